// Copyright 2021 Locha Mesh Developers <contact@locha.io>
//
// Based on the Renesas RA family standard boot firmware serial
// programming interface (R01AN5372).
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Memory area descriptors and the boundary arithmetic used by the
//! flash engine.
//!
//! The device reports one 25-byte descriptor per area: KOA, then the
//! inclusive `[SAD, EAD]` address range, then the erase/write/read/CRC
//! alignment units. A unit of zero means the area does not support the
//! corresponding operation.

use std::fmt;

use crate::error::{Error, FrameError, Result};
use crate::packet::read_be32;

/// High nibble of KOA: user/code flash (banks 0 and 1 differ in the low
/// nibble), data flash, config area.
pub const KOA_KIND_CODE: u8 = 0x0;
pub const KOA_KIND_DATA: u8 = 0x1;
pub const KOA_KIND_CONFIG: u8 = 0x2;

/// Flash operation selecting which alignment unit applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Erase,
    Write,
    Read,
    Crc,
}

impl FlashOp {
    pub fn name(self) -> &'static str {
        match self {
            FlashOp::Erase => "erase",
            FlashOp::Write => "write",
            FlashOp::Read => "read",
            FlashOp::Crc => "CRC",
        }
    }
}

/// One memory area as reported by the ARE command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Area {
    pub koa: u8,
    pub sad: u32,
    pub ead: u32,
    pub eau: u32,
    pub wau: u32,
    pub rau: u32,
    pub cau: u32,
}

impl Area {
    /// Parse a 25-byte area descriptor payload.
    pub fn parse(payload: &[u8]) -> Result<Area> {
        if payload.len() < 25 {
            return Err(Error::Frame(FrameError::Truncated {
                announced: 25,
                available: payload.len(),
            }));
        }

        Ok(Area {
            koa: payload[0],
            sad: read_be32(&payload[1..5]),
            ead: read_be32(&payload[5..9]),
            eau: read_be32(&payload[9..13]),
            wau: read_be32(&payload[13..17]),
            rau: read_be32(&payload[17..21]),
            cau: read_be32(&payload[21..25]),
        })
    }

    /// Area size in bytes (the address range is inclusive).
    pub fn size(&self) -> u32 {
        self.ead.wrapping_sub(self.sad).wrapping_add(1)
    }

    /// Area kind from the high nibble of KOA.
    pub fn kind(&self) -> u8 {
        (self.koa >> 4) & 0x0F
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind() {
            KOA_KIND_CODE => "User/Code",
            KOA_KIND_DATA => "Data",
            KOA_KIND_CONFIG => "Config",
            _ => "Unknown",
        }
    }

    /// Alignment unit for `op`; zero means unsupported.
    pub fn unit(&self, op: FlashOp) -> u32 {
        match op {
            FlashOp::Erase => self.eau,
            FlashOp::Write => self.wau,
            FlashOp::Read => self.rau,
            FlashOp::Crc => self.cau,
        }
    }

    pub fn supports(&self, op: FlashOp) -> bool {
        self.unit(op) != 0
    }

    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.sad && addr <= self.ead
    }
}

impl fmt::Display for Area {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "[{}] (KOA=0x{:02X}): 0x{:08X} - 0x{:08X}",
            self.kind_name(),
            self.koa,
            self.sad,
            self.ead
        )
    }
}

/// The area containing `addr`, if any. Areas cover disjoint ranges, so
/// at most one can match.
pub fn find_area_for_address(areas: &[Area], addr: u32) -> Option<&Area> {
    areas.iter().find(|area| area.contains(addr))
}

/// Union `(sad, ead)` span over every area of the given KOA kind. Used
/// to resolve a kind selector (e.g. both code flash banks) to a single
/// address range.
pub fn find_span_by_kind(areas: &[Area], kind: u8) -> Option<(u32, u32)> {
    let mut span: Option<(u32, u32)> = None;
    for area in areas.iter().filter(|a| a.kind() == kind) {
        span = Some(match span {
            None => (area.sad, area.ead),
            Some((sad, ead)) => (sad.min(area.sad), ead.max(area.ead)),
        });
    }
    span
}

/// Compute the inclusive end address of an operation on `area`.
///
/// The start must be aligned on the operation's unit. For erase, write
/// and CRC the block count is rounded up so the range covers `size`
/// whole units; exceeding EAD is an error. For read the end is aligned
/// up to the next read unit but clamped to EAD.
pub fn compute_end(area: &Area, op: FlashOp, start: u32, size: u32) -> Result<u32> {
    let unit = area.unit(op);
    if unit == 0 {
        return Err(Error::Precondition(format!(
            "area {} does not support {} operations",
            area, op.name()
        )));
    }

    if start % unit != 0 {
        return Err(Error::Alignment {
            op,
            addr: start,
            unit,
        });
    }

    if size == 0 {
        return Err(Error::Precondition("size must be non-zero".into()));
    }

    if let FlashOp::Read = op {
        let end = start
            .checked_add(size - 1)
            .ok_or_else(|| Error::Precondition("address range overflows".into()))?;
        if end > area.ead {
            return Err(Error::Precondition(format!(
                "size exceeds area boundary (max 0x{:08X})",
                area.ead
            )));
        }
        if (end + 1) % unit != 0 {
            let aligned = ((end / unit) + 1) * unit - 1;
            return Ok(aligned.min(area.ead));
        }
        return Ok(end);
    }

    let blocks = (u64::from(size) + u64::from(unit) - 1) / u64::from(unit);
    let end = u64::from(start) + blocks * u64::from(unit) - 1;
    if end > u64::from(area.ead) {
        return Err(Error::Precondition(format!(
            "size exceeds area boundary (max 0x{:08X})",
            area.ead
        )));
    }

    Ok(end as u32)
}
