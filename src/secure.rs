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

//! TrustZone boundary settings, wrapped key injection and config-area
//! inspection.

use std::time::Duration;

use serial::SerialPort;

use crate::area::KOA_KIND_CONFIG;
use crate::constants::{
    BND_CMD, BND_SET_CMD, KEY_CMD, KEY_VFY_CMD, UKEY_CMD, UKEY_VFY_CMD, WRAPPED_KEY_MAX,
};
use crate::error::{Error, FrameError, Result};
use crate::packet::read_be16;
use crate::{Device, QUERY_TIMEOUT};

/// Boundary and key writes go to flash on the device.
const STORE_TIMEOUT: Duration = Duration::from_secs(5);
const KEY_VERIFY_TIMEOUT: Duration = Duration::from_secs(1);

/// Secure/non-secure boundary settings, all sizes in KiB.
///
/// `cfs1`/`srs1` are the secure sizes without the NSC (non-secure
/// callable) region, `cfs2`/`srs2` the totals; the NSC region is the
/// difference. New values only take effect after a device reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Boundary {
    /// Code flash secure region size without NSC.
    pub cfs1: u16,
    /// Code flash secure region size.
    pub cfs2: u16,
    /// Data flash secure region size.
    pub dfs: u16,
    /// SRAM secure region size without NSC.
    pub srs1: u16,
    /// SRAM secure region size.
    pub srs2: u16,
}

impl Boundary {
    /// Parse the ten-byte big-endian boundary payload.
    pub fn parse(payload: &[u8]) -> Result<Boundary> {
        if payload.len() < 10 {
            return Err(Error::Frame(FrameError::Truncated {
                announced: 10,
                available: payload.len(),
            }));
        }

        Ok(Boundary {
            cfs1: read_be16(&payload[0..2]),
            cfs2: read_be16(&payload[2..4]),
            dfs: read_be16(&payload[4..6]),
            srs1: read_be16(&payload[6..8]),
            srs2: read_be16(&payload[8..10]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 10] {
        let mut data = [0u8; 10];
        data[0..2].copy_from_slice(&self.cfs1.to_be_bytes());
        data[2..4].copy_from_slice(&self.cfs2.to_be_bytes());
        data[4..6].copy_from_slice(&self.dfs.to_be_bytes());
        data[6..8].copy_from_slice(&self.srs1.to_be_bytes());
        data[8..10].copy_from_slice(&self.srs2.to_be_bytes());
        data
    }

    /// The secure sizes without NSC can never exceed the totals.
    pub fn validate(&self) -> Result<()> {
        if self.cfs1 > self.cfs2 {
            return Err(Error::Precondition(format!(
                "invalid boundary: CFS1 ({} KiB) > CFS2 ({} KiB)",
                self.cfs1, self.cfs2
            )));
        }
        if self.srs1 > self.srs2 {
            return Err(Error::Precondition(format!(
                "invalid boundary: SRS1 ({} KiB) > SRS2 ({} KiB)",
                self.srs1, self.srs2
            )));
        }
        Ok(())
    }
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Query the TrustZone boundary settings.
    pub fn boundary(&mut self) -> Result<Boundary> {
        let payload = self.transact(BND_CMD, &[], QUERY_TIMEOUT, "boundary")?;
        Boundary::parse(&payload)
    }

    /// Store new TrustZone boundary settings. They become effective
    /// after the next device reset.
    pub fn set_boundary(&mut self, boundary: &Boundary) -> Result<()> {
        boundary.validate()?;
        self.transact(
            BND_SET_CMD,
            &boundary.to_bytes(),
            STORE_TIMEOUT,
            "boundary setting",
        )?;
        Ok(())
    }

    /// Inject a wrapped DLM key into the key slot `index`.
    pub fn key_set(&mut self, index: u8, wrapped: &[u8]) -> Result<()> {
        self.inject_key(KEY_CMD, "key setting", index, wrapped)
    }

    /// Check whether the DLM key slot `index` holds a valid key.
    pub fn key_verify(&mut self, index: u8) -> Result<bool> {
        let payload = self.transact(KEY_VFY_CMD, &[index], KEY_VERIFY_TIMEOUT, "key verify")?;
        Ok(payload.first() == Some(&0x00))
    }

    /// Inject a wrapped user key into slot `index`.
    pub fn ukey_set(&mut self, index: u8, wrapped: &[u8]) -> Result<()> {
        self.inject_key(UKEY_CMD, "user key setting", index, wrapped)
    }

    /// Check whether the user key slot `index` holds a valid key.
    pub fn ukey_verify(&mut self, index: u8) -> Result<bool> {
        let payload =
            self.transact(UKEY_VFY_CMD, &[index], KEY_VERIFY_TIMEOUT, "user key verify")?;
        Ok(payload.first() == Some(&0x00))
    }

    /// Read the whole config area (option-setting memory).
    pub fn config_read(&mut self) -> Result<(u32, Vec<u8>)> {
        let area = self
            .areas
            .iter()
            .find(|area| area.kind() == KOA_KIND_CONFIG)
            .copied()
            .ok_or_else(|| Error::Precondition("device reports no config area".into()))?;

        let data = self.read(area.sad, area.size())?;
        Ok((area.sad, data))
    }

    fn inject_key(
        &mut self,
        cmd: u8,
        context: &'static str,
        index: u8,
        wrapped: &[u8],
    ) -> Result<()> {
        if wrapped.is_empty() {
            return Err(Error::Precondition("wrapped key is empty".into()));
        }
        if wrapped.len() > WRAPPED_KEY_MAX {
            return Err(Error::Precondition(format!(
                "wrapped key too long: {} bytes (max {})",
                wrapped.len(),
                WRAPPED_KEY_MAX
            )));
        }

        let mut data = Vec::with_capacity(1 + wrapped.len());
        data.push(index);
        data.extend_from_slice(wrapped);

        self.transact(cmd, &data, STORE_TIMEOUT, context)?;
        log::debug!("{} OK at index {}", context, index);
        Ok(())
    }
}
