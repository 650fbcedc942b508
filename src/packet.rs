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

//! Frame encoding and decoding for the boot firmware protocol.
//!
//! Wire layout: `SOD | LNH | LNL | CMD/RES | DATA | SUM | ETX`. The
//! 16-bit big-endian length counts the CMD/RES byte plus the data, and
//! SUM is the two's complement of the 8-bit sum over LNH, LNL, CMD/RES
//! and DATA. All multi-byte integers on the wire are big-endian.

use crate::constants::{ETX, MAX_DATA_LEN, SOD_ACK, SOD_CMD, STATUS_ERR};
use crate::error::{Error, FrameError, Result};

/// Two's complement checksum over the length bytes, the command byte and
/// the data.
pub fn checksum(cmd: u8, data: &[u8]) -> u8 {
    let pkt_len = (data.len() + 1) as u16;
    let mut sum = (pkt_len >> 8) as u32 + (pkt_len & 0xFF) as u32 + u32::from(cmd);
    for byte in data {
        sum += u32::from(*byte);
    }
    (sum as u8).wrapping_neg()
}

/// Build a complete frame for `cmd` with `data` as payload.
///
/// `ack` selects the start-of-data byte: `0x01` for an ordinary host
/// request, `0x81` for the data frames of a write stream and the
/// authentication continuation frame.
pub fn pack(cmd: u8, data: &[u8], ack: bool) -> Result<Vec<u8>> {
    if data.len() > MAX_DATA_LEN {
        return Err(Error::Buffer("frame payload larger than 1024 bytes"));
    }

    let pkt_len = (data.len() + 1) as u16;
    let mut pkt = Vec::with_capacity(data.len() + 6);
    pkt.push(if ack { SOD_ACK } else { SOD_CMD });
    pkt.push((pkt_len >> 8) as u8);
    pkt.push((pkt_len & 0xFF) as u8);
    pkt.push(cmd);
    pkt.extend_from_slice(data);
    pkt.push(checksum(cmd, data));
    pkt.push(ETX);

    Ok(pkt)
}

/// Validate a device response frame and return `(payload, res)`.
///
/// An error response (high bit of RES set) is surfaced as
/// [`Error::Response`] carrying the STS byte and, when the firmware
/// appends them, the flash status register and failing address.
pub fn unpack(buf: &[u8]) -> Result<(&[u8], u8)> {
    if buf.len() < 6 {
        return Err(Error::Frame(FrameError::Truncated {
            announced: 6,
            available: buf.len(),
        }));
    }

    if buf[0] != SOD_ACK {
        return Err(Error::Frame(FrameError::BadSod(buf[0])));
    }

    let pkt_len = read_be16(&buf[1..3]) as usize;
    if pkt_len < 1 {
        return Err(Error::Frame(FrameError::ZeroLength));
    }

    let res = buf[3];
    let dlen = pkt_len - 1;
    let total = dlen + 6;
    if buf.len() < total {
        return Err(Error::Frame(FrameError::Truncated {
            announced: total,
            available: buf.len(),
        }));
    }

    let payload = &buf[4..4 + dlen];

    if res & STATUS_ERR != 0 {
        let sts = payload.first().copied().unwrap_or(0);
        let (st2, adr) = if dlen >= 9 {
            (
                Some(read_be32(&payload[1..5])),
                Some(read_be32(&payload[5..9])),
            )
        } else {
            (None, None)
        };
        return Err(Error::Response { sts, st2, adr });
    }

    if buf[5 + dlen] != ETX {
        return Err(Error::Frame(FrameError::BadEtx(buf[5 + dlen])));
    }

    let expected = checksum(res, payload);
    if buf[4 + dlen] != expected {
        return Err(Error::Frame(FrameError::BadChecksum {
            expected,
            found: buf[4 + dlen],
        }));
    }

    Ok((payload, res))
}

pub(crate) fn read_be16(buf: &[u8]) -> u16 {
    (u16::from(buf[0]) << 8) | u16::from(buf[1])
}

pub(crate) fn read_be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]])
}

/// Big-endian `{start, end}` range payload used by ERA/WRI/REA/CRC.
pub(crate) fn range_payload(start: u32, end: u32) -> [u8; 8] {
    let mut data = [0u8; 8];
    data[..4].copy_from_slice(&start.to_be_bytes());
    data[4..].copy_from_slice(&end.to_be_bytes());
    data
}
