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

//! Error taxonomy of the device core.

use std::{error, fmt, io};

use crate::area::FlashOp;

/// STS codes reported by the boot firmware, with name and description.
#[rustfmt::skip]
const STS_CODES: &[(u8, &str, &str)] = &[
    (0x0C, "ERR_UNSU", "unsupported command"),
    (0xC1, "ERR_PCKT", "packet error (length/ETX)"),
    (0xC2, "ERR_CHKS", "checksum mismatch"),
    (0xC3, "ERR_FLOW", "command flow error"),
    (0xD0, "ERR_ADDR", "invalid address"),
    (0xD4, "ERR_BAUD", "baud rate margin error"),
    (0xDA, "ERR_PROT", "protection error"),
    (0xDB, "ERR_ID",   "ID authentication mismatch"),
    (0xDC, "ERR_SERI", "serial programming disabled"),
    (0xE1, "ERR_ERA",  "erase failed"),
    (0xE2, "ERR_WRI",  "write failed"),
    (0xE7, "ERR_SEQ",  "sequencer error"),
];

/// Name of an STS code, e.g. `ERR_ADDR`.
pub fn sts_name(code: u8) -> &'static str {
    STS_CODES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, name, _)| *name)
        .unwrap_or("ERR_UNKNOWN")
}

/// Description of an STS code, e.g. "invalid address".
pub fn sts_description(code: u8) -> &'static str {
    STS_CODES
        .iter()
        .find(|(c, _, _)| *c == code)
        .map(|(_, _, desc)| *desc)
        .unwrap_or("unknown error")
}

/// Malformed frame details. The serial stream is presumed desynchronised
/// after any of these, so callers do not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Response frame did not start with the device-to-host SOD byte.
    BadSod(u8),
    /// Frame did not end with ETX.
    BadEtx(u8),
    /// Checksum over LNH + LNL + RES + DATA did not cancel out.
    BadChecksum { expected: u8, found: u8 },
    /// Announced payload length of zero (the RES byte is always counted).
    ZeroLength,
    /// Announced payload length does not fit the received bytes.
    Truncated { announced: usize, available: usize },
}

impl fmt::Display for FrameError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FrameError::BadSod(b) => write!(fmt, "bad start-of-data byte 0x{:02X}", b),
            FrameError::BadEtx(b) => write!(fmt, "bad end-of-transmission byte 0x{:02X}", b),
            FrameError::BadChecksum { expected, found } => write!(
                fmt,
                "checksum mismatch (expected 0x{:02X}, found 0x{:02X})",
                expected, found
            ),
            FrameError::ZeroLength => write!(fmt, "zero payload length"),
            FrameError::Truncated {
                announced,
                available,
            } => write!(
                fmt,
                "truncated frame ({} bytes announced, {} available)",
                announced, available
            ),
        }
    }
}

/// Everything that can go wrong while driving the boot firmware.
#[derive(Debug)]
pub enum Error {
    /// Serial open/read/write failure, surfaced as-is.
    Io(io::Error),
    /// No bytes arrived within the configured window.
    Timeout(&'static str),
    /// Malformed frame on the wire.
    Frame(FrameError),
    /// The device reported a command failure. `st2` carries the flash
    /// status register and `adr` the failing address when the firmware
    /// provides them.
    Response {
        sts: u8,
        st2: Option<u32>,
        adr: Option<u32>,
    },
    /// The request is incompatible with the current area, DLM state or
    /// device group; nothing was sent to the device.
    Precondition(String),
    /// Start address violates the area's alignment unit for the operation.
    Alignment { op: FlashOp, addr: u32, unit: u32 },
    /// Frame payload over the 1 KiB limit or destination buffer too small.
    Buffer(&'static str),
    /// First mismatching byte of a verify.
    Verify {
        address: u32,
        flash: u8,
        expected: u8,
    },
    /// First non-0xFF byte of a blank check.
    Blank { address: u32, value: u8 },
    /// Baud rate not representable on this host.
    UnsupportedBaud(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::Io(ref err) => write!(fmt, "{}", err),
            Error::Timeout(what) => write!(fmt, "timed out waiting for {}", what),
            Error::Frame(ref err) => write!(fmt, "frame error: {}", err),
            Error::Response { sts, st2, adr } => {
                write!(
                    fmt,
                    "device error 0x{:02X} ({}: {})",
                    sts,
                    sts_name(sts),
                    sts_description(sts)
                )?;
                if let Some(st2) = st2 {
                    write!(fmt, ", flash status 0x{:08X}", st2)?;
                }
                if let Some(adr) = adr {
                    write!(fmt, ", failure address 0x{:08X}", adr)?;
                }
                Ok(())
            }
            Error::Precondition(ref msg) => write!(fmt, "{}", msg),
            Error::Alignment { op, addr, unit } => write!(
                fmt,
                "address 0x{:08X} not aligned on the {} unit 0x{:X}",
                addr,
                op.name(),
                unit
            ),
            Error::Buffer(msg) => write!(fmt, "{}", msg),
            Error::Verify {
                address,
                flash,
                expected,
            } => write!(
                fmt,
                "mismatch at 0x{:08X}: flash 0x{:02X}, expected 0x{:02X}",
                address, flash, expected
            ),
            Error::Blank { address, value } => write!(
                fmt,
                "non-blank byte 0x{:02X} at 0x{:08X}",
                value, address
            ),
            Error::UnsupportedBaud(rate) => {
                write!(fmt, "unsupported baud rate: {}", rate)
            }
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

impl From<serial::Error> for Error {
    fn from(err: serial::Error) -> Error {
        Error::Io(err.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sts_tables() {
        assert_eq!(sts_name(0xD0), "ERR_ADDR");
        assert_eq!(sts_description(0xD0), "invalid address");
        assert_eq!(sts_name(0xDB), "ERR_ID");
        assert_eq!(sts_name(0xDC), "ERR_SERI");
        assert_eq!(sts_name(0x42), "ERR_UNKNOWN");
        assert_eq!(sts_description(0x42), "unknown error");
    }

    #[test]
    fn test_response_display() {
        let err = Error::Response {
            sts: 0xE1,
            st2: Some(0x0001_0000),
            adr: Some(0x0000_2000),
        };
        let msg = err.to_string();
        assert!(msg.contains("ERR_ERA"));
        assert!(msg.contains("0x00010000"));
        assert!(msg.contains("0x00002000"));
    }
}
