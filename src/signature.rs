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

//! Device signature decoding and device-group capabilities.

use std::fmt;

use crate::constants::{BOOT_CODE_M33, BOOT_CODE_M4, BOOT_CODE_M85};
use crate::error::{Error, FrameError, Result};
use crate::packet::read_be32;

/// Boot code returned during the connection confirmation step.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum BootCode {
    /// Cortex-M4/M23 (RA2/RA4 series).
    CortexM4M23,
    /// Cortex-M33 (RA4M2/RA6 series).
    CortexM33,
    /// Cortex-M85 (RA8 series).
    CortexM85,
}

impl BootCode {
    pub fn from_byte(byte: u8) -> Option<BootCode> {
        match byte {
            BOOT_CODE_M4 => Some(BootCode::CortexM4M23),
            BOOT_CODE_M33 => Some(BootCode::CortexM33),
            BOOT_CODE_M85 => Some(BootCode::CortexM85),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            BootCode::CortexM4M23 => BOOT_CODE_M4,
            BootCode::CortexM33 => BOOT_CODE_M33,
            BootCode::CortexM85 => BOOT_CODE_M85,
        }
    }

    pub fn core_name(self) -> &'static str {
        match self {
            BootCode::CortexM4M23 => "Cortex-M4/M23",
            BootCode::CortexM33 => "Cortex-M33",
            BootCode::CortexM85 => "Cortex-M85",
        }
    }
}

/// Device group from the TYP field of the signature.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DeviceGroup {
    /// RA4M2/3, RA6M4/5, RA4E1, RA6E1.
    GrpAB,
    /// RA6T2. Authenticates regressions with AES-128-CMAC.
    GrpC,
    /// RA4E2, RA6E2, RA4T1, RA6T3. No DLM command support.
    GrpD,
    Unknown(u8),
}

impl DeviceGroup {
    pub fn from_typ(typ: u8) -> DeviceGroup {
        match typ {
            0x01 => DeviceGroup::GrpAB,
            0x02 => DeviceGroup::GrpC,
            0x05 => DeviceGroup::GrpD,
            other => DeviceGroup::Unknown(other),
        }
    }

    /// Whether the DLM/boundary/parameter/initialize command set exists.
    #[inline]
    pub fn supports_dlm(&self) -> bool {
        matches!(*self, DeviceGroup::GrpAB | DeviceGroup::GrpC)
    }

    /// Whether authenticated regressions use AES-128-CMAC instead of
    /// HMAC-SHA256.
    #[inline]
    pub fn uses_cmac(&self) -> bool {
        matches!(*self, DeviceGroup::GrpC)
    }

    pub fn label(&self) -> &'static str {
        match *self {
            DeviceGroup::GrpAB => "GrpA/GrpB",
            DeviceGroup::GrpC => "GrpC",
            DeviceGroup::GrpD => "GrpD",
            DeviceGroup::Unknown(_) => "Unknown",
        }
    }

    pub fn members(&self) -> &'static str {
        match *self {
            DeviceGroup::GrpAB => "RA4M2/3, RA6M4/5, RA4E1, RA6E1",
            DeviceGroup::GrpC => "RA6T2",
            DeviceGroup::GrpD => "RA4E2, RA6E2, RA4T1, RA6T3",
            DeviceGroup::Unknown(_) => "unknown device group",
        }
    }
}

impl fmt::Display for DeviceGroup {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}", self.label())
    }
}

/// Decoded SIG response.
///
/// Layout: RMB(4) + NOA(1) + TYP(1) + BFV(3) + DID(16) + PTN(16). Older
/// boot firmware revisions stop after BFV, so the identification fields
/// are optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Recommended maximum UART baud rate, bps.
    pub max_baudrate: u32,
    /// Number of accessible areas.
    pub area_count: u8,
    /// Raw TYP byte.
    pub typ: u8,
    pub group: DeviceGroup,
    /// Boot firmware version (major, minor, build).
    pub boot_firmware: (u8, u8, u8),
    /// 16-byte per-die identifier.
    pub device_id: Option<[u8; 16]>,
    /// Product type name, trailing spaces trimmed.
    pub product_name: Option<String>,
}

impl Signature {
    pub fn parse(payload: &[u8]) -> Result<Signature> {
        if payload.len() < 9 {
            return Err(Error::Frame(FrameError::Truncated {
                announced: 9,
                available: payload.len(),
            }));
        }

        let device_id = if payload.len() >= 25 {
            let mut did = [0u8; 16];
            did.copy_from_slice(&payload[9..25]);
            Some(did)
        } else {
            None
        };

        let product_name = if payload.len() >= 41 {
            let name: String = payload[25..41]
                .iter()
                .map(|b| char::from(*b))
                .collect::<String>()
                .trim_end_matches(' ')
                .to_string();
            Some(name)
        } else {
            None
        };

        Ok(Signature {
            max_baudrate: read_be32(&payload[0..4]),
            area_count: payload[4],
            typ: payload[5],
            group: DeviceGroup::from_typ(payload[5]),
            boot_firmware: (payload[6], payload[7], payload[8]),
            device_id,
            product_name,
        })
    }

    /// CPU core derived from the product name series digit (R7FAxxxx).
    pub fn cpu_core(&self) -> Option<&'static str> {
        let name = self.product_name.as_ref()?;
        if !name.starts_with("R7FA") {
            return None;
        }
        match *name.as_bytes().get(4)? {
            b'2' => Some("ARM Cortex-M23"),
            b'4' => Some("ARM Cortex-M33"),
            b'6' => Some("ARM Cortex-M33/M4"),
            b'8' => Some("ARM Cortex-M85"),
            _ => None,
        }
    }

    /// Dual-bank devices report each code bank as its own area.
    pub fn dual_bank(&self) -> bool {
        self.area_count > 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig_payload() -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&1_000_000u32.to_be_bytes());
        payload.push(4); // NOA
        payload.push(0x01); // TYP
        payload.extend_from_slice(&[1, 0, 0]); // BFV
        payload.extend_from_slice(&[0xAB; 16]); // DID
        payload.extend_from_slice(b"R7FA4M2AD3CFP   "); // PTN, space padded
        payload
    }

    #[test]
    fn test_parse_full_signature() {
        let sig = Signature::parse(&sig_payload()).unwrap();
        assert_eq!(sig.max_baudrate, 1_000_000);
        assert_eq!(sig.area_count, 4);
        assert_eq!(sig.typ, 0x01);
        assert_eq!(sig.group, DeviceGroup::GrpAB);
        assert_eq!(sig.boot_firmware, (1, 0, 0));
        assert_eq!(sig.device_id, Some([0xAB; 16]));
        assert_eq!(sig.product_name.as_deref(), Some("R7FA4M2AD3CFP"));
        assert_eq!(sig.cpu_core(), Some("ARM Cortex-M33"));
        assert!(!sig.dual_bank());
    }

    #[test]
    fn test_parse_minimal_signature() {
        let sig = Signature::parse(&sig_payload()[..9]).unwrap();
        assert_eq!(sig.max_baudrate, 1_000_000);
        assert_eq!(sig.device_id, None);
        assert_eq!(sig.product_name, None);
        assert_eq!(sig.cpu_core(), None);

        assert!(Signature::parse(&sig_payload()[..8]).is_err());
    }

    #[test]
    fn test_device_groups() {
        assert_eq!(DeviceGroup::from_typ(0x01), DeviceGroup::GrpAB);
        assert_eq!(DeviceGroup::from_typ(0x02), DeviceGroup::GrpC);
        assert_eq!(DeviceGroup::from_typ(0x05), DeviceGroup::GrpD);
        assert_eq!(DeviceGroup::from_typ(0x09), DeviceGroup::Unknown(0x09));

        assert!(DeviceGroup::GrpAB.supports_dlm());
        assert!(DeviceGroup::GrpC.supports_dlm());
        assert!(!DeviceGroup::GrpD.supports_dlm());
        assert!(DeviceGroup::GrpC.uses_cmac());
        assert!(!DeviceGroup::GrpAB.uses_cmac());
    }

    #[test]
    fn test_boot_codes() {
        assert_eq!(BootCode::from_byte(0xC3), Some(BootCode::CortexM4M23));
        assert_eq!(BootCode::from_byte(0xC5), Some(BootCode::CortexM85));
        assert_eq!(BootCode::from_byte(0xC6), Some(BootCode::CortexM33));
        assert_eq!(BootCode::from_byte(0x55), None);
        assert_eq!(BootCode::CortexM33.core_name(), "Cortex-M33");
    }
}
