// Copyright 2021 Locha Mesh Developers <contact@locha.io>
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

//! Serial port enumeration and Renesas boot-interface discovery.

use std::ffi::OsString;

use crate::constants::{RENESAS_PID, RENESAS_VID};

#[cfg(target_os = "linux")]
mod list_linux;

/// Information about an available serial port.
#[derive(Debug)]
pub struct PortInfo {
    /// Device node, e.g. `/dev/ttyACM0`.
    pub port: OsString,
    /// Short name, e.g. `ttyACM0`.
    pub name: OsString,
    pub usb_info: Option<PortUsbInfo>,
}

impl PortInfo {
    /// List all serial ports on the system.
    #[cfg(target_os = "linux")]
    pub fn list_all() -> Vec<PortInfo> {
        self::list_linux::list_all()
    }

    /// Port enumeration is only implemented for Linux hosts; elsewhere
    /// the port must be given explicitly.
    #[cfg(not(target_os = "linux"))]
    pub fn list_all() -> Vec<PortInfo> {
        Vec::new()
    }

    /// Whether this port is the USB-CDC interface of an RA device in
    /// boot mode.
    pub fn is_renesas_boot(&self) -> bool {
        self.usb_info
            .as_ref()
            .map(|usb| usb.vid == RENESAS_VID && usb.pid == RENESAS_PID)
            .unwrap_or(false)
    }
}

/// USB metadata of a serial port.
#[derive(Debug)]
pub struct PortUsbInfo {
    /// USB Vendor ID.
    pub vid: u16,
    /// USB Product ID.
    pub pid: u16,
    /// Serial number string.
    pub serial: Option<String>,
    /// Device manufacturer.
    pub manufacturer: Option<String>,
    /// Device product description.
    pub product: Option<String>,
}

/// First port exposing the Renesas boot-interface VID/PID, if any.
pub fn find_renesas_port() -> Option<PortInfo> {
    PortInfo::list_all()
        .into_iter()
        .find(PortInfo::is_renesas_boot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_renesas_boot() {
        let mut info = PortInfo {
            port: OsString::from("/dev/ttyACM0"),
            name: OsString::from("ttyACM0"),
            usb_info: None,
        };
        assert!(!info.is_renesas_boot());

        info.usb_info = Some(PortUsbInfo {
            vid: RENESAS_VID,
            pid: RENESAS_PID,
            serial: None,
            manufacturer: Some("Renesas".into()),
            product: Some("RA USB Boot".into()),
        });
        assert!(info.is_renesas_boot());

        info.usb_info = Some(PortUsbInfo {
            vid: 0x0403,
            pid: 0x6001,
            serial: None,
            manufacturer: None,
            product: None,
        });
        assert!(!info.is_renesas_boot());
    }
}
