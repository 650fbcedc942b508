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

//! Linux serial port enumeration via sysfs.

use std::{
    ffi::OsString,
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use super::{PortInfo, PortUsbInfo};

fn read_line<P: AsRef<Path>>(path: P) -> io::Result<String> {
    let mut file = BufReader::new(File::open(path)?);

    let mut line = String::new();
    file.read_line(&mut line)?;

    Ok(line.trim().to_owned())
}

fn read_hex16<P: AsRef<Path>>(path: P) -> Option<u16> {
    u16::from_str_radix(&read_line(path).ok()?, 16).ok()
}

fn parent(mut path: PathBuf) -> PathBuf {
    path.pop();
    path
}

/// USB metadata for `/dev/<name>`, walking `/sys/class/tty/<name>` up
/// to the interface and device directories.
fn usb_info(name: &Path) -> io::Result<Option<PortUsbInfo>> {
    let device_path = PathBuf::from("/sys/class/tty")
        .join(name)
        .join("device");
    if !device_path.exists() {
        return Ok(None);
    }

    let subsystem = fs::canonicalize(fs::canonicalize(&device_path)?.join("subsystem"))?
        .file_name()
        .map(|s| s.to_owned());

    // CDC-ACM ports hang directly off the usb device; usb-serial
    // adapters have one more interface level in between.
    let usb_if = match subsystem.as_ref().and_then(|s| s.to_str()) {
        Some("usb") => device_path,
        Some("usb-serial") => parent(fs::canonicalize(&device_path)?),
        _ => return Ok(None),
    };

    let usb_dev = parent(fs::canonicalize(usb_if)?);
    let vid = match read_hex16(usb_dev.join("idVendor")) {
        Some(vid) => vid,
        None => return Ok(None),
    };
    let pid = match read_hex16(usb_dev.join("idProduct")) {
        Some(pid) => pid,
        None => return Ok(None),
    };

    Ok(Some(PortUsbInfo {
        vid,
        pid,
        serial: read_line(usb_dev.join("serial")).ok(),
        manufacturer: read_line(usb_dev.join("manufacturer")).ok(),
        product: read_line(usb_dev.join("product")).ok(),
    }))
}

pub fn list_all() -> Vec<PortInfo> {
    let mut candidates = Vec::new();
    // USB-CDC (the RA boot interface), usb-serial adapters, built-in
    // serial ports.
    for pattern in &["/dev/ttyACM*", "/dev/ttyUSB*", "/dev/ttyS*"] {
        if let Ok(paths) = glob::glob(pattern) {
            candidates.extend(paths.filter_map(|path| path.ok()));
        }
    }

    let mut available = Vec::new();
    for path in candidates {
        let name = match path.file_name() {
            Some(name) => PathBuf::from(name),
            None => continue,
        };

        let usb = usb_info(&name).unwrap_or(None);
        available.push(PortInfo {
            port: OsString::from(&path),
            name: name.into_os_string(),
            usb_info: usb,
        });
    }

    available
}
