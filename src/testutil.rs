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

//! Scripted serial port standing in for a device during tests.
//!
//! The protocol is strictly request/response, so the mock releases one
//! pre-programmed response (or deliberate silence) per host write and
//! records every sent buffer for byte-exact assertions.

use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    rc::Rc,
    time::Duration,
};

use serial::SerialPort;

use crate::constants::{MAX_TRIES, STATUS_ERR, TIMEOUT_MS};
use crate::{packet, Area, Device, Signature};

pub(crate) struct MockPort {
    script: VecDeque<Option<Vec<u8>>>,
    readable: VecDeque<u8>,
    sent: Rc<RefCell<Vec<Vec<u8>>>>,
    timeout: Duration,
}

impl MockPort {
    pub(crate) fn new() -> MockPort {
        MockPort {
            script: VecDeque::new(),
            readable: VecDeque::new(),
            sent: Rc::new(RefCell::new(Vec::new())),
            timeout: Duration::from_millis(TIMEOUT_MS),
        }
    }

    /// Release `bytes` to the reader after the next host write.
    pub(crate) fn push_response(&mut self, bytes: Vec<u8>) {
        self.script.push_back(Some(bytes));
    }

    /// Stay silent after the next host write.
    pub(crate) fn push_silence(&mut self) {
        self.script.push_back(None);
    }

    /// Shared handle on the log of sent buffers; survives `close()`.
    pub(crate) fn sent_log(&self) -> Rc<RefCell<Vec<Vec<u8>>>> {
        Rc::clone(&self.sent)
    }
}

impl io::Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.readable.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
        }

        let mut n = 0;
        while n < buf.len() {
            match self.readable.pop_front() {
                Some(byte) => {
                    buf[n] = byte;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

impl io::Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.borrow_mut().push(buf.to_vec());
        if let Some(Some(bytes)) = self.script.pop_front() {
            self.readable.extend(bytes);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SerialPort for MockPort {
    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> serial::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn configure(&mut self, _settings: &serial::PortSettings) -> serial::Result<()> {
        Ok(())
    }

    fn reconfigure(
        &mut self,
        _setup: &dyn Fn(&mut dyn serial::SerialPortSettings) -> serial::Result<()>,
    ) -> serial::Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> serial::Result<()> {
        Ok(())
    }

    fn set_dtr(&mut self, _level: bool) -> serial::Result<()> {
        Ok(())
    }

    fn read_cts(&mut self) -> serial::Result<bool> {
        unreachable!()
    }

    fn read_dsr(&mut self) -> serial::Result<bool> {
        unreachable!()
    }

    fn read_ri(&mut self) -> serial::Result<bool> {
        unreachable!()
    }

    fn read_cd(&mut self) -> serial::Result<bool> {
        unreachable!()
    }
}

/// A `Device` over a mock port with the handshake skipped.
pub(crate) fn rig(port: MockPort) -> Device<MockPort> {
    Device {
        port,
        max_tries: MAX_TRIES,
        timeout: Duration::from_millis(TIMEOUT_MS),
        boot_code: None,
        signature: None,
        areas: Vec::new(),
        authenticated: false,
        uart_mode: false,
        baudrate: 9600,
        progress: None,
    }
}

/// Like [`rig`] but with a signature and memory map already cached.
pub(crate) fn rig_with_map(port: MockPort, areas: Vec<Area>) -> Device<MockPort> {
    let mut device = rig(port);
    device.signature = Some(Signature::parse(&sig_payload(areas.len() as u8)).unwrap());
    device.areas = areas;
    device
}

/// Response frame carrying `payload` for `cmd`.
pub(crate) fn data_response(cmd: u8, payload: &[u8]) -> Vec<u8> {
    packet::pack(cmd, payload, true).unwrap()
}

/// Plain OK response (single zero status byte).
pub(crate) fn ok_response(cmd: u8) -> Vec<u8> {
    packet::pack(cmd, &[0x00], true).unwrap()
}

/// Error response carrying only the STS byte.
pub(crate) fn error_response(cmd: u8, sts: u8) -> Vec<u8> {
    packet::pack(cmd | STATUS_ERR, &[sts], true).unwrap()
}

/// Signature payload for a GrpA/GrpB RA4M2 with `noa` areas.
pub(crate) fn sig_payload(noa: u8) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&1_000_000u32.to_be_bytes());
    payload.push(noa);
    payload.push(0x01);
    payload.extend_from_slice(&[1, 0, 0]);
    payload.extend_from_slice(&[0xAB; 16]);
    payload.extend_from_slice(b"R7FA4M2AD3CFP   ");
    payload
}

/// 25-byte area descriptor payload.
pub(crate) fn area_payload(
    koa: u8,
    sad: u32,
    ead: u32,
    eau: u32,
    wau: u32,
    rau: u32,
    cau: u32,
) -> Vec<u8> {
    let mut payload = vec![koa];
    payload.extend_from_slice(&sad.to_be_bytes());
    payload.extend_from_slice(&ead.to_be_bytes());
    payload.extend_from_slice(&eau.to_be_bytes());
    payload.extend_from_slice(&wau.to_be_bytes());
    payload.extend_from_slice(&rau.to_be_bytes());
    payload.extend_from_slice(&cau.to_be_bytes());
    payload
}

/// Code flash + data flash layout used across the engine tests.
pub(crate) fn ra4m2_areas() -> Vec<Area> {
    vec![
        Area {
            koa: 0x00,
            sad: 0x0000_0000,
            ead: 0x0007_FFFF,
            eau: 0x2000,
            wau: 0x80,
            rau: 0x04,
            cau: 0x04,
        },
        Area {
            koa: 0x10,
            sad: 0x0800_0000,
            ead: 0x0800_1FFF,
            eau: 0x40,
            wau: 0x04,
            rau: 0x04,
            cau: 0x04,
        },
    ]
}
