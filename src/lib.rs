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

//! # Renesas RA Serial Boot Firmware Interface library
//!
//! This is a library to drive the serial boot firmware of Renesas
//! RA-family microcontrollers over a UART link (USB-CDC or a plain
//! USB-UART adapter on P109/P110).
//!
//! It covers the framed request/response protocol, the connection
//! handshake, area-aware flash operations (erase, read, write, verify,
//! blank check, CRC), Device Lifecycle Management including the
//! HMAC-SHA256 authenticated regression, TrustZone boundary settings
//! and wrapped key injection.
//!
//! # See also
//!
//! - Renesas application note R01AN5372, "Standard Boot Firmware for the
//!   RA family MCUs Based on Arm Cortex-M33".

use std::{fmt, thread, time::Duration};

use serial::SerialPort;

#[rustfmt::skip]
pub mod constants;
pub mod area;
pub mod packet;
pub mod ports;

mod dlm;
mod error;
mod flash;
mod osis;
mod progress;
mod secure;
mod signature;
#[cfg(test)]
pub(crate) mod testutil;

pub use self::area::{compute_end, find_area_for_address, find_span_by_kind, Area, FlashOp};
pub use self::dlm::DlmState;
pub use self::error::{sts_description, sts_name, Error, FrameError, Result};
pub use self::flash::ParsedFile;
pub use self::osis::OsisInference;
pub use self::progress::{NoProgress, ProgressSink};
pub use self::secure::Boundary;
pub use self::signature::{BootCode, DeviceGroup, Signature};

use self::constants::{
    ARE_CMD, BAU_CMD, GENERIC_CODE, INQ_CMD, MAX_PKT_LEN, MAX_TRIES, SIG_CMD, SYNC_BYTE,
    TIMEOUT_MS,
};

/// Default timeout for simple query commands.
pub(crate) const QUERY_TIMEOUT: Duration = Duration::from_millis(500);
/// Inter-byte timeout once a response has started arriving.
const CONTINUATION_TIMEOUT: Duration = Duration::from_millis(20);

/// Baud rates the transport can configure, ascending.
#[rustfmt::skip]
const BAUD_RATES: &[u32] = &[
    9600, 19200, 38400, 57600, 115200,
    230400, 460800, 500000, 576000, 921600,
    1000000, 1152000, 1500000, 2000000, 2500000,
    3000000, 3500000, 4000000,
];

/// Whether the transport supports `rate`.
pub fn supported_baudrate(rate: u32) -> bool {
    BAUD_RATES.contains(&rate)
}

/// Greatest supported rate not above `max`, with 9600 as the floor.
pub fn best_baudrate(max: u32) -> u32 {
    BAUD_RATES
        .iter()
        .rev()
        .copied()
        .find(|rate| *rate <= max)
        .unwrap_or(9600)
}

fn to_serial_baud(rate: u32) -> Result<serial::BaudRate> {
    if !supported_baudrate(rate) {
        return Err(Error::UnsupportedBaud(rate));
    }
    Ok(match rate {
        9600 => serial::BaudRate::Baud9600,
        19200 => serial::BaudRate::Baud19200,
        38400 => serial::BaudRate::Baud38400,
        57600 => serial::BaudRate::Baud57600,
        115200 => serial::BaudRate::Baud115200,
        other => serial::BaudRate::BaudOther(other as usize),
    })
}

/// Default serial port settings for the boot interface: 8N1, no flow
/// control, starting at the 9600 bps the boot firmware wakes up with.
pub fn port_settings() -> serial::PortSettings {
    serial::PortSettings {
        baud_rate: serial::BaudRate::Baud9600,
        char_size: serial::CharSize::Bits8,
        parity: serial::Parity::ParityNone,
        stop_bits: serial::StopBits::Stop1,
        flow_control: serial::FlowControl::FlowNone,
    }
}

/// A connected RA device in serial boot mode.
///
/// Owns the serial handle for the lifetime of the session. Created with
/// [`Device::new`], which runs the connection handshake; call
/// [`Device::query_signature`] and [`Device::query_areas`] before any
/// flash operation so the engine knows the memory map.
pub struct Device<P> {
    pub(crate) port: P,
    pub(crate) max_tries: u32,
    pub(crate) timeout: Duration,
    pub(crate) boot_code: Option<BootCode>,
    pub(crate) signature: Option<Signature>,
    pub(crate) areas: Vec<Area>,
    pub(crate) authenticated: bool,
    pub(crate) uart_mode: bool,
    pub(crate) baudrate: u32,
    pub(crate) progress: Option<Box<dyn ProgressSink>>,
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Create a `Device` from an already opened and configured port and
    /// establish command mode.
    ///
    /// The handshake first inquires whether a previous session left the
    /// bootloader in command mode (draining any stale response bytes),
    /// otherwise it synchronizes with `0x00` bytes and confirms the
    /// boot code with the generic `0x55` probe.
    ///
    /// `uart_mode` selects plain-UART semantics (P109/P110 pins): the
    /// session is then reset to 9600 bps on [`Device::close`].
    pub fn new(port: P, uart_mode: bool) -> Result<Self> {
        let mut device = Device {
            port,
            max_tries: MAX_TRIES,
            timeout: Duration::from_millis(TIMEOUT_MS),
            boot_code: None,
            signature: None,
            areas: Vec::new(),
            authenticated: false,
            uart_mode,
            baudrate: 9600,
            progress: None,
        };

        device.init_communications()?;

        Ok(device)
    }

    /// Boot code reported during confirmation, if that step ran.
    pub fn boot_code(&self) -> Option<BootCode> {
        self.boot_code
    }

    /// Cached device signature.
    pub fn signature(&self) -> Option<&Signature> {
        self.signature.as_ref()
    }

    /// Cached memory area map.
    pub fn areas(&self) -> &[Area] {
        &self.areas
    }

    /// Whether an ID authentication succeeded in this session.
    pub fn authenticated(&self) -> bool {
        self.authenticated
    }

    /// Current UART baud rate.
    pub fn baudrate(&self) -> u32 {
        self.baudrate
    }

    /// Install a sink for flash-operation progress updates.
    pub fn set_progress_sink(&mut self, sink: Box<dyn ProgressSink>) {
        self.progress = Some(sink);
    }

    /// Close the session. In plain-UART mode a best-effort baud-rate
    /// reset to 9600 is emitted first so the next connection can sync.
    pub fn close(mut self) {
        if self.uart_mode && self.baudrate > 9600 {
            if let Ok(pkt) = packet::pack(BAU_CMD, &9600u32.to_be_bytes(), false) {
                let _ = self.port.write_all(&pkt);
                let _ = self.port.flush();
            }
        }
    }

    /// Query the device signature and cache it.
    pub fn query_signature(&mut self) -> Result<Signature> {
        let payload = self.transact(SIG_CMD, &[], QUERY_TIMEOUT, "device signature")?;
        let sig = Signature::parse(&payload)?;
        log::debug!(
            "signature: {} (TYP=0x{:02X}), {} areas, max {} bps",
            sig.group,
            sig.typ,
            sig.area_count,
            sig.max_baudrate
        );
        self.signature = Some(sig.clone());
        Ok(sig)
    }

    /// Query one area descriptor per NOA reported in the signature and
    /// cache the resulting memory map.
    pub fn query_areas(&mut self) -> Result<&[Area]> {
        let count = self
            .signature
            .as_ref()
            .map(|sig| sig.area_count)
            .ok_or_else(|| Error::Precondition("device signature not queried yet".into()))?;

        let mut areas = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let payload = self.transact(ARE_CMD, &[index], QUERY_TIMEOUT, "area information")?;
            let area = Area::parse(&payload)?;
            log::debug!("area {} {}", index, area);
            areas.push(area);
        }

        self.areas = areas;
        Ok(&self.areas)
    }

    /// Negotiate a new UART baud rate with the device, then reconfigure
    /// the host side.
    ///
    /// The device acknowledges at the old rate; the host must wait at
    /// least 1 ms before switching its own line.
    pub fn set_baudrate(&mut self, rate: u32) -> Result<()> {
        let baud = to_serial_baud(rate)?;

        self.transact(
            BAU_CMD,
            &rate.to_be_bytes(),
            QUERY_TIMEOUT,
            "baud rate change",
        )?;

        thread::sleep(Duration::from_millis(1));
        self.port
            .reconfigure(&|settings| settings.set_baud_rate(baud))?;
        self.baudrate = rate;

        log::debug!("baud rate changed to {} bps", rate);
        Ok(())
    }

    /// Send an arbitrary command frame and return the response payload.
    /// Diagnostic escape hatch; no area or state checks are applied.
    pub fn raw_command(&mut self, cmd: u8, data: &[u8]) -> Result<Vec<u8>> {
        self.transact(cmd, data, Duration::from_secs(5), "raw command")
    }

    fn init_communications(&mut self) -> Result<()> {
        if self.inquire()? {
            log::debug!("bootloader already in command mode");
            return Ok(());
        }

        self.sync()?;
        let code = self.confirm()?;
        self.boot_code = Some(code);
        Ok(())
    }

    /// Probe with a zero-data INQ frame. A `0x00` reply (or silence)
    /// means the device has not synced yet. Anything else is the start
    /// of a response from a previous session: drain the remainder so
    /// the input stream is clean, and report command mode.
    fn inquire(&mut self) -> Result<bool> {
        let pkt = packet::pack(INQ_CMD, &[], false)?;
        self.send(&pkt)?;

        let mut first = [0u8; 1];
        let n = self.recv(&mut first, self.timeout)?;
        if n == 0 || first[0] == SYNC_BYTE {
            return Ok(false);
        }

        let mut hdr = [0u8; 3];
        let n = self.recv(&mut hdr, self.timeout)?;
        if n < 3 {
            return Err(Error::Frame(FrameError::Truncated {
                announced: 3,
                available: n,
            }));
        }

        // LNH, LNL, RES consumed; data + SUM + ETX still pending.
        let pkt_len = usize::from(packet::read_be16(&hdr[0..2]));
        let mut remaining = pkt_len.saturating_sub(1) + 2;
        let mut drain = [0u8; 256];
        while remaining > 0 {
            let want = remaining.min(drain.len());
            let n = self.recv(&mut drain[..want], self.timeout)?;
            if n == 0 {
                break;
            }
            remaining -= n;
        }

        Ok(true)
    }

    /// Repeat three `0x00` bytes until the device echoes one back.
    fn sync(&mut self) -> Result<()> {
        let sync = [SYNC_BYTE; 3];

        for _ in 0..self.max_tries {
            self.send(&sync)?;

            let mut resp = [0u8; 1];
            if self.recv(&mut resp, self.timeout)? == 1 && resp[0] == SYNC_BYTE {
                log::debug!("sync OK");
                return Ok(());
            }
        }

        Err(Error::Timeout("bootloader sync"))
    }

    /// Send the generic code and expect one of the known boot codes.
    fn confirm(&mut self) -> Result<BootCode> {
        for tries in 0..self.max_tries {
            self.send(&[GENERIC_CODE])?;

            let mut resp = [0u8; 1];
            if self.recv(&mut resp, self.timeout)? == 1 {
                match BootCode::from_byte(resp[0]) {
                    Some(code) => {
                        log::debug!("boot code 0x{:02X} ({})", resp[0], code.core_name());
                        return Ok(code);
                    }
                    None => log::warn!("unexpected boot code response 0x{:02X}", resp[0]),
                }
            } else {
                log::debug!(
                    "no boot code response (try {}/{})",
                    tries + 1,
                    self.max_tries
                );
            }
        }

        Err(Error::Timeout("boot code confirmation"))
    }

    pub(crate) fn send(&mut self, data: &[u8]) -> Result<()> {
        log::trace!("send {} bytes: {:02X?}", data.len(), data);
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    /// Read up to `buf.len()` bytes. Returns once the buffer is full or
    /// the line goes quiet: the first byte is awaited for `timeout`,
    /// continuation bytes for the tighter inter-byte window. Zero bytes
    /// is not an error here; callers decide whether silence is fatal.
    pub(crate) fn recv(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        self.port.set_timeout(timeout)?;

        let mut total = 0;
        while total < buf.len() {
            match self.port.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => {
                    if total == 0 {
                        self.port.set_timeout(CONTINUATION_TIMEOUT)?;
                    }
                    total += n;
                }
                Err(ref err) if err.kind() == std::io::ErrorKind::TimedOut => break,
                Err(err) => return Err(Error::Io(err)),
            }
        }

        log::trace!("recv {} bytes: {:02X?}", total, &buf[..total]);
        Ok(total)
    }

    /// One request/response exchange: pack, send, receive, unpack.
    pub(crate) fn transact(
        &mut self,
        cmd: u8,
        data: &[u8],
        timeout: Duration,
        context: &'static str,
    ) -> Result<Vec<u8>> {
        let pkt = packet::pack(cmd, data, false)?;
        self.send(&pkt)?;
        self.receive_reply(timeout, context)
    }

    /// Like [`Device::transact`] but with the device-to-host SOD byte,
    /// used for the data frames of a write stream and the
    /// authentication continuation frame.
    pub(crate) fn transact_ack(
        &mut self,
        cmd: u8,
        data: &[u8],
        timeout: Duration,
        context: &'static str,
    ) -> Result<Vec<u8>> {
        let pkt = packet::pack(cmd, data, true)?;
        self.send(&pkt)?;
        self.receive_reply(timeout, context)
    }

    pub(crate) fn receive_reply(
        &mut self,
        timeout: Duration,
        context: &'static str,
    ) -> Result<Vec<u8>> {
        let mut resp = vec![0u8; MAX_PKT_LEN];
        let n = self.recv(&mut resp, timeout)?;
        if n == 0 {
            return Err(Error::Timeout(context));
        }

        let (payload, _res) = packet::unpack(&resp[..n])?;
        Ok(payload.to_vec())
    }
}

impl<P> fmt::Debug for Device<P> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Device")
            .field("boot_code", &self.boot_code)
            .field("signature", &self.signature)
            .field("areas", &self.areas)
            .field("authenticated", &self.authenticated)
            .field("uart_mode", &self.uart_mode)
            .field("baudrate", &self.baudrate)
            .field("port", &())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::{self, data_response, ok_response, MockPort};
    use super::*;

    #[test]
    fn test_baud_table() {
        assert!(supported_baudrate(9600));
        assert!(supported_baudrate(115200));
        assert!(supported_baudrate(4_000_000));
        assert!(!supported_baudrate(12345));

        assert!(to_serial_baud(12345).is_err());
        assert_eq!(
            to_serial_baud(115200).unwrap(),
            serial::BaudRate::Baud115200
        );
        assert_eq!(
            to_serial_baud(921600).unwrap(),
            serial::BaudRate::BaudOther(921600)
        );
    }

    #[test]
    fn test_best_baudrate() {
        assert_eq!(best_baudrate(1_000_000), 1_000_000);
        assert_eq!(best_baudrate(999_999), 921_600);
        assert_eq!(best_baudrate(u32::max_value()), 4_000_000);
        assert_eq!(best_baudrate(9600), 9600);
        assert_eq!(best_baudrate(1), 9600);
    }

    #[test]
    fn test_handshake_sync_and_confirm() {
        let mut port = MockPort::new();
        port.push_silence(); // INQ: no reply, device not synced
        port.push_response(vec![SYNC_BYTE]); // sync echo
        port.push_response(vec![0xC6]); // boot code

        let sent = port.sent_log();
        let device = Device::new(port, false).unwrap();
        assert_eq!(device.boot_code(), Some(BootCode::CortexM33));

        let sent = sent.borrow();
        assert_eq!(sent[0], vec![0x01, 0x00, 0x01, 0x00, 0xFF, 0x03]);
        assert_eq!(sent[1], vec![0x00, 0x00, 0x00]);
        assert_eq!(sent[2], vec![GENERIC_CODE]);
    }

    #[test]
    fn test_handshake_retries_unexpected_boot_code() {
        let mut port = MockPort::new();
        port.push_response(vec![SYNC_BYTE]); // INQ echoes a sync byte
        port.push_response(vec![SYNC_BYTE]);
        port.push_response(vec![0xAA]); // garbage, retried
        port.push_response(vec![0xC3]);

        let device = Device::new(port, false).unwrap();
        assert_eq!(device.boot_code(), Some(BootCode::CortexM4M23));
    }

    #[test]
    fn test_handshake_already_connected_drains_stale_frame() {
        let mut port = MockPort::new();
        // A stale signature response from a crashed session.
        port.push_response(data_response(SIG_CMD, &[0x55; 41]));

        let sent = port.sent_log();
        let device = Device::new(port, false).unwrap();
        // No sync or confirm ran.
        assert_eq!(device.boot_code(), None);
        assert_eq!(sent.borrow().len(), 1);
    }

    #[test]
    fn test_handshake_sync_failure_is_fatal() {
        let port = MockPort::new();
        match Device::new(port, false) {
            Err(Error::Timeout(what)) => assert_eq!(what, "bootloader sync"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_query_signature_and_areas() {
        let mut device = testutil::rig(MockPort::new());
        device
            .port
            .push_response(data_response(SIG_CMD, &testutil::sig_payload(2)));
        device.port.push_response(data_response(
            ARE_CMD,
            &testutil::area_payload(0x00, 0x0, 0x0007_FFFF, 0x2000, 0x80, 0x04, 0x04),
        ));
        device.port.push_response(data_response(
            ARE_CMD,
            &testutil::area_payload(0x10, 0x0800_0000, 0x0800_1FFF, 0x40, 0x04, 0x04, 0x04),
        ));

        let sig = device.query_signature().unwrap();
        assert_eq!(sig.area_count, 2);

        let areas = device.query_areas().unwrap().to_vec();
        assert_eq!(areas.len(), 2);
        assert_eq!(areas[0].ead, 0x0007_FFFF);
        assert_eq!(areas[1].sad, 0x0800_0000);

        // ARE requests carry the area index.
        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent[1][3], ARE_CMD);
        assert_eq!(sent[1][4], 0);
        assert_eq!(sent[2][4], 1);
    }

    #[test]
    fn test_query_areas_requires_signature() {
        let mut device = testutil::rig(MockPort::new());
        assert!(matches!(
            device.query_areas(),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_set_baudrate() {
        let mut device = testutil::rig(MockPort::new());
        device.port.push_response(ok_response(BAU_CMD));

        device.set_baudrate(921_600).unwrap();
        assert_eq!(device.baudrate(), 921_600);

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        let frame = sent.last().unwrap();
        assert_eq!(frame[3], BAU_CMD);
        assert_eq!(&frame[4..8], &921_600u32.to_be_bytes());
    }

    #[test]
    fn test_set_baudrate_rejects_unsupported_rate() {
        let mut device = testutil::rig(MockPort::new());
        assert!(matches!(
            device.set_baudrate(1234),
            Err(Error::UnsupportedBaud(1234))
        ));
        // Nothing went on the wire.
        assert!(device.port.sent_log().borrow().is_empty());
    }

    #[test]
    fn test_close_resets_uart_baudrate() {
        let mut device = testutil::rig(MockPort::new());
        device.uart_mode = true;
        device.baudrate = 921_600;

        let sent = device.port.sent_log();
        device.close();

        let sent = sent.borrow();
        let frame = sent.last().unwrap();
        assert_eq!(frame[3], BAU_CMD);
        assert_eq!(&frame[4..8], &9600u32.to_be_bytes());
    }

    #[test]
    fn test_close_usb_mode_is_silent() {
        let device = testutil::rig(MockPort::new());
        let sent = device.port.sent_log();
        device.close();
        assert!(sent.borrow().is_empty());
    }
}
