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

//! Area-aware flash operations: erase, read, write, verify, blank
//! check and CRC.
//!
//! Every read-style operation iterates in chunks of at most 1 KiB, one
//! complete request/response pair per chunk. The boot firmware's
//! multi-packet continuation mode has an ACK ambiguity, so the engine
//! never relies on it.

use std::time::Duration;

use serial::SerialPort;

use crate::area::{self, FlashOp};
use crate::constants::{CHUNK_SIZE, CRC_CMD, ERA_CMD, REA_CMD, WRI_CMD};
use crate::error::{Error, FrameError, Result};
use crate::packet::{range_payload, read_be32};
use crate::{Area, Device};

const ERASE_TIMEOUT: Duration = Duration::from_secs(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const CRC_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory firmware image handed to the flash engine.
///
/// `base_addr` and `has_addr` come from the file format: Intel HEX and
/// S-record carry their own load address, raw binaries do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFile {
    pub data: Vec<u8>,
    pub base_addr: u32,
    pub has_addr: bool,
}

impl ParsedFile {
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl<P> Device<P>
where
    P: SerialPort,
{
    /// Erase whole erase blocks covering `size` bytes from `start`.
    /// A zero size erases a single block.
    pub fn erase(&mut self, start: u32, size: u32) -> Result<()> {
        let area = self.area_for(start)?;
        let end = area::compute_end(&area, FlashOp::Erase, start, size.max(1))?;

        log::info!("erasing 0x{:08X}:0x{:08X}", start, end);
        self.transact(ERA_CMD, &range_payload(start, end), ERASE_TIMEOUT, "erase")?;
        Ok(())
    }

    /// Read `size` bytes from `start` (the whole area when zero).
    ///
    /// The returned buffer covers the read-unit aligned range, which
    /// may extend a few bytes past `size`.
    pub fn read(&mut self, start: u32, size: u32) -> Result<Vec<u8>> {
        let area = self.area_for(start)?;
        let size = if size == 0 { area.ead - start + 1 } else { size };
        let end = area::compute_end(&area, FlashOp::Read, start, size)?;

        let mut out = Vec::with_capacity((end - start + 1) as usize);
        self.read_chunks(start, end, "Reading", |_, chunk| {
            out.extend_from_slice(chunk);
            Ok(())
        })?;
        Ok(out)
    }

    /// Compare flash contents against `file`. Reports the first
    /// mismatch with its absolute address; where the read range extends
    /// past the file, flash must read back as erased (`0xFF`).
    pub fn verify(&mut self, file: &ParsedFile, start: u32, size: u32) -> Result<()> {
        self.verify_with(file, start, size, true)
    }

    /// Require `size` bytes from `start` (the whole area when zero) to
    /// be erased. Reports the first non-`0xFF` byte.
    pub fn blank_check(&mut self, start: u32, size: u32) -> Result<()> {
        let area = self.area_for(start)?;
        let size = if size == 0 { area.ead - start + 1 } else { size };
        let end = area::compute_end(&area, FlashOp::Read, start, size)?;

        self.read_chunks(start, end, "Blank checking", |chunk_start, chunk| {
            for (i, byte) in chunk.iter().enumerate() {
                if *byte != 0xFF {
                    return Err(Error::Blank {
                        address: chunk_start + i as u32,
                        value: *byte,
                    });
                }
            }
            Ok(())
        })
    }

    /// Write `file` to flash at `start`, streaming write-unit aligned
    /// chunks after the range header is acknowledged. When the file is
    /// shorter than the aligned range the tail is padded with zeros.
    ///
    /// With `verify_after` the written bytes are read back and compared
    /// against the file.
    pub fn write(
        &mut self,
        file: &ParsedFile,
        start: u32,
        size: u32,
        verify_after: bool,
    ) -> Result<()> {
        let file_size = file.size() as u32;
        let size = if size == 0 { file_size } else { size };
        if size > file_size {
            return Err(Error::Precondition(format!(
                "write size 0x{:X} exceeds file size 0x{:X}",
                size, file_size
            )));
        }

        let area = self.area_for(start)?;
        let end = area::compute_end(&area, FlashOp::Write, start, size)?;
        let write_size = end - start + 1;

        log::info!("writing 0x{:08X}:0x{:08X} ({} bytes)", start, end, write_size);
        self.transact(WRI_CMD, &range_payload(start, end), WRITE_TIMEOUT, "write init")?;

        if let Some(sink) = self.progress.as_mut() {
            sink.begin(u64::from(write_size), "Writing");
        }

        let mut total: u32 = 0;
        let result = loop {
            if total >= write_size {
                break Ok(());
            }

            let chunk_len = (write_size - total).min(CHUNK_SIZE as u32) as usize;
            let offset = total as usize;
            let mut chunk = vec![0u8; chunk_len];
            let available = file.data.len().saturating_sub(offset).min(chunk_len);
            chunk[..available].copy_from_slice(&file.data[offset..offset + available]);

            if let Err(err) = self.transact_ack(WRI_CMD, &chunk, WRITE_TIMEOUT, "write") {
                break Err(err);
            }

            total += chunk_len as u32;
            if let Some(sink) = self.progress.as_mut() {
                sink.update(u64::from(total));
            }
        };

        if let Some(sink) = self.progress.as_mut() {
            sink.finish();
        }
        result?;

        if verify_after {
            // Only the bytes the file actually provides are compared;
            // the zero-padded tail of the last write unit is not
            // expected to read back as erased.
            self.verify_with(file, start, size, false)?;
            log::info!("read-back verify OK");
        }

        Ok(())
    }

    /// CRC-32 (polynomial 0x04C11DB7) of the CRC-unit aligned range, as
    /// computed by the device.
    pub fn crc(&mut self, start: u32, size: u32) -> Result<u32> {
        let area = self.area_for(start)?;
        let end = area::compute_end(&area, FlashOp::Crc, start, size.max(1))?;

        log::info!("device CRC over 0x{:08X}:0x{:08X}", start, end);
        let payload = self.transact(CRC_CMD, &range_payload(start, end), CRC_TIMEOUT, "CRC")?;
        if payload.len() < 4 {
            return Err(Error::Frame(FrameError::Truncated {
                announced: 4,
                available: payload.len(),
            }));
        }

        Ok(read_be32(&payload[..4]))
    }

    fn verify_with(
        &mut self,
        file: &ParsedFile,
        start: u32,
        size: u32,
        blank_tail: bool,
    ) -> Result<()> {
        let size = if size == 0 { file.size() as u32 } else { size };
        let area = self.area_for(start)?;
        let end = area::compute_end(&area, FlashOp::Read, start, size)?;

        let data = &file.data;
        self.read_chunks(start, end, "Verifying", |chunk_start, chunk| {
            for (i, flash) in chunk.iter().enumerate() {
                let address = chunk_start + i as u32;
                let offset = (address - start) as usize;
                let expected = match data.get(offset) {
                    Some(byte) => *byte,
                    None if blank_tail => 0xFF,
                    None => continue,
                };
                if *flash != expected {
                    return Err(Error::Verify {
                        address,
                        flash: *flash,
                        expected,
                    });
                }
            }
            Ok(())
        })
    }

    /// Drive REA over `[start, end]` in single-packet chunks, handing
    /// each returned chunk to `consume` with its start address.
    fn read_chunks<F>(&mut self, start: u32, end: u32, desc: &str, mut consume: F) -> Result<()>
    where
        F: FnMut(u32, &[u8]) -> Result<()>,
    {
        let total = u64::from(end - start) + 1;
        if let Some(sink) = self.progress.as_mut() {
            sink.begin(total, desc);
        }

        let mut chunk_start = start;
        let mut done: u64 = 0;
        let result = loop {
            let chunk_end = chunk_start.saturating_add(CHUNK_SIZE as u32 - 1).min(end);

            let payload = match self.transact(
                REA_CMD,
                &range_payload(chunk_start, chunk_end),
                READ_TIMEOUT,
                "read",
            ) {
                Ok(payload) => payload,
                Err(err) => break Err(err),
            };

            let expected = (chunk_end - chunk_start + 1) as usize;
            if payload.len() != expected {
                break Err(Error::Frame(FrameError::Truncated {
                    announced: expected,
                    available: payload.len(),
                }));
            }

            if let Err(err) = consume(chunk_start, &payload) {
                break Err(err);
            }

            done += expected as u64;
            if let Some(sink) = self.progress.as_mut() {
                sink.update(done);
            }

            if chunk_end == end {
                break Ok(());
            }
            chunk_start = chunk_end + 1;
        };

        if let Some(sink) = self.progress.as_mut() {
            sink.finish();
        }
        result
    }

    fn area_for(&self, addr: u32) -> Result<Area> {
        area::find_area_for_address(&self.areas, addr)
            .copied()
            .ok_or_else(|| {
                Error::Precondition(format!("address 0x{:08X} not in any known area", addr))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use super::*;
    use crate::constants::STATUS_ERR;
    use crate::progress::ProgressSink;
    use crate::testutil::{
        data_response, error_response, ok_response, ra4m2_areas, rig_with_map, MockPort,
    };

    #[test]
    fn test_erase_packs_block_aligned_range() {
        let mut port = MockPort::new();
        // 81 00 02 12 00 EC 03
        port.push_response(ok_response(ERA_CMD));

        let mut device = rig_with_map(port, ra4m2_areas());
        device.erase(0x0, 0x2000).unwrap();

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(
            sent[0],
            vec![0x01, 0x00, 0x09, 0x12, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x1F, 0xFF, 0xC7, 0x03]
        );
    }

    #[test]
    fn test_erase_rejects_unaligned_start_before_sending() {
        let mut device = rig_with_map(MockPort::new(), ra4m2_areas());
        assert!(matches!(
            device.erase(0x100, 0x2000),
            Err(Error::Alignment { unit: 0x2000, .. })
        ));
        assert!(device.port.sent_log().borrow().is_empty());
    }

    #[test]
    fn test_erase_surfaces_device_error() {
        let mut port = MockPort::new();
        port.push_response(error_response(ERA_CMD, 0xE1));

        let mut device = rig_with_map(port, ra4m2_areas());
        match device.erase(0x0, 0x2000) {
            Err(Error::Response { sts: 0xE1, .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_erase_unknown_address() {
        let mut device = rig_with_map(MockPort::new(), ra4m2_areas());
        assert!(matches!(
            device.erase(0x2000_0000, 0x2000),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_read_chunks_bounded_to_1k() {
        let mut port = MockPort::new();
        let pattern: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        port.push_response(data_response(REA_CMD, &pattern[..1024]));
        port.push_response(data_response(REA_CMD, &pattern[1024..2048]));
        port.push_response(data_response(REA_CMD, &pattern[2048..3000]));

        let mut device = rig_with_map(port, ra4m2_areas());
        let data = device.read(0x0, 3000).unwrap();
        assert_eq!(data, pattern);

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent.len(), 3);
        assert_eq!(&sent[0][4..12], &range_payload(0, 1023));
        assert_eq!(&sent[1][4..12], &range_payload(1024, 2047));
        assert_eq!(&sent[2][4..12], &range_payload(2048, 2999));
    }

    #[test]
    fn test_read_rejects_short_chunk() {
        let mut port = MockPort::new();
        port.push_response(data_response(REA_CMD, &[0xFF; 100]));

        let mut device = rig_with_map(port, ra4m2_areas());
        assert!(matches!(
            device.read(0x0, 1024),
            Err(Error::Frame(FrameError::Truncated { .. }))
        ));
    }

    #[test]
    fn test_write_streams_padded_chunks() {
        let mut port = MockPort::new();
        port.push_response(ok_response(WRI_CMD)); // range header
        port.push_response(ok_response(WRI_CMD)); // data chunk

        let file = ParsedFile {
            data: (0..200u32).map(|i| i as u8).collect(),
            base_addr: 0,
            has_addr: false,
        };

        let mut device = rig_with_map(port, ra4m2_areas());
        device.write(&file, 0x0, 0, false).unwrap();

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);

        // Header covers two 128-byte write units.
        assert_eq!(sent[0][3], WRI_CMD);
        assert_eq!(&sent[0][4..12], &range_payload(0x0, 0xFF));

        // Data frame uses the ACK start-of-data byte and zero padding.
        assert_eq!(sent[1][0], 0x81);
        assert_eq!(sent[1][3], WRI_CMD);
        assert_eq!(&sent[1][4..204], file.data.as_slice());
        assert_eq!(&sent[1][204..260], [0u8; 56].as_ref());
    }

    #[test]
    fn test_write_rejects_size_beyond_file() {
        let file = ParsedFile {
            data: vec![0xAA; 16],
            base_addr: 0,
            has_addr: false,
        };
        let mut device = rig_with_map(MockPort::new(), ra4m2_areas());
        assert!(matches!(
            device.write(&file, 0x0, 32, false),
            Err(Error::Precondition(_))
        ));
    }

    #[test]
    fn test_write_with_readback_verify() {
        let mut port = MockPort::new();
        port.push_response(ok_response(WRI_CMD));
        port.push_response(ok_response(WRI_CMD));
        // Read-back of the first write unit; only the 8 file bytes are
        // compared, the written zero padding is fine.
        let mut readback = vec![0u8; 8];
        readback.copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        port.push_response(data_response(REA_CMD, &readback));

        let file = ParsedFile {
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
            base_addr: 0,
            has_addr: false,
        };

        let mut device = rig_with_map(port, ra4m2_areas());
        device.write(&file, 0x0800_0000, 0, true).unwrap();
    }

    #[test]
    fn test_verify_reports_first_mismatch() {
        let mut port = MockPort::new();
        let mut flash = vec![0x11u8; 8];
        flash[5] = 0x99;
        port.push_response(data_response(REA_CMD, &flash));

        let file = ParsedFile {
            data: vec![0x11; 8],
            base_addr: 0,
            has_addr: false,
        };

        let mut device = rig_with_map(port, ra4m2_areas());
        match device.verify(&file, 0x0, 0) {
            Err(Error::Verify {
                address,
                flash,
                expected,
            }) => {
                assert_eq!(address, 5);
                assert_eq!(flash, 0x99);
                assert_eq!(expected, 0x11);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_verify_requires_blank_tail() {
        let mut port = MockPort::new();
        // File covers 6 bytes; the read-unit aligned range covers 8.
        let mut flash = vec![0x22u8; 8];
        flash[6] = 0xFF;
        flash[7] = 0x00; // stale data past the file
        port.push_response(data_response(REA_CMD, &flash));

        let file = ParsedFile {
            data: vec![0x22; 6],
            base_addr: 0,
            has_addr: false,
        };

        let mut device = rig_with_map(port, ra4m2_areas());
        match device.verify(&file, 0x0, 0) {
            Err(Error::Verify {
                address,
                flash,
                expected,
            }) => {
                assert_eq!(address, 7);
                assert_eq!(flash, 0x00);
                assert_eq!(expected, 0xFF);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_blank_check() {
        let mut port = MockPort::new();
        port.push_response(data_response(REA_CMD, &[0xFF; 64]));
        let mut device = rig_with_map(port, ra4m2_areas());
        device.blank_check(0x0, 64).unwrap();

        let mut port = MockPort::new();
        let mut flash = vec![0xFFu8; 64];
        flash[10] = 0x7F;
        port.push_response(data_response(REA_CMD, &flash));
        let mut device = rig_with_map(port, ra4m2_areas());
        match device.blank_check(0x0, 64) {
            Err(Error::Blank { address, value }) => {
                assert_eq!(address, 10);
                assert_eq!(value, 0x7F);
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_crc() {
        let mut port = MockPort::new();
        port.push_response(data_response(CRC_CMD, &0xDEAD_BEEFu32.to_be_bytes()));

        let mut device = rig_with_map(port, ra4m2_areas());
        assert_eq!(device.crc(0x0, 0x1000).unwrap(), 0xDEAD_BEEF);

        let sent = device.port.sent_log();
        let sent = sent.borrow();
        assert_eq!(sent[0][3], CRC_CMD);
        assert_eq!(&sent[0][4..12], &range_payload(0x0, 0xFFF));
    }

    #[test]
    fn test_crc_short_payload() {
        let mut port = MockPort::new();
        port.push_response(data_response(CRC_CMD, &[0x12, 0x34]));
        let mut device = rig_with_map(port, ra4m2_areas());
        assert!(matches!(
            device.crc(0x0, 0x1000),
            Err(Error::Frame(FrameError::Truncated { .. }))
        ));
    }

    #[derive(Default)]
    struct Counter {
        begun: Rc<RefCell<u64>>,
        updates: Rc<RefCell<u32>>,
        finished: Rc<RefCell<bool>>,
    }

    impl ProgressSink for Counter {
        fn begin(&mut self, total: u64, _desc: &str) {
            *self.begun.borrow_mut() = total;
        }
        fn update(&mut self, _current: u64) {
            *self.updates.borrow_mut() += 1;
        }
        fn finish(&mut self) {
            *self.finished.borrow_mut() = true;
        }
    }

    #[test]
    fn test_read_reports_progress() {
        let mut port = MockPort::new();
        port.push_response(data_response(REA_CMD, &vec![0u8; 1024]));
        port.push_response(data_response(REA_CMD, &vec![0u8; 1024]));

        let sink = Counter::default();
        let begun = Rc::clone(&sink.begun);
        let updates = Rc::clone(&sink.updates);
        let finished = Rc::clone(&sink.finished);

        let mut device = rig_with_map(port, ra4m2_areas());
        device.set_progress_sink(Box::new(sink));
        device.read(0x0, 2048).unwrap();

        assert_eq!(*begun.borrow(), 2048);
        assert_eq!(*updates.borrow(), 2);
        assert!(*finished.borrow());
    }

    #[test]
    fn test_error_response_with_flash_details() {
        let mut port = MockPort::new();
        let mut payload = vec![0xE2];
        payload.extend_from_slice(&0x0000_0010u32.to_be_bytes());
        payload.extend_from_slice(&0x0000_0080u32.to_be_bytes());
        port.push_response(crate::packet::pack(WRI_CMD | STATUS_ERR, &payload, true).unwrap());
        port.push_silence();

        let file = ParsedFile {
            data: vec![0xAA; 128],
            base_addr: 0,
            has_addr: false,
        };
        let mut device = rig_with_map(port, ra4m2_areas());
        match device.write(&file, 0x0, 0, false) {
            Err(Error::Response { sts, st2, adr }) => {
                assert_eq!(sts, 0xE2);
                assert_eq!(st2, Some(0x10));
                assert_eq!(adr, Some(0x80));
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
