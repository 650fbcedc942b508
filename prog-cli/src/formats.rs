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

//! Firmware image file formats: raw binary, Intel HEX and Motorola
//! S-record. Small implementations covering the records toolchains
//! actually emit.

use std::{fmt::Write as _, fs, path::Path, str::FromStr};

use anyhow::{bail, Context, Result};
use ra_dfu::ParsedFile;

const BYTES_PER_LINE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Pick by file extension.
    Auto,
    Bin,
    Ihex,
    Srec,
}

impl Format {
    pub fn name(self) -> &'static str {
        match self {
            Format::Auto => "auto",
            Format::Bin => "binary",
            Format::Ihex => "Intel HEX",
            Format::Srec => "Motorola S-record",
        }
    }
}

impl FromStr for Format {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Format> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Format::Auto),
            "bin" | "binary" => Ok(Format::Bin),
            "ihex" | "hex" => Ok(Format::Ihex),
            "srec" | "mot" => Ok(Format::Srec),
            other => bail!("unknown format `{}` (use auto, bin, ihex or srec)", other),
        }
    }
}

/// Format from the file extension; raw binary when unrecognized.
pub fn detect(path: &Path) -> Format {
    let ext = match path.extension().and_then(|ext| ext.to_str()) {
        Some(ext) => ext.to_ascii_lowercase(),
        None => return Format::Bin,
    };

    match ext.as_str() {
        "hex" | "ihex" => Format::Ihex,
        "srec" | "s19" | "s28" | "s37" | "mot" => Format::Srec,
        _ => Format::Bin,
    }
}

/// Parse a firmware image file into the flash engine's input record.
pub fn parse(path: &Path, format: Format) -> Result<ParsedFile> {
    let format = match format {
        Format::Auto => detect(path),
        other => other,
    };
    log::debug!("parsing `{}` as {}", path.display(), format.name());

    match format {
        Format::Bin => {
            let data = fs::read(path)
                .with_context(|| format!("couldn't read `{}`", path.display()))?;
            Ok(ParsedFile {
                data,
                base_addr: 0,
                has_addr: false,
            })
        }
        Format::Ihex | Format::Srec => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("couldn't read `{}`", path.display()))?;
            let parsed = if format == Format::Ihex {
                parse_ihex(&text)
            } else {
                parse_srec(&text)
            };
            parsed.with_context(|| format!("couldn't parse `{}`", path.display()))
        }
        Format::Auto => unreachable!(),
    }
}

/// Write flash contents to a file in the requested format.
pub fn write(path: &Path, format: Format, data: &[u8], addr: u32) -> Result<()> {
    let format = match format {
        Format::Auto => detect(path),
        other => other,
    };

    let result = match format {
        Format::Bin => fs::write(path, data),
        Format::Ihex => fs::write(path, encode_ihex(data, addr)),
        Format::Srec => fs::write(path, encode_srec(data, addr)),
        Format::Auto => unreachable!(),
    };

    result.with_context(|| format!("couldn't write `{}`", path.display()))
}

fn hex_byte(s: &[u8]) -> Result<u8> {
    if s.len() < 2 {
        bail!("line too short");
    }
    let text = std::str::from_utf8(&s[..2]).context("invalid hex digits")?;
    u8::from_str_radix(text, 16).context("invalid hex digits")
}

/// A decoded data record: absolute address plus payload.
struct Record {
    addr: u32,
    data: Vec<u8>,
}

/// Assemble records into one contiguous image, filling gaps with the
/// erased-flash value.
fn assemble(records: Vec<Record>) -> Result<ParsedFile> {
    let min_addr = match records.iter().map(|r| r.addr).min() {
        Some(min) => min,
        None => bail!("no data records found"),
    };
    let max_end = records
        .iter()
        .map(|r| u64::from(r.addr) + r.data.len() as u64)
        .max()
        .unwrap_or(u64::from(min_addr));

    let size = (max_end - u64::from(min_addr)) as usize;
    let mut data = vec![0xFFu8; size];
    for record in records {
        let offset = (record.addr - min_addr) as usize;
        data[offset..offset + record.data.len()].copy_from_slice(&record.data);
    }

    Ok(ParsedFile {
        data,
        base_addr: min_addr,
        has_addr: true,
    })
}

fn parse_ihex(text: &str) -> Result<ParsedFile> {
    let mut records = Vec::new();
    let mut ext_addr: u32 = 0;
    let mut eof_seen = false;

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let line_num = line_num + 1;
        let bytes = line.as_bytes();
        if bytes[0] != b':' {
            bail!("line {}: expected ':' at start of line", line_num);
        }
        let p = &bytes[1..];
        if p.len() < 10 {
            bail!("line {}: line too short", line_num);
        }

        let byte_count = hex_byte(p).with_context(|| format!("line {}", line_num))? as usize;
        let addr_hi = hex_byte(&p[2..]).with_context(|| format!("line {}", line_num))?;
        let addr_lo = hex_byte(&p[4..]).with_context(|| format!("line {}", line_num))?;
        let rec_type = hex_byte(&p[6..]).with_context(|| format!("line {}", line_num))?;

        if p.len() < 8 + byte_count * 2 + 2 {
            bail!("line {}: line too short for byte count", line_num);
        }

        let mut checksum = (byte_count as u8)
            .wrapping_add(addr_hi)
            .wrapping_add(addr_lo)
            .wrapping_add(rec_type);
        let mut data = Vec::with_capacity(byte_count);
        for i in 0..byte_count {
            let byte =
                hex_byte(&p[8 + i * 2..]).with_context(|| format!("line {}", line_num))?;
            data.push(byte);
            checksum = checksum.wrapping_add(byte);
        }
        let file_checksum =
            hex_byte(&p[8 + byte_count * 2..]).with_context(|| format!("line {}", line_num))?;
        if checksum.wrapping_add(file_checksum) != 0 {
            bail!("line {}: checksum mismatch", line_num);
        }

        let addr = (u16::from(addr_hi) << 8) | u16::from(addr_lo);
        match rec_type {
            0x00 => records.push(Record {
                addr: ext_addr + u32::from(addr),
                data,
            }),
            0x01 => eof_seen = true,
            0x02 => {
                if data.len() != 2 {
                    bail!("line {}: invalid extended segment address record", line_num);
                }
                ext_addr = ((u32::from(data[0]) << 8) | u32::from(data[1])) << 4;
            }
            0x04 => {
                if data.len() != 2 {
                    bail!("line {}: invalid extended linear address record", line_num);
                }
                ext_addr = ((u32::from(data[0]) << 8) | u32::from(data[1])) << 16;
            }
            // Start addresses have no meaning for flashing.
            0x03 | 0x05 => {}
            other => bail!("line {}: unknown record type 0x{:02X}", line_num, other),
        }
    }

    if !eof_seen {
        bail!("no EOF record found");
    }

    assemble(records)
}

fn parse_srec(text: &str) -> Result<ParsedFile> {
    let mut records = Vec::new();
    let mut eof_seen = false;

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let line_num = line_num + 1;
        let bytes = line.as_bytes();
        if bytes[0] != b'S' && bytes[0] != b's' {
            bail!("line {}: expected 'S' at start of line", line_num);
        }
        if bytes.len() < 2 || !bytes[1].is_ascii_digit() {
            bail!("line {}: expected digit after 'S'", line_num);
        }
        let rec_type = bytes[1] - b'0';
        let p = &bytes[2..];
        if p.len() < 4 {
            bail!("line {}: line too short", line_num);
        }

        let byte_count = hex_byte(p).with_context(|| format!("line {}", line_num))? as usize;
        if p.len() < 2 + byte_count * 2 {
            bail!("line {}: line too short for byte count", line_num);
        }

        let addr_bytes = match rec_type {
            0 | 1 | 5 | 9 => 2,
            2 | 8 => 3,
            3 | 7 => 4,
            other => bail!("line {}: unknown record type S{}", line_num, other),
        };
        if byte_count < addr_bytes + 1 {
            bail!("line {}: byte count too small", line_num);
        }

        let mut checksum = byte_count as u8;
        let mut addr: u32 = 0;
        for i in 0..addr_bytes {
            let byte =
                hex_byte(&p[2 + i * 2..]).with_context(|| format!("line {}", line_num))?;
            addr = (addr << 8) | u32::from(byte);
            checksum = checksum.wrapping_add(byte);
        }

        let data_bytes = byte_count - addr_bytes - 1;
        let mut data = Vec::with_capacity(data_bytes);
        for i in 0..data_bytes {
            let byte = hex_byte(&p[2 + addr_bytes * 2 + i * 2..])
                .with_context(|| format!("line {}", line_num))?;
            data.push(byte);
            checksum = checksum.wrapping_add(byte);
        }

        let file_checksum = hex_byte(&p[2 + addr_bytes * 2 + data_bytes * 2..])
            .with_context(|| format!("line {}", line_num))?;
        if checksum.wrapping_add(file_checksum) != 0xFF {
            bail!("line {}: checksum mismatch", line_num);
        }

        match rec_type {
            1 | 2 | 3 => records.push(Record { addr, data }),
            7 | 8 | 9 => eof_seen = true,
            // Header and record count carry no image data.
            0 | 5 => {}
            _ => unreachable!(),
        }
    }

    if !eof_seen {
        bail!("no end record found");
    }

    assemble(records)
}

fn encode_ihex(data: &[u8], addr: u32) -> String {
    let mut out = String::new();
    let mut current_ext: u32 = 0;
    let mut offset = 0;

    while offset < data.len() {
        let line_addr = addr + offset as u32;

        // Extended linear address record when crossing a 64 KiB page.
        let ext = line_addr >> 16;
        if ext != current_ext {
            let sum = 0x02u8
                .wrapping_add(0x04)
                .wrapping_add((ext >> 8) as u8)
                .wrapping_add(ext as u8);
            let _ = writeln!(out, ":02000004{:04X}{:02X}", ext, sum.wrapping_neg());
            current_ext = ext;
        }

        let line_len = BYTES_PER_LINE.min(data.len() - offset);
        let rec_addr = (line_addr & 0xFFFF) as u16;
        let mut sum = (line_len as u8)
            .wrapping_add((rec_addr >> 8) as u8)
            .wrapping_add(rec_addr as u8);
        let _ = write!(out, ":{:02X}{:04X}00", line_len, rec_addr);
        for byte in &data[offset..offset + line_len] {
            let _ = write!(out, "{:02X}", byte);
            sum = sum.wrapping_add(*byte);
        }
        let _ = writeln!(out, "{:02X}", sum.wrapping_neg());

        offset += line_len;
    }

    out.push_str(":00000001FF\n");
    out
}

fn encode_srec(data: &[u8], addr: u32) -> String {
    let mut out = String::new();

    // S0 header record.
    let header = b"HDR";
    let mut sum = (header.len() as u8).wrapping_add(3);
    let _ = write!(out, "S0{:02X}0000", header.len() + 3);
    for byte in header {
        let _ = write!(out, "{:02X}", byte);
        sum = sum.wrapping_add(*byte);
    }
    let _ = writeln!(out, "{:02X}", !sum);

    // S3 data records with 32-bit addresses.
    let mut offset = 0;
    while offset < data.len() {
        let line_addr = addr + offset as u32;
        let line_len = BYTES_PER_LINE.min(data.len() - offset);
        let byte_count = (4 + line_len + 1) as u8;

        let mut sum = byte_count;
        for shift in &[24, 16, 8, 0] {
            sum = sum.wrapping_add((line_addr >> shift) as u8);
        }

        let _ = write!(out, "S3{:02X}{:08X}", byte_count, line_addr);
        for byte in &data[offset..offset + line_len] {
            let _ = write!(out, "{:02X}", byte);
            sum = sum.wrapping_add(*byte);
        }
        let _ = writeln!(out, "{:02X}", !sum);

        offset += line_len;
    }

    // S7 end record carrying the start address.
    let mut sum = 0x05u8;
    for shift in &[24, 16, 8, 0] {
        sum = sum.wrapping_add((addr >> shift) as u8);
    }
    let _ = writeln!(out, "S705{:08X}{:02X}", addr, !sum);

    out
}
