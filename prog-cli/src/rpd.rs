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

//! Renesas Partition Data (`.rpd`) files, as generated by the IDE's
//! TrustZone partitioning step. Key/value text with hex byte counts;
//! the boundary command wants KiB.

use anyhow::{bail, Context, Result};
use ra_dfu::Boundary;

fn parse_hex_value(value: &str) -> Result<u32> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16).with_context(|| format!("invalid hex value `{}`", value))
}

fn to_kib(key: &str, bytes: u32) -> Result<u16> {
    if bytes % 1024 != 0 {
        bail!("{}: 0x{:X} bytes is not a whole KiB multiple", key, bytes);
    }
    let kib = bytes / 1024;
    if kib > u32::from(u16::max_value()) {
        bail!("{}: 0x{:X} bytes is out of range", key, bytes);
    }
    Ok(kib as u16)
}

/// Parse `.rpd` contents into boundary settings.
///
/// Recognized keys: `FLASH_C_SIZE` (code flash secure without NSC),
/// `FLASH_S_SIZE` (code flash secure total), `DATA_FLASH_S_SIZE`,
/// `RAM_C_SIZE` and `RAM_S_SIZE`. All five must be present.
pub fn parse(text: &str) -> Result<Boundary> {
    let mut cfs1 = None;
    let mut cfs2 = None;
    let mut dfs = None;
    let mut srs1 = None;
    let mut srs2 = None;

    for (line_num, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        let mut parts = line.splitn(2, '=');
        let key = parts.next().unwrap_or("").trim();
        let value = match parts.next() {
            Some(value) => value,
            None => bail!("line {}: expected KEY=VALUE", line_num + 1),
        };

        let slot = match key {
            "FLASH_C_SIZE" => &mut cfs1,
            "FLASH_S_SIZE" => &mut cfs2,
            "DATA_FLASH_S_SIZE" => &mut dfs,
            "RAM_C_SIZE" => &mut srs1,
            "RAM_S_SIZE" => &mut srs2,
            // Partition files carry more keys than the boundary needs.
            _ => continue,
        };

        let bytes = parse_hex_value(value).with_context(|| format!("line {}", line_num + 1))?;
        *slot = Some(to_kib(key, bytes)?);
    }

    match (cfs1, cfs2, dfs, srs1, srs2) {
        (Some(cfs1), Some(cfs2), Some(dfs), Some(srs1), Some(srs2)) => Ok(Boundary {
            cfs1,
            cfs2,
            dfs,
            srs1,
            srs2,
        }),
        _ => bail!(
            "missing keys; need FLASH_C_SIZE, FLASH_S_SIZE, DATA_FLASH_S_SIZE, RAM_C_SIZE and RAM_S_SIZE"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_complete_file() {
        let text = "\
# generated partition data
FLASH_C_SIZE=0x10000
FLASH_S_SIZE=0x20000
DATA_FLASH_S_SIZE=0x800
RAM_C_SIZE=0x4000
RAM_S_SIZE=0x8000
RESERVED=0xdeadbeef
";
        let boundary = parse(text).unwrap();
        assert_eq!(boundary.cfs1, 64);
        assert_eq!(boundary.cfs2, 128);
        assert_eq!(boundary.dfs, 2);
        assert_eq!(boundary.srs1, 16);
        assert_eq!(boundary.srs2, 32);
    }

    #[test]
    fn test_parse_accepts_bare_hex() {
        let text = "\
FLASH_C_SIZE=8000
FLASH_S_SIZE=8000
DATA_FLASH_S_SIZE=400
RAM_C_SIZE=2000
RAM_S_SIZE=2000
";
        let boundary = parse(text).unwrap();
        assert_eq!(boundary.cfs1, 32);
        assert_eq!(boundary.dfs, 1);
    }

    #[test]
    fn test_parse_rejects_partial_kib() {
        let text = "\
FLASH_C_SIZE=0x10001
FLASH_S_SIZE=0x20000
DATA_FLASH_S_SIZE=0x800
RAM_C_SIZE=0x4000
RAM_S_SIZE=0x8000
";
        assert!(parse(text).is_err());
    }

    #[test]
    fn test_parse_requires_all_keys() {
        assert!(parse("FLASH_S_SIZE=0x20000\n").is_err());
        assert!(parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage_value() {
        let text = "FLASH_C_SIZE=zzz\n";
        assert!(parse(text).is_err());
    }
}
