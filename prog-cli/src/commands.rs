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

//! One handler per sub-command: option decoding, the library call and
//! the human-readable output.

use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use indicatif::{ProgressBar, ProgressStyle};
use serial::SystemPort;

use ra_dfu::{
    area::{KOA_KIND_CODE, KOA_KIND_CONFIG, KOA_KIND_DATA},
    constants::{PARAM_ID_INIT, PARAM_INIT_DISABLED, PARAM_INIT_ENABLED, WRAPPED_KEY_MAX},
    find_span_by_kind, Boundary, Device, DlmState, ParsedFile, ProgressSink,
};

use crate::formats::{self, Format};
use crate::rpd;

type Dev = Device<SystemPort>;

/// Progress sink backed by an `indicatif` bar.
#[derive(Default)]
pub struct Bar {
    bar: Option<ProgressBar>,
}

impl ProgressSink for Bar {
    fn begin(&mut self, total: u64, desc: &str) {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{msg:>14} [{bar:30}] {percent:>3}% ({pos}/{len})")
                .progress_chars("#>-"),
        );
        bar.set_message(desc);
        self.bar = Some(bar);
    }

    fn update(&mut self, current: u64) {
        if let Some(bar) = self.bar.as_ref() {
            bar.set_position(current);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish();
        }
    }
}

pub fn parse_hex_u32(value: &str) -> Result<u32> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    u32::from_str_radix(digits, 16)
        .with_context(|| format!("invalid hex value `{}`", value))
}

pub fn parse_hex_bytes(value: &str) -> Result<Vec<u8>> {
    let digits = value
        .trim()
        .trim_start_matches("0x")
        .trim_start_matches("0X");
    if digits.len() % 2 != 0 {
        bail!("hex string `{}` has an odd number of digits", value);
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("invalid hex string `{}`", value))
        })
        .collect()
}

/// Human size with the unit the number divides evenly into.
pub fn format_size(bytes: u32) -> String {
    if bytes >= 1024 * 1024 {
        format!("{} MB", bytes / (1024 * 1024))
    } else if bytes >= 1024 {
        format!("{} KB", bytes / 1024)
    } else {
        format!("{} bytes", bytes)
    }
}

fn area_kind(name: &str) -> Result<u8> {
    match name.to_ascii_lowercase().as_str() {
        "code" => Ok(KOA_KIND_CODE),
        "data" => Ok(KOA_KIND_DATA),
        "config" => Ok(KOA_KIND_CONFIG),
        other => bail!("unknown area `{}` (use code, data or config)", other),
    }
}

fn address_of(matches: &ArgMatches<'_>) -> Result<Option<u32>> {
    matches.value_of("address").map(parse_hex_u32).transpose()
}

fn size_of(matches: &ArgMatches<'_>) -> Result<u32> {
    Ok(matches
        .value_of("size")
        .map(parse_hex_u32)
        .transpose()?
        .unwrap_or(0))
}

fn format_of(matches: &ArgMatches<'_>) -> Result<Format> {
    matches
        .value_of("format")
        .map(str::parse)
        .transpose()
        .map(|format| format.unwrap_or(Format::Auto))
}

/// `(start, size)` from either `--area <kind>` or `--address`/`--size`.
fn resolve_range(device: &Dev, matches: &ArgMatches<'_>) -> Result<(u32, u32)> {
    if let Some(name) = matches.value_of("area") {
        let kind = area_kind(name)?;
        let (sad, ead) = find_span_by_kind(device.areas(), kind)
            .ok_or_else(|| anyhow!("device has no `{}` area", name))?;
        let size = match size_of(matches)? {
            0 => ead - sad + 1,
            size => size,
        };
        return Ok((sad, size));
    }

    Ok((address_of(matches)?.unwrap_or(0), size_of(matches)?))
}

/// Load address for file-based commands: explicit `--address` wins,
/// then the address carried by the file format, then zero.
fn file_address(matches: &ArgMatches<'_>, file: &ParsedFile) -> Result<u32> {
    if let Some(address) = address_of(matches)? {
        return Ok(address);
    }
    if file.has_addr {
        log::info!("using load address 0x{:08X} from file", file.base_addr);
        return Ok(file.base_addr);
    }
    Ok(0)
}

pub fn list() -> Result<()> {
    let ports = ra_dfu::ports::PortInfo::list_all();
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }

    for port in ports {
        match port.usb_info {
            Some(usb) => {
                let mark = if usb.vid == ra_dfu::constants::RENESAS_VID
                    && usb.pid == ra_dfu::constants::RENESAS_PID
                {
                    "  <- RA boot interface"
                } else {
                    ""
                };
                println!(
                    "{}  [{:04x}:{:04x}] {} {}{}",
                    Path::new(&port.port).display(),
                    usb.vid,
                    usb.pid,
                    usb.manufacturer.as_deref().unwrap_or("?"),
                    usb.product.as_deref().unwrap_or("?"),
                    mark
                );
            }
            None => println!("{}", Path::new(&port.port).display()),
        }
    }

    Ok(())
}

pub fn info(device: &mut Dev) -> Result<()> {
    let sig = device
        .signature()
        .cloned()
        .context("device signature not available")?;

    println!("==================== Device Information ====================");
    println!(
        "Device Group:       {} (TYP=0x{:02X})",
        sig.group.label(),
        sig.typ
    );
    println!("                    {}", sig.group.members());
    println!(
        "Boot Firmware:      v{}.{}.{}",
        sig.boot_firmware.0, sig.boot_firmware.1, sig.boot_firmware.2
    );
    println!("Max UART Baudrate:  {} bps", sig.max_baudrate);
    println!(
        "Number of Areas:    {} ({} mode)",
        sig.area_count,
        if sig.dual_bank() { "dual-bank" } else { "linear" }
    );

    if let Some(did) = sig.device_id {
        let hex: String = did.iter().map(|b| format!("{:02X}", b)).collect();
        println!("Device ID:          {}", hex);

        // Wafer fab, packed manufacturing date, CRC16, lot number and
        // die coordinates.
        let fab: String = did[..2].iter().map(|b| char::from(*b)).collect();
        let year = (did[2] >> 4) & 0x0F;
        let month = did[2] & 0x0F;
        let day = did[3];
        let crc16 = (u16::from(did[4]) << 8) | u16::from(did[5]);
        let lot: String = did[6..12].iter().map(|b| char::from(*b)).collect();
        println!("  Wafer Fab:        {}", fab);
        println!(
            "  Manufacturing:    20{:02}-{:02}-{:02}",
            u16::from(year) + 10,
            month,
            day
        );
        println!("  CRC16:            0x{:04X}", crc16);
        println!("  Lot Number:       {}", lot);
        println!("  Wafer/X/Y:        {} / {} / {}", did[12], did[13], did[14]);
    }

    if let Some(name) = sig.product_name.as_deref() {
        println!("Product Name:       {}", name);
    }
    if let Some(core) = sig.cpu_core() {
        println!("CPU Core:           {}", core);
    }

    if sig.group.supports_dlm() {
        let state = device.dlm_state().context("DLM state")?;
        println!("DLM State:          {} (0x{:02X})", state, state.code());
    }

    println!();
    print_areas(device);
    println!("=============================================================");
    Ok(())
}

fn print_areas(device: &Dev) {
    let mut code = 0u32;
    let mut data = 0u32;
    let mut config = 0u32;

    for (index, area) in device.areas().iter().enumerate() {
        match area.kind() {
            KOA_KIND_CODE => code += area.size(),
            KOA_KIND_DATA => data += area.size(),
            KOA_KIND_CONFIG => config += area.size(),
            _ => {}
        }

        let unit = |value: u32| {
            if value > 0 {
                format_size(value)
            } else {
                "n/a".to_string()
            }
        };
        println!("Area {} {}", index, area);
        println!(
            "       Size: {:<9} Erase: {:<9} Write: {:<9} Read: {:<9} CRC: {}",
            format_size(area.size()),
            unit(area.eau),
            unit(area.wau),
            unit(area.rau),
            unit(area.cau),
        );
    }

    println!("Memory:");
    if code > 0 {
        println!("  Code Flash: {}", format_size(code));
    }
    if data > 0 {
        println!("  Data Flash: {}", format_size(data));
    }
    if config > 0 {
        println!("  Config: {}", format_size(config));
    }
}

pub fn read(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let path = Path::new(matches.value_of("FILE").unwrap());
    let format = format_of(matches)?;
    let (start, size) = resolve_range(device, matches)?;

    let data = device.read(start, size).context("read")?;
    formats::write(path, format, &data, start)?;

    println!(
        "Read {} from 0x{:08X} into `{}`",
        format_size(data.len() as u32),
        start,
        path.display()
    );
    Ok(())
}

pub fn write(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let path = Path::new(matches.value_of("FILE").unwrap());
    let format = format_of(matches)?;
    let file = formats::parse(path, format)?;
    let start = file_address(matches, &file)?;
    let size = size_of(matches)?;
    let verify = matches.is_present("verify");

    log::info!(
        "firmware `{}`: {} bytes",
        path.display(),
        file.size()
    );

    device.write(&file, start, size, verify).context("write")?;

    println!("Write complete");
    if verify {
        println!("Verify complete");
    }
    Ok(())
}

pub fn verify(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let path = Path::new(matches.value_of("FILE").unwrap());
    let format = format_of(matches)?;
    let file = formats::parse(path, format)?;
    let start = file_address(matches, &file)?;
    let size = size_of(matches)?;

    device.verify(&file, start, size).context("verify")?;

    println!("Verify complete: flash matches `{}`", path.display());
    Ok(())
}

pub fn erase(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let (start, size) = resolve_range(device, matches)?;
    device.erase(start, size).context("erase")?;
    println!("Erase complete");
    Ok(())
}

pub fn blank_check(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let (start, size) = resolve_range(device, matches)?;
    device.blank_check(start, size).context("blank-check")?;
    println!("Blank: all bytes erased");
    Ok(())
}

pub fn crc(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let (start, size) = resolve_range(device, matches)?;
    let crc = device.crc(start, size).context("crc")?;
    println!("CRC-32: 0x{:08X}", crc);
    Ok(())
}

pub fn dlm(device: &mut Dev) -> Result<()> {
    let state = device.dlm_state().context("dlm")?;
    println!(
        "DLM State: 0x{:02X} ({}: {})",
        state.code(),
        state,
        state.description()
    );
    Ok(())
}

pub fn dlm_transit(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let dest: DlmState = matches
        .value_of("STATE")
        .unwrap()
        .parse()
        .map_err(|err| anyhow!("{}", err))?;

    if dest == DlmState::LckBoot {
        println!("WARNING: LCK_BOOT leaves the boot interface unresponsive");
        println!("         until the next power cycle.");
    }

    let from = device.dlm_transit(dest).context("dlm-transit")?;
    if from == dest {
        println!("Already in DLM state {}", dest);
    } else {
        println!("DLM transit complete: {} -> {}", from, dest);
    }
    Ok(())
}

pub fn dlm_auth(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let dest: DlmState = matches
        .value_of("STATE")
        .unwrap()
        .parse()
        .map_err(|err| anyhow!("{}", err))?;
    let key = parse_hex_bytes(matches.value_of("key").unwrap())?;
    let unique_id = matches.is_present("unique-id");

    let from = device
        .dlm_authenticate(dest, &key, unique_id)
        .context("dlm-auth")?;

    println!("DLM authentication successful: {} -> {}", from, dest);
    if dest == DlmState::RmaReq {
        println!("Note: RMA_REQ also erased the flash contents");
    }
    Ok(())
}

fn print_boundary(boundary: &Boundary) {
    println!("  Code Flash secure (without NSC): {} KB", boundary.cfs1);
    println!("  Code Flash secure (total):       {} KB", boundary.cfs2);
    println!("  Data Flash secure:               {} KB", boundary.dfs);
    println!("  SRAM secure (without NSC):       {} KB", boundary.srs1);
    println!("  SRAM secure (total):             {} KB", boundary.srs2);
    if boundary.cfs2 > boundary.cfs1 {
        println!(
            "  Code Flash NSC region:           {} KB",
            boundary.cfs2 - boundary.cfs1
        );
    }
    if boundary.srs2 > boundary.srs1 {
        println!(
            "  SRAM NSC region:                 {} KB",
            boundary.srs2 - boundary.srs1
        );
    }
}

pub fn boundary(device: &mut Dev) -> Result<()> {
    let boundary = device.boundary().context("boundary")?;
    println!("Secure/Non-secure Boundary Settings:");
    print_boundary(&boundary);
    Ok(())
}

pub fn boundary_set(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let boundary = if let Some(path) = matches.value_of("rpd") {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("couldn't read `{}`", path))?;
        rpd::parse(&text).with_context(|| format!("couldn't parse `{}`", path))?
    } else {
        let field = |name: &str| -> Result<u16> {
            let value = matches
                .value_of(name)
                .ok_or_else(|| anyhow!("boundary-set requires --{} (or --rpd)", name))?;
            value
                .parse()
                .with_context(|| format!("invalid --{} value `{}`", name, value))
        };
        Boundary {
            cfs1: field("cfs1")?,
            cfs2: field("cfs2")?,
            dfs: field("dfs")?,
            srs1: field("srs1")?,
            srs2: field("srs2")?,
        }
    };

    println!("Setting TrustZone boundaries:");
    print_boundary(&boundary);

    device.set_boundary(&boundary).context("boundary-set")?;
    println!("Boundary settings stored successfully");
    println!("Note: settings become effective after device reset");
    Ok(())
}

pub fn param(device: &mut Dev) -> Result<()> {
    let value = device.param(PARAM_ID_INIT).context("param")?;
    let state = match value {
        PARAM_INIT_DISABLED => "disabled",
        PARAM_INIT_ENABLED => "enabled",
        _ => "unknown",
    };
    println!("Initialization command: 0x{:02X} ({})", value, state);
    Ok(())
}

pub fn param_set(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let value = match matches.value_of("VALUE").unwrap() {
        v if v.eq_ignore_ascii_case("enable") => PARAM_INIT_ENABLED,
        v if v.eq_ignore_ascii_case("disable") => PARAM_INIT_DISABLED,
        other => bail!("invalid param-set value `{}` (use enable or disable)", other),
    };

    if value == PARAM_INIT_DISABLED {
        println!("WARNING: disabling the initialization command removes the");
        println!("         ability to factory-reset this device.");
    }

    device.set_param(PARAM_ID_INIT, value).context("param-set")?;
    println!("Parameter set successfully");
    Ok(())
}

pub fn init(device: &mut Dev) -> Result<()> {
    println!("Initializing device (factory reset to SSD state)...");
    println!("WARNING: this erases all flash areas and resets boundaries!");

    let from = device.initialize().context("init")?;
    println!("Initialize complete: {} -> SSD", from);
    Ok(())
}

pub fn osis(device: &mut Dev) -> Result<()> {
    let inference = device.osis_inference();
    println!("OSIS (ID code protection): {}", inference.describe());
    println!();
    println!("The OSIS register is not readable over the boot interface;");
    println!("the state above is inferred from this session. ALeRASE only");
    println!("works when OSIS[127:126] = 10b (Locked with All Erase).");
    Ok(())
}

pub fn config_read(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let (base, data) = device.config_read().context("config-read")?;

    if let Some(path) = matches.value_of("FILE") {
        let format = format_of(matches)?;
        formats::write(Path::new(path), format, &data, base)?;
        println!(
            "Config area ({}) written to `{}`",
            format_size(data.len() as u32),
            path
        );
        return Ok(());
    }

    for (i, chunk) in data.chunks(16).enumerate() {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{:08X}: {}", base + (i * 16) as u32, hex.join(" "));
    }
    Ok(())
}

fn read_key_file(path: &str) -> Result<Vec<u8>> {
    let mut data =
        std::fs::read(path).with_context(|| format!("couldn't read key file `{}`", path))?;
    if data.is_empty() {
        bail!("empty key file `{}`", path);
    }
    if data.len() > WRAPPED_KEY_MAX {
        // W-UFPK containers are typically 80 bytes; the protocol only
        // takes the first 48.
        log::info!(
            "key file is {} bytes, truncating to the {}-byte protocol window",
            data.len(),
            WRAPPED_KEY_MAX
        );
        data.truncate(WRAPPED_KEY_MAX);
    }
    Ok(data)
}

fn key_index(matches: &ArgMatches<'_>) -> Result<u8> {
    let value = matches.value_of("INDEX").unwrap();
    value
        .parse()
        .with_context(|| format!("invalid key index `{}`", value))
}

pub fn key_set(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let index = key_index(matches)?;
    let wrapped = read_key_file(matches.value_of("FILE").unwrap())?;

    println!("Setting key at index {} ({} bytes wrapped key)", index, wrapped.len());
    device.key_set(index, &wrapped).context("key-set")?;
    println!("Key set successfully at index {}", index);
    Ok(())
}

pub fn key_verify(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let index = key_index(matches)?;
    let valid = device.key_verify(index).context("key-verify")?;
    if valid {
        println!("Key at index {}: VALID", index);
    } else {
        println!("Key at index {}: INVALID or EMPTY", index);
    }
    Ok(())
}

pub fn ukey_set(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let index = key_index(matches)?;
    let wrapped = read_key_file(matches.value_of("FILE").unwrap())?;

    println!(
        "Setting user key at index {} ({} bytes wrapped key)",
        index,
        wrapped.len()
    );
    device.ukey_set(index, &wrapped).context("ukey-set")?;
    println!("User key set successfully at index {}", index);
    Ok(())
}

pub fn ukey_verify(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let index = key_index(matches)?;
    let valid = device.ukey_verify(index).context("ukey-verify")?;
    if valid {
        println!("User key at index {}: VALID", index);
    } else {
        println!("User key at index {}: INVALID or EMPTY", index);
    }
    Ok(())
}

pub fn status(device: &mut Dev) -> Result<()> {
    let supports_dlm = device
        .signature()
        .map(|sig| sig.group.supports_dlm())
        .unwrap_or(true);

    if !supports_dlm {
        println!("This device group has no DLM/boundary/parameter commands");
        return Ok(());
    }

    let state = device.dlm_state().context("status")?;
    println!(
        "DLM State:     {} (0x{:02X}) - {}",
        state,
        state.code(),
        state.description()
    );

    match device.param(PARAM_ID_INIT) {
        Ok(PARAM_INIT_ENABLED) => println!("Initialize:    enabled"),
        Ok(PARAM_INIT_DISABLED) => println!("Initialize:    disabled"),
        Ok(value) => println!("Initialize:    unknown (0x{:02X})", value),
        Err(err) => println!("Initialize:    unavailable ({})", err),
    }

    println!("ID Protection: {}", device.osis_inference().describe());

    println!("Boundary:");
    match device.boundary() {
        Ok(boundary) => print_boundary(&boundary),
        Err(err) => println!("  unavailable ({})", err),
    }

    Ok(())
}

pub fn raw(device: &mut Dev, matches: &ArgMatches<'_>) -> Result<()> {
    let cmd_bytes = parse_hex_bytes(matches.value_of("CMD").unwrap())?;
    if cmd_bytes.len() != 1 {
        bail!("CMD must be a single hex byte");
    }
    let data = matches
        .value_of("DATA")
        .map(parse_hex_bytes)
        .transpose()?
        .unwrap_or_default();

    let payload = device.raw_command(cmd_bytes[0], &data).context("raw")?;
    if payload.is_empty() {
        println!("OK (empty payload)");
        return Ok(());
    }

    for chunk in payload.chunks(16) {
        let hex: Vec<String> = chunk.iter().map(|b| format!("{:02X}", b)).collect();
        println!("{}", hex.join(" "));
    }
    Ok(())
}
