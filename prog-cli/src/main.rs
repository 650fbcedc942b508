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

use std::{ffi::OsString, io, path::Path, time::Duration};

use serial::{SerialPort, SystemPort};

use anyhow::{Context, Result};
use clap::{crate_authors, crate_version, App, AppSettings, Arg, ArgMatches, SubCommand};

use ra_dfu::{constants::ALERASE_ID, constants::ID_CODE_LEN, Device};

mod commands;
mod formats;
mod rpd;

fn main() -> Result<()> {
    let app = App::new("Renesas RA Serial Boot Programmer")
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .version(crate_version!())
        .author(crate_authors!())
        .about("Firmware update tool for Renesas RA devices in serial boot mode\nProject website: https://locha.io/software/ra-dfu")
        .arg(
            Arg::with_name("port")
                .short("p")
                .long("port")
                .takes_value(true)
                .global(true)
                .help("Serial port (auto-detects the RA boot interface if omitted)")
        )
        .arg(
            Arg::with_name("address")
                .short("a")
                .long("address")
                .takes_value(true)
                .global(true)
                .help("Start address as hex, e.g. 0x8000")
        )
        .arg(
            Arg::with_name("size")
                .short("s")
                .long("size")
                .takes_value(true)
                .global(true)
                .help("Size in bytes as hex, e.g. 0x10000")
        )
        .arg(
            Arg::with_name("area")
                .long("area")
                .takes_value(true)
                .global(true)
                .help("Select a whole area instead of --address/--size [code|data|config]")
        )
        .arg(
            Arg::with_name("baudrate")
                .short("b")
                .long("baudrate")
                .takes_value(true)
                .global(true)
                .help("UART baud rate to negotiate (clamped to the device's recommended maximum)")
        )
        .arg(
            Arg::with_name("id")
                .short("i")
                .long("id")
                .takes_value(true)
                .global(true)
                .help("ID code for authentication (32 hex characters)")
        )
        .arg(
            Arg::with_name("erase-all")
                .short("e")
                .long("erase-all")
                .global(true)
                .help("Authenticate with the ALeRASE magic ID (erases all areas on OSIS-permitting devices)")
        )
        .arg(
            Arg::with_name("uart")
                .short("u")
                .long("uart")
                .global(true)
                .help("Plain UART mode (P109/P110 pins); resets the device to 9600 bps on close")
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .takes_value(true)
                .global(true)
                .help("Firmware file format [auto|bin|ihex|srec]")
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .global(true)
                .help("Suppress progress bars")
        )
        .arg(
            Arg::with_name("v")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Sets the level of verbosity, -v (debug), -vv (trace)")
        )
        .subcommand(
            SubCommand::with_name("list")
                .about("List serial ports and mark the RA boot interface")
        )
        .subcommand(
            SubCommand::with_name("info")
                .about("Show device identification, DLM state and memory map")
        )
        .subcommand(
            SubCommand::with_name("read")
                .about("Read flash memory into a file")
                .arg(Arg::with_name("FILE").required(true).help("Output file"))
        )
        .subcommand(
            SubCommand::with_name("write")
                .about("Write a firmware file to flash")
                .arg(Arg::with_name("FILE").required(true).help("Firmware file (bin/ihex/srec)"))
                .arg(
                    Arg::with_name("verify")
                        .long("verify")
                        .help("Read back and compare after writing")
                )
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Compare flash contents against a firmware file")
                .arg(Arg::with_name("FILE").required(true).help("Firmware file (bin/ihex/srec)"))
        )
        .subcommand(
            SubCommand::with_name("erase")
                .about("Erase flash blocks")
        )
        .subcommand(
            SubCommand::with_name("blank-check")
                .about("Check that a flash range is fully erased")
        )
        .subcommand(
            SubCommand::with_name("crc")
                .about("Device-side CRC-32 of a flash range")
        )
        .subcommand(
            SubCommand::with_name("dlm")
                .about("Show the Device Lifecycle Management state")
        )
        .subcommand(
            SubCommand::with_name("dlm-transit")
                .about("Transition the DLM state without authentication")
                .arg(
                    Arg::with_name("STATE")
                        .required(true)
                        .help("Destination state [ssd|nsecsd|dpl|lck_dbg|lck_boot]")
                )
        )
        .subcommand(
            SubCommand::with_name("dlm-auth")
                .about("Authenticated DLM regression (HMAC-SHA256)")
                .arg(
                    Arg::with_name("STATE")
                        .required(true)
                        .help("Destination state [ssd|nsecsd|rma_req]")
                )
                .arg(
                    Arg::with_name("key")
                        .short("k")
                        .long("key")
                        .takes_value(true)
                        .required(true)
                        .help("16-byte DLM key as 32 hex characters")
                )
                .arg(
                    Arg::with_name("unique-id")
                        .long("unique-id")
                        .help("Use the MCU unique ID as the challenge (RMA_REQ only)")
                )
        )
        .subcommand(
            SubCommand::with_name("boundary")
                .about("Show TrustZone boundary settings")
        )
        .subcommand(
            SubCommand::with_name("boundary-set")
                .about("Store TrustZone boundary settings (effective after reset)")
                .arg(Arg::with_name("cfs1").long("cfs1").takes_value(true).help("Code flash secure size without NSC [KiB]"))
                .arg(Arg::with_name("cfs2").long("cfs2").takes_value(true).help("Code flash secure size total [KiB]"))
                .arg(Arg::with_name("dfs").long("dfs").takes_value(true).help("Data flash secure size [KiB]"))
                .arg(Arg::with_name("srs1").long("srs1").takes_value(true).help("SRAM secure size without NSC [KiB]"))
                .arg(Arg::with_name("srs2").long("srs2").takes_value(true).help("SRAM secure size total [KiB]"))
                .arg(Arg::with_name("rpd").long("rpd").takes_value(true).help("Read the sizes from a Renesas Partition Data file"))
        )
        .subcommand(
            SubCommand::with_name("param")
                .about("Show the initialize-command parameter")
        )
        .subcommand(
            SubCommand::with_name("param-set")
                .about("Enable or disable the initialize command")
                .arg(Arg::with_name("VALUE").required(true).help("enable or disable"))
        )
        .subcommand(
            SubCommand::with_name("init")
                .about("Factory reset (erases all areas, lands in SSD)")
        )
        .subcommand(
            SubCommand::with_name("osis")
                .about("Show the inferred ID code protection state")
        )
        .subcommand(
            SubCommand::with_name("config-read")
                .about("Dump the config area (option-setting memory)")
                .arg(Arg::with_name("FILE").help("Optional output file"))
        )
        .subcommand(
            SubCommand::with_name("key-set")
                .about("Inject a wrapped DLM key")
                .arg(Arg::with_name("INDEX").required(true).help("Key slot index"))
                .arg(Arg::with_name("FILE").required(true).help("Wrapped key file"))
        )
        .subcommand(
            SubCommand::with_name("key-verify")
                .about("Verify a DLM key slot")
                .arg(Arg::with_name("INDEX").required(true).help("Key slot index"))
        )
        .subcommand(
            SubCommand::with_name("ukey-set")
                .about("Inject a wrapped user key")
                .arg(Arg::with_name("INDEX").required(true).help("Key slot index"))
                .arg(Arg::with_name("FILE").required(true).help("Wrapped key file"))
        )
        .subcommand(
            SubCommand::with_name("ukey-verify")
                .about("Verify a user key slot")
                .arg(Arg::with_name("INDEX").required(true).help("Key slot index"))
        )
        .subcommand(
            SubCommand::with_name("status")
                .about("One-screen DLM, boundary, parameter and protection summary")
        )
        .subcommand(
            SubCommand::with_name("raw")
                .about("Send a raw command frame and print the response payload")
                .arg(Arg::with_name("CMD").required(true).help("Opcode as hex byte, e.g. 3A"))
                .arg(Arg::with_name("DATA").help("Payload as hex string"))
        );

    // When double clicking the binary the binary will be paused. Useful on
    // windows, since the Console window will be closed inmediately.
    #[cfg(windows)]
    let app = app.setting(AppSettings::WaitOnError);

    let matches = app.get_matches();

    let (name, sub) = match matches.subcommand() {
        (name, Some(sub)) => (name, sub),
        _ => unreachable!("subcommand is required"),
    };

    init_logger(match sub.occurrences_of("v") {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        2..=u64::MAX => log::LevelFilter::Trace,
    })?;

    if name == "list" {
        return commands::list();
    }

    let uart_mode = sub.is_present("uart");
    let port_path = resolve_port(sub, uart_mode)?;

    log::info!("Opening serial port `{}`", Path::new(&port_path).display());
    let mut port: SystemPort = serial::open(&port_path).with_context(|| {
        format!(
            "Couldn't open serial port `{}`",
            Path::new(&port_path).display()
        )
    })?;
    port.configure(&ra_dfu::port_settings())?;
    port.set_timeout(Duration::from_millis(200))?;

    log::info!("Connecting to the boot firmware");
    let mut device =
        Device::new(port, uart_mode).context("Failed to connect to the boot firmware")?;

    let result = run(&mut device, name, sub);

    device.close();
    result
}

/// Everything that needs a connected device; split out so the port is
/// closed (and a plain-UART session reset to 9600) on every path.
fn run(device: &mut Device<SystemPort>, name: &str, sub: &ArgMatches<'_>) -> Result<()> {
    let sig = device
        .query_signature()
        .context("Failed to read the device signature")?;
    device
        .query_areas()
        .context("Failed to read the memory map")?;

    if let Some(rate) = sub.value_of("baudrate") {
        let rate: u32 = rate.parse().context("Invalid baud rate")?;
        negotiate_baudrate(device, rate, sig.max_baudrate);
    }

    authenticate(device, sub)?;

    if !sub.is_present("quiet") {
        device.set_progress_sink(Box::new(commands::Bar::default()));
    }

    match name {
        "info" => commands::info(device),
        "read" => commands::read(device, sub),
        "write" => commands::write(device, sub),
        "verify" => commands::verify(device, sub),
        "erase" => commands::erase(device, sub),
        "blank-check" => commands::blank_check(device, sub),
        "crc" => commands::crc(device, sub),
        "dlm" => commands::dlm(device),
        "dlm-transit" => commands::dlm_transit(device, sub),
        "dlm-auth" => commands::dlm_auth(device, sub),
        "boundary" => commands::boundary(device),
        "boundary-set" => commands::boundary_set(device, sub),
        "param" => commands::param(device),
        "param-set" => commands::param_set(device, sub),
        "init" => commands::init(device),
        "osis" => commands::osis(device),
        "config-read" => commands::config_read(device, sub),
        "key-set" => commands::key_set(device, sub),
        "key-verify" => commands::key_verify(device, sub),
        "ukey-set" => commands::ukey_set(device, sub),
        "ukey-verify" => commands::ukey_verify(device, sub),
        "status" => commands::status(device),
        "raw" => commands::raw(device, sub),
        other => anyhow::bail!("unknown command: {}", other),
    }
}

fn resolve_port(sub: &ArgMatches<'_>, uart_mode: bool) -> Result<OsString> {
    if let Some(port) = sub.value_of_os("port") {
        return Ok(port.to_owned());
    }

    if uart_mode {
        anyhow::bail!("UART mode requires an explicit port (-p option)");
    }

    let info = ra_dfu::ports::find_renesas_port()
        .context("No Renesas device found; specify the port with -p")?;
    if let Some(usb) = &info.usb_info {
        log::info!(
            "Auto-detected RA boot interface: {} ({} {})",
            Path::new(&info.port).display(),
            usb.manufacturer.as_deref().unwrap_or("?"),
            usb.product.as_deref().unwrap_or("?"),
        );
    }

    Ok(info.port)
}

/// Clamp the requested rate to the device's recommended maximum and
/// negotiate it. A failed negotiation falls back once to 115200 and
/// otherwise stays at the 9600 the session opened with.
fn negotiate_baudrate(device: &mut Device<SystemPort>, requested: u32, device_max: u32) {
    let target = ra_dfu::best_baudrate(requested.min(device_max));
    if target != requested {
        log::info!(
            "clamping requested baud rate {} to {} (device maximum {})",
            requested,
            target,
            device_max
        );
    }
    if target <= 9600 {
        return;
    }

    if let Err(err) = device.set_baudrate(target) {
        log::warn!("baud rate change to {} failed: {}", target, err);
        if target > 115_200 {
            log::warn!("falling back to 115200");
            if let Err(err) = device.set_baudrate(115_200) {
                log::warn!("fallback failed ({}); staying at 9600", err);
            }
        }
    } else {
        log::info!("session running at {} bps", target);
    }
}

fn authenticate(device: &mut Device<SystemPort>, sub: &ArgMatches<'_>) -> Result<()> {
    let erase_all = sub.is_present("erase-all");
    let id = sub.value_of("id");

    if erase_all && id.is_some() {
        anyhow::bail!("--erase-all and --id are mutually exclusive");
    }

    if erase_all {
        log::warn!("ALeRASE requires OSIS[127:126]=10b (Locked with All Erase support)");
        log::warn!("it will fail on devices in plain Locked mode (01b)");
        return device
            .authenticate_id(&ALERASE_ID)
            .context("ALeRASE authentication failed");
    }

    if let Some(id) = id {
        let bytes = commands::parse_hex_bytes(id)?;
        if bytes.len() != ID_CODE_LEN {
            anyhow::bail!(
                "ID code must be {} hex bytes ({} hex characters)",
                ID_CODE_LEN,
                ID_CODE_LEN * 2
            );
        }
        let mut id_code = [0u8; ID_CODE_LEN];
        id_code.copy_from_slice(&bytes);
        return device
            .authenticate_id(&id_code)
            .context("ID authentication failed");
    }

    Ok(())
}

fn init_logger(level: log::LevelFilter) -> Result<()> {
    let mut logger = env_logger::Builder::from_env("RA_DFU_LOG");
    logger.filter_level(level);

    #[cfg(unix)]
    logger.format(log_format_color);
    #[cfg(not(unix))]
    logger.format(log_format_no_color);

    logger.try_init().context("Failed to initialize logger")
}

#[cfg(unix)]
fn log_format_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    use std::io::Write;

    let level = match record.level() {
        log::Level::Error => ansi_term::Color::Red.bold().paint("ERROR"),
        log::Level::Warn => ansi_term::Color::Yellow.bold().paint("WARN"),
        log::Level::Info => ansi_term::Color::Green.bold().paint("INFO"),
        log::Level::Debug => ansi_term::Color::Cyan.bold().paint("DBG"),
        log::Level::Trace => ansi_term::Color::Cyan.bold().paint("TRACE"),
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}

#[cfg(not(unix))]
fn log_format_no_color(
    fmt: &mut env_logger::fmt::Formatter,
    record: &log::Record<'_>,
) -> io::Result<()> {
    use std::io::Write;

    let level = match record.level() {
        log::Level::Error => "ERROR",
        log::Level::Warn => "WARN",
        log::Level::Info => "INFO",
        log::Level::Debug => "DBG",
        log::Level::Trace => "TRACE",
    };

    writeln!(fmt, "[{}] - {}", level, record.args())
}
