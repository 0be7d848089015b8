//! Command-line glue: argument types and the terminal front-ends of the
//! library operations
//!
//! Types and functions in here are exercised by the `c3flash` binary and
//! carry no stability guarantees for library consumers.

use std::path::PathBuf;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use miette::{miette, IntoDiagnostic, Result};

use crate::connection::reset::{HardReset, ResetStrategy};
use crate::firmware::FirmwareBundle;
use crate::flasher::{BaudRate, Flasher, FlashingState};
use crate::interface::Interface;

pub mod serial;

pub use serial::{detect_usb_serial_ports, get_serial_port};

/// Connection configuration
#[derive(Debug, Args)]
pub struct ConnectArgs {
    /// Serial port device path (auto-detected when omitted)
    #[arg(short = 'p', long, env = "C3FLASH_PORT")]
    pub port: Option<String>,
    /// Baud rate to flash at
    #[arg(short = 'b', long, default_value_t = BaudRate::Baud921600, value_parser = parse_baud)]
    pub baud: BaudRate,
}

/// Arguments for the flash subcommand
#[derive(Debug, Args)]
pub struct FlashArgs {
    #[clap(flatten)]
    pub connect_args: ConnectArgs,
    /// Firmware binary, or a build directory containing bootloader.bin,
    /// partitions.bin and firmware.bin
    #[arg(value_name = "IMAGE")]
    pub image: PathBuf,
}

fn parse_baud(arg: &str) -> Result<BaudRate, String> {
    arg.parse().map_err(|err: crate::Error| err.to_string())
}

/// Flash a firmware bundle and render progress until the run terminates
pub fn flash(args: FlashArgs) -> Result<()> {
    let device = get_serial_port(&args.connect_args)?;
    let bundle = FirmwareBundle::load(&args.image)?;

    info!("Loaded {} ({})", bundle.file_name(), bundle.size_description());
    info!("Flashing {}", bundle.flash_description());

    let (flasher, events) = Flasher::new();
    flasher.flash(bundle, device, args.connect_args.baud);

    let bar = ProgressBar::new(100).with_style(
        ProgressStyle::with_template("{msg:>12} [{bar:40}] {percent:>3}%")
            .into_diagnostic()?
            .progress_chars("=> "),
    );
    bar.set_message("Flashing");

    for state in events {
        match state {
            FlashingState::Flashing { progress } => {
                bar.set_position((progress * 100.0) as u64);
            }
            FlashingState::Complete => {
                bar.finish();
                info!("{}", state.status_message());
                return Ok(());
            }
            FlashingState::Error { .. } => {
                bar.abandon();
                return Err(miette!("{}", state.status_message()));
            }
            other => info!("{}", other.status_message()),
        }
    }

    // The worker went away without a terminal state; treat as failure.
    Err(miette!("flashing ended unexpectedly"))
}

/// Print the detected USB serial ports
pub fn list_ports() -> Result<()> {
    let ports = detect_usb_serial_ports();
    if ports.is_empty() {
        info!("No serial ports detected");
        return Ok(());
    }

    for port in ports {
        let identity = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" [{vid:04x}:{pid:04x}]"),
            _ => String::new(),
        };
        let tag = if port.is_usb_serial_jtag() {
            " (USB-JTAG-Serial)"
        } else {
            ""
        };
        println!("{}{identity} {}{tag}", port.path, port.name);
    }

    Ok(())
}

/// Hard-reset the target into its application
pub fn reset(args: ConnectArgs) -> Result<()> {
    let device = get_serial_port(&args)?;
    let mut interface = Interface::open(&device.path).map_err(crate::Error::from)?;

    info!("Resetting {}", device.display_name());
    HardReset
        .reset(&mut interface)
        .map_err(crate::Error::from)?;

    Ok(())
}
