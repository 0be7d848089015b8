//! Write firmware bundles to a target device
//!
//! [Flasher] owns the whole pipeline: reset into the bootloader, sync with
//! retry and a reopen fallback for re-enumerating USB-JTAG-Serial devices,
//! watchdog disarming, optional baud negotiation, SPI attach, the
//! erase/write loop per image, and the hard reset back into the
//! application. Progress is published as [FlashingState] events on an
//! observer channel; the work itself runs on a dedicated thread.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, sleep};
use std::time::Duration;

use log::{debug, info};
use strum::Display;

use crate::command::{Command, CommandType};
use crate::connection::Connection;
use crate::error::{Error, ErrorKind};
use crate::firmware::{FirmwareBundle, FirmwareImage};
#[cfg(unix)]
use crate::interface::Interface;
use crate::interface::{DeviceDescriptor, SerialError, Transport};
use crate::targets::esp32c3;

/// Seed of the XOR checksum carried by data commands
pub(crate) const CHECKSUM_INIT: u8 = 0xEF;
/// Bytes per FLASH_DATA block on the ROM loader
pub const FLASH_BLOCK_SIZE: usize = 1024;
/// Short blocks are padded up to a full block with this
const BLOCK_PAD_BYTE: u8 = 0xFF;

const SYNC_RETRIES: usize = 20;
const SYNC_RETRY_DELAY: Duration = Duration::from_millis(50);
/// Default wait for a command response during the write loop
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Pacing gap between data blocks. Not cosmetic: the ROM loader's
/// USB-JTAG-Serial FIFO silently drops bytes when the host outruns it.
const BLOCK_DELAY: Duration = Duration::from_millis(5);

/// Time for the chip to settle into the bootloader after reset
const CHIP_SETTLE_DELAY: Duration = Duration::from_millis(500);
/// Wait for USB re-enumeration before trying to reopen the port
const REENUMERATION_DELAY: Duration = Duration::from_millis(2000);
const REOPEN_ATTEMPTS: usize = 5;
const REOPEN_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Pause on either side of the host baud switch
const BAUD_SWITCH_DELAY: Duration = Duration::from_millis(50);
const VERIFY_DELAY: Duration = Duration::from_millis(100);
/// Time for the device to restart after FLASH_END
const RESTART_DELAY: Duration = Duration::from_millis(1000);

/// XOR checksum over `data`, seeded with `checksum`
pub fn checksum(data: &[u8], mut checksum: u8) -> u8 {
    for byte in data {
        checksum ^= *byte;
    }

    checksum
}

/// Line speeds supported for flashing
///
/// The device always boots its loader at 115200; higher rates are
/// negotiated after sync.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display)]
#[repr(u32)]
pub enum BaudRate {
    #[default]
    #[strum(serialize = "115200")]
    Baud115200 = 115_200,
    #[strum(serialize = "230400")]
    Baud230400 = 230_400,
    #[strum(serialize = "460800")]
    Baud460800 = 460_800,
    #[strum(serialize = "921600")]
    Baud921600 = 921_600,
}

impl BaudRate {
    pub const ALL: [BaudRate; 4] = [
        BaudRate::Baud115200,
        BaudRate::Baud230400,
        BaudRate::Baud460800,
        BaudRate::Baud921600,
    ];

    pub fn value(self) -> u32 {
        self as u32
    }
}

impl FromStr for BaudRate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "115200" => Ok(BaudRate::Baud115200),
            "230400" => Ok(BaudRate::Baud230400),
            "460800" => Ok(BaudRate::Baud460800),
            "921600" => Ok(BaudRate::Baud921600),
            _ => Err(Error::InvalidBaudRate(s.to_string())),
        }
    }
}

/// Lifecycle of a flash run, as published to observers
#[derive(Debug, Clone, PartialEq)]
pub enum FlashingState {
    Idle,
    Connecting,
    Syncing,
    ChangingBaudRate,
    Erasing,
    /// Overall progress across the whole bundle, in `0.0..=1.0`
    Flashing { progress: f64 },
    Verifying,
    Restarting,
    Complete,
    Error {
        kind: ErrorKind,
        message: String,
        data: u32,
    },
}

impl FlashingState {
    /// Whether a run is still in progress
    pub fn is_active(&self) -> bool {
        !matches!(
            self,
            FlashingState::Idle | FlashingState::Complete | FlashingState::Error { .. }
        )
    }

    pub fn from_error(err: &Error) -> Self {
        FlashingState::Error {
            kind: err.kind(),
            message: err.to_string(),
            data: err.error_data(),
        }
    }

    /// One-line status text for display surfaces
    pub fn status_message(&self) -> String {
        match self {
            FlashingState::Idle => "Ready".to_string(),
            FlashingState::Connecting => "Connecting to device...".to_string(),
            FlashingState::Syncing => "Syncing with bootloader...".to_string(),
            FlashingState::ChangingBaudRate => "Changing baud rate...".to_string(),
            FlashingState::Erasing => "Erasing flash...".to_string(),
            FlashingState::Flashing { progress } => {
                format!("Flashing... {}%", (progress * 100.0) as u32)
            }
            FlashingState::Verifying => "Verifying...".to_string(),
            FlashingState::Restarting => "Restarting device...".to_string(),
            FlashingState::Complete => "Flash complete!".to_string(),
            FlashingState::Error {
                kind,
                message,
                data,
            } => error_description(*kind, message, *data),
        }
    }
}

fn error_description(kind: ErrorKind, message: &str, data: u32) -> String {
    match kind {
        ErrorKind::PortNotFound => "Serial port not found".to_string(),
        ErrorKind::ConnectionFailed => format!("Connection failed: {message}"),
        ErrorKind::SyncFailed => format!("Failed to sync after {data} attempts"),
        ErrorKind::BaudChangeTimeout => "Timeout changing baud rate".to_string(),
        ErrorKind::FlashBeginFailed => format!("Flash begin failed (0x{data:02x})"),
        ErrorKind::FlashDataFailed => format!("Flash data failed at block {data}"),
        ErrorKind::FlashEndFailed => "Flash end failed".to_string(),
        ErrorKind::ChecksumMismatch => "Checksum mismatch".to_string(),
        ErrorKind::Timeout => format!("Timeout: {message}"),
        ErrorKind::InvalidFirmware => format!("Invalid firmware: {message}"),
        ErrorKind::PortDisconnected => "Port disconnected".to_string(),
        ErrorKind::Cancelled => "Operation cancelled".to_string(),
    }
}

/// Factory for transports, keyed by device path
///
/// The default opener hands out [Interface]; tests substitute scripted
/// ports.
pub type PortOpener = dyn Fn(&str) -> Result<Box<dyn Transport>, SerialError> + Send + Sync;

/// Flashing service: one worker thread per run, events to one observer
pub struct Flasher {
    events: Sender<FlashingState>,
    cancelled: Arc<AtomicBool>,
    flashing: Arc<AtomicBool>,
    opener: Arc<PortOpener>,
}

impl Flasher {
    /// Service flashing real serial devices
    #[cfg(unix)]
    pub fn new() -> (Self, Receiver<FlashingState>) {
        Self::with_opener(Arc::new(|path: &str| {
            Interface::open(path).map(|interface| Box::new(interface) as Box<dyn Transport>)
        }))
    }

    /// Service with a custom transport factory
    pub fn with_opener(opener: Arc<PortOpener>) -> (Self, Receiver<FlashingState>) {
        let (events, receiver) = channel();

        let flasher = Flasher {
            events,
            cancelled: Arc::new(AtomicBool::new(false)),
            flashing: Arc::new(AtomicBool::new(false)),
            opener,
        };

        (flasher, receiver)
    }

    /// Start flashing `bundle` onto `device`
    ///
    /// Returns immediately; progress arrives on the event channel and the
    /// run terminates with [FlashingState::Complete] or
    /// [FlashingState::Error]. A call while a run is already active is
    /// ignored.
    pub fn flash(&self, bundle: FirmwareBundle, device: DeviceDescriptor, baud: BaudRate) {
        if self.flashing.swap(true, Ordering::SeqCst) {
            debug!("Flash requested while a run is active; ignoring");
            return;
        }
        self.cancelled.store(false, Ordering::SeqCst);

        let worker = FlashWorker {
            events: self.events.clone(),
            cancelled: self.cancelled.clone(),
            opener: self.opener.clone(),
        };
        let flashing = self.flashing.clone();

        let spawned = thread::Builder::new()
            .name("c3flash-worker".to_string())
            .spawn(move || {
                worker.dispatch(bundle, device, baud);
                flashing.store(false, Ordering::SeqCst);
            });

        if spawned.is_err() {
            self.flashing.store(false, Ordering::SeqCst);
        }
    }

    /// Request cancellation of the active run
    ///
    /// Cooperative: the worker notices within one block or one response
    /// poll, whichever comes first.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_flashing(&self) -> bool {
        self.flashing.load(Ordering::SeqCst)
    }
}

struct FlashWorker {
    events: Sender<FlashingState>,
    cancelled: Arc<AtomicBool>,
    opener: Arc<PortOpener>,
}

impl FlashWorker {
    fn dispatch(&self, bundle: FirmwareBundle, device: DeviceDescriptor, baud: BaudRate) {
        // The transport is owned by `run` and closed on any exit path.
        match self.run(&bundle, &device, baud) {
            Ok(()) => self.emit(FlashingState::Complete),
            Err(err) => {
                let state = if self.cancelled.load(Ordering::SeqCst) {
                    FlashingState::from_error(&Error::Cancelled)
                } else {
                    FlashingState::from_error(&err)
                };
                self.emit(state);
            }
        }
    }

    fn run(
        &self,
        bundle: &FirmwareBundle,
        device: &DeviceDescriptor,
        baud: BaudRate,
    ) -> Result<(), Error> {
        bundle.validate()?;

        info!(
            "Flashing {} to {}",
            bundle.flash_description(),
            device.display_name()
        );

        self.emit(FlashingState::Connecting);
        let transport = (self.opener)(&device.path)?;
        let mut connection = Connection::new(transport, self.cancelled.clone());

        connection.enter_bootloader(device)?;
        sleep(CHIP_SETTLE_DELAY);
        connection.flush()?;

        self.emit(FlashingState::Syncing);
        if let Err(err) = self.sync_with_retry(&mut connection) {
            if matches!(err, Error::Cancelled) {
                return Err(err);
            }

            // USB-JTAG-Serial devices re-enumerate after the reset, which
            // can invalidate the descriptor we synced on. Close, wait out
            // the re-enumeration and start over on a fresh open.
            debug!("Initial sync failed ({err}); reopening the port");
            drop(connection);
            sleep(REENUMERATION_DELAY);

            let transport = self.reopen(&device.path)?;
            connection = Connection::new(transport, self.cancelled.clone());
            connection.flush()?;

            self.emit(FlashingState::Syncing);
            self.sync_with_retry(&mut connection)?;
        }

        // The loader will reset mid-write otherwise; must happen right
        // after the sync that succeeded.
        if device.is_usb_serial_jtag() {
            esp32c3::disable_watchdogs(&mut connection)?;
        }

        if baud != BaudRate::Baud115200 {
            self.emit(FlashingState::ChangingBaudRate);
            self.change_baud(&mut connection, baud)?;
        }

        self.spi_attach(&mut connection)?;

        let total_size = bundle.total_size();
        let mut bytes_flashed = 0usize;
        for image in bundle.images() {
            self.check_cancelled()?;
            self.flash_image(&mut connection, image, bytes_flashed, total_size)?;
            bytes_flashed += image.size();
        }

        // Integrity is enforced per block by the loader's checksums; there
        // is no separate read-back pass.
        self.emit(FlashingState::Verifying);
        sleep(VERIFY_DELAY);

        self.emit(FlashingState::Restarting);
        self.flash_end(&mut connection, device.is_usb_serial_jtag())?;
        sleep(RESTART_DELAY);

        Ok(())
    }

    /// Sync until the loader answers, up to [SYNC_RETRIES] attempts
    fn sync_with_retry(&self, connection: &mut Connection) -> Result<(), Error> {
        for attempt in 1..=SYNC_RETRIES {
            match connection.sync() {
                Ok(()) => {
                    debug!("Synced on attempt {attempt}");
                    return Ok(());
                }
                Err(err @ Error::Cancelled) => return Err(err),
                Err(err) => {
                    debug!("Sync attempt {attempt} failed: {err}");
                    if attempt < SYNC_RETRIES {
                        sleep(SYNC_RETRY_DELAY);
                    }
                }
            }
        }

        Err(Error::SyncFailed {
            attempts: SYNC_RETRIES as u32,
        })
    }

    /// Reopen the port after a reset-induced re-enumeration
    fn reopen(&self, path: &str) -> Result<Box<dyn Transport>, Error> {
        for attempt in 1..=REOPEN_ATTEMPTS {
            self.check_cancelled()?;
            match (self.opener)(path) {
                Ok(transport) => {
                    debug!("Reopened {path} on attempt {attempt}");
                    return Ok(transport);
                }
                Err(err) => {
                    debug!("Reopen attempt {attempt} failed: {err}");
                    if attempt < REOPEN_ATTEMPTS {
                        sleep(REOPEN_RETRY_DELAY);
                    }
                }
            }
        }

        Err(Error::ConnectionFailed)
    }

    fn change_baud(&self, connection: &mut Connection, baud: BaudRate) -> Result<(), Error> {
        info!("Changing baud rate to {baud}");

        connection.write_command(Command::ChangeBaud {
            new_baud: baud.value(),
            prior_baud: BaudRate::Baud115200.value(),
        })?;

        sleep(BAUD_SWITCH_DELAY);
        connection.set_baud(baud.value())?;
        sleep(BAUD_SWITCH_DELAY);

        // Confirm the new speed took by syncing again.
        connection.sync().map_err(|err| match err {
            Error::Timeout(_) => Error::Timeout(CommandType::ChangeBaud),
            other => other,
        })
    }

    /// Attach the SPI flash; the ROM loader requires this before
    /// FLASH_BEGIN
    fn spi_attach(&self, connection: &mut Connection) -> Result<(), Error> {
        let response = connection.command(Command::SpiAttach)?;
        if !response.is_success() {
            return Err(Error::Rom {
                command: CommandType::SpiAttach,
                status: response.status,
                error: response.error,
            });
        }

        Ok(())
    }

    /// Erase the image's region and stream its blocks
    fn flash_image(
        &self,
        connection: &mut Connection,
        image: &FirmwareImage,
        bytes_flashed: usize,
        total_size: usize,
    ) -> Result<(), Error> {
        let num_blocks = image.size().div_ceil(FLASH_BLOCK_SIZE);

        debug!(
            "Writing {} ({} bytes, {num_blocks} blocks) at 0x{:x}",
            image.file_name(),
            image.size(),
            image.offset
        );

        // The device erases synchronously while handling FLASH_BEGIN,
        // hence the generous timeout.
        self.emit(FlashingState::Erasing);
        connection.write_command(Command::FlashBegin {
            size: image.size() as u32,
            blocks: num_blocks as u32,
            block_size: FLASH_BLOCK_SIZE as u32,
            offset: image.offset,
        })?;
        let response =
            connection.wait_for_response(CommandType::FlashBegin, CommandType::FlashBegin.timeout())?;
        if !response.is_success() {
            return Err(Error::FlashBegin {
                status: response.status,
            });
        }

        for block_num in 0..num_blocks {
            self.check_cancelled()?;

            let start = block_num * FLASH_BLOCK_SIZE;
            let end = (start + FLASH_BLOCK_SIZE).min(image.size());
            let mut block = image.data[start..end].to_vec();
            block.resize(FLASH_BLOCK_SIZE, BLOCK_PAD_BYTE);

            let image_progress = (block_num + 1) as f64 / num_blocks as f64;
            let progress =
                (bytes_flashed as f64 + image_progress * image.size() as f64) / total_size as f64;
            self.emit(FlashingState::Flashing { progress });

            connection.write_command(Command::FlashData {
                data: &block,
                sequence: block_num as u32,
            })?;
            let response = connection.wait_for_response(CommandType::FlashData, RESPONSE_TIMEOUT)?;
            if !response.is_success() {
                return Err(Error::FlashData {
                    block: block_num as u32,
                    status: response.status,
                });
            }

            sleep(BLOCK_DELAY);
        }

        Ok(())
    }

    /// Finish the flash and reboot into the application
    fn flash_end(&self, connection: &mut Connection, usb_serial_jtag: bool) -> Result<(), Error> {
        connection.write_command(Command::FlashEnd { reboot: true })?;

        // The device may reboot before it manages to answer; silence and
        // failure reports are both acceptable here.
        match connection.wait_for_response(CommandType::FlashEnd, CommandType::FlashEnd.timeout()) {
            Ok(response) if !response.is_success() => {
                debug!(
                    "FLASH_END reported status 0x{:02x}; assuming the device rebooted",
                    response.status
                );
            }
            Ok(_) => {}
            Err(Error::Timeout(_)) => {
                debug!("No FLASH_END response; assuming the device rebooted");
            }
            Err(err) => return Err(err),
        }

        // The soft reboot does not reliably reset the USB block, so kick
        // the chip over the reset line as well.
        if usb_serial_jtag {
            connection.hard_reset()?;
        }

        Ok(())
    }

    fn emit(&self, state: FlashingState) {
        let _ = self.events.send(state);
    }

    fn check_cancelled(&self) -> Result<(), Error> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_of_nothing_is_the_seed() {
        assert_eq!(checksum(&[], CHECKSUM_INIT), 0xEF);
    }

    #[test]
    fn checksum_of_the_seed_is_zero() {
        assert_eq!(checksum(&[0xEF], CHECKSUM_INIT), 0x00);
    }

    #[test]
    fn checksum_is_xor_over_all_bytes() {
        let data = [0x13, 0x37, 0xC0, 0xDB, 0x55];
        let expected = data.iter().fold(0u8, |acc, b| acc ^ b);

        assert_eq!(checksum(&data, CHECKSUM_INIT) ^ CHECKSUM_INIT, expected);
    }

    #[test]
    fn baud_rate_parsing() {
        assert_eq!("115200".parse::<BaudRate>().unwrap(), BaudRate::Baud115200);
        assert_eq!("921600".parse::<BaudRate>().unwrap(), BaudRate::Baud921600);
        assert!("9600".parse::<BaudRate>().is_err());
        assert_eq!(BaudRate::Baud460800.value(), 460_800);
    }

    #[test]
    fn state_activity() {
        assert!(!FlashingState::Idle.is_active());
        assert!(!FlashingState::Complete.is_active());
        assert!(!FlashingState::Error {
            kind: ErrorKind::Timeout,
            message: String::new(),
            data: 0,
        }
        .is_active());

        assert!(FlashingState::Connecting.is_active());
        assert!(FlashingState::Flashing { progress: 0.5 }.is_active());
        assert!(FlashingState::Restarting.is_active());
    }

    #[test]
    fn error_states_render_their_data() {
        let sync = FlashingState::from_error(&Error::SyncFailed { attempts: 20 });
        assert_eq!(sync.status_message(), "Failed to sync after 20 attempts");

        let begin = FlashingState::from_error(&Error::FlashBegin { status: 0x07 });
        assert_eq!(begin.status_message(), "Flash begin failed (0x07)");

        let data = FlashingState::from_error(&Error::FlashData {
            block: 3,
            status: 1,
        });
        assert_eq!(data.status_message(), "Flash data failed at block 3");

        let cancelled = FlashingState::from_error(&Error::Cancelled);
        assert_eq!(cancelled.status_message(), "Operation cancelled");
    }

    #[test]
    fn flashing_state_renders_percentage() {
        let state = FlashingState::Flashing { progress: 0.42 };
        assert_eq!(state.status_message(), "Flashing... 42%");
    }
}
