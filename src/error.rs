//! Library error types

use miette::Diagnostic;
use thiserror::Error;

use crate::command::CommandType;
use crate::firmware::FirmwareError;
use crate::interface::SerialError;

/// Closed classification of flashing failures
///
/// This is what state observers see; the richer [Error] variants collapse
/// onto it via [Error::kind].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    PortNotFound,
    ConnectionFailed,
    SyncFailed,
    BaudChangeTimeout,
    FlashBeginFailed,
    FlashDataFailed,
    FlashEndFailed,
    ChecksumMismatch,
    Timeout,
    InvalidFirmware,
    PortDisconnected,
    Cancelled,
}

#[derive(Debug, Error, Diagnostic)]
#[non_exhaustive]
pub enum Error {
    #[error("error while using serial port: {0}")]
    #[diagnostic(code(c3flash::serial_error))]
    Serial(#[from] SerialError),

    #[error("failed to connect to the device")]
    #[diagnostic(
        code(c3flash::connection_failed),
        help("Ensure that the device is connected and not held in reset")
    )]
    ConnectionFailed,

    #[error("no serial ports could be detected")]
    #[diagnostic(
        code(c3flash::no_serial),
        help("Make sure you have connected a device to the host system")
    )]
    NoSerial,

    #[error("the serial port '{0}' could not be found")]
    #[diagnostic(
        code(c3flash::port_not_found),
        help("Make sure the correct device is connected to the host system")
    )]
    PortNotFound(String),

    #[error("failed to sync with the bootloader after {attempts} attempts")]
    #[diagnostic(
        code(c3flash::sync_failed),
        help("Hold the BOOT button while the flash starts, or power-cycle the board")
    )]
    SyncFailed { attempts: u32 },

    #[error("the bootloader rejected {command} (status {status:#04x}, error {error:#04x})")]
    #[diagnostic(code(c3flash::rom_error))]
    Rom {
        command: CommandType,
        status: u8,
        error: u8,
    },

    #[error("erase failed (status {status:#04x})")]
    #[diagnostic(code(c3flash::flash_begin_failed))]
    FlashBegin { status: u8 },

    #[error("write failed at block {block} (status {status:#04x})")]
    #[diagnostic(code(c3flash::flash_data_failed))]
    FlashData { block: u32, status: u8 },

    #[error("finalizing the flash failed (status {status:#04x})")]
    #[diagnostic(code(c3flash::flash_end_failed))]
    FlashEnd { status: u8 },

    #[error("timeout while waiting for a {0} response")]
    #[diagnostic(code(c3flash::timeout))]
    Timeout(CommandType),

    #[error("the baud rate '{0}' is not valid")]
    #[diagnostic(
        code(c3flash::invalid_baud_rate),
        help("The accepted values are: 115200, 230400, 460800, 921600")
    )]
    InvalidBaudRate(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    InvalidFirmware(#[from] FirmwareError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Collapse onto the closed [ErrorKind] taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Serial(SerialError::Disconnected) => ErrorKind::PortDisconnected,
            Error::Serial(_)
            | Error::ConnectionFailed
            | Error::Rom { .. }
            | Error::Io(_)
            | Error::InvalidBaudRate(_) => ErrorKind::ConnectionFailed,
            Error::NoSerial | Error::PortNotFound(_) => ErrorKind::PortNotFound,
            Error::SyncFailed { .. } => ErrorKind::SyncFailed,
            Error::FlashBegin { .. } => ErrorKind::FlashBeginFailed,
            Error::FlashData { .. } => ErrorKind::FlashDataFailed,
            Error::FlashEnd { .. } => ErrorKind::FlashEndFailed,
            Error::Timeout(CommandType::ChangeBaud) => ErrorKind::BaudChangeTimeout,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidFirmware(_) => ErrorKind::InvalidFirmware,
        }
    }

    /// Numeric detail carried by the error, for status rendering
    ///
    /// Attempt count for sync failures, ROM status for a failed erase,
    /// block number for a failed write, zero otherwise.
    pub fn error_data(&self) -> u32 {
        match self {
            Error::SyncFailed { attempts } => *attempts,
            Error::FlashBegin { status } => u32::from(*status),
            Error::FlashData { block, .. } => *block,
            _ => 0,
        }
    }
}
