//! Command-level connection to a target device
//!
//! [Connection] owns the serial transport and the framing decoder, and
//! provides the command/response exchanges the flashing pipeline is built
//! from. Reset choreographies live in [reset].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::debug;

use crate::command::{Command, CommandType, DIRECTION_RESPONSE};
use crate::error::Error;
use crate::interface::{DeviceDescriptor, Transport};
use crate::slip::{SlipDecoder, SlipEncoder};

pub mod reset;

use reset::{reset_strategy_for, HardReset, ResetStrategy};

/// Granularity of the response polling loop; cancellation is observed at
/// this interval.
const READ_POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// The ROM answers a single SYNC several times; how many extras to drain
const SYNC_DRAIN_COUNT: usize = 7;
/// Timeout per drained extra SYNC response
const SYNC_DRAIN_TIMEOUT: Duration = Duration::from_millis(100);

/// A parsed response packet from the ROM loader
#[derive(Debug, Clone)]
pub struct CommandResponse {
    pub command: u8,
    pub size: u16,
    pub value: u32,
    pub data: Vec<u8>,
    pub status: u8,
    pub error: u8,
}

impl CommandResponse {
    /// Parse a de-framed packet, returning `None` for anything that is not
    /// a response (the RX stream carries boot chatter and echoes too)
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < 8 {
            return None;
        }
        if frame[0] != DIRECTION_RESPONSE {
            return None;
        }

        let size = u16::from_le_bytes([frame[2], frame[3]]);
        let value = u32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);

        let data_end = frame.len().min(8 + usize::from(size));
        let data = frame[8..data_end].to_vec();

        // Status and error lead the data section on this loader; they are
        // NOT trailing bytes.
        let status = data.first().copied().unwrap_or(0);
        let error = data.get(1).copied().unwrap_or(0);

        Some(CommandResponse {
            command: frame[1],
            size,
            value,
            data,
            status,
            error,
        })
    }

    pub fn is_success(&self) -> bool {
        self.status == 0 && self.error == 0
    }
}

/// An open connection to a target device
pub struct Connection {
    serial: Box<dyn Transport>,
    decoder: SlipDecoder,
    cancelled: Arc<AtomicBool>,
}

impl Connection {
    pub fn new(serial: Box<dyn Transport>, cancelled: Arc<AtomicBool>) -> Self {
        Connection {
            serial,
            decoder: SlipDecoder::new(),
            cancelled,
        }
    }

    /// Drive the chip into its ROM bootloader
    ///
    /// Selects the choreography from the device's USB identity and flushes
    /// whatever the reset spewed into the input buffer.
    pub fn enter_bootloader(&mut self, device: &DeviceDescriptor) -> Result<(), Error> {
        let strategy = reset_strategy_for(device);
        strategy.reset(self.serial.as_mut())?;
        self.flush()?;

        Ok(())
    }

    /// Reset into the application
    pub fn hard_reset(&mut self) -> Result<(), Error> {
        HardReset.reset(self.serial.as_mut())?;
        self.flush()?;

        Ok(())
    }

    /// Frame and transmit a command
    pub fn write_command(&mut self, command: Command<'_>) -> Result<(), Error> {
        debug!("Writing command: {:?}", command.command_type());

        let mut encoded = Vec::new();
        let mut encoder = SlipEncoder::new(&mut encoded)?;
        command.write(&mut encoder)?;
        encoder.finish()?;

        self.serial.write(&encoded)?;

        Ok(())
    }

    /// Await a response to `command_type`, discarding unrelated frames
    ///
    /// Polls in [READ_POLL_TIMEOUT] slices so cancellation takes effect
    /// promptly even while the loader is silent.
    pub fn wait_for_response(
        &mut self,
        command_type: CommandType,
        timeout: Duration,
    ) -> Result<CommandResponse, Error> {
        let deadline = Instant::now() + timeout;
        self.decoder.reset();

        while Instant::now() < deadline {
            self.check_cancelled()?;

            let data = self.serial.read(READ_POLL_TIMEOUT)?;
            for frame in self.decoder.process(&data) {
                match CommandResponse::parse(&frame) {
                    Some(response) if response.command == command_type as u8 => {
                        return Ok(response);
                    }
                    _ => continue,
                }
            }
        }

        Err(Error::Timeout(command_type))
    }

    /// Transmit `command` and await its response
    ///
    /// Status checking is left to the caller; the flash-control commands
    /// map failures onto their own error variants.
    pub fn command(&mut self, command: Command<'_>) -> Result<CommandResponse, Error> {
        let command_type = command.command_type();
        let timeout = command.timeout();
        self.write_command(command)?;
        self.wait_for_response(command_type, timeout)
    }

    /// One sync exchange: send SYNC, require a successful reply, then
    /// drain the extra replies the ROM sends for a single request
    ///
    /// Skipping the drain leaves stale SYNC frames in the pipe that get
    /// matched against later commands.
    pub fn sync(&mut self) -> Result<(), Error> {
        let response = self.command(Command::Sync)?;
        if !response.is_success() {
            return Err(Error::Rom {
                command: CommandType::Sync,
                status: response.status,
                error: response.error,
            });
        }

        for _ in 0..SYNC_DRAIN_COUNT {
            let _ = self.wait_for_response(CommandType::Sync, SYNC_DRAIN_TIMEOUT);
        }
        self.flush()?;

        Ok(())
    }

    /// Read a 32-bit register
    pub fn read_reg(&mut self, address: u32) -> Result<u32, Error> {
        let response = self.command(Command::ReadReg { address })?;
        if !response.is_success() {
            return Err(Error::Rom {
                command: CommandType::ReadReg,
                status: response.status,
                error: response.error,
            });
        }

        Ok(response.value)
    }

    /// Write a 32-bit register with full mask and no delay
    pub fn write_reg(&mut self, address: u32, value: u32) -> Result<(), Error> {
        let response = self.command(Command::WriteReg {
            address,
            value,
            mask: None,
        })?;
        if !response.is_success() {
            return Err(Error::Rom {
                command: CommandType::WriteReg,
                status: response.status,
                error: response.error,
            });
        }

        Ok(())
    }

    /// Reconfigure the host-side line speed
    pub fn set_baud(&mut self, baud: u32) -> Result<(), Error> {
        self.serial.set_baud_rate(baud)?;
        Ok(())
    }

    /// Discard buffered input and output
    pub fn flush(&mut self) -> Result<(), Error> {
        self.serial.flush()?;
        Ok(())
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
    fn parse_sync_response() {
        let frame = [
            0x01, 0x08, 0x04, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x12, 0x34,
        ];
        let response = CommandResponse::parse(&frame).unwrap();

        assert_eq!(response.command, 0x08);
        assert_eq!(response.size, 4);
        assert_eq!(response.value, 0xDDCCBBAA);
        assert_eq!(response.status, 0);
        assert_eq!(response.error, 0);
        assert!(response.is_success());
    }

    #[test]
    fn parse_failed_response() {
        let frame = [
            0x01, 0x08, 0x04, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x05, 0x00, 0x00,
        ];
        let response = CommandResponse::parse(&frame).unwrap();

        assert_eq!(response.error, 5);
        assert!(!response.is_success());
    }

    #[test]
    fn requests_are_not_responses() {
        let frame = [
            0x00, 0x08, 0x04, 0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0x00, 0x00, 0x00, 0x00,
        ];
        assert!(CommandResponse::parse(&frame).is_none());
    }

    #[test]
    fn short_frames_are_rejected() {
        assert!(CommandResponse::parse(&[0x01, 0x08, 0x00]).is_none());
        assert!(CommandResponse::parse(&[]).is_none());
    }

    #[test]
    fn data_is_truncated_to_frame_length() {
        // Header claims 16 bytes of data, frame carries only 2.
        let frame = [
            0x01, 0x0A, 0x10, 0x00, 0x78, 0x56, 0x34, 0x12, 0x00, 0x00,
        ];
        let response = CommandResponse::parse(&frame).unwrap();

        assert_eq!(response.size, 16);
        assert_eq!(response.data, vec![0x00, 0x00]);
        assert_eq!(response.value, 0x12345678);
    }

    #[test]
    fn missing_status_bytes_default_to_zero() {
        let frame = [0x01, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
        let response = CommandResponse::parse(&frame).unwrap();

        assert_eq!(response.status, 0);
        assert_eq!(response.error, 0);
        assert!(response.is_success());
    }
}
