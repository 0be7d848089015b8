//! Commands understood by the ESP32-C3 ROM bootloader
//!
//! Every command is an 8-byte header (direction, opcode, payload length,
//! checksum) followed by a little-endian payload, wrapped in SLIP framing
//! before it goes on the wire.

use std::io::Write;
use std::mem::size_of;
use std::time::Duration;

use bytemuck::{bytes_of, Pod, Zeroable};
use strum::Display;

use crate::flasher::{checksum, CHECKSUM_INIT};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const SYNC_TIMEOUT: Duration = Duration::from_secs(1);
const SPI_ATTACH_TIMEOUT: Duration = Duration::from_secs(3);
const FLASH_BEGIN_TIMEOUT: Duration = Duration::from_secs(30);
const FLASH_END_TIMEOUT: Duration = Duration::from_secs(2);

/// Request direction byte
pub const DIRECTION_REQUEST: u8 = 0x00;
/// Response direction byte
pub const DIRECTION_RESPONSE: u8 = 0x01;

/// Opcodes of the ROM loader commands used by this crate
#[derive(Copy, Clone, Debug, Display, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandType {
    FlashBegin = 0x02,
    FlashData = 0x03,
    FlashEnd = 0x04,
    Sync = 0x08,
    WriteReg = 0x09,
    ReadReg = 0x0A,
    SpiAttach = 0x0D,
    ChangeBaud = 0x0F,
}

impl CommandType {
    /// How long to wait for the loader's response to this command
    ///
    /// `FlashBegin` performs the erase synchronously, which dwarfs every
    /// other exchange on large images.
    pub fn timeout(&self) -> Duration {
        match self {
            CommandType::Sync => SYNC_TIMEOUT,
            CommandType::SpiAttach => SPI_ATTACH_TIMEOUT,
            CommandType::FlashBegin => FLASH_BEGIN_TIMEOUT,
            CommandType::FlashEnd => FLASH_END_TIMEOUT,
            _ => DEFAULT_TIMEOUT,
        }
    }
}

/// A command ready to be serialized
#[derive(Copy, Clone, Debug)]
pub enum Command<'a> {
    Sync,
    FlashBegin {
        size: u32,
        blocks: u32,
        block_size: u32,
        offset: u32,
    },
    FlashData {
        data: &'a [u8],
        sequence: u32,
    },
    FlashEnd {
        reboot: bool,
    },
    WriteReg {
        address: u32,
        value: u32,
        mask: Option<u32>,
    },
    ReadReg {
        address: u32,
    },
    /// Attach the SPI flash with the default (fused) pin assignment
    SpiAttach,
    ChangeBaud {
        /// New baud rate
        new_baud: u32,
        /// Prior baud rate (`0` for the ROM default)
        prior_baud: u32,
    },
}

impl<'a> Command<'a> {
    pub fn command_type(&self) -> CommandType {
        match self {
            Command::Sync => CommandType::Sync,
            Command::FlashBegin { .. } => CommandType::FlashBegin,
            Command::FlashData { .. } => CommandType::FlashData,
            Command::FlashEnd { .. } => CommandType::FlashEnd,
            Command::WriteReg { .. } => CommandType::WriteReg,
            Command::ReadReg { .. } => CommandType::ReadReg,
            Command::SpiAttach => CommandType::SpiAttach,
            Command::ChangeBaud { .. } => CommandType::ChangeBaud,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.command_type().timeout()
    }

    /// Serialize the header and payload (without framing) into `writer`
    pub fn write<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        writer.write_all(&[DIRECTION_REQUEST, self.command_type() as u8])?;
        match *self {
            Command::Sync => {
                let mut payload = [0x55u8; 36];
                payload[..4].copy_from_slice(&[0x07, 0x07, 0x12, 0x20]);
                write_basic(writer, &payload, 0)?;
            }
            Command::FlashBegin {
                size,
                blocks,
                block_size,
                offset,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct BeginParams {
                    size: u32,
                    blocks: u32,
                    block_size: u32,
                    offset: u32,
                    encrypted: u32,
                }
                let params = BeginParams {
                    size,
                    blocks,
                    block_size,
                    offset,
                    // The ROM loader requires the fifth word even though
                    // encrypted writes are unsupported here.
                    encrypted: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::FlashData { data, sequence } => {
                data_command(writer, data, sequence)?;
            }
            Command::FlashEnd { reboot } => {
                let flag: u32 = if reboot { 0 } else { 1 };
                write_basic(writer, &flag.to_le_bytes(), 0)?;
            }
            Command::WriteReg {
                address,
                value,
                mask,
            } => {
                #[derive(Zeroable, Pod, Copy, Clone, Debug)]
                #[repr(C)]
                struct WriteRegParams {
                    addr: u32,
                    value: u32,
                    mask: u32,
                    delay_us: u32,
                }
                let params = WriteRegParams {
                    addr: address,
                    value,
                    mask: mask.unwrap_or(0xFFFFFFFF),
                    delay_us: 0,
                };
                write_basic(writer, bytes_of(&params), 0)?;
            }
            Command::ReadReg { address } => {
                write_basic(writer, &address.to_le_bytes(), 0)?;
            }
            Command::SpiAttach => {
                // Two zeroed words select the fused default pins.
                write_basic(writer, &[0u8; 8], 0)?;
            }
            Command::ChangeBaud {
                new_baud,
                prior_baud,
            } => {
                let mut payload = [0u8; 8];
                payload[..4].copy_from_slice(&new_baud.to_le_bytes());
                payload[4..].copy_from_slice(&prior_baud.to_le_bytes());
                write_basic(writer, &payload, 0)?;
            }
        };
        Ok(())
    }
}

fn write_basic<W: Write>(mut writer: W, data: &[u8], checksum: u32) -> std::io::Result<()> {
    writer.write_all(&((data.len() as u16).to_le_bytes()))?;
    writer.write_all(&(checksum.to_le_bytes()))?;
    writer.write_all(data)?;
    Ok(())
}

fn data_command<W: Write>(mut writer: W, block_data: &[u8], sequence: u32) -> std::io::Result<()> {
    #[derive(Zeroable, Pod, Copy, Clone, Debug)]
    #[repr(C)]
    struct BlockParams {
        size: u32,
        sequence: u32,
        dummy1: u32,
        dummy2: u32,
    }

    let params = BlockParams {
        size: block_data.len() as u32,
        sequence,
        dummy1: 0,
        dummy2: 0,
    };

    let check = checksum(block_data, CHECKSUM_INIT);
    let total_length = size_of::<BlockParams>() + block_data.len();

    writer.write_all(&((total_length as u16).to_le_bytes()))?;
    writer.write_all(&((check as u32).to_le_bytes()))?;
    writer.write_all(bytes_of(&params))?;
    writer.write_all(block_data)?;
    Ok(())
}
