//! Serial transport for talking to the ROM bootloader
//!
//! Wraps a native TTY with the open/read/write discipline the loader needs:
//! exclusive access, raw 8N1, no modem-line changes at open time, timeout
//! reads and a retrying write loop. Control lines are only ever touched by
//! the reset choreographies in [crate::connection::reset].

use std::io::{self, Read, Write};
use std::thread::sleep;
use std::time::Duration;

#[cfg(unix)]
use std::os::fd::{AsRawFd, RawFd};

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use thiserror::Error;

#[cfg(unix)]
use serialport::TTYPort;

/// Vendor ID of Espressif's native USB peripherals
pub const USB_SERIAL_JTAG_VID: u16 = 0x303A;
/// Product ID of the ESP32-C3 USB-JTAG-Serial peripheral
pub const USB_SERIAL_JTAG_PID: u16 = 0x1001;

/// Largest chunk a single transport read will return
const READ_CHUNK_SIZE: usize = 4096;
/// Back-off between write retries when the output buffer is full
const WRITE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Errors raised by the serial transport
#[derive(Debug, Error)]
pub enum SerialError {
    #[error("cannot open serial port: {0}")]
    CannotOpen(#[source] serialport::Error),
    #[error("serial write failed: {0}")]
    WriteFailed(#[source] io::Error),
    #[error("serial read failed: {0}")]
    ReadFailed(#[source] io::Error),
    #[error("invalid serial configuration: {0}")]
    InvalidConfiguration(#[source] serialport::Error),
    #[error("serial port disconnected")]
    Disconnected,
    #[error("modem control change failed: {0}")]
    ControlLine(#[source] io::Error),
}

/// A serial device as reported by the host's port enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// Filesystem path of the character device
    pub path: String,
    /// Human-readable product name, may be empty
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl DeviceDescriptor {
    /// Descriptor for a bare path with unknown USB identity
    pub fn from_path(path: &str) -> Self {
        Self {
            path: path.to_string(),
            name: String::new(),
            vid: None,
            pid: None,
        }
    }

    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.path
        } else {
            &self.name
        }
    }

    /// Whether the device is the ESP32-C3's native USB-JTAG-Serial
    /// peripheral, which re-enumerates on reset and needs its own reset
    /// choreography.
    pub fn is_usb_serial_jtag(&self) -> bool {
        self.vid == Some(USB_SERIAL_JTAG_VID) && self.pid == Some(USB_SERIAL_JTAG_PID)
    }
}

/// Byte-level port operations the connection layer is written against
///
/// [Interface] is the hardware implementation; tests drive the flashing
/// pipeline with a scripted fake instead.
pub trait Transport: Send {
    /// Wait up to `timeout` for input, then perform a single read
    ///
    /// Returns an empty buffer when nothing arrived in time.
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, SerialError>;

    /// Write the whole buffer, retrying while the output queue is full
    fn write(&mut self, data: &[u8]) -> Result<(), SerialError>;

    /// Discard both transmit and receive buffers
    fn flush(&mut self) -> Result<(), SerialError>;

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), SerialError>;

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError>;

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError>;

    /// Change both modem control lines in one call
    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), SerialError>;
}

/// Exclusive handle on a serial device
#[cfg(unix)]
pub struct Interface {
    port: TTYPort,
    path: String,
}

#[cfg(unix)]
impl Interface {
    /// Open `path` raw 8N1 at 115200 with exclusive access
    ///
    /// The modem control lines are deliberately left alone here: asserting
    /// or even deasserting DTR/RTS at open time resets USB-JTAG-Serial
    /// devices. HUPCL is cleared so closing the port does not drop DTR
    /// either.
    pub fn open(path: &str) -> Result<Self, SerialError> {
        let mut port = serialport::new(path, 115_200)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(1))
            .open_native()
            .map_err(SerialError::CannotOpen)?;

        port.set_exclusive(true).map_err(SerialError::CannotOpen)?;
        clear_hupcl(port.as_raw_fd())?;

        port.clear(ClearBuffer::All)
            .map_err(SerialError::InvalidConfiguration)?;

        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(unix)]
impl AsRawFd for Interface {
    fn as_raw_fd(&self) -> RawFd {
        self.port.as_raw_fd()
    }
}

#[cfg(unix)]
impl Transport for Interface {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, SerialError> {
        // serialport refuses a zero timeout on some platforms.
        let timeout = timeout.max(Duration::from_millis(1));
        self.port
            .set_timeout(timeout)
            .map_err(SerialError::InvalidConfiguration)?;

        let mut buffer = [0u8; READ_CHUNK_SIZE];
        match self.port.read(&mut buffer) {
            Ok(n) => Ok(buffer[..n].to_vec()),
            Err(e) if is_would_block(&e) => Ok(Vec::new()),
            Err(e) => Err(classify(e, SerialError::ReadFailed)),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<(), SerialError> {
        let mut written = 0;
        while written < data.len() {
            match self.port.write(&data[written..]) {
                Ok(n) => written += n,
                // Output queue full; give the USB stack a moment to drain.
                Err(e) if is_would_block(&e) => sleep(WRITE_RETRY_DELAY),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(classify(e, SerialError::WriteFailed)),
            }
        }

        // No tcdrain here: blocking on drain wedges USB-JTAG-Serial, and
        // command responses confirm receipt anyway.
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SerialError> {
        self.port
            .clear(ClearBuffer::All)
            .map_err(SerialError::InvalidConfiguration)
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), SerialError> {
        self.port
            .set_baud_rate(baud)
            .map_err(SerialError::InvalidConfiguration)?;
        self.port
            .clear(ClearBuffer::All)
            .map_err(SerialError::InvalidConfiguration)
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SerialError> {
        self.port
            .write_data_terminal_ready(level)
            .map_err(|e| SerialError::ControlLine(io::Error::new(io::ErrorKind::Other, e)))
    }

    fn set_rts(&mut self, level: bool) -> Result<(), SerialError> {
        self.port
            .write_request_to_send(level)
            .map_err(|e| SerialError::ControlLine(io::Error::new(io::ErrorKind::Other, e)))
    }

    fn set_dtr_rts(&mut self, dtr: bool, rts: bool) -> Result<(), SerialError> {
        let fd = self.as_raw_fd();
        let mut status: i32 = 0;

        match unsafe { libc::ioctl(fd, libc::TIOCMGET, &mut status) } {
            0 => (),
            _ => return Err(SerialError::ControlLine(io::Error::last_os_error())),
        }

        if dtr {
            status |= libc::TIOCM_DTR
        } else {
            status &= !libc::TIOCM_DTR
        }

        if rts {
            status |= libc::TIOCM_RTS
        } else {
            status &= !libc::TIOCM_RTS
        }

        match unsafe { libc::ioctl(fd, libc::TIOCMSET, &status) } {
            0 => Ok(()),
            _ => Err(SerialError::ControlLine(io::Error::last_os_error())),
        }
    }
}

fn is_would_block(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Distinguish a vanished device from a transient I/O failure
fn classify(err: io::Error, wrap: fn(io::Error) -> SerialError) -> SerialError {
    #[cfg(unix)]
    if matches!(
        err.raw_os_error(),
        Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV)
    ) {
        return SerialError::Disconnected;
    }

    wrap(err)
}

/// Keep DTR asserted across close
///
/// The USB-JTAG-Serial peripheral watches the line; a HUPCL-driven drop at
/// close would reset the chip we just flashed.
#[cfg(unix)]
fn clear_hupcl(fd: RawFd) -> Result<(), SerialError> {
    unsafe {
        let mut termios: libc::termios = std::mem::zeroed();
        if libc::tcgetattr(fd, &mut termios) != 0 {
            return Err(SerialError::ControlLine(io::Error::last_os_error()));
        }
        termios.c_cflag &= !libc::HUPCL;
        if libc::tcsetattr(fd, libc::TCSANOW, &termios) != 0 {
            return Err(SerialError::ControlLine(io::Error::last_os_error()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb_serial_jtag_classification() {
        let mut device = DeviceDescriptor {
            path: "/dev/ttyACM0".into(),
            name: "USB JTAG/serial debug unit".into(),
            vid: Some(USB_SERIAL_JTAG_VID),
            pid: Some(USB_SERIAL_JTAG_PID),
        };
        assert!(device.is_usb_serial_jtag());

        device.pid = Some(0x0002);
        assert!(!device.is_usb_serial_jtag());

        device.vid = None;
        device.pid = None;
        assert!(!device.is_usb_serial_jtag());
    }

    #[test]
    fn display_name_falls_back_to_path() {
        let device = DeviceDescriptor::from_path("/dev/ttyUSB0");
        assert_eq!(device.display_name(), "/dev/ttyUSB0");

        let named = DeviceDescriptor {
            name: "CP2102 USB to UART".into(),
            ..device
        };
        assert_eq!(named.display_name(), "CP2102 USB to UART");
    }
}
