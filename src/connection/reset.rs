//! Control-line choreographies for entering and leaving the bootloader
//!
//! Timings in here are load-bearing: they match what the ROM and the usual
//! host serial drivers need, and shortening them produces boards that only
//! sometimes enter download mode.

use std::thread::sleep;
use std::time::Duration;

use log::debug;

use crate::interface::{DeviceDescriptor, SerialError, Transport};

/// Hold time for each stage of the bootloader entry sequences
const RESET_HOLD_DELAY: Duration = Duration::from_millis(100);
/// Time to wait before releasing the boot pin
const BOOT_PIN_DELAY: Duration = Duration::from_millis(50);

/// A strategy for driving a target into or out of reset
pub trait ResetStrategy {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), SerialError>;

    fn set_dtr(&self, serial: &mut dyn Transport, level: bool) -> Result<(), SerialError> {
        serial.set_dtr(level)
    }

    fn set_rts(&self, serial: &mut dyn Transport, level: bool) -> Result<(), SerialError> {
        serial.set_rts(level)
    }

    fn set_dtr_rts(
        &self,
        serial: &mut dyn Transport,
        dtr_level: bool,
        rts_level: bool,
    ) -> Result<(), SerialError> {
        serial.set_dtr_rts(dtr_level, rts_level)
    }
}

/// Bootloader entry for the ESP32-C3's native USB-JTAG-Serial peripheral
///
/// The peripheral latches DTR/RTS differently from a discrete UART bridge,
/// so the line transitions below must happen one at a time.
#[derive(Debug, Clone, Copy)]
pub struct UsbJtagSerialReset;

impl ResetStrategy for UsbJtagSerialReset {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), SerialError> {
        debug!("Using UsbJtagSerial reset strategy");

        self.set_rts(serial, false)?; // Idle
        self.set_dtr(serial, false)?;

        sleep(RESET_HOLD_DELAY);

        self.set_dtr(serial, true)?; // Set boot pin (GPIO9 low)
        self.set_rts(serial, false)?;

        sleep(RESET_HOLD_DELAY);

        self.set_rts(serial, true)?; // Assert reset
        self.set_dtr(serial, false)?; // Release boot pin
        self.set_rts(serial, true)?; // Re-set RTS: some host drivers only latch DTR on an RTS edge

        sleep(RESET_HOLD_DELAY);

        self.set_dtr(serial, false)?; // Chip out of reset
        self.set_rts(serial, false)?;

        sleep(BOOT_PIN_DELAY);

        Ok(())
    }
}

/// Classic bootloader entry for USB-UART bridges (CP2102, CH340, ...)
///
/// Assumes the usual board circuit: DTR drives GPIO0 and RTS drives EN,
/// both through inverters.
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset;

impl ResetStrategy for ClassicReset {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), SerialError> {
        debug!("Using Classic reset strategy");

        self.set_dtr_rts(serial, false, true)?; // EN low, chip in reset, GPIO0 high

        sleep(RESET_HOLD_DELAY);

        self.set_dtr_rts(serial, true, false)?; // EN high with GPIO0 low, boots the loader

        sleep(BOOT_PIN_DELAY);

        self.set_dtr(serial, false)?; // Release the boot pin

        sleep(BOOT_PIN_DELAY);

        Ok(())
    }
}

/// Reset into the application after flashing
///
/// RTS pulses the reset line while DTR stays low so GPIO9 reads high and
/// the chip takes the normal boot path.
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, serial: &mut dyn Transport) -> Result<(), SerialError> {
        debug!("Using HardReset strategy");

        self.set_dtr(serial, false)?;

        sleep(BOOT_PIN_DELAY);

        self.set_rts(serial, true)?;

        sleep(RESET_HOLD_DELAY);

        self.set_rts(serial, false)?;

        sleep(RESET_HOLD_DELAY);

        Ok(())
    }
}

/// Pick the bootloader-entry strategy for a device
///
/// One strategy per device class, never mixed: re-running the wrong
/// choreography on a USB-JTAG-Serial device knocks it off the bus.
pub fn reset_strategy_for(device: &DeviceDescriptor) -> Box<dyn ResetStrategy> {
    if device.is_usb_serial_jtag() {
        Box::new(UsbJtagSerialReset)
    } else {
        Box::new(ClassicReset)
    }
}
