//! ESP32-C3 watchdog registers
//!
//! The ROM loader does not feed the RTC watchdog or the super watchdog, so
//! on a slow ROM-only flash either one will reset the chip mid-write. Both
//! units sit behind write-protection registers that only open for their
//! exact key values.

use log::debug;

use crate::connection::Connection;
use crate::error::Error;

const RTC_CNTL_BASE: u32 = 0x6000_8000;

const RTC_WDT_CONFIG0: u32 = RTC_CNTL_BASE + 0x0090;
const RTC_WDT_WPROTECT: u32 = RTC_CNTL_BASE + 0x00A8;
const RTC_WDT_WKEY: u32 = 0x50D8_3AA1;

const SWD_CONF: u32 = RTC_CNTL_BASE + 0x00AC;
const SWD_WPROTECT: u32 = RTC_CNTL_BASE + 0x00B0;
const SWD_WKEY: u32 = 0x8F1D_312A;

const WDT_EN: u32 = 1 << 31;
const SWD_AUTO_FEED_EN: u32 = 1 << 31;

/// Stop the RTC watchdog and neutralize the super watchdog
///
/// Must run immediately after the first successful sync, before any flash
/// traffic.
pub fn disable_watchdogs(connection: &mut Connection) -> Result<(), Error> {
    debug!("Disabling RTC watchdog");
    connection.write_reg(RTC_WDT_WPROTECT, RTC_WDT_WKEY)?;
    let config = connection.read_reg(RTC_WDT_CONFIG0)?;
    connection.write_reg(RTC_WDT_CONFIG0, config & !WDT_EN)?;
    connection.write_reg(RTC_WDT_WPROTECT, 0)?;

    debug!("Enabling super watchdog auto-feed");
    // The super watchdog cannot be stopped; auto-feed makes it harmless.
    connection.write_reg(SWD_WPROTECT, SWD_WKEY)?;
    let conf = connection.read_reg(SWD_CONF)?;
    connection.write_reg(SWD_CONF, conf | SWD_AUTO_FEED_EN)?;
    connection.write_reg(SWD_WPROTECT, 0)?;

    Ok(())
}
