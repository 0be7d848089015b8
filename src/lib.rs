//! A library and application for flashing ESP32-C3 devices over Serial
//!
//! Talks directly to the chip's first-stage ROM bootloader: reset into
//! download mode over the DTR/RTS lines, sync, disarm the watchdogs,
//! stream SLIP-framed data blocks and hard-reset into the application.
//! Both the native USB-JTAG-Serial peripheral and classic USB-UART
//! bridges are supported, including the re-enumeration dance the former
//! performs on every reset.
//!
//! ## As an application
//!
//! ```bash
//! $ cargo install c3flash
//! $ c3flash flash firmware.bin
//! ```
//!
//! ## As a library
//!
//! ```toml
//! c3flash = { version = "0.3", default-features = false }
//! ```
//!
//! Disabling default features drops the `cli` module and its dependencies;
//! the flashing pipeline itself ([flasher::Flasher]) stays available and
//! reports progress over a channel of [flasher::FlashingState] events.

#![cfg_attr(docsrs, feature(doc_cfg))]

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;
pub mod command;
pub mod connection;
pub mod error;
pub mod firmware;
pub mod flasher;
pub mod interface;
pub mod slip;
pub mod targets;

pub use crate::error::{Error, ErrorKind};

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}
