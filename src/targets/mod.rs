//! Target-specific register maps and routines

pub mod esp32c3;
