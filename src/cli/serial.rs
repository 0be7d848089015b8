//! Serial port discovery and selection

use dialoguer::{theme::ColorfulTheme, Select};
use serialport::{available_ports, SerialPortType};

use super::ConnectArgs;
use crate::error::Error;
use crate::interface::DeviceDescriptor;

/// Resolve the device to flash from the command line or by prompting
///
/// An explicitly given port is matched against the enumeration so we pick
/// up its USB identity (and with it the reset choreography); an unknown
/// path is still accepted as-is for symlinked or virtual ports.
pub fn get_serial_port(matches: &ConnectArgs) -> Result<DeviceDescriptor, Error> {
    let mut ports = detect_usb_serial_ports();

    if let Some(path) = &matches.port {
        let descriptor = ports
            .into_iter()
            .find(|candidate| candidate.path == *path)
            .unwrap_or_else(|| DeviceDescriptor::from_path(path));
        return Ok(descriptor);
    }

    match ports.len() {
        0 => Err(Error::NoSerial),
        1 => Ok(ports.remove(0)),
        _ => select_serial_port(ports),
    }
}

/// Enumerate USB serial devices as descriptors
pub fn detect_usb_serial_ports() -> Vec<DeviceDescriptor> {
    let ports = available_ports().unwrap_or_default();

    ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(usb) => Some(DeviceDescriptor {
                path: port.port_name,
                name: usb.product.unwrap_or_default(),
                vid: Some(usb.vid),
                pid: Some(usb.pid),
            }),
            _ => None,
        })
        .collect()
}

fn select_serial_port(ports: Vec<DeviceDescriptor>) -> Result<DeviceDescriptor, Error> {
    let labels: Vec<String> = ports
        .iter()
        .map(|port| {
            if port.name.is_empty() {
                port.path.clone()
            } else {
                format!("{} - {}", port.path, port.name)
            }
        })
        .collect();

    let index = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select a serial port")
        .items(&labels)
        .default(0)
        .interact()
        .map_err(|_| Error::NoSerial)?;

    ports.into_iter().nth(index).ok_or(Error::NoSerial)
}
