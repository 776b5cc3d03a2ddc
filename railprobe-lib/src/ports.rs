//! Serial port discovery and opening.

use serialport::{DataBits, FlowControl, Parity, SerialPortType, StopBits};
use std::time::Duration;
use tracing::{debug, info};

use crate::constants::BAUD_RATE;
use crate::error::Result;
use crate::transport::SerialLink;
use crate::transport::serial::SystemLink;

/// Line parameters applied when a port is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: BAUD_RATE,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    pub name: String,
    /// USB vendor id, when the port sits on a USB bridge
    pub vid: Option<u16>,
    pub product: Option<String>,
}

/// Source of serial ports. `SystemPorts` talks to the OS; tests substitute a mock.
pub trait PortBackend: Send + Sync {
    fn available_ports(&self) -> Result<Vec<PortInfo>>;

    fn open(&self, name: &str, settings: &LineSettings) -> Result<Box<dyn SerialLink>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

/// Read timeout of opened ports. Reads are only issued for bytes already
/// waiting, so this just bounds a misbehaving driver.
const READ_TIMEOUT: Duration = Duration::from_millis(10);

impl PortBackend for SystemPorts {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, product) = match p.port_type {
                    SerialPortType::UsbPort(usb) => (Some(usb.vid), usb.product),
                    _ => (None, None),
                };
                PortInfo {
                    name: p.port_name,
                    vid,
                    product,
                }
            })
            .collect())
    }

    fn open(&self, name: &str, settings: &LineSettings) -> Result<Box<dyn SerialLink>> {
        let port = serialport::new(name, settings.baud_rate)
            .data_bits(settings.data_bits)
            .parity(settings.parity)
            .stop_bits(settings.stop_bits)
            .flow_control(settings.flow_control)
            .timeout(READ_TIMEOUT)
            .open()?;
        info!(port = name, baud = settings.baud_rate, "Opened serial port");
        Ok(Box::new(SystemLink::new(port)))
    }
}

/// True for ports that belong to an on-board debug adapter
pub fn is_excluded(port: &PortInfo, excluded_vids: &[u16]) -> bool {
    port.vid.is_some_and(|vid| excluded_vids.contains(&vid))
}

/// Enumerate ports and drop the ones owned by excluded USB vendors
pub fn candidate_ports(backend: &dyn PortBackend, excluded_vids: &[u16]) -> Result<Vec<String>> {
    let ports = backend.available_ports()?;
    let names: Vec<String> = ports
        .into_iter()
        .filter(|p| {
            let excluded = is_excluded(p, excluded_vids);
            if excluded {
                debug!(port = %p.name, vid = ?p.vid, "Skipping debug adapter port");
            }
            !excluded
        })
        .map(|p| p.name)
        .collect();
    debug!(?names, "Candidate ports");
    Ok(names)
}
