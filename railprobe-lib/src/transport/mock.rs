//! In-process stand-ins for the serial hardware.
//!
//! `MockBackend` hands out `MockLink`s attached to shared `MockDevice`s. A
//! device runs a [`Firmware`] that turns each written command line into zero
//! or more reply lines. `SimulatedFirmware` speaks the real fixture protocol
//! and is what `railprobe detect --simulate` runs against.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;

use super::SerialLink;
use crate::channel::{CHANNEL_COUNT, CHANNELS, channel_by_command};
use crate::constants::IDENTITY_PROBE;
use crate::error::{RailError, Result};
use crate::ports::{LineSettings, PortBackend, PortInfo};
use crate::role::DeviceRole;

/// Reply logic of a simulated device
pub trait Firmware: Send {
    fn respond(&mut self, command: &str) -> Vec<String>;
}

impl<F> Firmware for F
where
    F: FnMut(&str) -> Vec<String> + Send,
{
    fn respond(&mut self, command: &str) -> Vec<String> {
        self(command)
    }
}

/// Fixture firmware: answers the identity probe and every channel command.
#[derive(Debug, Clone)]
pub struct SimulatedFirmware {
    pub role: DeviceRole,
    /// Reading per channel; `None` leaves that channel silent
    pub values: [Option<i32>; CHANNEL_COUNT],
    pub answers_probe: bool,
}

impl SimulatedFirmware {
    /// Every channel reads `value`
    pub fn uniform(role: DeviceRole, value: i32) -> Self {
        Self {
            role,
            values: [Some(value); CHANNEL_COUNT],
            answers_probe: true,
        }
    }

    pub fn with_value(mut self, channel: usize, value: Option<i32>) -> Self {
        if let Some(slot) = self.values.get_mut(channel) {
            *slot = value;
        }
        self
    }

    pub fn silent_to_probe(mut self) -> Self {
        self.answers_probe = false;
        self
    }

    /// The line this firmware prints for `channel`
    pub fn reading_line(channel: usize, value: i32) -> String {
        format!("{}(A{}): {}", CHANNELS[channel].response_name, channel, value)
    }
}

impl Firmware for SimulatedFirmware {
    fn respond(&mut self, command: &str) -> Vec<String> {
        if command.eq_ignore_ascii_case(IDENTITY_PROBE) {
            return if self.answers_probe {
                vec![self.role.identity_token().to_string()]
            } else {
                Vec::new()
            };
        }
        match channel_by_command(command) {
            Some(channel) => {
                let i = channel.id.index();
                self.values[i]
                    .map(|v| vec![Self::reading_line(i, v)])
                    .unwrap_or_default()
            }
            None => vec![format!("ERR unknown command {}", command)],
        }
    }
}

struct DeviceInner {
    to_host: VecDeque<u8>,
    partial: Vec<u8>,
    written: Vec<String>,
    firmware: Box<dyn Firmware>,
    banner: Vec<u8>,
    muted: bool,
    io_failure: bool,
    open_count: usize,
    open_links: usize,
}

/// Shared handle to one simulated device
#[derive(Clone)]
pub struct MockDevice {
    inner: Arc<Mutex<DeviceInner>>,
}

impl MockDevice {
    pub fn new(firmware: impl Firmware + 'static) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DeviceInner {
                to_host: VecDeque::new(),
                partial: Vec::new(),
                written: Vec::new(),
                firmware: Box::new(firmware),
                banner: Vec::new(),
                muted: false,
                io_failure: false,
                open_count: 0,
                open_links: 0,
            })),
        }
    }

    /// Text the device prints every time its port is opened
    pub fn with_banner(self, banner: &str) -> Self {
        self.inner.lock().banner = banner.as_bytes().to_vec();
        self
    }

    /// Queue raw bytes for the host
    pub fn inject(&self, bytes: &[u8]) {
        self.inner.lock().to_host.extend(bytes);
    }

    /// Stop answering anything (device hung or unplugged cable)
    pub fn set_muted(&self, muted: bool) {
        self.inner.lock().muted = muted;
    }

    /// Make every read and write fail
    pub fn set_io_failure(&self, failing: bool) {
        self.inner.lock().io_failure = failing;
    }

    /// Command lines the host has written so far
    pub fn written(&self) -> Vec<String> {
        self.inner.lock().written.clone()
    }

    /// Times the port has been opened
    pub fn open_count(&self) -> usize {
        self.inner.lock().open_count
    }

    /// Links to this device currently held open
    pub fn open_links(&self) -> usize {
        self.inner.lock().open_links
    }

    fn on_open(&self) {
        let mut inner = self.inner.lock();
        inner.open_count += 1;
        inner.open_links += 1;
        inner.partial.clear();
        let banner = inner.banner.clone();
        inner.to_host.extend(banner);
    }
}

pub struct MockLink {
    device: MockDevice,
}

impl Drop for MockLink {
    fn drop(&mut self) {
        let mut inner = self.device.inner.lock();
        inner.open_links = inner.open_links.saturating_sub(1);
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged")
}

impl SerialLink for MockLink {
    fn bytes_to_read(&mut self) -> io::Result<usize> {
        let inner = self.device.inner.lock();
        if inner.io_failure {
            return Err(broken_pipe());
        }
        Ok(inner.to_host.len())
    }

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize> {
        let mut inner = self.device.inner.lock();
        if inner.io_failure {
            return Err(broken_pipe());
        }
        let n = inner.to_host.len().min(buffer.len());
        for (slot, byte) in buffer.iter_mut().zip(inner.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let mut inner = self.device.inner.lock();
        if inner.io_failure {
            return Err(broken_pipe());
        }
        inner.partial.extend_from_slice(data);
        while let Some(pos) = inner.partial.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = inner.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]).trim().to_string();
            inner.written.push(line.clone());
            if inner.muted {
                continue;
            }
            for reply in inner.firmware.respond(&line) {
                inner.to_host.extend(reply.as_bytes());
                inner.to_host.extend(b"\r\n");
            }
        }
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        let mut inner = self.device.inner.lock();
        if inner.io_failure {
            return Err(broken_pipe());
        }
        inner.to_host.clear();
        Ok(())
    }
}

struct MockPort {
    info: PortInfo,
    /// `None` models a port that refuses to open (busy or permission denied)
    device: Option<MockDevice>,
}

/// Port backend serving simulated devices
#[derive(Default)]
pub struct MockBackend {
    ports: Mutex<Vec<MockPort>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_device(self, name: &str, vid: Option<u16>, device: MockDevice) -> Self {
        self.ports.lock().push(MockPort {
            info: PortInfo {
                name: name.to_string(),
                vid,
                product: None,
            },
            device: Some(device),
        });
        self
    }

    pub fn with_unopenable(self, name: &str) -> Self {
        self.ports.lock().push(MockPort {
            info: PortInfo {
                name: name.to_string(),
                vid: None,
                product: None,
            },
            device: None,
        });
        self
    }

    pub fn remove(&self, name: &str) {
        self.ports.lock().retain(|p| p.info.name != name);
    }
}

impl PortBackend for MockBackend {
    fn available_ports(&self) -> Result<Vec<PortInfo>> {
        Ok(self.ports.lock().iter().map(|p| p.info.clone()).collect())
    }

    fn open(&self, name: &str, _settings: &LineSettings) -> Result<Box<dyn SerialLink>> {
        let ports = self.ports.lock();
        let port = ports
            .iter()
            .find(|p| p.info.name == name)
            .ok_or_else(|| RailError::PortUnavailable(format!("{} does not exist", name)))?;
        let device = port
            .device
            .clone()
            .ok_or_else(|| RailError::PortUnavailable(format!("{} is busy", name)))?;
        device.on_open();
        Ok(Box::new(MockLink { device }))
    }
}
