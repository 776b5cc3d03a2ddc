//! Line-oriented serial transport with heartbeat supervision.
//!
//! A `Transport` owns at most one open port. Its 50 ms read poll and its 1 s
//! heartbeat are deadlines serviced by [`Transport::idle`], so every wait a
//! caller performs keeps the link read and supervised. Closing clears both
//! deadlines before the port handle is dropped.

use bytes::BytesMut;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tokio::sync::watch;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::constants::{HEARTBEAT_PERIOD, IDENTITY_PROBE, POLL_INTERVAL};
use crate::error::Result;
use crate::handshake::{IdentitySignal, VerifyLink};
use crate::ports::{self, LineSettings, PortBackend};
use crate::response::{InboundLine, classify_line, split_lines};
use crate::role::{DeviceMode, DeviceRole};
use crate::store::SampleStore;

pub mod heartbeat;
pub mod mock;
pub mod serial;

use heartbeat::{Heartbeat, HeartbeatAction};

/// Raw byte access to one opened serial port
pub trait SerialLink: Send {
    /// Bytes waiting in the OS receive buffer
    fn bytes_to_read(&mut self) -> io::Result<usize>;

    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;

    /// Drop whatever sits in the OS receive buffer
    fn clear_input(&mut self) -> io::Result<()>;
}

/// Observable state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LinkStatus {
    #[strum(to_string = "closed")]
    Closed,
    /// Port open, identity not verified yet
    #[strum(to_string = "open")]
    Open,
    /// Verified and under heartbeat supervision
    #[strum(to_string = "healthy")]
    Healthy,
    /// I/O fault or heartbeat threshold reached; the port has been released
    #[strum(to_string = "lost")]
    Lost,
}

pub struct Transport {
    role: DeviceRole,
    backend: Arc<dyn PortBackend>,
    settings: LineSettings,
    store: Arc<dyn SampleStore>,
    link: Option<Box<dyn SerialLink>>,
    port_name: Option<String>,
    rx: BytesMut,
    heartbeat: Heartbeat,
    next_poll: Option<Instant>,
    next_beat: Option<Instant>,
    status: watch::Sender<LinkStatus>,
    mode: DeviceMode,
    signal: Option<IdentitySignal>,
    wrong_mode: bool,
}

impl Transport {
    pub fn new(role: DeviceRole, backend: Arc<dyn PortBackend>, store: Arc<dyn SampleStore>) -> Self {
        let (status, _) = watch::channel(LinkStatus::Closed);
        Self {
            role,
            backend,
            settings: LineSettings::default(),
            store,
            link: None,
            port_name: None,
            rx: BytesMut::with_capacity(256),
            heartbeat: Heartbeat::default(),
            next_poll: None,
            next_beat: None,
            status,
            mode: DeviceMode::Unknown,
            signal: None,
            wrong_mode: false,
        }
    }

    pub fn role(&self) -> DeviceRole {
        self.role
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    pub fn status(&self) -> LinkStatus {
        *self.status.borrow()
    }

    /// Watch link status changes
    pub fn subscribe(&self) -> watch::Receiver<LinkStatus> {
        self.status.subscribe()
    }

    /// Firmware identity observed on this link
    pub fn mode(&self) -> DeviceMode {
        self.mode
    }

    /// Whether the other role's identity token has been seen since the last discard
    pub fn wrong_mode_seen(&self) -> bool {
        self.wrong_mode
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }

    pub fn store(&self) -> &Arc<dyn SampleStore> {
        &self.store
    }

    pub fn candidate_ports(&self, excluded_vids: &[u16]) -> Result<Vec<String>> {
        ports::candidate_ports(self.backend.as_ref(), excluded_vids)
    }

    /// Open `port_name`, closing any port held before. Starts the read poll.
    pub fn open(&mut self, port_name: &str) -> bool {
        self.close();
        self.rx.clear();
        self.signal = None;
        self.wrong_mode = false;

        match self.backend.open(port_name, &self.settings) {
            Ok(link) => {
                self.link = Some(link);
                self.port_name = Some(port_name.to_string());
                self.next_poll = Some(Instant::now() + POLL_INTERVAL);
                self.status.send_replace(LinkStatus::Open);
                info!(port = port_name, role = %self.role, "Transport opened");
                true
            }
            Err(e) => {
                warn!(port = port_name, error = %e, "Failed to open port");
                false
            }
        }
    }

    /// Write `command` followed by a newline. A write fault tears the link down.
    pub fn send(&mut self, command: &str) -> bool {
        let mut data = Vec::with_capacity(command.len() + 1);
        data.extend_from_slice(command.as_bytes());
        data.push(b'\n');

        let Some(link) = self.link.as_mut() else {
            warn!(command, "Send on closed transport");
            return false;
        };
        debug!(bytes = hex::encode(&data), command, "Serial write");
        let result = link.write_all(&data);

        match result {
            Ok(()) => true,
            Err(e) => {
                self.link_failed(&format!("write failed: {}", e));
                false
            }
        }
    }

    /// User-initiated close
    pub fn close(&mut self) {
        self.stop_heartbeat();
        self.next_poll = None;
        if self.link.take().is_some() {
            info!(port = ?self.port_name, "Transport closed");
        }
        self.port_name = None;
        self.status.send_replace(LinkStatus::Closed);
    }

    /// Close after the link is known to be gone; also drops buffered input
    pub fn force_close(&mut self) {
        self.close();
        self.rx.clear();
        self.signal = None;
    }

    /// Discard buffered input, both ours and the OS's, along with any identity
    /// signal or mode derived from it
    pub fn discard_input(&mut self) {
        self.rx.clear();
        self.signal = None;
        self.wrong_mode = false;
        self.mode = DeviceMode::Unknown;

        let result = self.link.as_mut().map(|link| link.clear_input());
        if let Some(Err(e)) = result {
            self.link_failed(&format!("clear failed: {}", e));
        }
    }

    /// First identity signal seen since the last discard
    pub fn take_signal(&mut self) -> Option<IdentitySignal> {
        self.signal.take()
    }

    pub fn reset_mode(&mut self) {
        self.mode = DeviceMode::Unknown;
    }

    pub fn start_heartbeat(&mut self) {
        if !self.is_open() {
            return;
        }
        let now = Instant::now();
        self.heartbeat.start(now);
        self.next_beat = Some(now + HEARTBEAT_PERIOD);
        self.status.send_replace(LinkStatus::Healthy);
        debug!(port = ?self.port_name, "Heartbeat started");
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat.stop();
        self.next_beat = None;
    }

    /// Wait for `duration` while servicing the read poll and the heartbeat.
    pub async fn idle(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let mut wake = deadline;
            if let Some(t) = self.next_poll {
                wake = wake.min(t);
            }
            if let Some(t) = self.next_beat {
                wake = wake.min(t);
            }
            time::sleep_until(wake).await;

            let now = Instant::now();
            if self.next_poll.is_some_and(|t| t <= now) {
                self.next_poll = Some(now + POLL_INTERVAL);
                self.poll_once();
            }
            if self.next_beat.is_some_and(|t| t <= now) {
                self.next_beat = Some(now + HEARTBEAT_PERIOD);
                self.heartbeat_tick(now);
            }
            if now >= deadline {
                break;
            }
        }
    }

    /// One read-poll cycle: drain waiting bytes and dispatch complete lines
    pub fn poll_once(&mut self) {
        let result = match self.link.as_mut() {
            Some(link) => read_available(link.as_mut()),
            None => return,
        };

        match result {
            Ok(bytes) if bytes.is_empty() => {}
            Ok(bytes) => {
                debug!(bytes = hex::encode(&bytes), "Serial read");
                self.rx.extend_from_slice(&bytes);
                for line in split_lines(&mut self.rx) {
                    self.handle_line(&line);
                }
            }
            Err(e) => self.link_failed(&format!("read failed: {}", e)),
        }
    }

    fn handle_line(&mut self, line: &str) {
        let now = Instant::now();
        match classify_line(line) {
            InboundLine::Identity(role) if role == self.role => {
                debug!(line, "Identity reply");
                self.heartbeat.on_identity(now);
                self.mode = role.into();
                if self.signal.is_none() {
                    self.signal = Some(IdentitySignal::Verified);
                }
            }
            InboundLine::Identity(other) => {
                warn!(port = ?self.port_name, found = %other, expected = %self.role, "Wrong firmware mode");
                self.wrong_mode = true;
                self.mode = other.into();
                if self.signal.is_none() {
                    self.signal = Some(IdentitySignal::WrongMode(other));
                }
            }
            InboundLine::Reading { channel, value } => {
                self.heartbeat.on_activity(now);
                self.store.record_sample(channel, value);
            }
            InboundLine::Unrecognized => {
                self.heartbeat.on_activity(now);
            }
        }
    }

    fn heartbeat_tick(&mut self, now: Instant) {
        match self.heartbeat.tick(now) {
            HeartbeatAction::Idle => {}
            HeartbeatAction::SendProbe => {
                self.send(IDENTITY_PROBE);
            }
            HeartbeatAction::Failed => self.link_failed("heartbeat unanswered"),
        }
    }

    fn link_failed(&mut self, reason: &str) {
        warn!(port = ?self.port_name, reason, "Link lost");
        self.heartbeat.mark_unhealthy();
        self.force_close();
        self.status.send_replace(LinkStatus::Lost);
    }
}

pub(crate) fn read_available(link: &mut dyn SerialLink) -> io::Result<Vec<u8>> {
    let available = link.bytes_to_read()?;
    if available == 0 {
        return Ok(Vec::new());
    }
    let mut buffer = vec![0u8; available];
    let n = link.read(&mut buffer)?;
    buffer.truncate(n);
    Ok(buffer)
}

impl VerifyLink for Transport {
    fn role(&self) -> DeviceRole {
        self.role
    }

    fn reset_mode(&mut self) {
        Transport::reset_mode(self);
    }

    fn open(&mut self, port_name: &str) -> bool {
        Transport::open(self, port_name)
    }

    fn close(&mut self) {
        Transport::close(self);
    }

    fn discard_input(&mut self) {
        Transport::discard_input(self);
    }

    fn send(&mut self, command: &str) -> bool {
        Transport::send(self, command)
    }

    async fn idle(&mut self, duration: Duration) {
        Transport::idle(self, duration).await;
    }

    fn take_signal(&mut self) -> Option<IdentitySignal> {
        Transport::take_signal(self)
    }

    fn start_heartbeat(&mut self) {
        Transport::start_heartbeat(self);
    }
}
