//! Mode probe scanner.
//!
//! Before any firmware role is assumed, the scanner walks every candidate port
//! with a one-shot identity probe and reports which role answers. It works on
//! raw links rather than a `Transport`: nothing is framed, the accumulated
//! bytes are searched for either token.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::cancel::CancelFlag;
use crate::constants::{
    BOOT_SETTLE, IDENTITY_PROBE, SCAN_LISTEN_WINDOW, SCAN_POLL_INTERVAL, SCAN_RETRY_INTERVAL,
};
use crate::ports::{LineSettings, PortBackend, candidate_ports};
use crate::response::detect_role;
use crate::role::DeviceRole;
use crate::transport::read_available;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// No candidate port exists; retrying later
    NoPort,
    Probing { port: String },
    /// Every port was probed without a recognised reply; retrying later
    NotFound,
    Found { port: String, role: DeviceRole },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Sweep {
    Found(String, DeviceRole),
    NoPort,
    NotFound,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Found(DeviceRole),
    Miss,
    Cancelled,
}

pub struct ModeScanner {
    backend: Arc<dyn PortBackend>,
    settings: LineSettings,
    excluded_vids: Vec<u16>,
    events: mpsc::UnboundedSender<ScanEvent>,
    cancel: CancelFlag,
    pub retry_interval: Duration,
    pub settle: Duration,
    pub poll_interval: Duration,
    pub listen_window: Duration,
}

impl ModeScanner {
    pub fn new(
        backend: Arc<dyn PortBackend>,
        excluded_vids: Vec<u16>,
        events: mpsc::UnboundedSender<ScanEvent>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            backend,
            settings: LineSettings::default(),
            excluded_vids,
            events,
            cancel,
            retry_interval: SCAN_RETRY_INTERVAL,
            settle: BOOT_SETTLE,
            poll_interval: SCAN_POLL_INTERVAL,
            listen_window: SCAN_LISTEN_WINDOW,
        }
    }

    /// Sweep the ports until a role answers or the scan is cancelled.
    pub async fn run(&self) -> Option<(String, DeviceRole)> {
        loop {
            match self.sweep().await {
                Sweep::Found(port, role) => return Some((port, role)),
                Sweep::Cancelled => return None,
                Sweep::NoPort | Sweep::NotFound => {}
            }
            sleep(self.retry_interval).await;
            if self.cancel.is_cancelled() {
                info!("Mode scan abandoned");
                return None;
            }
        }
    }

    async fn sweep(&self) -> Sweep {
        if self.cancel.is_cancelled() {
            return Sweep::Cancelled;
        }

        let ports = match candidate_ports(self.backend.as_ref(), &self.excluded_vids) {
            Ok(ports) => ports,
            Err(e) => {
                debug!(error = %e, "Port enumeration failed");
                Vec::new()
            }
        };
        if ports.is_empty() {
            self.report(ScanEvent::NoPort);
            return Sweep::NoPort;
        }

        for port in ports {
            if self.cancel.is_cancelled() {
                return Sweep::Cancelled;
            }
            self.report(ScanEvent::Probing { port: port.clone() });
            match self.probe_port(&port).await {
                Probe::Found(role) => {
                    info!(%port, %role, "Mode scan found firmware");
                    self.report(ScanEvent::Found {
                        port: port.clone(),
                        role,
                    });
                    return Sweep::Found(port, role);
                }
                Probe::Cancelled => return Sweep::Cancelled,
                Probe::Miss => {}
            }
        }

        self.report(ScanEvent::NotFound);
        Sweep::NotFound
    }

    /// One-shot identity probe. The link is dropped, and so closed, on return.
    async fn probe_port(&self, port: &str) -> Probe {
        let mut link = match self.backend.open(port, &self.settings) {
            Ok(link) => link,
            Err(e) => {
                debug!(port, error = %e, "Probe open failed");
                return Probe::Miss;
            }
        };

        sleep(self.settle).await;
        if self.cancel.is_cancelled() {
            return Probe::Cancelled;
        }

        let mut probe = IDENTITY_PROBE.as_bytes().to_vec();
        probe.push(b'\n');
        if let Err(e) = link.clear_input().and_then(|_| link.write_all(&probe)) {
            debug!(port, error = %e, "Probe write failed");
            return Probe::Miss;
        }

        let polls = (self.listen_window.as_millis() / self.poll_interval.as_millis().max(1)).max(1);
        let mut received = Vec::new();
        for _ in 0..polls {
            sleep(self.poll_interval).await;
            if self.cancel.is_cancelled() {
                return Probe::Cancelled;
            }
            match read_available(link.as_mut()) {
                Ok(bytes) => received.extend_from_slice(&bytes),
                Err(e) => {
                    debug!(port, error = %e, "Probe read failed");
                    return Probe::Miss;
                }
            }
            if let Some(role) = detect_role(&received) {
                return Probe::Found(role);
            }
        }

        debug!(port, bytes = received.len(), "No identity token in probe reply");
        Probe::Miss
    }

    fn report(&self, event: ScanEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        let _ = self.events.send(event);
    }
}
