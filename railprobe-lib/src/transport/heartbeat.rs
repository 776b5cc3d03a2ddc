//! Liveness supervision for an open link.
//!
//! Every period the supervisor either sees recent traffic (healthy, no probe),
//! sees its previous probe still unanswered (one more failure), or sends a new
//! probe. The supervisor itself does no I/O: `tick` tells the transport what
//! to do.

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::{ACTIVITY_GRACE, HEARTBEAT_FAIL_THRESHOLD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Nothing to do this period
    Idle,
    /// Write the identity probe
    SendProbe,
    /// Threshold reached; the link is dead. Reported once per start.
    Failed,
}

#[derive(Debug)]
pub struct Heartbeat {
    enabled: bool,
    waiting_for_reply: bool,
    consecutive_failures: u32,
    healthy: bool,
    last_activity: Instant,
    threshold: u32,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new(HEARTBEAT_FAIL_THRESHOLD)
    }
}

impl Heartbeat {
    pub fn new(threshold: u32) -> Self {
        Self {
            enabled: false,
            waiting_for_reply: false,
            consecutive_failures: 0,
            healthy: false,
            last_activity: Instant::now(),
            threshold,
        }
    }

    pub fn start(&mut self, now: Instant) {
        self.enabled = true;
        self.waiting_for_reply = false;
        self.consecutive_failures = 0;
        self.healthy = true;
        self.last_activity = now;
    }

    pub fn stop(&mut self) {
        self.enabled = false;
        self.waiting_for_reply = false;
    }

    pub fn tick(&mut self, now: Instant) -> HeartbeatAction {
        if !self.enabled {
            return HeartbeatAction::Idle;
        }

        if now.saturating_duration_since(self.last_activity) < ACTIVITY_GRACE {
            // Device is busy answering real commands
            self.consecutive_failures = 0;
            self.waiting_for_reply = false;
            self.healthy = true;
            return HeartbeatAction::Idle;
        }

        if self.waiting_for_reply {
            self.consecutive_failures += 1;
            debug!(failures = self.consecutive_failures, "Heartbeat probe unanswered");
            if self.consecutive_failures >= self.threshold {
                warn!(failures = self.consecutive_failures, "Heartbeat threshold reached");
                self.mark_unhealthy();
                return HeartbeatAction::Failed;
            }
            return HeartbeatAction::Idle;
        }

        self.waiting_for_reply = true;
        HeartbeatAction::SendProbe
    }

    /// The firmware answered with this link's own identity token
    pub fn on_identity(&mut self, now: Instant) {
        self.waiting_for_reply = false;
        self.consecutive_failures = 0;
        self.healthy = true;
        self.last_activity = now;
    }

    /// Any other inbound line
    pub fn on_activity(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.last_activity = now;
    }

    /// Force the unhealthy state and stop probing
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
        self.stop();
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn is_waiting_for_reply(&self) -> bool {
        self.waiting_for_reply
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }
}
