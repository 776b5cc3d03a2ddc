//! Connection establishment with firmware-identity verification.
//!
//! The procedure is the same for both firmware roles; only the expected token
//! differs. It is written once against [`VerifyLink`], the small capability
//! set a transport has to offer, and reused by every transport.

use std::time::Duration;
use strum_macros::Display;
use tracing::{debug, info, warn};

use crate::constants::{
    BOOT_SETTLE, IDENTITY_PROBE, VERIFY_ATTEMPTS, VERIFY_POLL_INTERVAL, VERIFY_POLLS, VERIFY_RETRY_PAUSE,
};
use crate::role::DeviceRole;

/// Identity reply classification for the current attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySignal {
    /// Our own token arrived
    Verified,
    /// The other firmware's token arrived
    WrongMode(DeviceRole),
}

/// Terminal classification of one handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectResult {
    #[strum(to_string = "success")]
    Success,
    #[strum(to_string = "wrong firmware mode")]
    WrongMode,
    #[strum(to_string = "no identity reply")]
    Failed,
    #[strum(to_string = "port error")]
    PortError,
}

/// What the handshake needs from a transport.
#[allow(async_fn_in_trait)]
pub trait VerifyLink {
    fn role(&self) -> DeviceRole;

    fn reset_mode(&mut self);

    fn open(&mut self, port_name: &str) -> bool;

    fn close(&mut self);

    /// Drop software- and OS-buffered input and any pending signal
    fn discard_input(&mut self);

    fn send(&mut self, command: &str) -> bool;

    /// Suspend for `duration` while the link keeps reading
    async fn idle(&mut self, duration: Duration);

    fn take_signal(&mut self) -> Option<IdentitySignal>;

    fn start_heartbeat(&mut self);
}

/// Timing of the verification procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub settle: Duration,
    pub attempts: u32,
    pub poll_interval: Duration,
    pub polls_per_attempt: u32,
    pub retry_pause: Duration,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            settle: BOOT_SETTLE,
            attempts: VERIFY_ATTEMPTS,
            poll_interval: VERIFY_POLL_INTERVAL,
            polls_per_attempt: VERIFY_POLLS,
            retry_pause: VERIFY_RETRY_PAUSE,
        }
    }
}

impl Handshake {
    /// Open `port_name` and confirm the firmware on it runs `link.role()`.
    ///
    /// On `Success` the port stays open with the heartbeat running; on any
    /// other result the port is closed.
    pub async fn connect_and_verify<L: VerifyLink>(&self, link: &mut L, port_name: &str) -> ConnectResult {
        let role = link.role();
        link.reset_mode();

        if !link.open(port_name) {
            return ConnectResult::PortError;
        }

        // Let the boot banner finish, then throw it away
        link.idle(self.settle).await;
        link.discard_input();

        for attempt in 1..=self.attempts {
            link.discard_input();
            if !link.send(IDENTITY_PROBE) {
                warn!(port = port_name, "Identity probe could not be written");
                link.close();
                return ConnectResult::PortError;
            }
            debug!(port = port_name, attempt, "Identity probe sent");

            for _ in 0..self.polls_per_attempt {
                link.idle(self.poll_interval).await;
                match link.take_signal() {
                    Some(IdentitySignal::Verified) => {
                        info!(port = port_name, %role, attempt, "Firmware identity verified");
                        link.start_heartbeat();
                        return ConnectResult::Success;
                    }
                    Some(IdentitySignal::WrongMode(found)) => {
                        warn!(port = port_name, expected = %role, %found, "Port runs the other firmware");
                        link.close();
                        return ConnectResult::WrongMode;
                    }
                    None => {}
                }
            }

            if attempt < self.attempts {
                link.idle(self.retry_pause).await;
            }
        }

        info!(port = port_name, %role, "No identity reply");
        link.close();
        ConnectResult::Failed
    }
}
