//! Auto-detection workflow: connect, acquire every channel, diagnose.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use strum_macros::Display;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cancel::CancelFlag;
use crate::channel::{CHANNEL_COUNT, CHANNELS, Channel, ChannelId};
use crate::config::{ConfigStore, ThresholdRange, validate_hardware_value};
use crate::constants::ACQUIRE_POLL_TICK;
use crate::error::RailError;
use crate::handshake::{ConnectResult, Handshake};
use crate::rules::{self, RuleId, Snapshot};
use crate::transport::{LinkStatus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum WorkflowState {
    #[strum(to_string = "idle")]
    Idle,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "acquiring")]
    Acquiring,
    #[strum(to_string = "evaluating")]
    Evaluating,
    #[strum(to_string = "cancelled")]
    Cancelled,
}

impl WorkflowState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            WorkflowState::Connecting | WorkflowState::Acquiring | WorkflowState::Evaluating
        )
    }
}

/// One reason a fixture failed diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailedItem {
    Anomaly(RuleId),
    /// The channel never produced a reading, retries included
    NoData { channel: ChannelId },
    OutOfRange {
        channel: ChannelId,
        value: i32,
        range: ThresholdRange,
    },
}

fn channel_label(channel: ChannelId) -> &'static str {
    channel.channel().map_or("unknown channel", |c| c.display_name)
}

impl fmt::Display for FailedItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailedItem::Anomaly(rule) => write!(f, "{}", rule),
            FailedItem::NoData { channel } => {
                write!(f, "{} (ch {}): no data", channel_label(*channel), channel)
            }
            FailedItem::OutOfRange { channel, value, range } => write!(
                f,
                "{} (ch {}): {} outside [{}, {}]",
                channel_label(*channel),
                channel,
                value,
                range.min,
                range.max
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub passed: bool,
    pub failed_items: Vec<FailedItem>,
}

impl Verdict {
    pub fn descriptions(&self) -> Vec<String> {
        self.failed_items.iter().map(ToString::to_string).collect()
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.passed {
            return write!(f, "PASS");
        }
        write!(f, "FAIL ({} item(s))", self.failed_items.len())
    }
}

/// Events for whatever front end drives the workflow.
#[derive(Debug, Clone, PartialEq)]
pub enum DetectionEvent {
    StateChanged(WorkflowState),
    /// Channel currently being requested
    Reading(ChannelId),
    Progress { status: String, fraction: f64 },
    /// Transient, user-visible message
    Notice(String),
    Verdict(Verdict),
}

#[derive(Debug)]
pub enum DetectOutcome {
    Completed(Verdict),
    Aborted(RailError),
    Cancelled,
}

/// Channels whose sample count grew after their own request, and the rest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AcquireReport {
    pub completed: Vec<ChannelId>,
    pub missing: Vec<ChannelId>,
}

enum Abort {
    Cancelled,
    Failed(RailError),
}

impl From<RailError> for Abort {
    fn from(e: RailError) -> Self {
        Abort::Failed(e)
    }
}

type Step<T> = std::result::Result<T, Abort>;

/// Port order for the connect phase: the previously used port first
pub fn port_priority(preferred: Option<&str>, candidates: &[String]) -> Vec<String> {
    let mut order = Vec::with_capacity(candidates.len() + 1);
    if let Some(port) = preferred {
        order.push(port.to_string());
    }
    for port in candidates {
        if !order.contains(port) {
            order.push(port.clone());
        }
    }
    order
}

/// Diagnose one snapshot: anomaly rules first, then per-channel checks.
///
/// Channels covered by a triggered rule are reported through that rule only.
/// A channel without a reading is always a failure.
pub fn evaluate_snapshot(snapshot: &Snapshot, config: &dyn ConfigStore) -> Verdict {
    let triggered = rules::evaluate(snapshot, config);
    let covered: HashSet<ChannelId> = triggered
        .iter()
        .flat_map(|&id| rules::rule(id).channel_ids())
        .collect();

    let mut failed_items: Vec<FailedItem> = triggered.into_iter().map(FailedItem::Anomaly).collect();
    for channel in ChannelId::all() {
        match snapshot.get(channel) {
            None => failed_items.push(FailedItem::NoData { channel }),
            Some(_) if covered.contains(&channel) => {}
            Some(value) => {
                let range = config.threshold_range(channel);
                if !validate_hardware_value(value, range) {
                    failed_items.push(FailedItem::OutOfRange { channel, value, range });
                }
            }
        }
    }

    Verdict {
        passed: failed_items.is_empty(),
        failed_items,
    }
}

pub struct AutoDetector {
    transport: Transport,
    handshake: Handshake,
    config: Arc<dyn ConfigStore>,
    excluded_vids: Vec<u16>,
    preferred_port: Option<String>,
    events: mpsc::UnboundedSender<DetectionEvent>,
    cancel: CancelFlag,
    state: WorkflowState,
    last_result: Option<Verdict>,
    last_acquire: Option<AcquireReport>,
}

impl AutoDetector {
    pub fn new(
        transport: Transport,
        config: Arc<dyn ConfigStore>,
        events: mpsc::UnboundedSender<DetectionEvent>,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            transport,
            handshake: Handshake::default(),
            config,
            excluded_vids: Vec::new(),
            preferred_port: None,
            events,
            cancel,
            state: WorkflowState::Idle,
            last_result: None,
            last_acquire: None,
        }
    }

    pub fn with_port_filter(mut self, excluded_vids: Vec<u16>) -> Self {
        self.excluded_vids = excluded_vids;
        self
    }

    pub fn with_preferred_port(mut self, port: Option<String>) -> Self {
        self.preferred_port = port;
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn preferred_port(&self) -> Option<&str> {
        self.preferred_port.as_deref()
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn last_result(&self) -> Option<&Verdict> {
        self.last_result.as_ref()
    }

    pub fn last_acquire(&self) -> Option<&AcquireReport> {
        self.last_acquire.as_ref()
    }

    /// Re-emit the cached verdict without touching the fixture
    pub fn replay_last_result(&self) -> Option<Verdict> {
        let verdict = self.last_result.clone()?;
        self.emit(DetectionEvent::Verdict(verdict.clone()));
        Some(verdict)
    }

    /// Run connect, acquire and evaluate.
    ///
    /// `&mut self` keeps runs exclusive, so a running state found here belongs
    /// to a run whose future was dropped before it finished. Its port state is
    /// unknown, so the link is released and the run starts from scratch.
    pub async fn start(&mut self) -> DetectOutcome {
        if self.is_running() {
            warn!(state = %self.state, "Previous auto-detection was interrupted");
            self.transport.close();
            self.set_state(WorkflowState::Idle);
        }
        self.cancel.reset();

        match self.run().await {
            Ok(verdict) => {
                info!(%verdict, "Auto-detection finished");
                self.last_result = Some(verdict.clone());
                self.emit(DetectionEvent::Verdict(verdict.clone()));
                self.set_state(WorkflowState::Idle);
                DetectOutcome::Completed(verdict)
            }
            Err(Abort::Cancelled) => {
                info!("Auto-detection cancelled");
                self.notice("Auto-detection cancelled".to_string());
                self.set_state(WorkflowState::Cancelled);
                DetectOutcome::Cancelled
            }
            Err(Abort::Failed(e)) => {
                warn!(error = %e, "Auto-detection aborted");
                if matches!(e, RailError::LinkLost(_)) {
                    self.notice("Connection to the fixture was lost".to_string());
                }
                self.set_state(WorkflowState::Idle);
                DetectOutcome::Aborted(e)
            }
        }
    }

    async fn run(&mut self) -> Step<Verdict> {
        self.set_state(WorkflowState::Connecting);
        self.connect().await?;

        self.set_state(WorkflowState::Acquiring);
        let report = self.acquire().await?;
        self.last_acquire = Some(report);

        self.checkpoint()?;
        self.set_state(WorkflowState::Evaluating);
        Ok(self.evaluate())
    }

    async fn connect(&mut self) -> Step<()> {
        let candidates = match self.transport.candidate_ports(&self.excluded_vids) {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Port enumeration failed");
                Vec::new()
            }
        };

        if self.transport.is_open() && self.transport.status() == LinkStatus::Healthy {
            debug!(port = ?self.transport.port_name(), "Already connected");
            return Ok(());
        }

        let order = port_priority(self.preferred_port.as_deref(), &candidates);
        if order.is_empty() {
            self.notice("No serial port detected".to_string());
            return Err(RailError::PortUnavailable("no candidate ports".to_string()).into());
        }

        let role = self.transport.role();
        let mut wrong_mode_port = None;
        let mut any_silent = false;
        for (i, port) in order.iter().enumerate() {
            self.checkpoint()?;
            self.progress(format!("Connecting to {}", port), i as f64 / order.len() as f64);

            let handshake = self.handshake;
            match handshake.connect_and_verify(&mut self.transport, port).await {
                ConnectResult::Success => {
                    self.preferred_port = Some(port.clone());
                    self.notice(format!("Connected on {}", port));
                    return Ok(());
                }
                ConnectResult::WrongMode => {
                    self.notice(format!("{} runs the {} firmware, skipping", port, role.other()));
                    wrong_mode_port = Some(port.clone());
                }
                ConnectResult::Failed => any_silent = true,
                ConnectResult::PortError => {}
            }
        }

        self.notice("Connect failed: no fixture answered".to_string());
        let err = match wrong_mode_port {
            Some(port) => RailError::WrongDevice {
                port,
                found: role.other(),
            },
            None if any_silent => RailError::HandshakeTimeout(format!("{} port(s) tried", order.len())),
            None => RailError::PortUnavailable(format!("none of {} port(s) could be opened", order.len())),
        };
        Err(err.into())
    }

    async fn acquire(&mut self) -> Step<AcquireReport> {
        let store = Arc::clone(self.transport.store());
        store.clear_all();

        let tick_ms = ACQUIRE_POLL_TICK.as_millis() as u64;
        let polls = self.config.hardware_wait_ms().div_ceil(tick_ms).max(1) as u32;
        let mut completed = [false; CHANNEL_COUNT];

        for (i, channel) in CHANNELS.iter().enumerate() {
            self.checkpoint()?;
            completed[i] = self.request_channel(channel, polls).await?;
            self.progress(
                format!("Read {}", channel.display_name),
                (i + 1) as f64 / CHANNEL_COUNT as f64,
            );
        }

        let max_retry = self.config.max_retry_per_id();
        for channel in CHANNELS.iter() {
            if store.sample_count(channel.id) > 0 {
                continue;
            }
            for attempt in 1..=max_retry {
                self.checkpoint()?;
                self.progress(
                    format!("Retrying {} ({}/{})", channel.display_name, attempt, max_retry),
                    1.0,
                );
                if self.request_channel(channel, polls).await? {
                    completed[channel.id.index()] = true;
                    break;
                }
            }
        }

        let mut report = AcquireReport::default();
        for channel in ChannelId::all() {
            if completed[channel.index()] {
                report.completed.push(channel);
            } else {
                report.missing.push(channel);
            }
        }
        if !report.missing.is_empty() {
            warn!(missing = ?report.missing, "Channels without a fresh reading");
        }
        Ok(report)
    }

    /// Send one channel command and wait for that channel's count to grow
    async fn request_channel(&mut self, channel: &Channel, polls: u32) -> Step<bool> {
        let store = Arc::clone(self.transport.store());
        self.emit(DetectionEvent::Reading(channel.id));
        let before = store.sample_count(channel.id);

        if !self.transport.send(channel.command) {
            return Err(self.link_lost());
        }

        for _ in 0..polls {
            self.transport.idle(ACQUIRE_POLL_TICK).await;
            if !self.transport.is_open() {
                return Err(self.link_lost());
            }
            if store.sample_count(channel.id) > before {
                return Ok(true);
            }
            self.checkpoint()?;
        }
        debug!(channel = %channel.id, "No reading within the hardware wait");
        Ok(false)
    }

    fn evaluate(&self) -> Verdict {
        let store = self.transport.store();
        let mut snapshot = Snapshot::new();
        for channel in ChannelId::all() {
            snapshot.set(channel, store.first_sample(channel).map(|s| s.value));
        }
        evaluate_snapshot(&snapshot, self.config.as_ref())
    }

    /// Leave the fixture: stop supervision and release the port
    pub fn disconnect(&mut self) {
        self.transport.close();
    }

    fn link_lost(&self) -> Abort {
        let port = self.transport.port_name().unwrap_or("fixture").to_string();
        Abort::Failed(RailError::LinkLost(format!("{} stopped responding", port)))
    }

    fn checkpoint(&self) -> Step<()> {
        if self.cancel.is_cancelled() {
            return Err(Abort::Cancelled);
        }
        Ok(())
    }

    fn set_state(&mut self, state: WorkflowState) {
        if self.state != state {
            debug!(from = %self.state, to = %state, "Workflow state");
            self.state = state;
            self.emit(DetectionEvent::StateChanged(state));
        }
    }

    fn progress(&self, status: String, fraction: f64) {
        self.emit(DetectionEvent::Progress {
            status,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }

    fn notice(&self, message: String) {
        self.emit(DetectionEvent::Notice(message));
    }

    fn emit(&self, event: DetectionEvent) {
        let _ = self.events.send(event);
    }
}
