pub mod cancel;
pub mod channel;
pub mod config;
pub mod constants;
pub mod detect;
pub mod error;
pub mod handshake;
pub mod ports;
pub mod response;
pub mod role;
pub mod rules;
pub mod scanner;
pub mod store;
pub mod transport;


// Re-export the types most callers need
pub use cancel::CancelFlag;
pub use channel::{CHANNEL_COUNT, CHANNELS, Channel, ChannelGroup, ChannelId};
pub use config::{AnomalyThresholds, ConfigStore, DetectorConfig, ThresholdRange, validate_hardware_value};
pub use detect::{AutoDetector, DetectOutcome, DetectionEvent, FailedItem, Verdict, WorkflowState};
pub use error::{RailError, Result};
pub use handshake::{ConnectResult, Handshake, VerifyLink};
pub use ports::{PortBackend, PortInfo, SystemPorts};
pub use role::{DeviceMode, DeviceRole};
pub use rules::{AnomalyRule, RuleId, Snapshot};
pub use scanner::{ModeScanner, ScanEvent};
pub use store::{MemorySampleStore, Sample, SampleStore};
pub use transport::{LinkStatus, SerialLink, Transport};
