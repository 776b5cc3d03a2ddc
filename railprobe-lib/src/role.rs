use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::constants::{DETECTOR_TOKEN, MONITOR_TOKEN};

/// Firmware variant running on the fixture's microcontroller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum DeviceRole {
    /// Batch auto-detection firmware
    #[strum(to_string = "auto-detect")]
    Detector,
    /// Live readout firmware
    #[strum(to_string = "monitor")]
    Monitor,
}

impl DeviceRole {
    pub const ALL: [DeviceRole; 2] = [DeviceRole::Detector, DeviceRole::Monitor];

    /// Literal line this firmware sends in answer to the identity probe
    pub fn identity_token(&self) -> &'static str {
        match self {
            DeviceRole::Detector => DETECTOR_TOKEN,
            DeviceRole::Monitor => MONITOR_TOKEN,
        }
    }

    pub fn other(&self) -> DeviceRole {
        match self {
            DeviceRole::Detector => DeviceRole::Monitor,
            DeviceRole::Monitor => DeviceRole::Detector,
        }
    }

    /// Case-insensitive match of a whole line against this role's token
    pub fn matches_line(&self, line: &str) -> bool {
        line.trim().eq_ignore_ascii_case(self.identity_token())
    }
}

/// Firmware identity as far as it has been discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum DeviceMode {
    #[strum(to_string = "auto-detect")]
    Detector,
    #[strum(to_string = "monitor")]
    Monitor,
    #[default]
    #[strum(to_string = "unknown")]
    Unknown,
}

impl DeviceMode {
    pub fn role(&self) -> Option<DeviceRole> {
        match self {
            DeviceMode::Detector => Some(DeviceRole::Detector),
            DeviceMode::Monitor => Some(DeviceRole::Monitor),
            DeviceMode::Unknown => None,
        }
    }
}

impl From<DeviceRole> for DeviceMode {
    fn from(role: DeviceRole) -> Self {
        match role {
            DeviceRole::Detector => DeviceMode::Detector,
            DeviceRole::Monitor => DeviceMode::Monitor,
        }
    }
}
