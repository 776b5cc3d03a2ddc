//! Detection parameters and per-channel acceptance ranges.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::channel::{CHANNEL_COUNT, ChannelId};
use crate::constants::DEBUG_ADAPTER_VIDS;
use crate::error::{RailError, Result};
use crate::rules::RuleId;

/// Inclusive acceptance window for one channel's raw ADC reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdRange {
    pub min: i32,
    pub max: i32,
}

impl ThresholdRange {
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i32) -> bool {
        validate_hardware_value(value, *self)
    }
}

impl Default for ThresholdRange {
    fn default() -> Self {
        Self::new(100, 900)
    }
}

/// True when `value` lies within `range`, bounds included
pub fn validate_hardware_value(value: i32, range: ThresholdRange) -> bool {
    range.min <= value && value <= range.max
}

/// "Below" thresholds of the anomaly rules, one per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyThresholds {
    pub main_supply: i32,
    pub downstream: i32,
    pub backup_battery: i32,
    pub peripheral: i32,
}

impl Default for AnomalyThresholds {
    fn default() -> Self {
        Self {
            main_supply: 50,
            downstream: 50,
            backup_battery: 50,
            peripheral: 50,
        }
    }
}

/// Read-only view of the configuration consumed by the detection workflow.
pub trait ConfigStore: Send + Sync {
    fn threshold_range(&self, channel: ChannelId) -> ThresholdRange;

    /// How long the firmware may take to answer one channel command
    fn hardware_wait_ms(&self) -> u64;

    fn max_retry_per_id(&self) -> u32;

    fn anomaly_threshold(&self, rule: RuleId) -> i32;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub hardware_wait_ms: u64,
    pub max_retry_per_id: u32,
    /// Port tried first by the connect phase
    pub preferred_port: Option<String>,
    /// USB vendor ids that are never offered as candidate ports
    pub excluded_vids: Vec<u16>,
    pub thresholds: Vec<ThresholdRange>,
    pub anomaly: AnomalyThresholds,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            hardware_wait_ms: 500,
            max_retry_per_id: 2,
            preferred_port: None,
            excluded_vids: DEBUG_ADAPTER_VIDS.to_vec(),
            thresholds: vec![ThresholdRange::default(); CHANNEL_COUNT],
            anomaly: AnomalyThresholds::default(),
        }
    }
}

impl DetectorConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let config: DetectorConfig = serde_json::from_str(&text)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded detector config");
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.validate()?;
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.thresholds.len() != CHANNEL_COUNT {
            return Err(RailError::Config(format!(
                "expected {} threshold ranges, found {}",
                CHANNEL_COUNT,
                self.thresholds.len()
            )));
        }
        if let Some((i, range)) = self.thresholds.iter().enumerate().find(|(_, r)| r.min > r.max) {
            return Err(RailError::Config(format!(
                "channel {} has min {} above max {}",
                i, range.min, range.max
            )));
        }
        Ok(())
    }
}

impl ConfigStore for DetectorConfig {
    fn threshold_range(&self, channel: ChannelId) -> ThresholdRange {
        self.thresholds.get(channel.index()).copied().unwrap_or_default()
    }

    fn hardware_wait_ms(&self) -> u64 {
        self.hardware_wait_ms
    }

    fn max_retry_per_id(&self) -> u32 {
        self.max_retry_per_id
    }

    fn anomaly_threshold(&self, rule: RuleId) -> i32 {
        match rule {
            RuleId::MainSupply => self.anomaly.main_supply,
            RuleId::Downstream => self.anomaly.downstream,
            RuleId::BackupBattery => self.anomaly.backup_battery,
            RuleId::Peripheral => self.anomaly.peripheral,
        }
    }
}
