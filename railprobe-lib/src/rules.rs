//! Hierarchical power-rail anomaly rules.
//!
//! Each rule fires when every channel in its subset reads below the rule's
//! threshold. A gated rule additionally requires its prerequisite to fire on
//! the same snapshot.

use strum_macros::Display;

use crate::channel::{CHANNEL_COUNT, ChannelId};
use crate::config::ConfigStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum RuleId {
    #[strum(to_string = "Main supply collapse")]
    MainSupply,
    #[strum(to_string = "Downstream rails down")]
    Downstream,
    #[strum(to_string = "Backup battery flat")]
    BackupBattery,
    #[strum(to_string = "Peripheral rails down")]
    Peripheral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnomalyRule {
    pub id: RuleId,
    pub channels: &'static [u8],
    pub prerequisite: Option<RuleId>,
}

impl AnomalyRule {
    pub fn channel_ids(&self) -> impl Iterator<Item = ChannelId> + '_ {
        self.channels.iter().map(|&c| ChannelId(c))
    }
}

/// Rule table. Independent rules come before the rules they gate.
pub static RULES: [AnomalyRule; 4] = [
    AnomalyRule {
        id: RuleId::MainSupply,
        channels: &[0, 1, 2, 7, 8],
        prerequisite: None,
    },
    AnomalyRule {
        id: RuleId::BackupBattery,
        channels: &[14],
        prerequisite: None,
    },
    AnomalyRule {
        id: RuleId::Peripheral,
        channels: &[12, 13, 15, 16, 17, 18],
        prerequisite: None,
    },
    AnomalyRule {
        id: RuleId::Downstream,
        channels: &[3, 4, 5, 6, 9, 10, 11],
        prerequisite: Some(RuleId::MainSupply),
    },
];

pub fn rule(id: RuleId) -> &'static AnomalyRule {
    match id {
        RuleId::MainSupply => &RULES[0],
        RuleId::BackupBattery => &RULES[1],
        RuleId::Peripheral => &RULES[2],
        RuleId::Downstream => &RULES[3],
    }
}

/// One value (or none) per channel, taken from a single acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot([Option<i32>; CHANNEL_COUNT]);

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel: ChannelId) -> Option<i32> {
        self.0.get(channel.index()).copied().flatten()
    }

    pub fn set(&mut self, channel: ChannelId, value: Option<i32>) {
        if let Some(slot) = self.0.get_mut(channel.index()) {
            *slot = value;
        }
    }

    pub fn from_values(values: [Option<i32>; CHANNEL_COUNT]) -> Self {
        Self(values)
    }
}

/// Whether the rule's own channel condition holds, ignoring any prerequisite.
/// A missing reading never counts as "below".
fn condition_holds(rule: &AnomalyRule, snapshot: &Snapshot, config: &dyn ConfigStore) -> bool {
    let threshold = config.anomaly_threshold(rule.id);
    rule.channel_ids()
        .all(|c| snapshot.get(c).is_some_and(|v| v < threshold))
}

/// Evaluate one rule, re-checking its prerequisite chain against the same snapshot
pub fn is_triggered(id: RuleId, snapshot: &Snapshot, config: &dyn ConfigStore) -> bool {
    let rule = rule(id);
    if let Some(prerequisite) = rule.prerequisite {
        if !is_triggered(prerequisite, snapshot, config) {
            return false;
        }
    }
    condition_holds(rule, snapshot, config)
}

/// All triggered rules in table order
pub fn evaluate(snapshot: &Snapshot, config: &dyn ConfigStore) -> Vec<RuleId> {
    RULES
        .iter()
        .map(|r| r.id)
        .filter(|&id| is_triggered(id, snapshot, config))
        .collect()
}
