use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::channel::ChannelId;

/// One reading delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub channel: ChannelId,
    pub value: i32,
    pub timestamp: DateTime<Utc>,
}

/// Ordered per-channel history of readings.
///
/// The transport is the only writer; the detection workflow only reads.
/// Implementations handle their own synchronisation, hence `&self` everywhere.
pub trait SampleStore: Send + Sync {
    fn record_sample(&self, channel: ChannelId, value: i32);

    fn latest_sample(&self, channel: ChannelId) -> Option<Sample>;

    fn first_sample(&self, channel: ChannelId) -> Option<Sample>;

    fn sample_history(&self, channel: ChannelId) -> Vec<Sample>;

    fn clear_all(&self);

    fn sample_count(&self, channel: ChannelId) -> usize {
        self.sample_history(channel).len()
    }
}

/// In-process store used by the CLI and the tests.
#[derive(Debug, Default)]
pub struct MemorySampleStore {
    history: Mutex<BTreeMap<ChannelId, Vec<Sample>>>,
}

impl MemorySampleStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SampleStore for MemorySampleStore {
    fn record_sample(&self, channel: ChannelId, value: i32) {
        self.history.lock().entry(channel).or_default().push(Sample {
            channel,
            value,
            timestamp: Utc::now(),
        });
    }

    fn latest_sample(&self, channel: ChannelId) -> Option<Sample> {
        self.history.lock().get(&channel).and_then(|h| h.last().copied())
    }

    fn first_sample(&self, channel: ChannelId) -> Option<Sample> {
        self.history.lock().get(&channel).and_then(|h| h.first().copied())
    }

    fn sample_history(&self, channel: ChannelId) -> Vec<Sample> {
        self.history.lock().get(&channel).cloned().unwrap_or_default()
    }

    fn clear_all(&self) {
        self.history.lock().clear();
    }

    fn sample_count(&self, channel: ChannelId) -> usize {
        self.history.lock().get(&channel).map_or(0, Vec::len)
    }
}
