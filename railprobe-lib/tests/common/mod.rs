//! Common test utilities and shared fixtures

// Not every test file uses every helper
#![allow(dead_code)]

use std::sync::Arc;
use tokio::sync::mpsc;

pub use railprobe_lib::transport::mock::{MockBackend, MockDevice, SimulatedFirmware};
pub use railprobe_lib::{
    CHANNEL_COUNT, CancelFlag, ChannelId, DeviceRole, LinkStatus, MemorySampleStore, SampleStore, Transport,
};

pub const PORT_A: &str = "/dev/ttyACM0";
pub const PORT_B: &str = "/dev/ttyACM1";

/// Reading that sits inside the default [100, 900] range
pub const IN_RANGE: i32 = 500;

/// Reading below the default anomaly threshold (50)
pub const COLLAPSED: i32 = 10;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn healthy_firmware(role: DeviceRole) -> SimulatedFirmware {
    SimulatedFirmware::uniform(role, IN_RANGE)
}

pub fn single_port(device: MockDevice) -> Arc<MockBackend> {
    Arc::new(MockBackend::new().with_device(PORT_A, Some(0x2341), device))
}

pub fn transport(role: DeviceRole, backend: Arc<MockBackend>) -> (Transport, Arc<MemorySampleStore>) {
    let store = Arc::new(MemorySampleStore::new());
    let transport = Transport::new(role, backend, store.clone());
    (transport, store)
}

/// Everything currently queued on an event channel
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub fn count_written(device: &MockDevice, command: &str) -> usize {
    device.written().iter().filter(|c| c.as_str() == command).count()
}
