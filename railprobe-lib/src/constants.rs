// Wire and timing constants for the railprobe fixture

use std::time::Duration;

/// Line speed of both firmware variants
pub const BAUD_RATE: u32 = 115_200;

/// Command sent to ask the firmware which role it runs; doubles as the heartbeat probe
pub const IDENTITY_PROBE: &str = "WHO";

/// Identity token emitted by the auto-detection firmware
pub const DETECTOR_TOKEN: &str = "DETECTOR_READY";

/// Identity token emitted by the live-monitor firmware
pub const MONITOR_TOKEN: &str = "MONITOR_READY";

/// Vendor ids of on-board debug adapters that must never be probed
/// (SEGGER J-Link, Microchip EDBG)
pub const DEBUG_ADAPTER_VIDS: &[u16] = &[0x1366, 0x03EB];

/// Period of the transport read poll
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Period of the heartbeat timer
pub const HEARTBEAT_PERIOD: Duration = Duration::from_secs(1);

/// Inbound traffic younger than this counts as proof of life
pub const ACTIVITY_GRACE: Duration = Duration::from_millis(800);

/// Consecutive unanswered probes before the link is declared dead
pub const HEARTBEAT_FAIL_THRESHOLD: u32 = 3;

/// Time the firmware needs to finish its boot banner after the port opens
pub const BOOT_SETTLE: Duration = Duration::from_millis(1000);

/// Identity attempts per port during the handshake
pub const VERIFY_ATTEMPTS: u32 = 2;

/// Poll interval while waiting for an identity reply
pub const VERIFY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Polls per identity attempt (5 x 200 ms = 1 s window)
pub const VERIFY_POLLS: u32 = 5;

/// Pause between the two identity attempts
pub const VERIFY_RETRY_PAUSE: Duration = Duration::from_millis(300);

/// Delay before the mode scanner repeats a full port sweep
pub const SCAN_RETRY_INTERVAL: Duration = Duration::from_secs(3);

/// Poll interval of the mode scanner
pub const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long the mode scanner listens on one port
pub const SCAN_LISTEN_WINDOW: Duration = Duration::from_secs(2);

/// Tick of the acquire-phase sample poll
pub const ACQUIRE_POLL_TICK: Duration = Duration::from_millis(50);
