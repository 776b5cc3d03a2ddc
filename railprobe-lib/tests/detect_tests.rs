//! End-to-end detection runs against simulated fixtures

mod common;

use common::*;
use railprobe_lib::rules::RuleId;
use railprobe_lib::transport::mock::SimulatedFirmware;
use railprobe_lib::{
    AutoDetector, DetectOutcome, DetectionEvent, DetectorConfig, FailedItem, RailError, WorkflowState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const MAIN_SUPPLY: [usize; 5] = [0, 1, 2, 7, 8];
const DOWNSTREAM: [usize; 7] = [3, 4, 5, 6, 9, 10, 11];
const BACKUP_BATTERY: [usize; 1] = [14];
const PERIPHERAL: [usize; 6] = [12, 13, 15, 16, 17, 18];

struct Bench {
    detector: AutoDetector,
    events: mpsc::UnboundedReceiver<DetectionEvent>,
    cancel: CancelFlag,
}

fn bench(backend: Arc<MockBackend>) -> Bench {
    let (transport, _store) = transport(DeviceRole::Detector, backend);
    let (tx, events) = mpsc::unbounded_channel();
    let cancel = CancelFlag::new();
    let detector = AutoDetector::new(transport, Arc::new(DetectorConfig::default()), tx, cancel.clone());
    Bench {
        detector,
        events,
        cancel,
    }
}

fn firmware_with(values: &[(usize, Option<i32>)]) -> SimulatedFirmware {
    values
        .iter()
        .fold(healthy_firmware(DeviceRole::Detector), |fw, &(ch, v)| fw.with_value(ch, v))
}

fn collapsed(channels: &[usize]) -> Vec<(usize, Option<i32>)> {
    channels.iter().map(|&ch| (ch, Some(COLLAPSED))).collect()
}

fn verdict_of(outcome: DetectOutcome) -> railprobe_lib::Verdict {
    match outcome {
        DetectOutcome::Completed(verdict) => verdict,
        other => panic!("expected a completed run, got {:?}", other),
    }
}

fn states(events: &[DetectionEvent]) -> Vec<WorkflowState> {
    events
        .iter()
        .filter_map(|e| match e {
            DetectionEvent::StateChanged(s) => Some(*s),
            _ => None,
        })
        .collect()
}

fn notices(events: &[DetectionEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            DetectionEvent::Notice(n) => Some(n.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_healthy_fixture_passes() {
    init_tracing();
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));

    let verdict = verdict_of(bench.detector.start().await);

    assert!(verdict.passed);
    assert!(verdict.failed_items.is_empty());
    assert_eq!(verdict.to_string(), "PASS");

    let events = drain(&mut bench.events);
    assert_eq!(
        states(&events),
        vec![
            WorkflowState::Connecting,
            WorkflowState::Acquiring,
            WorkflowState::Evaluating,
            WorkflowState::Idle
        ]
    );
    assert!(events.contains(&DetectionEvent::Verdict(verdict.clone())));
    assert!(events.iter().any(|e| matches!(e, DetectionEvent::Progress { fraction, .. } if *fraction == 1.0)));

    // Every channel requested exactly once, in table order
    let requested: Vec<String> = device.written().into_iter().filter(|c| c.starts_with("RD")).collect();
    let expected: Vec<String> = (0..CHANNEL_COUNT).map(|i| format!("RD{:02}", i)).collect();
    assert_eq!(requested, expected);

    assert_eq!(bench.detector.preferred_port(), Some(PORT_A));
    assert_eq!(bench.detector.last_result(), Some(&verdict));
    let report = bench.detector.last_acquire().expect("acquire report");
    assert_eq!(report.completed.len(), CHANNEL_COUNT);
    assert!(report.missing.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_replay_emits_cached_verdict() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));

    assert!(bench.detector.replay_last_result().is_none());
    let verdict = verdict_of(bench.detector.start().await);
    drain(&mut bench.events);
    let writes = device.written().len();

    assert_eq!(bench.detector.replay_last_result(), Some(verdict.clone()));
    assert_eq!(drain(&mut bench.events), vec![DetectionEvent::Verdict(verdict)]);
    assert_eq!(device.written().len(), writes);
}

#[tokio::test(start_paused = true)]
async fn test_silent_channel_is_retried_then_reported() {
    let device = MockDevice::new(firmware_with(&[(6, None)]));
    let mut bench = bench(single_port(device.clone()));

    let verdict = verdict_of(bench.detector.start().await);

    assert!(!verdict.passed);
    assert_eq!(
        verdict.failed_items,
        vec![FailedItem::NoData {
            channel: ChannelId(6)
        }]
    );
    // One sweep request plus max_retry_per_id retries
    assert_eq!(count_written(&device, "RD06"), 3);
    assert_eq!(count_written(&device, "RD05"), 1);
    assert_eq!(bench.detector.last_acquire().map(|r| r.missing.clone()), Some(vec![ChannelId(6)]));
    assert!(verdict.descriptions()[0].ends_with("(ch 6): no data"));
}

#[tokio::test(start_paused = true)]
async fn test_main_rail_collapse_is_one_anomaly() {
    let device = MockDevice::new(firmware_with(&collapsed(&MAIN_SUPPLY)));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(verdict.failed_items, vec![FailedItem::Anomaly(RuleId::MainSupply)]);
}

#[tokio::test(start_paused = true)]
async fn test_downstream_rule_needs_main_rail_collapse() {
    let device = MockDevice::new(firmware_with(&collapsed(&DOWNSTREAM)));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert!(!verdict.passed);
    assert!(
        !verdict
            .failed_items
            .iter()
            .any(|item| matches!(item, FailedItem::Anomaly(_)))
    );
    let out_of_range: Vec<ChannelId> = verdict
        .failed_items
        .iter()
        .filter_map(|item| match item {
            FailedItem::OutOfRange { channel, value, .. } => {
                assert_eq!(*value, COLLAPSED);
                Some(*channel)
            }
            _ => None,
        })
        .collect();
    let expected: Vec<ChannelId> = DOWNSTREAM.iter().map(|&c| ChannelId(c as u8)).collect();
    assert_eq!(out_of_range, expected);
}

#[tokio::test(start_paused = true)]
async fn test_backup_battery_collapse_is_one_anomaly() {
    let device = MockDevice::new(firmware_with(&collapsed(&BACKUP_BATTERY)));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(verdict.failed_items, vec![FailedItem::Anomaly(RuleId::BackupBattery)]);
    assert_eq!(verdict.descriptions(), vec![RuleId::BackupBattery.to_string()]);
}

#[tokio::test(start_paused = true)]
async fn test_peripheral_collapse_is_one_anomaly() {
    let device = MockDevice::new(firmware_with(&collapsed(&PERIPHERAL)));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(verdict.failed_items, vec![FailedItem::Anomaly(RuleId::Peripheral)]);
}

#[tokio::test(start_paused = true)]
async fn test_partial_peripheral_collapse_is_range_failures() {
    // Five of six peripheral channels low: no anomaly, just range failures
    let device = MockDevice::new(firmware_with(&collapsed(&PERIPHERAL[..5])));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(verdict.failed_items.len(), 5);
    assert!(
        verdict
            .failed_items
            .iter()
            .all(|item| matches!(item, FailedItem::OutOfRange { value: COLLAPSED, .. }))
    );
}

#[tokio::test(start_paused = true)]
async fn test_independent_rules_fire_together() {
    let mut values = collapsed(&BACKUP_BATTERY);
    values.extend(collapsed(&PERIPHERAL));
    let device = MockDevice::new(firmware_with(&values));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(
        verdict.failed_items,
        vec![
            FailedItem::Anomaly(RuleId::BackupBattery),
            FailedItem::Anomaly(RuleId::Peripheral)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_both_rails_collapsed() {
    let mut values = collapsed(&MAIN_SUPPLY);
    values.extend(collapsed(&DOWNSTREAM));
    let device = MockDevice::new(firmware_with(&values));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(
        verdict.failed_items,
        vec![
            FailedItem::Anomaly(RuleId::MainSupply),
            FailedItem::Anomaly(RuleId::Downstream)
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_out_of_range_reading_is_reported_with_range() {
    let device = MockDevice::new(firmware_with(&[(14, Some(950))]));
    let mut bench = bench(single_port(device));

    let verdict = verdict_of(bench.detector.start().await);

    assert_eq!(verdict.failed_items.len(), 1);
    let description = &verdict.descriptions()[0];
    assert!(description.ends_with("(ch 14): 950 outside [100, 900]"), "{}", description);
}

#[tokio::test(start_paused = true)]
async fn test_stale_reading_does_not_count_as_fresh() {
    // RD02 also prints channel 3; RD03 itself never answers
    let device = MockDevice::new(|command: &str| match command {
        "WHO" => vec!["DETECTOR_READY".to_string()],
        "RD02" => vec![
            SimulatedFirmware::reading_line(2, IN_RANGE),
            SimulatedFirmware::reading_line(3, IN_RANGE),
        ],
        "RD03" => Vec::new(),
        other => match railprobe_lib::channel::channel_by_command(other) {
            Some(channel) => vec![SimulatedFirmware::reading_line(channel.id.index(), IN_RANGE)],
            None => Vec::new(),
        },
    });
    let mut bench = bench(single_port(device.clone()));

    let verdict = verdict_of(bench.detector.start().await);

    // The stale value still feeds the diagnosis, but the channel is not fresh
    assert!(verdict.passed);
    assert_eq!(bench.detector.last_acquire().map(|r| r.missing.clone()), Some(vec![ChannelId(3)]));
    // Retries only cover channels with no sample at all
    assert_eq!(count_written(&device, "RD03"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_wrong_mode_port_is_skipped() {
    let monitor = MockDevice::new(healthy_firmware(DeviceRole::Monitor));
    let fixture = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let backend = Arc::new(
        MockBackend::new()
            .with_device(PORT_A, None, monitor.clone())
            .with_device(PORT_B, None, fixture),
    );
    let mut bench = bench(backend);

    let verdict = verdict_of(bench.detector.start().await);

    assert!(verdict.passed);
    assert_eq!(bench.detector.preferred_port(), Some(PORT_B));
    assert_eq!(monitor.open_links(), 0);
    let notices = notices(&drain(&mut bench.events));
    assert!(notices.contains(&format!("{} runs the monitor firmware, skipping", PORT_A)));
}

#[tokio::test(start_paused = true)]
async fn test_only_wrong_mode_ports_is_wrong_device() {
    let monitor = MockDevice::new(healthy_firmware(DeviceRole::Monitor));
    let mut bench = bench(single_port(monitor));

    match bench.detector.start().await {
        DetectOutcome::Aborted(RailError::WrongDevice { port, found }) => {
            assert_eq!(port, PORT_A);
            assert_eq!(found, DeviceRole::Monitor);
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(bench.detector.state(), WorkflowState::Idle);
    assert!(bench.detector.last_result().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_preferred_port_is_tried_first() {
    let first = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let second = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let backend = Arc::new(
        MockBackend::new()
            .with_device(PORT_A, None, first.clone())
            .with_device(PORT_B, None, second.clone()),
    );
    let mut bench = bench(backend);
    bench.detector = bench.detector.with_preferred_port(Some(PORT_B.to_string()));

    verdict_of(bench.detector.start().await);

    assert_eq!(first.open_count(), 0);
    assert_eq!(second.open_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_no_ports_aborts_with_notice() {
    let mut bench = bench(Arc::new(MockBackend::new()));

    let outcome = bench.detector.start().await;

    assert!(matches!(outcome, DetectOutcome::Aborted(RailError::PortUnavailable(_))));
    let events = drain(&mut bench.events);
    assert!(notices(&events).contains(&"No serial port detected".to_string()));
    assert_eq!(states(&events), vec![WorkflowState::Connecting, WorkflowState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_link_loss_mid_acquire_aborts() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));

    let (outcome, _) = tokio::join!(bench.detector.start(), async {
        // Connect completes at about 1.2 s
        sleep(Duration::from_millis(1500)).await;
        device.set_io_failure(true);
    });

    assert!(matches!(outcome, DetectOutcome::Aborted(RailError::LinkLost(_))));
    assert!(!bench.detector.transport().is_open());
    assert_eq!(bench.detector.transport().status(), LinkStatus::Lost);
    assert!(bench.detector.last_result().is_none());
    let events = drain(&mut bench.events);
    assert!(notices(&events).contains(&"Connection to the fixture was lost".to_string()));
    assert!(!events.iter().any(|e| matches!(e, DetectionEvent::Verdict(_))));
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_acquire_stops_requests() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));
    let cancel = bench.cancel.clone();

    let (outcome, _) = tokio::join!(bench.detector.start(), async {
        sleep(Duration::from_millis(1500)).await;
        cancel.cancel();
    });

    assert!(matches!(outcome, DetectOutcome::Cancelled));
    assert_eq!(bench.detector.state(), WorkflowState::Cancelled);
    assert_eq!(count_written(&device, "RD18"), 0);
    let events = drain(&mut bench.events);
    assert!(notices(&events).contains(&"Auto-detection cancelled".to_string()));
    assert!(!events.iter().any(|e| matches!(e, DetectionEvent::Verdict(_))));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_reuses_healthy_link() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));

    assert!(verdict_of(bench.detector.start().await).passed);
    assert!(verdict_of(bench.detector.start().await).passed);

    assert_eq!(device.open_count(), 1);
    assert_eq!(count_written(&device, "RD00"), 2);

    bench.detector.disconnect();
    assert_eq!(device.open_links(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_run_does_not_block_the_next_one() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let mut bench = bench(single_port(device.clone()));

    // Abandon the run mid-acquire (connect finishes at about 1.2 s)
    let dropped = timeout(Duration::from_millis(1500), bench.detector.start()).await;
    assert!(dropped.is_err());
    assert_eq!(bench.detector.state(), WorkflowState::Acquiring);

    let verdict = verdict_of(bench.detector.start().await);

    assert!(verdict.passed);
    assert_eq!(bench.detector.state(), WorkflowState::Idle);
    // The interrupted link is released and the fixture reconnected
    assert_eq!(device.open_count(), 2);
    assert_eq!(device.open_links(), 1);
}
