//! Arbitrary bytes on the wire must never panic or corrupt the store

mod common;

use bytes::BytesMut;
use common::*;
use railprobe_lib::response::{InboundLine, classify_line, detect_role, split_lines};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::time::Duration;

/// Bytes biased towards the protocol alphabet so lines actually form
fn wire_bytes(rng: &mut StdRng, len: usize) -> Vec<u8> {
    const ALPHABET: &[u8] = b"vin(A0):-+ 0123456789_\r\n";
    (0..len)
        .map(|_| {
            if rng.gen_ratio(1, 4) {
                ALPHABET[rng.gen_range(0..ALPHABET.len())]
            } else {
                rng.r#gen::<u8>()
            }
        })
        .collect()
}

#[test]
fn test_framing_survives_random_bytes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut buf = BytesMut::new();
    for round in 0..500 {
        let len = rng.gen_range(0..64);
        buf.extend_from_slice(&wire_bytes(&mut rng, len));
        for line in split_lines(&mut buf) {
            assert!(!line.is_empty());
            assert!(!line.contains('\n'), "round {}", round);
            if let InboundLine::Reading { channel, .. } = classify_line(&line) {
                assert!(channel.index() < CHANNEL_COUNT);
            }
        }
        assert!(!buf.contains(&b'\n'));
        let _ = detect_role(&buf);
    }
}

#[test]
fn test_framing_is_independent_of_chunking() {
    let mut rng = StdRng::seed_from_u64(42);
    let stream = wire_bytes(&mut rng, 4096);

    let mut whole = BytesMut::from(&stream[..]);
    let expected = split_lines(&mut whole);

    let mut chunked = BytesMut::new();
    let mut lines = Vec::new();
    let mut offset = 0;
    while offset < stream.len() {
        let step = rng.gen_range(1..=17);
        let end = (offset + step).min(stream.len());
        chunked.extend_from_slice(&stream[offset..end]);
        lines.extend(split_lines(&mut chunked));
        offset = end;
    }

    assert_eq!(lines, expected);
    assert_eq!(chunked, whole);
}

#[tokio::test(start_paused = true)]
async fn test_transport_accepts_random_input() {
    let device = MockDevice::new(healthy_firmware(DeviceRole::Detector));
    let (mut transport, store) = transport(DeviceRole::Detector, single_port(device.clone()));
    transport.open(PORT_A);
    transport.start_heartbeat();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..200 {
        let len = rng.gen_range(0..256);
        device.inject(&wire_bytes(&mut rng, len));
        transport.idle(Duration::from_millis(50)).await;
    }
    device.inject(b"\r\nvin(A0): 321\r\n");
    transport.idle(Duration::from_millis(100)).await;

    assert!(transport.is_open());
    assert_eq!(store.latest_sample(ChannelId(0)).map(|s| s.value), Some(321));
}
