//! Property tests for checksums, segmentation and ring accounting
//!
//!   cargo test -p mvirt-netfront --test netfront_proptest

mod harness;

use std::collections::VecDeque;

use proptest::prelude::*;

use harness::TestFrontend;
use mvirt_netfront::checksum::{embedded_l4_checksum, tcp_checksum, udp_checksum, verify};
use mvirt_netfront::headers::classify;
use mvirt_netfront::offload::segment_tcp;
use mvirt_netfront::payload::PayloadCursor;
use mvirt_netfront::test_util::RxHarness;
use mvirt_netfront::test_util::packets::{self, TCP_IPV4_HEADERS};
use mvirt_netfront::transmitter::TxStatus;

fn l4_checksum_valid(frame: &[u8]) -> bool {
    let mut header = Vec::new();
    let mut cursor = PayloadCursor::new(frame);
    let info = classify(&mut header, &mut cursor).expect("headers parse");
    let calculated = if info.tcp.is_some() {
        tcp_checksum(&header, &info, &mut cursor)
    } else {
        udp_checksum(&header, &info, &mut cursor)
    }
    .expect("frame readable");
    let embedded = embedded_l4_checksum(&header, &info).expect("l4 header");
    verify(calculated, embedded)
}

/// One step of the receive ring's life
#[derive(Debug, Clone)]
enum RxStep {
    /// Backend fills buffers with a UDP frame of this many payload bytes
    Send(usize),
    /// Backend consumes one buffer and reports an error for it
    Error,
    /// Backend publishes its responses
    Push,
    Poll,
    /// Caller gives back up to this many held packets, oldest first
    Return(usize),
}

fn rx_step() -> impl Strategy<Value = RxStep> {
    prop_oneof![
        3 => (1usize..9000).prop_map(RxStep::Send),
        1 => Just(RxStep::Error),
        2 => Just(RxStep::Push),
        2 => Just(RxStep::Poll),
        2 => (1usize..8).prop_map(RxStep::Return),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn checksum_agrees_with_builder(
        payload in prop::collection::vec(any::<u8>(), 0..3000),
        seq in any::<u32>(),
        ipv6 in any::<bool>(),
        udp in any::<bool>(),
    ) {
        let frame = match (ipv6, udp) {
            (false, false) => packets::tcp_ipv4_frame(&payload, seq, 1),
            (true, false) => packets::tcp_ipv6_frame(&payload, seq),
            (false, true) => packets::udp_ipv4_frame(&payload),
            (true, true) => packets::udp_ipv6_frame(&payload),
        };
        prop_assert!(l4_checksum_valid(&frame));
    }

    #[test]
    fn corrupted_payload_fails_checksum(
        payload in prop::collection::vec(any::<u8>(), 1..1500),
        index in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let mut frame = packets::tcp_ipv4_frame(&payload, 0, 1);
        let at = TCP_IPV4_HEADERS + index.index(payload.len());
        frame[at] ^= flip;
        prop_assert!(!l4_checksum_valid(&frame));
    }

    #[test]
    fn segmentation_preserves_payload(
        len in 1usize..20000,
        mss in 536usize..9000,
        seq in any::<u32>(),
    ) {
        let payload = packets::pattern(len, 7);
        let frame = packets::tcp_ipv4_frame(&payload, seq, 1);
        let segments = segment_tcp(&frame, mss).expect("segment");

        prop_assert_eq!(segments.len(), len.div_ceil(mss));
        let mut reassembled = Vec::new();
        let mut expected_seq = seq;
        for segment in &segments {
            let parsed = packets::parse_tcp_frame(segment).expect("tcp");
            prop_assert!(parsed.checksums_valid);
            prop_assert!(parsed.payload.len() <= mss);
            prop_assert_eq!(parsed.seq, expected_seq);
            expected_seq = expected_seq.wrapping_add(parsed.payload.len() as u32);
            reassembled.extend_from_slice(&parsed.payload);
        }
        prop_assert_eq!(reassembled, payload);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn every_packet_completes_and_grants_balance(
        shapes in prop::collection::vec((18usize..6000, 1usize..6), 1..40),
    ) {
        let fe = TestFrontend::new(r#"{ "rx_buffers": 32, "tx_buffers": 128 }"#, 1);
        let mut backends = fe.connect();
        let backend = &mut backends[0];

        let mut sent = Vec::new();
        for (cookie, (len, pieces)) in shapes.iter().enumerate() {
            let frame = packets::udp_ipv4_frame(&packets::pattern(*len, cookie as u8));
            fe.netfront
                .queue_packet(0, fe.scattered_packet(cookie as u64, &frame, *pieces))
                .expect("queue");
            sent.push(frame);
        }

        let mut received = Vec::new();
        while backend.tx.pending() > 0 {
            received.extend(fe.transmit(0, backend));
        }
        prop_assert_eq!(received.len(), sent.len());
        for (frame, expected) in received.iter().zip(&sent) {
            prop_assert_eq!(&frame.data, expected);
        }

        let completions = fe.upstream.take_completions();
        prop_assert_eq!(completions.len(), sent.len());
        prop_assert!(completions.iter().all(|c| c.status == TxStatus::Ok));

        fe.close();
        prop_assert_eq!(fe.grants.active(), 0);
        prop_assert_eq!(fe.grants.permits(), fe.grants.revokes());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn receive_pending_matches_ring(steps in prop::collection::vec(rx_step(), 1..120)) {
        let harness = RxHarness::new(24);
        harness.receiver.enable().expect("enable");
        let mut backend = harness.backend();
        let mut held = VecDeque::new();

        for step in steps {
            match step {
                RxStep::Send(len) => {
                    backend.send_frame(&packets::udp_ipv4_frame(&packets::pattern(len, 1)), 0);
                }
                RxStep::Error => {
                    backend.send_error();
                }
                RxStep::Push => {
                    backend.push();
                }
                RxStep::Poll => {
                    harness.receiver.poll().expect("poll");
                    held.extend(harness.upstream.take_packets());
                }
                RxStep::Return(count) => {
                    for packet in held.drain(..count.min(held.len())) {
                        harness.receiver.return_packet(packet);
                    }
                }
            }
            prop_assert!(harness.receiver.pending_consistent());
        }

        // Everything given back and reposted
        backend.push();
        harness.receiver.poll().expect("poll");
        held.extend(harness.upstream.take_packets());
        for packet in held.drain(..) {
            harness.receiver.return_packet(packet);
        }
        harness.receiver.poll().expect("poll");
        prop_assert!(harness.receiver.pending_consistent());
        prop_assert_eq!(harness.receiver.pending_count(), 24);
    }
}
