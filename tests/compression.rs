//! Compression is transparent to both ends of the codec.

use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;

use sealwire::{ManualClock, SecureChannel, TransportConfig};

fn channel() -> SecureChannel {
    let config = TransportConfig {
        rsa_key_size: 1024,
        session_kdf_iterations: 1_000,
        anti_replay: false,
        ..TransportConfig::default()
    };
    SecureChannel::with_clock(config, Arc::new(ManualClock::starting_now())).unwrap()
}

/// Length of the compact canonical record around an empty string payload.
fn record_overhead(timestamp: i64, nonce: &str, sequence: u64) -> usize {
    serde_json::to_vec(&json!({
        "payload": "",
        "timestamp": timestamp,
        "nonce": nonce,
        "sequence": sequence,
        "version": "2.0",
    }))
    .unwrap()
    .len()
}

#[test]
fn test_threshold_switches_compression() {
    let channel = channel();
    let session = channel.sessions().create_session("c1").unwrap();

    // The clock is frozen, so every envelope shares this timestamp, and
    // nonces have a fixed length.
    let sizing = channel.codec().encrypt(&json!(""), &session.session_id, 1).unwrap();
    let overhead = record_overhead(sizing.timestamp, &sizing.nonce, 1);

    let at_threshold = json!("a".repeat(1024 - overhead));
    let over_threshold = json!("a".repeat(1025 - overhead));

    let at_env = channel.codec().encrypt(&at_threshold, &session.session_id, 2).unwrap();
    let over_env = channel.codec().encrypt(&over_threshold, &session.session_id, 3).unwrap();
    assert_eq!(at_env.timestamp, sizing.timestamp);
    assert!(!at_env.compressed, "a 1024-byte record stays uncompressed");
    assert!(over_env.compressed, "a 1025-byte record is compressed");

    assert_eq!(channel.codec().decrypt(&at_env).unwrap().payload, at_threshold);
    assert_eq!(channel.codec().decrypt(&over_env).unwrap().payload, over_threshold);

    // Repetitive payloads shrink on the wire.
    assert!(over_env.data.len() < at_env.data.len());
}

#[test]
fn test_threshold_is_configurable() {
    let config = TransportConfig {
        rsa_key_size: 1024,
        session_kdf_iterations: 1_000,
        compression_threshold: 16,
        ..TransportConfig::default()
    };
    let channel = SecureChannel::with_clock(config, Arc::new(ManualClock::starting_now())).unwrap();
    let session = channel.sessions().create_session("c1").unwrap();

    let envelope = channel.codec().encrypt(&json!("short"), &session.session_id, 1).unwrap();
    assert!(envelope.compressed);
    assert_eq!(channel.codec().decrypt(&envelope).unwrap().payload, json!("short"));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_payload_survives_either_path(len in 0usize..3000, fill in "[a-zA-Z0-9]") {
        let channel = channel();
        let session = channel.sessions().create_session("c1").unwrap();
        let payload = json!({"blob": fill.repeat(len)});

        let envelope = channel.codec().encrypt(&payload, &session.session_id, 0).unwrap();
        prop_assert_eq!(channel.codec().decrypt(&envelope).unwrap().payload, payload);
    }
}
