//! Session establishment, use, expiry and revocation end to end.

use std::sync::Arc;

use chrono::Duration;
use serde_json::json;

use sealwire::{ManualClock, SecureChannel, TransportConfig, TransportError};

fn channel() -> (SecureChannel, ManualClock) {
    let clock = ManualClock::starting_now();
    let config = TransportConfig {
        rsa_key_size: 1024,
        session_kdf_iterations: 1_000,
        ..TransportConfig::default()
    };
    let channel = SecureChannel::with_clock(config, Arc::new(clock.clone())).unwrap();
    (channel, clock)
}

#[test]
fn test_hello_replay_revoke_scenario() {
    let (channel, _) = channel();
    let codec = channel.codec();

    let session = channel.sessions().create_session("c1").unwrap();
    let envelope = codec
        .encrypt(&json!({"msg": "hello"}), &session.session_id, 1)
        .unwrap();

    let opened = codec.decrypt(&envelope).unwrap();
    assert_eq!(opened.payload, json!({"msg": "hello"}));
    assert_eq!(opened.metadata.sequence, 1);

    // Same envelope again: replay.
    assert_eq!(codec.decrypt(&envelope), Err(TransportError::ReplayDetected));

    // After revocation nothing referencing the session opens.
    channel.sessions().revoke_session(&session.session_id);
    assert_eq!(codec.decrypt(&envelope), Err(TransportError::SessionNotFound));
}

#[test]
fn test_revoked_session_rejects_fresh_envelopes() {
    let (channel, _) = channel();
    let session = channel.sessions().create_session("c1").unwrap();
    let envelope = channel
        .codec()
        .encrypt(&json!([1, 2, 3]), &session.session_id, 5)
        .unwrap();

    channel.sessions().revoke_session(&session.session_id);
    assert_eq!(
        channel.codec().decrypt(&envelope),
        Err(TransportError::SessionNotFound)
    );
    assert_eq!(
        channel.codec().encrypt(&json!(1), &session.session_id, 6),
        Err(TransportError::SessionNotFound)
    );
}

#[test]
fn test_expired_session_is_not_found() {
    let (channel, clock) = channel();
    let session = channel.sessions().create_session("c1").unwrap();

    clock.advance(Duration::seconds(301));
    assert!(channel.sessions().get_session(&session.session_id).is_none());
    assert_eq!(
        channel.codec().encrypt(&json!(1), &session.session_id, 1),
        Err(TransportError::SessionNotFound)
    );
}

#[test]
fn test_unknown_session_is_not_found_regardless_of_payload() {
    let (channel, _) = channel();
    let session = channel.sessions().create_session("c1").unwrap();
    let mut envelope = channel
        .codec()
        .encrypt(&json!({"msg": "hello"}), &session.session_id, 1)
        .unwrap();

    envelope.session_id = "not-a-session".into();
    assert_eq!(
        channel.codec().decrypt(&envelope),
        Err(TransportError::SessionNotFound)
    );
}

#[test]
fn test_client_public_key_is_kept_with_session() {
    let (channel, _) = channel();
    let descriptor = channel
        .sessions()
        .create_session_with_key("c1", Some("client-pem".into()))
        .unwrap();

    let session = channel.sessions().get_session(&descriptor.session_id).unwrap();
    assert_eq!(session.client_public_key(), Some("client-pem"));
    assert_eq!(session.server_public_key(), descriptor.server_public_key);
    assert_eq!(session.status().client_id, "c1");
}

#[test]
fn test_purge_reaps_sessions_and_nonces() {
    let (channel, clock) = channel();
    let session = channel.sessions().create_session("c1").unwrap();
    let envelope = channel
        .codec()
        .encrypt(&json!(1), &session.session_id, 1)
        .unwrap();
    channel.codec().decrypt(&envelope).unwrap();

    clock.advance(Duration::seconds(301));
    assert_eq!(channel.purge_expired(), (1, 1));
    assert_eq!(channel.sessions().active_sessions(), 0);
}
