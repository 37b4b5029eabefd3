//! Transport envelope codec.
//!
//! One envelope carries one protected payload. Sealing:
//!
//! 1. Wrap the payload in a canonical record with timestamp, replay nonce,
//!    sequence and version, serialized as compact JSON.
//! 2. Gzip the record if it is longer than the compression threshold.
//! 3. Encrypt with AES-256-GCM under the session key and a fresh 96-bit IV.
//! 4. Sign `"{data}:{iv}:{timestamp}:{nonce}"` with HMAC-SHA256 under
//!    `SHA256(session_key || "hmac")`.
//!
//! Opening checks, in order: session liveness, freshness window, replay
//! probe, HMAC, AEAD tag, decompression, record parsing. The nonce is marked
//! consumed only once all of them pass, atomically, so a rejected envelope
//! never burns its nonce and racing duplicates yield exactly one success.

use std::io::{Read, Write};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Duration;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::crypto;
use crate::error::{CryptoError, TransportError};
use crate::replay::{NonceKey, ReplayGuard};
use crate::session::{session_hint, Session, SessionManager};

/// Wire format version produced and accepted by this codec.
pub const ENVELOPE_VERSION: &str = "2.0";

/// Entropy of the replay nonce, in bytes (96 bits).
const NONCE_BYTES: usize = 12;

/// The wire unit of one protected exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub session_id: String,
    /// Base64 AES-GCM ciphertext.
    pub data: String,
    /// Base64 96-bit AEAD IV.
    pub iv: String,
    /// Base64 128-bit GCM tag.
    pub tag: String,
    pub timestamp: i64,
    /// Replay token, distinct from the IV.
    pub nonce: String,
    pub sequence: u64,
    /// Hex HMAC-SHA256 over the envelope fields.
    pub hmac: String,
    pub version: String,
    #[serde(default)]
    pub compressed: bool,
}

impl Envelope {
    /// Parse an envelope from a JSON body.
    pub fn from_json(bytes: &[u8]) -> Result<Self, TransportError> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::MalformedEnvelope(e.to_string()))
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|_| CryptoError::Serialization)
    }

    fn signed_bytes(data: &str, iv: &str, timestamp: i64, nonce: &str) -> Vec<u8> {
        format!("{data}:{iv}:{timestamp}:{nonce}").into_bytes()
    }
}

/// The authenticated plaintext inside an envelope.
#[derive(Serialize, Deserialize)]
struct TransportRecord {
    payload: Value,
    timestamp: i64,
    nonce: String,
    sequence: u64,
    version: String,
}

/// Replay metadata recovered from an opened envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvelopeMetadata {
    pub timestamp: i64,
    pub nonce: String,
    pub sequence: u64,
    pub version: String,
}

/// A successfully opened envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Opened {
    pub payload: Value,
    pub metadata: EnvelopeMetadata,
}

/// Seals and opens envelopes for live sessions.
#[derive(Clone)]
pub struct TransportCodec {
    sessions: SessionManager,
    replay: Arc<dyn ReplayGuard>,
}

impl TransportCodec {
    pub fn new(sessions: SessionManager, replay: Arc<dyn ReplayGuard>) -> Self {
        Self { sessions, replay }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    fn live_session(&self, session_id: &str) -> Result<Arc<Session>, TransportError> {
        self.sessions
            .get_session(session_id)
            .ok_or(TransportError::SessionNotFound)
    }

    /// Seal `payload` for `session_id`.
    pub fn encrypt(
        &self,
        payload: &Value,
        session_id: &str,
        sequence: u64,
    ) -> Result<Envelope, TransportError> {
        let session = self.live_session(session_id)?;
        let config = self.sessions.config();

        let timestamp = self.sessions.clock().unix_now();
        let nonce = crypto::random_token::<NONCE_BYTES>()?;
        let record = TransportRecord {
            payload: payload.clone(),
            timestamp,
            nonce: nonce.clone(),
            sequence,
            version: ENVELOPE_VERSION.to_string(),
        };
        let canonical = serde_json::to_vec(&record).map_err(|_| CryptoError::Serialization)?;

        let compressed = canonical.len() > config.compression_threshold;
        let plaintext = if compressed {
            gzip(&canonical)?
        } else {
            canonical
        };

        let sealed = crypto::seal_detached(session.key().as_bytes(), &[], &plaintext)?;
        let data = STANDARD.encode(&sealed.ciphertext);
        let iv = STANDARD.encode(sealed.iv);
        let hmac = crypto::hmac_sha256_hex(
            &*session.key().hmac_key(),
            &Envelope::signed_bytes(&data, &iv, timestamp, &nonce),
        );

        debug!(
            session = session_hint(session_id),
            sequence,
            size = plaintext.len(),
            compressed,
            "envelope sealed"
        );

        Ok(Envelope {
            session_id: session_id.to_string(),
            data,
            iv,
            tag: STANDARD.encode(sealed.tag),
            timestamp,
            nonce,
            sequence,
            hmac,
            version: ENVELOPE_VERSION.to_string(),
            compressed,
        })
    }

    /// Verify and open an envelope.
    pub fn decrypt(&self, envelope: &Envelope) -> Result<Opened, TransportError> {
        let result = self.open(envelope);
        if let Err(err) = &result {
            warn!(
                session = session_hint(&envelope.session_id),
                sequence = envelope.sequence,
                reason = err.reason(),
                "envelope rejected"
            );
        }
        result
    }

    fn open(&self, envelope: &Envelope) -> Result<Opened, TransportError> {
        let session = self.live_session(&envelope.session_id)?;
        let config = self.sessions.config();

        let now = self.sessions.clock().unix_now();
        if now.abs_diff(envelope.timestamp) > config.time_window_secs {
            return Err(TransportError::StaleTimestamp);
        }

        if envelope.version != ENVELOPE_VERSION {
            return Err(TransportError::MalformedEnvelope(format!(
                "unsupported version {}",
                envelope.version
            )));
        }

        let nonce_key = NonceKey::new(&envelope.session_id, &envelope.nonce, envelope.timestamp);
        if config.anti_replay && self.replay.is_consumed(&nonce_key) {
            return Err(TransportError::ReplayDetected);
        }

        if config.integrity_check {
            let signature = hex::decode(&envelope.hmac)
                .map_err(|_| TransportError::MalformedEnvelope("hmac".into()))?;
            let signed = Envelope::signed_bytes(
                &envelope.data,
                &envelope.iv,
                envelope.timestamp,
                &envelope.nonce,
            );
            if !crypto::hmac_sha256_verify(&*session.key().hmac_key(), &signed, &signature) {
                warn!(session = session_hint(&envelope.session_id), "hmac mismatch");
                return Err(TransportError::IntegrityFailure);
            }
        }

        let ciphertext = decode_field(&envelope.data, "data")?;
        let iv = decode_field(&envelope.iv, "iv")?;
        let tag = decode_field(&envelope.tag, "tag")?;

        let plaintext = crypto::open_detached(session.key().as_bytes(), &[], &iv, &ciphertext, &tag)
            .ok_or_else(|| {
                warn!(session = session_hint(&envelope.session_id), "aead tag mismatch");
                TransportError::IntegrityFailure
            })?;

        let canonical = if envelope.compressed {
            gunzip(&plaintext, config.max_request_size)?
        } else {
            plaintext
        };

        let record: TransportRecord = serde_json::from_slice(&canonical)
            .map_err(|e| TransportError::MalformedEnvelope(e.to_string()))?;

        // The record is authenticated by GCM; the outer fields must agree
        // with it even when the HMAC check is switched off.
        if record.nonce != envelope.nonce || record.timestamp != envelope.timestamp {
            return Err(TransportError::IntegrityFailure);
        }

        // Keep the mark alive past the last second this timestamp is fresh,
        // including when the sender's clock runs ahead of ours.
        let lead = (envelope.timestamp - now).max(0);
        let mark_ttl = config.time_window() + Duration::seconds(lead + 1);
        if config.anti_replay && !self.replay.check_and_mark(&nonce_key, mark_ttl) {
            return Err(TransportError::ReplayDetected);
        }

        debug!(
            session = session_hint(&envelope.session_id),
            sequence = record.sequence,
            "envelope opened"
        );

        Ok(Opened {
            payload: record.payload,
            metadata: EnvelopeMetadata {
                timestamp: record.timestamp,
                nonce: record.nonce,
                sequence: record.sequence,
                version: record.version,
            },
        })
    }
}

fn decode_field(value: &str, field: &str) -> Result<Vec<u8>, TransportError> {
    STANDARD
        .decode(value)
        .map_err(|_| TransportError::MalformedEnvelope(format!("{field}: invalid base64")))
}

fn gzip(bytes: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|_| CryptoError::Serialization)?;
    encoder.finish().map_err(|_| CryptoError::Serialization)
}

/// Inflate at most `limit` bytes; larger outputs are treated as corrupt.
fn gunzip(bytes: &[u8], limit: usize) -> Result<Vec<u8>, TransportError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|_| TransportError::DecompressionFailure)?;
    if out.len() > limit {
        return Err(TransportError::DecompressionFailure);
    }
    Ok(out)
}
