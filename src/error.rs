//! Error types for sealwire.
//!
//! Errors are split by who caused them. `CryptoError` is an internal fault
//! (RNG exhaustion, a primitive refusing a key) and is never triggered by
//! untrusted input. `TransportError` and `LayeredError` cover the expected
//! failure modes of inbound payloads. Messages signal *what* failed without
//! revealing cryptographic state.

use thiserror::Error;

/// Internal failures of the underlying primitives.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// A key had the wrong length or was rejected by `ring`.
    #[error("invalid key")]
    InvalidKey,

    /// The AEAD seal operation failed.
    #[error("encryption failed")]
    EncryptionFailure,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// The handshake keypair could not be generated or encoded.
    #[error("keypair generation failed")]
    KeyGenerationFailure,

    /// A value could not be serialized into its canonical form.
    #[error("serialization failed")]
    Serialization,
}

/// Failures of the transport envelope codec.
///
/// Everything except `Crypto` is a local, expected outcome of handling
/// untrusted input. AEAD tag and HMAC mismatches are both reported as
/// `IntegrityFailure` so callers cannot tell which check tripped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The session is absent, revoked or expired.
    #[error("session not found")]
    SessionNotFound,

    /// The envelope timestamp lies outside the freshness window.
    #[error("stale timestamp")]
    StaleTimestamp,

    /// The envelope nonce was already consumed.
    #[error("replay detected")]
    ReplayDetected,

    /// HMAC or AEAD authentication failed.
    #[error("integrity check failed")]
    IntegrityFailure,

    /// Missing or invalid fields, bad base64, bad JSON.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// The compressed body could not be inflated.
    #[error("decompression failed")]
    DecompressionFailure,

    /// Internal primitive failure while encrypting.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl TransportError {
    /// True for the untrusted-input taxonomy, false for internal faults.
    pub fn is_client_fault(&self) -> bool {
        !matches!(self, Self::Crypto(_))
    }

    /// Stable machine-readable label used in logs and audit records.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "session_not_found",
            Self::StaleTimestamp => "stale_timestamp",
            Self::ReplayDetected => "replay_detected",
            Self::IntegrityFailure => "integrity_failure",
            Self::MalformedEnvelope(_) => "malformed_envelope",
            Self::DecompressionFailure => "decompression_failure",
            Self::Crypto(_) => "internal_crypto_error",
        }
    }
}

/// Failures of the application-layer layered cipher.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayeredError {
    /// A round's integrity check failed (wrong secret, tampered token).
    #[error("decryption failed")]
    DecryptError,

    /// The token was not valid base64 or was too short to carry a round.
    #[error("malformed token")]
    MalformedToken,

    /// The requested level exceeds the configured maximum.
    #[error("encrypt level {0} out of range")]
    LevelOutOfRange(u32),

    /// Internal primitive failure while encrypting.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Invalid or unsafe configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// A value could not be parsed or is out of range.
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    /// A production deployment still carries a development placeholder.
    #[error("{0} still uses the development placeholder")]
    InsecureDefault(&'static str),
}
