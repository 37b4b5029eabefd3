//! Application-layer layered cipher.
//!
//! A value is serialized to canonical JSON text and then encrypted `level`
//! times, each round under its own key derived from the shared application
//! secret and a fresh salt. Rounds are applied bottom-up and removed
//! top-down, so the outermost round is the last one sealed.
//!
//! Round token layout, base64 encoded:
//!
//! ```text
//! salt[16] || 0x80 || timestamp_be[8] || iv[12] || ciphertext || tag[16]
//! ```
//!
//! The version byte and timestamp are authenticated as AEAD additional data.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::TransportConfig;
use crate::crypto::{self, IV_LEN, SALT_LEN, TAG_LEN};
use crate::error::{CryptoError, LayeredError};
use crate::keys::{self, Secret};

const TOKEN_VERSION: u8 = 0x80;

/// Version byte plus big-endian timestamp.
const HEADER_LEN: usize = 1 + 8;

const MIN_ROUND_LEN: usize = SALT_LEN + HEADER_LEN + IV_LEN + TAG_LEN;

/// The result of peeling a layered token.
///
/// Tokens produced by [`LayeredCipher::encrypt`] always peel to
/// `Structured`. `Raw` is what a foreign token yields when its innermost text
/// is not JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayeredValue {
    Structured(Value),
    Raw(String),
}

impl LayeredValue {
    /// Collapse into a JSON value; raw text becomes a JSON string.
    pub fn into_value(self) -> Value {
        match self {
            Self::Structured(value) => value,
            Self::Raw(text) => Value::String(text),
        }
    }
}

/// Wire shape of a layered-cipher body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayeredEnvelope {
    pub encrypted_data: String,
    pub encrypt_level: u32,
    #[serde(default)]
    pub encrypted: bool,
}

impl LayeredEnvelope {
    /// Recognize a layered body by its marker fields.
    pub fn detect(body: &Value) -> Option<Self> {
        let object = body.as_object()?;
        if !object.contains_key("encrypted_data") || !object.contains_key("encrypt_level") {
            return None;
        }
        serde_json::from_value(body.clone()).ok()
    }
}

/// Multi-round symmetric cipher keyed by a long-lived shared secret.
#[derive(Clone)]
pub struct LayeredCipher {
    secret: Secret,
    iterations: NonZeroU32,
    max_level: u32,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for LayeredCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayeredCipher")
            .field("secret", &self.secret)
            .field("iterations", &self.iterations)
            .field("max_level", &self.max_level)
            .finish_non_exhaustive()
    }
}

impl LayeredCipher {
    /// A cipher stamping rounds with the system clock.
    pub fn new(secret: Secret, iterations: NonZeroU32, max_level: u32) -> Self {
        Self {
            secret,
            iterations,
            max_level,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp round headers from `clock` instead.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            config.application_secret.clone(),
            config.layered_iterations(),
            config.max_encrypt_level,
        )
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    fn check_level(&self, level: u32) -> Result<(), LayeredError> {
        if level > self.max_level {
            return Err(LayeredError::LevelOutOfRange(level));
        }
        Ok(())
    }

    /// Encrypt `value` with `level` rounds. Level 0 returns the canonical
    /// JSON text unchanged.
    pub fn encrypt(&self, value: &Value, level: u32) -> Result<String, LayeredError> {
        self.check_level(level)?;
        let mut current = serde_json::to_string(value).map_err(|_| CryptoError::Serialization)?;

        for _ in 0..level {
            current = self.seal_round(current.as_bytes())?;
        }
        Ok(current)
    }

    /// Peel `level` rounds off `token` and parse what remains.
    pub fn decrypt(&self, token: &str, level: u32) -> Result<LayeredValue, LayeredError> {
        self.check_level(level)?;
        let mut current = token.to_string();

        for _ in 0..level {
            let inner = self.open_round(&current)?;
            current = String::from_utf8(inner).map_err(|_| LayeredError::DecryptError)?;
        }

        Ok(match serde_json::from_str(&current) {
            Ok(value) => LayeredValue::Structured(value),
            Err(_) => LayeredValue::Raw(current),
        })
    }

    /// Encrypt into the `{encrypted_data, encrypt_level, encrypted}` shape.
    pub fn wrap(&self, value: &Value, level: u32) -> Result<LayeredEnvelope, LayeredError> {
        Ok(LayeredEnvelope {
            encrypted_data: self.encrypt(value, level)?,
            encrypt_level: level,
            encrypted: true,
        })
    }

    pub fn unwrap(&self, envelope: &LayeredEnvelope) -> Result<LayeredValue, LayeredError> {
        self.decrypt(&envelope.encrypted_data, envelope.encrypt_level)
    }

    fn seal_round(&self, plaintext: &[u8]) -> Result<String, LayeredError> {
        let salt = crypto::random_array::<SALT_LEN>()?;
        let key = keys::derive_round_key(&self.secret, &salt, self.iterations);

        let mut header = [0u8; HEADER_LEN];
        header[0] = TOKEN_VERSION;
        header[1..].copy_from_slice(&self.clock.unix_now().to_be_bytes());

        let sealed = crypto::seal_detached(&key, &header, plaintext)?;

        let mut out = Vec::with_capacity(MIN_ROUND_LEN + sealed.ciphertext.len());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&header);
        out.extend_from_slice(&sealed.iv);
        out.extend_from_slice(&sealed.ciphertext);
        out.extend_from_slice(&sealed.tag);
        Ok(STANDARD.encode(out))
    }

    fn open_round(&self, token: &str) -> Result<Vec<u8>, LayeredError> {
        let raw = STANDARD
            .decode(token.trim())
            .map_err(|_| LayeredError::MalformedToken)?;
        if raw.len() < MIN_ROUND_LEN {
            return Err(LayeredError::MalformedToken);
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (header, rest) = rest.split_at(HEADER_LEN);
        let (iv, rest) = rest.split_at(IV_LEN);
        let (ciphertext, tag) = rest.split_at(rest.len() - TAG_LEN);

        if header[0] != TOKEN_VERSION {
            return Err(LayeredError::MalformedToken);
        }

        let key = keys::derive_round_key(&self.secret, salt, self.iterations);
        crypto::open_detached(&key, header, iv, ciphertext, tag).ok_or(LayeredError::DecryptError)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn cipher(secret: &str) -> LayeredCipher {
        LayeredCipher::new(Secret::new(secret), NonZeroU32::new(10).unwrap(), 5)
    }

    #[test]
    fn roundtrip_for_each_level() {
        let cipher = cipher("app-secret");
        let value = json!({"user": "alice", "roles": ["admin"], "n": 3});

        for level in 0..=3 {
            let token = cipher.encrypt(&value, level).unwrap();
            let peeled = cipher.decrypt(&token, level).unwrap();
            assert_eq!(peeled, LayeredValue::Structured(value.clone()));
        }
    }

    #[test]
    fn level_zero_is_canonical_json() {
        let cipher = cipher("app-secret");
        assert_eq!(cipher.encrypt(&json!({"a": 1}), 0).unwrap(), r#"{"a":1}"#);
        assert_eq!(cipher.encrypt(&json!("text"), 0).unwrap(), r#""text""#);
    }

    #[test]
    fn encryption_is_not_deterministic() {
        let cipher = cipher("app-secret");
        let value = json!({"msg": "hello"});
        assert_ne!(
            cipher.encrypt(&value, 1).unwrap(),
            cipher.encrypt(&value, 1).unwrap()
        );
    }

    #[test]
    fn wrong_secret_fails() {
        let token = cipher("app-secret").encrypt(&json!([1, 2]), 2).unwrap();
        assert_eq!(
            cipher("other-secret").decrypt(&token, 2),
            Err(LayeredError::DecryptError)
        );
    }

    #[test]
    fn tampered_round_fails() {
        let cipher = cipher("app-secret");
        let token = cipher.encrypt(&json!("payload"), 1).unwrap();
        let mut raw = STANDARD.decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert_eq!(
            cipher.decrypt(&STANDARD.encode(raw), 1),
            Err(LayeredError::DecryptError)
        );
    }

    #[test]
    fn round_header_is_stamped_by_the_clock() {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let cipher = cipher("app-secret").with_clock(Arc::new(clock.clone()));
        let token = cipher.encrypt(&json!("payload"), 1).unwrap();

        let raw = STANDARD.decode(&token).unwrap();
        let header = &raw[SALT_LEN..SALT_LEN + HEADER_LEN];
        assert_eq!(header[0], TOKEN_VERSION);
        let stamped = i64::from_be_bytes(header[1..].try_into().unwrap());
        assert_eq!(stamped, clock.unix_now());
        assert_eq!(cipher.decrypt(&token, 1).unwrap().into_value(), json!("payload"));
    }

    #[test]
    fn peeling_too_few_rounds_yields_raw() {
        let cipher = cipher("app-secret");
        let token = cipher.encrypt(&json!({"k": "v"}), 2).unwrap();
        assert!(matches!(cipher.decrypt(&token, 1), Ok(LayeredValue::Raw(_))));
        assert_eq!(cipher.decrypt(&token, 3), Err(LayeredError::MalformedToken));
    }

    #[test]
    fn non_json_text_is_raw() {
        let cipher = cipher("app-secret");
        assert_eq!(
            cipher.decrypt("plain words", 0).unwrap(),
            LayeredValue::Raw("plain words".into())
        );
        assert_eq!(
            LayeredValue::Raw("plain words".into()).into_value(),
            json!("plain words")
        );
    }

    #[test]
    fn levels_above_max_are_rejected() {
        let cipher = cipher("app-secret");
        assert_eq!(cipher.encrypt(&json!(1), 6), Err(LayeredError::LevelOutOfRange(6)));
        assert_eq!(cipher.decrypt("x", 6), Err(LayeredError::LevelOutOfRange(6)));
    }

    #[test]
    fn short_or_invalid_tokens_are_malformed() {
        let cipher = cipher("app-secret");
        assert_eq!(cipher.decrypt("!!!", 1), Err(LayeredError::MalformedToken));
        assert_eq!(
            cipher.decrypt(&STANDARD.encode([0u8; 20]), 1),
            Err(LayeredError::MalformedToken)
        );
    }

    #[test]
    fn envelope_wrap_and_detect() {
        let cipher = cipher("app-secret");
        let envelope = cipher.wrap(&json!({"x": 1}), 2).unwrap();
        assert!(envelope.encrypted);

        let body = serde_json::to_value(&envelope).unwrap();
        let detected = LayeredEnvelope::detect(&body).unwrap();
        assert_eq!(detected, envelope);
        assert_eq!(cipher.unwrap(&detected).unwrap().into_value(), json!({"x": 1}));

        assert!(LayeredEnvelope::detect(&json!({"encrypted_data": "abc"})).is_none());
        assert!(LayeredEnvelope::detect(&json!([1, 2])).is_none());
    }
}
