//! Deployment configuration.
//!
//! Every knob has a default. A deployment picks an [`Environment`] preset and
//! then overrides individual values from a JSON document or from environment
//! variables.

use std::num::NonZeroU32;
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::keys::Secret;

const DEV_TRANSPORT_SECRET: &str = "transport-layer-secure-key-2024";
const DEV_APPLICATION_SECRET: &str = "sealwire-application-layer-key";

/// Upper bound for TTLs and windows (ten years). Keeps timestamp arithmetic
/// in range.
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Deployment environment. Selects the freshness/TTL preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Testing,
    Production,
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "testing" | "test" => Ok(Self::Testing),
            "production" | "prod" => Ok(Self::Production),
            other => Err(ConfigError::Invalid {
                key: "ENVIRONMENT".into(),
                value: other.into(),
            }),
        }
    }
}

/// Configuration of the whole transport channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub environment: Environment,
    /// Server-wide secret mixed into every session key.
    pub transport_secret: Secret,
    /// Long-lived secret shared by every layered-cipher caller.
    pub application_secret: Secret,
    pub session_ttl_secs: u64,
    /// Freshness window: maximum |now - envelope.timestamp|.
    pub time_window_secs: u64,
    pub anti_replay: bool,
    pub integrity_check: bool,
    /// Canonical records longer than this are gzip-compressed.
    pub compression_threshold: usize,
    pub rsa_key_size: usize,
    pub session_kdf_iterations: u32,
    pub layered_kdf_iterations: u32,
    pub default_encrypt_level: u32,
    pub max_encrypt_level: u32,
    /// Upper bound on inbound bodies and on decompressed envelope records.
    pub max_request_size: usize,
    pub excluded_paths: Vec<String>,
    pub high_security_paths: Vec<String>,
    /// Mount point of the session lifecycle endpoints.
    pub session_route_prefix: String,
    /// Rejections in the audit log that trigger an alert.
    pub failure_alert_threshold: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            transport_secret: Secret::new(DEV_TRANSPORT_SECRET),
            application_secret: Secret::new(DEV_APPLICATION_SECRET),
            session_ttl_secs: 300,
            time_window_secs: 30,
            anti_replay: true,
            integrity_check: true,
            compression_threshold: 1024,
            rsa_key_size: 2048,
            session_kdf_iterations: 100_000,
            layered_kdf_iterations: 1_000,
            default_encrypt_level: 1,
            max_encrypt_level: 5,
            max_request_size: 10 * 1024 * 1024,
            excluded_paths: [
                "/admin/",
                "/api/docs/",
                "/api/schema/",
                "/health/",
                "/session/",
                "/static/",
                "/media/",
                "/favicon.ico",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            high_security_paths: [
                "/api/v1/auth/password",
                "/api/v1/users/password",
                "/api/v1/auth/2fa",
                "/api/v1/payment/",
                "/api/v1/billing/",
                "/api/v1/subscription/",
                "/api/v1/user/identity/",
                "/api/v1/admin/users/",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            session_route_prefix: "/session".into(),
            failure_alert_threshold: 10,
        }
    }
}

impl TransportConfig {
    /// Defaults adjusted for a deployment environment.
    pub fn for_environment(environment: Environment) -> Self {
        let mut config = Self {
            environment,
            ..Self::default()
        };
        config.apply_preset();
        config
    }

    fn apply_preset(&mut self) {
        match self.environment {
            Environment::Development => {
                self.time_window_secs = 300;
                self.session_ttl_secs = 3600;
            }
            Environment::Testing => {
                self.time_window_secs = 60;
                self.session_ttl_secs = 600;
            }
            Environment::Production => {
                self.time_window_secs = 15;
                self.session_ttl_secs = 300;
                self.anti_replay = true;
                self.integrity_check = true;
            }
        }
    }

    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json).map_err(|e| ConfigError::Invalid {
            key: "config".into(),
            value: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from a key lookup. The `ENVIRONMENT` preset applies
    /// first; explicit variables override it.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let environment = match lookup("ENVIRONMENT") {
            Some(value) => value.parse()?,
            None => Environment::default(),
        };
        let mut config = Self::for_environment(environment);

        if let Some(value) = lookup("TRANSPORT_KEY") {
            config.transport_secret = Secret::new(value);
        }
        if let Some(value) = lookup("CRYPTO_KEY") {
            config.application_secret = Secret::new(value);
        }
        parse_var(&lookup, "SESSION_KEY_TTL", &mut config.session_ttl_secs)?;
        parse_var(&lookup, "TIME_WINDOW", &mut config.time_window_secs)?;
        parse_flag(&lookup, "ANTI_REPLAY", &mut config.anti_replay)?;
        parse_flag(&lookup, "INTEGRITY_CHECK", &mut config.integrity_check)?;
        parse_var(&lookup, "COMPRESSION_THRESHOLD", &mut config.compression_threshold)?;
        parse_var(&lookup, "RSA_KEY_SIZE", &mut config.rsa_key_size)?;
        parse_var(&lookup, "ENCRYPTION_MAX_REQUEST_SIZE", &mut config.max_request_size)?;
        parse_var(&lookup, "ENCRYPTION_DEFAULT_LEVEL", &mut config.default_encrypt_level)?;

        config.validate()?;
        Ok(config)
    }

    /// Reject unusable or unsafe combinations.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.environment == Environment::Production {
            if self.transport_secret.expose() == DEV_TRANSPORT_SECRET {
                return Err(ConfigError::InsecureDefault("transport_secret"));
            }
            if self.application_secret.expose() == DEV_APPLICATION_SECRET {
                return Err(ConfigError::InsecureDefault("application_secret"));
            }
        }
        let checks: [(&str, bool, String); 6] = [
            (
                "session_ttl_secs",
                (1..=MAX_DURATION_SECS).contains(&self.session_ttl_secs),
                self.session_ttl_secs.to_string(),
            ),
            (
                "time_window_secs",
                (1..=MAX_DURATION_SECS).contains(&self.time_window_secs),
                self.time_window_secs.to_string(),
            ),
            ("rsa_key_size", self.rsa_key_size >= 1024, self.rsa_key_size.to_string()),
            (
                "session_kdf_iterations",
                self.session_kdf_iterations > 0,
                self.session_kdf_iterations.to_string(),
            ),
            (
                "layered_kdf_iterations",
                self.layered_kdf_iterations > 0,
                self.layered_kdf_iterations.to_string(),
            ),
            (
                "default_encrypt_level",
                self.default_encrypt_level <= self.max_encrypt_level,
                self.default_encrypt_level.to_string(),
            ),
        ];
        for (key, ok, value) in checks {
            if !ok {
                return Err(ConfigError::Invalid {
                    key: key.into(),
                    value,
                });
            }
        }
        Ok(())
    }

    pub fn session_ttl(&self) -> Duration {
        Duration::seconds(clamp_secs(self.session_ttl_secs))
    }

    pub fn time_window(&self) -> Duration {
        Duration::seconds(clamp_secs(self.time_window_secs))
    }

    pub(crate) fn session_iterations(&self) -> NonZeroU32 {
        NonZeroU32::new(self.session_kdf_iterations).unwrap_or(NonZeroU32::MIN)
    }

    pub(crate) fn layered_iterations(&self) -> NonZeroU32 {
        NonZeroU32::new(self.layered_kdf_iterations).unwrap_or(NonZeroU32::MIN)
    }
}

fn clamp_secs(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX / 1_000)
}

fn parse_var<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.into(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn parse_flag<F>(lookup: &F, key: &str, slot: &mut bool) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        *slot = match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => {
                return Err(ConfigError::Invalid {
                    key: key.into(),
                    value: raw.clone(),
                })
            }
        };
    }
    Ok(())
}
