//! Interception pipeline.
//!
//! A pair of hooks around a request handler. `inbound` unwraps the transport
//! envelope and then the layered body before the handler sees the request;
//! `outbound` applies the layered cipher and then the transport envelope to
//! the handler's response. Any inbound failure short-circuits with a generic
//! client error. The specific reason goes to the log and the audit trail.

use std::sync::Arc;

use http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, warn};

use crate::audit::{AuditEventKind, AuditLog, AuditRecord};
use crate::config::TransportConfig;
use crate::envelope::{Envelope, TransportCodec};
use crate::error::{CryptoError, LayeredError, TransportError};
use crate::layered::{LayeredCipher, LayeredEnvelope};
use crate::policy::{PathPolicy, PolicyTable};
use crate::session::session_hint;

/// Request/response flag: the body is a transport envelope.
pub const X_TRANSPORT_ENCRYPTED: &str = "x-transport-encrypted";
/// Request flag: layered-cipher level for this exchange.
pub const X_ENCRYPT_LEVEL: &str = "x-encrypt-level";
/// Names the session of a bodyless request.
pub const X_TRANSPORT_SESSION: &str = "x-transport-session";

/// Per-request state carried from `inbound` to `outbound`.
///
/// Also inserted into the request's extensions for handlers to inspect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub policy: PathPolicy,
    /// Session the response is sealed for, if any.
    pub session_id: Option<String>,
    pub sequence: Option<u64>,
    /// Layered-cipher level applied to the response.
    pub encrypt_level: u32,
}

enum ExchangeError {
    TooLarge,
    Policy(&'static str),
    Transport(TransportError),
    Layered(LayeredError),
}

impl ExchangeError {
    fn reason(&self) -> &'static str {
        match self {
            Self::TooLarge => "payload_too_large",
            Self::Policy(reason) => reason,
            Self::Transport(err) => err.reason(),
            Self::Layered(LayeredError::DecryptError) => "layered_decrypt_failed",
            Self::Layered(LayeredError::MalformedToken) => "layered_malformed_token",
            Self::Layered(LayeredError::LevelOutOfRange(_)) => "encrypt_level_out_of_range",
            Self::Layered(LayeredError::Crypto(_)) => "internal_crypto_error",
        }
    }
}

impl From<TransportError> for ExchangeError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<LayeredError> for ExchangeError {
    fn from(err: LayeredError) -> Self {
        Self::Layered(err)
    }
}

impl From<CryptoError> for ExchangeError {
    fn from(err: CryptoError) -> Self {
        Self::Transport(TransportError::Crypto(err))
    }
}

/// Build a JSON response with the given status.
pub(crate) fn json_response(status: StatusCode, body: &Value) -> Response<Vec<u8>> {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    let mut response = Response::new(bytes);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response<Vec<u8>> {
    json_response(
        status,
        &json!({"error": code, "message": message, "code": status.as_u16()}),
    )
}

fn header_flag(headers: &HeaderMap, name: &str) -> bool {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true") || v == "1")
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"))
}

fn mark_json_body(headers: &mut HeaderMap, len: usize) {
    headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
}

/// The inbound/outbound hook pair.
pub struct Pipeline {
    codec: TransportCodec,
    cipher: LayeredCipher,
    policy: PolicyTable,
    audit: Arc<Mutex<AuditLog>>,
}

impl Pipeline {
    pub fn new(
        codec: TransportCodec,
        cipher: LayeredCipher,
        policy: PolicyTable,
        audit: Arc<Mutex<AuditLog>>,
    ) -> Self {
        Self {
            codec,
            cipher,
            policy,
            audit,
        }
    }

    pub fn codec(&self) -> &TransportCodec {
        &self.codec
    }

    pub fn cipher(&self) -> &LayeredCipher {
        &self.cipher
    }

    pub fn audit(&self) -> &Arc<Mutex<AuditLog>> {
        &self.audit
    }

    fn config(&self) -> &TransportConfig {
        self.codec.sessions().config()
    }

    /// Run `handler` between the inbound and outbound hooks.
    pub fn handle<F>(&self, request: Request<Vec<u8>>, handler: F) -> Response<Vec<u8>>
    where
        F: FnOnce(Request<Vec<u8>>) -> Response<Vec<u8>>,
    {
        match self.inbound(request) {
            Ok((request, exchange)) => {
                let response = handler(request);
                self.outbound(&exchange, response)
            }
            Err(rejection) => rejection,
        }
    }

    /// Unwrap a protected request, or produce the client error to return.
    pub fn inbound(
        &self,
        mut request: Request<Vec<u8>>,
    ) -> Result<(Request<Vec<u8>>, Exchange), Response<Vec<u8>>> {
        let path = request.uri().path().to_string();
        let mut exchange = Exchange {
            policy: self.policy.evaluate(&path),
            session_id: None,
            sequence: None,
            encrypt_level: self.config().default_encrypt_level,
        };

        if exchange.policy != PathPolicy::Skip {
            let result = if request.body().len() > self.config().max_request_size {
                Err(ExchangeError::TooLarge)
            } else {
                self.unwrap_request(&mut request, &mut exchange)
            };
            if let Err(err) = result {
                return Err(self.reject(&path, &request, err));
            }
        }

        request.extensions_mut().insert(exchange.clone());
        Ok((request, exchange))
    }

    fn unwrap_request(
        &self,
        request: &mut Request<Vec<u8>>,
        exchange: &mut Exchange,
    ) -> Result<(), ExchangeError> {
        let headers = request.headers();
        let transport_flag = header_flag(headers, X_TRANSPORT_ENCRYPTED);
        let level_header = match headers.get(X_ENCRYPT_LEVEL) {
            Some(raw) => Some(
                raw.to_str()
                    .ok()
                    .and_then(|v| v.trim().parse::<u32>().ok())
                    .ok_or(ExchangeError::Policy("invalid_encrypt_level"))?,
            ),
            None => None,
        };
        let session_header = headers
            .get(X_TRANSPORT_SESSION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(level) = level_header {
            if level > self.cipher.max_level() {
                return Err(LayeredError::LevelOutOfRange(level).into());
            }
            exchange.encrypt_level = level;
        }

        let bodyless = matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS)
            || request.body().is_empty();
        if bodyless {
            match session_header {
                Some(session_id) => {
                    if self.codec.sessions().get_session(&session_id).is_none() {
                        return Err(TransportError::SessionNotFound.into());
                    }
                    exchange.session_id = Some(session_id);
                }
                None if exchange.policy.requires_transport() => {
                    return Err(ExchangeError::Policy("transport_required"));
                }
                None => {}
            }
            return Ok(());
        }

        let requested = transport_flag || level_header.is_some();
        if !requested && exchange.policy == PathPolicy::Optional {
            return Ok(());
        }

        let mut body = if transport_flag {
            let envelope = Envelope::from_json(request.body())?;
            let opened = self.codec.decrypt(&envelope)?;
            exchange.session_id = Some(envelope.session_id);
            exchange.sequence = Some(opened.metadata.sequence);
            opened.payload
        } else if exchange.policy.requires_transport() {
            return Err(ExchangeError::Policy("transport_required"));
        } else {
            match serde_json::from_slice(request.body()) {
                Ok(value) => value,
                Err(_) if exchange.policy.requires_layered() => {
                    return Err(LayeredError::MalformedToken.into());
                }
                // Not JSON, so not a layered body; hand it over untouched.
                Err(_) => return Ok(()),
            }
        };

        match LayeredEnvelope::detect(&body) {
            Some(layered) => {
                body = self.cipher.unwrap(&layered)?.into_value();
                exchange.encrypt_level = layered.encrypt_level;
            }
            None if exchange.policy.requires_layered() => {
                return Err(ExchangeError::Policy("layered_required"));
            }
            None if !transport_flag => return Ok(()),
            None => {}
        }

        let bytes = serde_json::to_vec(&body).map_err(|_| CryptoError::Serialization)?;
        mark_json_body(request.headers_mut(), bytes.len());
        *request.body_mut() = bytes;

        debug!(
            session = exchange.session_id.as_deref().map(session_hint),
            level = exchange.encrypt_level,
            "request unwrapped"
        );
        Ok(())
    }

    fn reject(&self, path: &str, request: &Request<Vec<u8>>, err: ExchangeError) -> Response<Vec<u8>> {
        let reason = err.reason();
        warn!(path, method = %request.method(), reason, "inbound exchange rejected");

        let mut record = AuditRecord::new(AuditEventKind::InboundRejected, self.codec.sessions().clock().now())
            .path(path)
            .reason(reason);
        if let Some(session_id) = request
            .headers()
            .get(X_TRANSPORT_SESSION)
            .and_then(|v| v.to_str().ok())
        {
            record = record.session(session_id);
        }
        self.audit.lock().append(record);

        match err {
            ExchangeError::TooLarge => error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "request body exceeds the size limit",
            ),
            _ => error_response(StatusCode::BAD_REQUEST, "DECRYPTION_FAILED", "decryption failed"),
        }
    }

    /// Seal an eligible response for the exchange.
    ///
    /// Skipped paths, error statuses, non-JSON and unparsable bodies pass
    /// through untouched.
    pub fn outbound(&self, exchange: &Exchange, response: Response<Vec<u8>>) -> Response<Vec<u8>> {
        if exchange.policy == PathPolicy::Skip
            || response.status().as_u16() >= 400
            || !is_json(response.headers())
        {
            return response;
        }
        let Ok(body) = serde_json::from_slice::<Value>(response.body()) else {
            return response;
        };

        match self.seal_response(exchange, body) {
            Ok((bytes, transported)) => {
                let mut response = response;
                mark_json_body(response.headers_mut(), bytes.len());
                if transported {
                    response
                        .headers_mut()
                        .insert(X_TRANSPORT_ENCRYPTED, HeaderValue::from_static("true"));
                }
                *response.body_mut() = bytes;
                response
            }
            Err(err) => {
                let reason = err.reason();
                error!(reason, "response encryption failed");
                let mut record =
                    AuditRecord::new(AuditEventKind::OutboundFailed, self.codec.sessions().clock().now())
                        .reason(reason);
                if let Some(session_id) = &exchange.session_id {
                    record = record.session(session_id);
                }
                self.audit.lock().append(record);
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ENCRYPTION_FAILED",
                    "response encryption failed",
                )
            }
        }
    }

    fn seal_response(&self, exchange: &Exchange, body: Value) -> Result<(Vec<u8>, bool), ExchangeError> {
        let mut body = body;
        let level = if exchange.policy.requires_layered() {
            exchange.encrypt_level.max(1)
        } else {
            exchange.encrypt_level
        };

        if level > 0 {
            let layered = self.cipher.wrap(&body, level)?;
            body = serde_json::to_value(layered).map_err(|_| CryptoError::Serialization)?;
        }

        let transported = match &exchange.session_id {
            Some(session_id) => {
                let envelope = self
                    .codec
                    .encrypt(&body, session_id, exchange.sequence.unwrap_or(0))?;
                body = serde_json::to_value(envelope).map_err(|_| CryptoError::Serialization)?;
                true
            }
            None => false,
        };

        let bytes = serde_json::to_vec(&body).map_err(|_| CryptoError::Serialization)?;
        Ok((bytes, transported))
    }
}
