//! Session lifecycle endpoints.
//!
//! Plain JSON in and out, never transport-wrapped. Mounted under the
//! configured route prefix:
//!
//! - `POST   {prefix}/create`
//! - `GET    {prefix}/{id}/status`
//! - `DELETE {prefix}/{id}/revoke`
//! - `GET    {prefix}/health`

use std::sync::Arc;

use http::{Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::audit::{AuditEventKind, AuditLog, AuditRecord};
use crate::envelope::TransportCodec;
use crate::layered::LayeredCipher;
use crate::pipeline::{error_response, json_response};

const HEALTH_CLIENT_ID: &str = "health_check_client";

#[derive(Debug, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_public_key: Option<String>,
}

/// Handlers for the session routes.
pub struct SessionEndpoints {
    codec: TransportCodec,
    cipher: LayeredCipher,
    audit: Arc<Mutex<AuditLog>>,
    prefix: String,
}

impl SessionEndpoints {
    pub fn new(codec: TransportCodec, cipher: LayeredCipher, audit: Arc<Mutex<AuditLog>>) -> Self {
        let prefix = codec
            .sessions()
            .config()
            .session_route_prefix
            .trim_end_matches('/')
            .to_string();
        Self {
            codec,
            cipher,
            audit,
            prefix,
        }
    }

    /// Dispatch `request` if it targets a session route.
    pub fn route(&self, request: &Request<Vec<u8>>) -> Option<Response<Vec<u8>>> {
        let path = request.uri().path().trim_end_matches('/');
        let rest = path.strip_prefix(self.prefix.as_str())?;
        let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

        match (request.method(), segments.as_slice()) {
            (&Method::POST, ["create"]) => Some(self.create(request.body())),
            (&Method::GET, ["health"]) => Some(self.health()),
            (&Method::GET, [session_id, "status"]) => Some(self.status(session_id)),
            (&Method::DELETE, [session_id, "revoke"]) => Some(self.revoke(session_id)),
            _ => None,
        }
    }

    pub fn create(&self, body: &[u8]) -> Response<Vec<u8>> {
        let request: CreateSessionRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(_) => {
                return error_response(StatusCode::BAD_REQUEST, "INVALID_JSON", "invalid JSON body")
            }
        };
        let Some(client_id) = request.client_id.filter(|id| !id.is_empty()) else {
            return error_response(
                StatusCode::BAD_REQUEST,
                "MISSING_CLIENT_ID",
                "client_id is required",
            );
        };

        match self
            .codec
            .sessions()
            .create_session_with_key(&client_id, request.client_public_key)
        {
            Ok(descriptor) => {
                self.record(
                    AuditRecord::new(AuditEventKind::SessionCreated, self.now())
                        .session(&descriptor.session_id)
                        .client(&client_id),
                );
                json_response(StatusCode::CREATED, &json!(descriptor))
            }
            Err(err) => {
                error!(%err, "session creation failed");
                error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "SESSION_CREATION_FAILED",
                    "session creation failed",
                )
            }
        }
    }

    pub fn status(&self, session_id: &str) -> Response<Vec<u8>> {
        match self.codec.sessions().get_session(session_id) {
            Some(session) => json_response(StatusCode::OK, &json!(session.status())),
            None => error_response(
                StatusCode::NOT_FOUND,
                "SESSION_NOT_FOUND",
                "session does not exist or has expired",
            ),
        }
    }

    /// Always succeeds, whether or not the session existed.
    pub fn revoke(&self, session_id: &str) -> Response<Vec<u8>> {
        self.codec.sessions().revoke_session(session_id);
        self.record(AuditRecord::new(AuditEventKind::SessionRevoked, self.now()).session(session_id));
        json_response(StatusCode::OK, &json!({"success": true}))
    }

    /// Self-test: open a session, round-trip an envelope and a layered
    /// token through it, then revoke it.
    pub fn health(&self) -> Response<Vec<u8>> {
        let probe = json!({"test": "health_check_data"});

        let transport = self.probe_transport(&probe);
        let layered = self
            .cipher
            .encrypt(&probe, 1)
            .and_then(|token| self.cipher.decrypt(&token, 1))
            .map(|value| value.into_value() == probe)
            .unwrap_or(false);

        let healthy = transport && layered;
        let status = if healthy {
            StatusCode::OK
        } else {
            StatusCode::SERVICE_UNAVAILABLE
        };
        info!(transport, layered, "health check");

        json_response(
            status,
            &json!({
                "status": if healthy { "healthy" } else { "degraded" },
                "services": {
                    "transport_encryption": if transport { "healthy" } else { "unhealthy" },
                    "application_encryption": if layered { "healthy" } else { "unhealthy" },
                    "data_integrity": healthy,
                },
                "timestamp": self.codec.sessions().clock().unix_now(),
            }),
        )
    }

    fn probe_transport(&self, probe: &serde_json::Value) -> bool {
        let sessions = self.codec.sessions();
        let Ok(descriptor) = sessions.create_session(HEALTH_CLIENT_ID) else {
            return false;
        };
        let ok = self
            .codec
            .encrypt(probe, &descriptor.session_id, 0)
            .and_then(|envelope| self.codec.decrypt(&envelope))
            .is_ok_and(|opened| &opened.payload == probe);
        sessions.revoke_session(&descriptor.session_id);
        ok
    }

    fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.codec.sessions().clock().now()
    }

    fn record(&self, record: AuditRecord) {
        self.audit.lock().append(record);
    }
}
