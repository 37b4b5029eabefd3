//! # sealwire
//!
//! Session-oriented envelope encryption for request/response exchanges.
//!
//! A client opens a session and receives an identifier bound to a derived
//! AES-256 key. Every protected payload then travels inside an authenticated,
//! replay-resistant, optionally compressed envelope, layered around an
//! independent application-level cipher keyed by a long-lived shared secret.
//!
//! ## Public API
//!
//! [`SecureChannel`] wires the pieces together for a host process. The
//! building blocks stay public for hosts that need different stores or
//! routing: [`SessionManager`], [`TransportCodec`], [`LayeredCipher`],
//! [`Pipeline`] and [`SessionEndpoints`]. Raw key material never leaves the
//! crate.

// Module declarations.
pub mod audit;
pub mod clock;
pub mod config;
pub(crate) mod crypto;
pub mod endpoints;
pub mod envelope;
pub mod error;
pub mod keys;
pub mod layered;
pub mod pipeline;
pub mod policy;
pub mod replay;
pub mod session;

use std::sync::Arc;

use http::{Request, Response};
use parking_lot::Mutex;

pub use audit::{AuditLog, AuditSink, FileAuditSink};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Environment, TransportConfig};
pub use endpoints::SessionEndpoints;
pub use envelope::{Envelope, Opened, TransportCodec};
pub use error::{ConfigError, CryptoError, LayeredError, TransportError};
pub use keys::Secret;
pub use layered::{LayeredCipher, LayeredEnvelope, LayeredValue};
pub use pipeline::{Exchange, Pipeline};
pub use policy::{PathPolicy, PolicyTable};
pub use replay::{MemoryReplayGuard, ReplayGuard};
pub use session::{MemorySessionStore, SessionDescriptor, SessionManager, SessionStore};

/// Audit records retained in memory by a [`SecureChannel`].
const AUDIT_CAPACITY: usize = 4096;

/// A fully wired channel: session routes plus the interception pipeline.
pub struct SecureChannel {
    pipeline: Pipeline,
    endpoints: SessionEndpoints,
    replay: Arc<dyn ReplayGuard>,
}

impl SecureChannel {
    /// In-memory stores on the system clock.
    pub fn new(config: TransportConfig) -> Result<Self, ConfigError> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// In-memory stores on the given clock.
    pub fn with_clock(config: TransportConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        let store = Arc::new(MemorySessionStore::new(Arc::clone(&clock)));
        let replay = Arc::new(MemoryReplayGuard::new(Arc::clone(&clock)));
        Self::with_stores(config, clock, store, replay)
    }

    /// Caller-provided stores, e.g. backed by an external TTL cache.
    pub fn with_stores(
        config: TransportConfig,
        clock: Arc<dyn Clock>,
        store: Arc<dyn SessionStore>,
        replay: Arc<dyn ReplayGuard>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let cipher = LayeredCipher::from_config(&config).with_clock(Arc::clone(&clock));
        let sessions = SessionManager::new(Arc::clone(&config), store, clock);
        let codec = TransportCodec::new(sessions, Arc::clone(&replay));
        let audit = Arc::new(Mutex::new(AuditLog::new(
            AUDIT_CAPACITY,
            config.failure_alert_threshold,
        )));

        let endpoints = SessionEndpoints::new(codec.clone(), cipher.clone(), Arc::clone(&audit));
        let pipeline = Pipeline::new(codec, cipher, PolicyTable::from_config(&config), audit);

        Ok(Self {
            pipeline,
            endpoints,
            replay,
        })
    }

    /// Replace the default path policy.
    pub fn with_policy(self, policy: PolicyTable) -> Self {
        let pipeline = Pipeline::new(
            self.pipeline.codec().clone(),
            self.pipeline.cipher().clone(),
            policy,
            Arc::clone(self.pipeline.audit()),
        );
        Self { pipeline, ..self }
    }

    /// Answer session routes directly; run everything else through the
    /// pipeline around `handler`.
    pub fn serve<F>(&self, request: Request<Vec<u8>>, handler: F) -> Response<Vec<u8>>
    where
        F: FnOnce(Request<Vec<u8>>) -> Response<Vec<u8>>,
    {
        if let Some(response) = self.endpoints.route(&request) {
            return response;
        }
        self.pipeline.handle(request, handler)
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn endpoints(&self) -> &SessionEndpoints {
        &self.endpoints
    }

    pub fn sessions(&self) -> &SessionManager {
        self.pipeline.codec().sessions()
    }

    pub fn codec(&self) -> &TransportCodec {
        self.pipeline.codec()
    }

    pub fn cipher(&self) -> &LayeredCipher {
        self.pipeline.cipher()
    }

    pub fn audit(&self) -> &Arc<Mutex<AuditLog>> {
        self.pipeline.audit()
    }

    /// Add a sink to receive a copy of every audit record.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.audit().lock().add_forward_sink(sink);
    }

    /// Eagerly reap expired sessions and nonce marks.
    /// Returns `(sessions, nonces)` removed.
    pub fn purge_expired(&self) -> (usize, usize) {
        (self.sessions().purge_expired(), self.replay.purge_expired())
    }
}
