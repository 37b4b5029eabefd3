//! Session establishment and lookup.
//!
//! A session binds a client to one derived symmetric key for a bounded
//! lifetime. Sessions live in a [`SessionStore`]: a keyed cache with a
//! per-entry TTL. Expiry is lazy; an expired entry is deleted by the lookup
//! that finds it. Once gone, a session is never resurrected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::clock::Clock;
use crate::config::TransportConfig;
use crate::crypto::{self, SALT_LEN};
use crate::error::CryptoError;
use crate::keys::{self, SessionKey};

/// Entropy of a session id, in bytes (128 bits).
const SESSION_ID_BYTES: usize = 16;

/// Log-safe prefix of a session id.
pub(crate) fn session_hint(session_id: &str) -> &str {
    let end = session_id
        .char_indices()
        .nth(8)
        .map_or(session_id.len(), |(i, _)| i);
    &session_id[..end]
}

// ---------------------------------------------------------------------------
// Session record
// ---------------------------------------------------------------------------

/// Everything the server keeps about one session.
///
/// Key material is reachable only inside the crate.
pub struct Session {
    session_id: String,
    client_id: String,
    client_public_key: Option<String>,
    key: SessionKey,
    salt: [u8; SALT_LEN],
    server_private_key: Zeroizing<String>,
    server_public_key: String,
    created_at: i64,
    expires_at: i64,
}

impl Session {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn client_public_key(&self) -> Option<&str> {
        self.client_public_key.as_deref()
    }

    pub fn server_public_key(&self) -> &str {
        &self.server_public_key
    }

    pub fn salt(&self) -> &[u8; SALT_LEN] {
        &self.salt
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    /// A session is usable iff `now < expires_at`.
    pub fn is_valid_at(&self, unix_now: i64) -> bool {
        unix_now < self.expires_at
    }

    pub(crate) fn key(&self) -> &SessionKey {
        &self.key
    }

    #[cfg(test)]
    pub(crate) fn server_private_key(&self) -> &str {
        &self.server_private_key
    }

    /// Diagnostic summary returned by the status endpoint.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            created_at: self.created_at,
            expires_at: self.expires_at,
            valid: true,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &session_hint(&self.session_id))
            .field("client_id", &self.client_id)
            .field("key", &self.key)
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// What a client learns when it opens a session. Never the key itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub session_id: String,
    pub server_public_key: String,
    pub expires_at: i64,
    /// Truncated SHA-256 of the session key.
    pub key_hash: String,
}

/// Metadata reported by `GET /session/{id}/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub client_id: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub valid: bool,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// A keyed cache of sessions with per-entry TTL.
///
/// Implementations must be safe for concurrent use; there is no isolation
/// requirement across unrelated keys.
pub trait SessionStore: Send + Sync {
    /// Insert or replace a session, retained for at most `ttl`.
    fn put(&self, session: Arc<Session>, ttl: Duration);

    /// Look up a session whose cache entry has not expired.
    fn get(&self, session_id: &str) -> Option<Arc<Session>>;

    /// Remove a session. Absent ids are ignored.
    fn delete(&self, session_id: &str);

    /// Drop every expired entry, returning how many were removed.
    fn purge_expired(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct StoreEntry {
    session: Arc<Session>,
    evict_at: DateTime<Utc>,
}

/// In-process [`SessionStore`] backed by a locked map.
pub struct MemorySessionStore {
    entries: RwLock<HashMap<String, StoreEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemorySessionStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn put(&self, session: Arc<Session>, ttl: Duration) {
        let evict_at = self.clock.now() + ttl;
        self.entries
            .write()
            .insert(session.session_id.clone(), StoreEntry { session, evict_at });
    }

    fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read();
            match entries.get(session_id) {
                None => return None,
                Some(entry) if now < entry.evict_at => return Some(Arc::clone(&entry.session)),
                Some(_) => {}
            }
        }
        // Expired: re-check under the write lock, a concurrent put may have
        // replaced the entry.
        let mut entries = self.entries.write();
        if entries.get(session_id).is_some_and(|e| now >= e.evict_at) {
            entries.remove(session_id);
        }
        None
    }

    fn delete(&self, session_id: &str) {
        self.entries.write().remove(session_id);
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.evict_at);
        before - entries.len()
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Creates, looks up and revokes sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    config: Arc<TransportConfig>,
}

impl SessionManager {
    pub fn new(
        config: Arc<TransportConfig>,
        store: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn config(&self) -> &Arc<TransportConfig> {
        &self.config
    }

    /// Open a new session for `client_id`.
    ///
    /// Only fails if the RNG or the keypair generator does, which is an
    /// internal fault, not a client error.
    pub fn create_session(&self, client_id: &str) -> Result<SessionDescriptor, CryptoError> {
        self.create_session_with_key(client_id, None)
    }

    /// Open a new session, recording the client's advertised public key.
    pub fn create_session_with_key(
        &self,
        client_id: &str,
        client_public_key: Option<String>,
    ) -> Result<SessionDescriptor, CryptoError> {
        let session_id = crypto::random_token::<SESSION_ID_BYTES>()?;
        let salt = crypto::random_array::<SALT_LEN>()?;
        let now = self.clock.unix_now();

        let key = keys::derive_session_key(
            &self.config.transport_secret,
            client_id,
            &session_id,
            now,
            &salt,
            self.config.session_iterations(),
        );
        let keypair = keys::generate_handshake_keypair(self.config.rsa_key_size)?;

        let ttl = self.config.session_ttl();
        let descriptor = SessionDescriptor {
            session_id: session_id.clone(),
            server_public_key: keypair.public_pem.clone(),
            expires_at: now + ttl.num_seconds(),
            key_hash: key.fingerprint(),
        };

        let session = Session {
            session_id,
            client_id: client_id.to_string(),
            client_public_key,
            key,
            salt,
            server_private_key: keypair.private_pem,
            server_public_key: keypair.public_pem,
            created_at: now,
            expires_at: descriptor.expires_at,
        };
        self.store.put(Arc::new(session), ttl);

        info!(
            session = session_hint(&descriptor.session_id),
            client_id,
            expires_at = descriptor.expires_at,
            "session created"
        );
        Ok(descriptor)
    }

    /// Look up a live session. Expired sessions are deleted on sight.
    pub fn get_session(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.store.get(session_id)?;
        if !session.is_valid_at(self.clock.unix_now()) {
            self.store.delete(session_id);
            debug!(session = session_hint(session_id), "session expired");
            return None;
        }
        Some(session)
    }

    /// Delete a session. Idempotent.
    pub fn revoke_session(&self, session_id: &str) {
        self.store.delete(session_id);
        info!(session = session_hint(session_id), "session revoked");
    }

    /// Eagerly reap expired sessions.
    pub fn purge_expired(&self) -> usize {
        self.store.purge_expired()
    }

    pub fn active_sessions(&self) -> usize {
        self.store.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn manager() -> (SessionManager, ManualClock) {
        let clock = ManualClock::starting_now();
        let config = TransportConfig {
            rsa_key_size: 1024,
            session_kdf_iterations: 1_000,
            ..TransportConfig::default()
        };
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemorySessionStore::new(Arc::clone(&shared)));
        (SessionManager::new(Arc::new(config), store, shared), clock)
    }

    #[test]
    fn create_returns_descriptor_without_key() {
        let (manager, clock) = manager();
        let descriptor = manager.create_session("c1").unwrap();

        assert!(descriptor.session_id.len() >= 22);
        assert_eq!(descriptor.key_hash.len(), 16);
        assert_eq!(descriptor.expires_at, clock.unix_now() + 300);
        assert!(descriptor.server_public_key.contains("PUBLIC KEY"));

        let session = manager.get_session(&descriptor.session_id).unwrap();
        assert_eq!(session.client_id(), "c1");
        assert_eq!(session.key().fingerprint(), descriptor.key_hash);
        assert!(session.server_private_key().contains("PRIVATE KEY"));
    }

    #[test]
    fn session_ids_and_keys_are_unique() {
        let (manager, _) = manager();
        let a = manager.create_session("c1").unwrap();
        let b = manager.create_session("c1").unwrap();
        assert_ne!(a.session_id, b.session_id);
        assert_ne!(a.key_hash, b.key_hash);
    }

    #[test]
    fn expiry_is_lazy_and_final() {
        let (manager, clock) = manager();
        let descriptor = manager.create_session("c1").unwrap();

        clock.advance(Duration::seconds(299));
        assert!(manager.get_session(&descriptor.session_id).is_some());

        clock.advance(Duration::seconds(2));
        assert!(manager.get_session(&descriptor.session_id).is_none());
        assert_eq!(manager.active_sessions(), 0);

        // Winding the clock back does not bring it back.
        clock.rewind(Duration::seconds(10));
        assert!(manager.get_session(&descriptor.session_id).is_none());
    }

    #[test]
    fn expires_exactly_at_deadline() {
        let (manager, clock) = manager();
        let descriptor = manager.create_session("c1").unwrap();
        clock.advance(Duration::seconds(300));
        assert!(manager.get_session(&descriptor.session_id).is_none());
    }

    #[test]
    fn revoke_is_idempotent() {
        let (manager, _) = manager();
        let descriptor = manager.create_session("c1").unwrap();
        manager.revoke_session(&descriptor.session_id);
        manager.revoke_session(&descriptor.session_id);
        manager.revoke_session("never-existed");
        assert!(manager.get_session(&descriptor.session_id).is_none());
    }

    #[test]
    fn purge_removes_only_expired() {
        let (manager, clock) = manager();
        manager.create_session("old").unwrap();
        clock.advance(Duration::seconds(200));
        manager.create_session("new").unwrap();
        clock.advance(Duration::seconds(150));

        assert_eq!(manager.purge_expired(), 1);
        assert_eq!(manager.active_sessions(), 1);
    }

    #[test]
    fn hint_truncates_to_eight_chars() {
        assert_eq!(session_hint("abcdefghijkl"), "abcdefgh");
        assert_eq!(session_hint("abc"), "abc");
    }
}
