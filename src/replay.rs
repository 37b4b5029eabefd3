//! Replay and freshness guard.
//!
//! Remembers which `(session_id, nonce, timestamp)` triples have been
//! consumed. Each mark carries a TTL chosen by the caller, which must keep
//! it alive until the envelope would be rejected on its timestamp anyway.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::clock::Clock;

/// Sweep expired marks at most this often.
const SWEEP_INTERVAL_SECS: i64 = 5;

/// Identity of one consumed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NonceKey {
    pub session_id: String,
    pub nonce: String,
    pub timestamp: i64,
}

impl NonceKey {
    pub fn new(session_id: &str, nonce: &str, timestamp: i64) -> Self {
        Self {
            session_id: session_id.to_string(),
            nonce: nonce.to_string(),
            timestamp,
        }
    }
}

/// At-most-once consumption of envelope nonces.
pub trait ReplayGuard: Send + Sync {
    /// Atomically test and insert. Returns `true` if the key was fresh and
    /// is now marked, `false` if it was already consumed.
    ///
    /// When several callers race on the same key, exactly one sees `true`.
    fn check_and_mark(&self, key: &NonceKey, ttl: Duration) -> bool;

    /// Non-mutating membership probe.
    fn is_consumed(&self, key: &NonceKey) -> bool;

    /// Drop every expired mark, returning how many were removed.
    fn purge_expired(&self) -> usize;
}

struct Marks {
    expiries: HashMap<NonceKey, DateTime<Utc>>,
    last_sweep: DateTime<Utc>,
}

/// In-process [`ReplayGuard`]. A single mutex makes `check_and_mark` atomic.
pub struct MemoryReplayGuard {
    marks: Mutex<Marks>,
    clock: Arc<dyn Clock>,
}

impl MemoryReplayGuard {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let last_sweep = clock.now();
        Self {
            marks: Mutex::new(Marks {
                expiries: HashMap::new(),
                last_sweep,
            }),
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.marks.lock().expiries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReplayGuard for MemoryReplayGuard {
    fn check_and_mark(&self, key: &NonceKey, ttl: Duration) -> bool {
        let now = self.clock.now();
        let mut marks = self.marks.lock();

        if now - marks.last_sweep >= Duration::seconds(SWEEP_INTERVAL_SECS) {
            marks.expiries.retain(|_, expiry| now < *expiry);
            marks.last_sweep = now;
        }

        let live = marks.expiries.get(key).is_some_and(|expiry| now < *expiry);
        if live {
            return false;
        }
        marks.expiries.insert(key.clone(), now + ttl);
        true
    }

    fn is_consumed(&self, key: &NonceKey) -> bool {
        let now = self.clock.now();
        self.marks
            .lock()
            .expiries
            .get(key)
            .is_some_and(|expiry| now < *expiry)
    }

    fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut marks = self.marks.lock();
        let before = marks.expiries.len();
        marks.expiries.retain(|_, expiry| now < *expiry);
        marks.last_sweep = now;
        before - marks.expiries.len()
    }
}
