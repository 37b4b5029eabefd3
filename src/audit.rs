//! Security event log.
//!
//! Records session lifecycle events and every rejected exchange. The log is
//! append-only and bounded; the oldest records fall off once it is full.
//! Pluggable sinks receive a copy of every record for durable storage.

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::session::session_hint;

const DEFAULT_CAPACITY: usize = 1024;

/// A sink that receives audit records. Implement this to forward records
/// to a file, a database or a SIEM.
pub trait AuditSink: Send {
    fn append(&mut self, record: AuditRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SessionCreated,
    SessionRevoked,
    /// An inbound exchange failed decryption or policy checks.
    InboundRejected,
    /// An outbound response could not be sealed.
    OutboundFailed,
}

impl AuditEventKind {
    pub fn is_failure(self) -> bool {
        matches!(self, Self::InboundRejected | Self::OutboundFailed)
    }
}

/// One security-relevant event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub kind: AuditEventKind,
    /// Session id prefix, never the full id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Internal failure label; never sent to clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(kind: AuditEventKind, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            session: None,
            client_id: None,
            path: None,
            reason: None,
            timestamp,
        }
    }

    pub fn session(mut self, session_id: &str) -> Self {
        self.session = Some(session_hint(session_id).to_string());
        self
    }

    pub fn client(mut self, client_id: &str) -> Self {
        self.client_id = Some(client_id.to_string());
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn reason(mut self, reason: &str) -> Self {
        self.reason = Some(reason.to_string());
        self
    }
}

/// A bounded, append-only log of security events.
/// Can forward records to additional sinks via `add_forward_sink`.
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    alert_threshold: usize,
    failures_since_alert: usize,
    alerts_raised: usize,
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY, 10)
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("records", &self.records.len())
            .field("capacity", &self.capacity)
            .field("alerts_raised", &self.alerts_raised)
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    /// A zero threshold disables alerting.
    pub fn new(capacity: usize, alert_threshold: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(DEFAULT_CAPACITY)),
            capacity: capacity.max(1),
            alert_threshold,
            failures_since_alert: 0,
            alerts_raised: 0,
            forward_sinks: Vec::new(),
        }
    }

    /// Add a sink to receive a copy of every record.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append a record, forward it to every sink and raise an alert each
    /// time another `alert_threshold` failures have accumulated.
    pub fn append(&mut self, record: AuditRecord) {
        if record.kind.is_failure() && self.alert_threshold > 0 {
            self.failures_since_alert += 1;
            if self.failures_since_alert >= self.alert_threshold {
                self.failures_since_alert = 0;
                self.alerts_raised += 1;
                error!(
                    failures = self.alert_threshold,
                    last_reason = record.reason.as_deref().unwrap_or("unknown"),
                    "security alert: repeated transport failures"
                );
            }
        }

        for sink in self.forward_sinks.iter_mut() {
            sink.append(record.clone());
        }

        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AuditRecord> {
        self.records.iter()
    }

    /// Failure records currently retained.
    pub fn failure_count(&self) -> usize {
        self.records.iter().filter(|r| r.kind.is_failure()).count()
    }

    pub fn alerts_raised(&self) -> usize {
        self.alerts_raised
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit records as JSON lines (one per record) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, record: AuditRecord) {
        if let Ok(line) = serde_json::to_string(&record) {
            let _ = writeln!(self.file, "{line}");
            let _ = self.file.flush();
        }
    }
}
