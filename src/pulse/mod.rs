//! Fault pulse: detects change in the mesh, translates dead-lettered work
//! into events, and escalates anything above informational severity.
//!
//! Events flow through a single [`EventDispatcher`]: producers (the
//! dead-letter listener and the mesh watcher) build a [`PulseEvent`] and hand
//! it over; the dispatcher appends it to the bounded in-memory log and, for
//! warning and critical events, walks the configured escalation channels in
//! order until one accepts the incident.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod dispatch;
mod dlq;
mod journal;
mod log;
mod watcher;

pub use dispatch::{
    DirectHttpChannel, DispatchError, EscalationChannel, EscalationTask, EventDispatcher,
    TaskQueueChannel,
};
pub use dlq::DeadLetterListener;
pub use journal::{
    JournalCategory, JournalEntry, JournalError, JournalQuery, JournalStore, NewJournalEntry,
    SqliteJournalStore,
};
pub use log::EventLog;
pub use watcher::{spawn_watch_loop, MeshWatcher};

/// Source tag for events produced by the dead-letter listener.
pub const SOURCE_QUEUE_LISTENER: &str = "queue-listener";
/// Source tag for events produced by the mesh transition watcher.
pub const SOURCE_MESH_WATCHER: &str = "mesh-watcher";

/// How many events `PulseStatus` carries inline.
const RECENT_EVENTS: usize = 10;

/// Severity of a pulse event. Only `Warning` and `Critical` are escalated;
/// `Info` events stay in the log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown severity: {0}")]
pub struct ParseSeverityError(String);

impl std::str::FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseSeverityError(other.to_string())),
        }
    }
}

/// A single detected fault or notable transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PulseEvent {
    /// Which detector produced the event ([`SOURCE_QUEUE_LISTENER`] or
    /// [`SOURCE_MESH_WATCHER`]).
    pub source: String,
    pub severity: Severity,
    pub title: String,
    pub detail: String,
    pub timestamp: DateTime<Utc>,
    /// Free-form context: routing keys, node names, status transitions.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl PulseEvent {
    pub fn new(
        source: &str,
        severity: Severity,
        title: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        PulseEvent {
            source: source.to_string(),
            severity,
            title: title.into(),
            detail: detail.into(),
            timestamp: Utc::now(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of the pulse subsystem for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PulseStatus {
    pub running: bool,
    pub queue_available: bool,
    pub event_count: usize,
    pub recent_events: Vec<PulseEvent>,
}

/// Facade over the pulse subsystem: exposes the event log, the incident
/// journal, and liveness flags maintained by the background workers.
pub struct PulseService {
    log: Arc<EventLog>,
    journal: Arc<dyn JournalStore>,
    queue_available: Arc<AtomicBool>,
    running: AtomicBool,
}

impl PulseService {
    pub fn new(log: Arc<EventLog>, journal: Arc<dyn JournalStore>) -> Self {
        PulseService {
            log,
            journal,
            queue_available: Arc::new(AtomicBool::new(false)),
            running: AtomicBool::new(false),
        }
    }

    /// Shared flag flipped by the dead-letter listener as the broker
    /// connection comes and goes.
    pub fn queue_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.queue_available)
    }

    pub fn mark_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub async fn status(&self) -> PulseStatus {
        PulseStatus {
            running: self.running.load(Ordering::SeqCst),
            queue_available: self.queue_available.load(Ordering::SeqCst),
            event_count: self.log.len().await,
            recent_events: self.log.query(RECENT_EVENTS, None, None).await,
        }
    }

    /// Most-recent-first slice of the event log, optionally filtered.
    pub async fn events(
        &self,
        limit: usize,
        severity: Option<Severity>,
        source: Option<&str>,
    ) -> Vec<PulseEvent> {
        self.log.query(limit, severity, source).await
    }

    pub async fn journal_append(
        &self,
        entry: NewJournalEntry,
    ) -> Result<JournalEntry, JournalError> {
        self.journal.append(entry).await
    }

    pub async fn journal_query(
        &self,
        query: &JournalQuery,
    ) -> Result<Vec<JournalEntry>, JournalError> {
        self.journal.query(query).await
    }
}

// =================================================================
// Tests
// =================================================================
