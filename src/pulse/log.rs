//! Bounded in-memory event log. Oldest entries are evicted once the
//! capacity is reached; reads return most-recent-first.

use std::collections::VecDeque;

use tokio::sync::Mutex;

use super::{PulseEvent, Severity};

pub struct EventLog {
    capacity: usize,
    entries: Mutex<VecDeque<PulseEvent>>,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        EventLog {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub async fn record(&self, event: PulseEvent) {
        let mut entries = self.entries.lock().await;
        entries.push_back(event);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Newest events first, filtered before the limit is applied so a full
    /// page of matches comes back even when other severities dominate.
    pub async fn query(
        &self,
        limit: usize,
        severity: Option<Severity>,
        source: Option<&str>,
    ) -> Vec<PulseEvent> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .rev()
            .filter(|event| severity.is_none_or(|wanted| event.severity == wanted))
            .filter(|event| source.is_none_or(|wanted| event.source == wanted))
            .take(limit)
            .cloned()
            .collect()
    }
}

// =================================================================
// Tests
// =================================================================
