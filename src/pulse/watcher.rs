//! Watches mesh snapshots and turns status transitions into pulse events.
//!
//! The watcher holds the previous observation as a name-to-status baseline.
//! Each pass diffs the current snapshot against it, emits one event per
//! transition, and replaces the baseline whether or not any dispatch
//! succeeded, so a flapping node produces one event per edge rather than one
//! per pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::info;

use crate::mesh::{MeshNode, MeshService, NodeStatus};
use crate::worker::{self, WorkerHandle};

use super::{EventDispatcher, PulseEvent, Severity, SOURCE_MESH_WATCHER};

pub struct MeshWatcher {
    mesh: Arc<MeshService>,
    dispatcher: Arc<EventDispatcher>,
    baseline: Mutex<HashMap<String, NodeStatus>>,
}

impl MeshWatcher {
    pub fn new(mesh: Arc<MeshService>, dispatcher: Arc<EventDispatcher>) -> Self {
        MeshWatcher {
            mesh,
            dispatcher,
            baseline: Mutex::new(HashMap::new()),
        }
    }

    /// Diff the current snapshot against the baseline and dispatch one event
    /// per transition. The baseline is advanced before dispatching so a slow
    /// or failing escalation cannot double-report an edge.
    pub async fn check_once(&self) {
        let snapshot = self.mesh.snapshot().await;
        let events = {
            let mut baseline = self.baseline.lock().await;
            let events = diff_transitions(&baseline, &snapshot.nodes);
            *baseline = snapshot
                .nodes
                .iter()
                .map(|node| (node.name.clone(), node.status))
                .collect();
            events
        };
        for event in events {
            self.dispatcher.record(event).await;
        }
    }
}

/// Compute transition events between the previous baseline and the nodes of
/// a fresh snapshot. Pure so the edge rules can be tested directly.
fn diff_transitions(
    previous: &HashMap<String, NodeStatus>,
    nodes: &[MeshNode],
) -> Vec<PulseEvent> {
    let mut events = Vec::new();

    for node in nodes {
        match previous.get(&node.name).copied() {
            None => {
                // Nodes first seen unhealthy or unprobed stay silent until
                // they produce a real edge.
                if node.status == NodeStatus::Healthy {
                    events.push(discovered(node));
                }
            }
            Some(prev) => match (prev, node.status) {
                (NodeStatus::Healthy, NodeStatus::Unhealthy | NodeStatus::Unknown) => {
                    events.push(went_down(node, prev));
                }
                (NodeStatus::Unhealthy | NodeStatus::Unknown, NodeStatus::Healthy) => {
                    events.push(recovered(node, prev));
                }
                (NodeStatus::Healthy, NodeStatus::Healthy)
                | (NodeStatus::Unhealthy, NodeStatus::Unhealthy)
                | (NodeStatus::Unknown, NodeStatus::Unknown)
                | (NodeStatus::Unhealthy, NodeStatus::Unknown)
                | (NodeStatus::Unknown, NodeStatus::Unhealthy) => {}
            },
        }
    }

    let mut removed: Vec<(&String, NodeStatus)> = previous
        .iter()
        .filter(|(name, _)| !nodes.iter().any(|node| &node.name == *name))
        .map(|(name, status)| (name, *status))
        .collect();
    removed.sort_by(|a, b| a.0.cmp(b.0));
    for (name, prev) in removed {
        events.push(removed_event(name, prev));
    }

    events
}

fn discovered(node: &MeshNode) -> PulseEvent {
    PulseEvent::new(
        SOURCE_MESH_WATCHER,
        Severity::Info,
        format!("Sidecar '{}' discovered", node.name),
        format!("joined the mesh with {} tools", node.tools_count),
    )
    .with_metadata("node", &node.name)
    .with_metadata("to", NodeStatus::Healthy.as_str())
}

fn went_down(node: &MeshNode, prev: NodeStatus) -> PulseEvent {
    let cause = node.error.as_deref().unwrap_or("health probe failed");
    PulseEvent::new(
        SOURCE_MESH_WATCHER,
        Severity::Critical,
        format!("Sidecar '{}' is DOWN", node.name),
        cause,
    )
    .with_metadata("node", &node.name)
    .with_metadata("from", prev.as_str())
    .with_metadata("to", node.status.as_str())
}

fn recovered(node: &MeshNode, prev: NodeStatus) -> PulseEvent {
    PulseEvent::new(
        SOURCE_MESH_WATCHER,
        Severity::Info,
        format!("Sidecar '{}' recovered", node.name),
        "health restored after outage",
    )
    .with_metadata("node", &node.name)
    .with_metadata("from", prev.as_str())
    .with_metadata("to", node.status.as_str())
}

fn removed_event(name: &str, prev: NodeStatus) -> PulseEvent {
    PulseEvent::new(
        SOURCE_MESH_WATCHER,
        Severity::Warning,
        format!("Sidecar '{name}' removed from registry"),
        format!("no longer registered; last status was {prev}"),
    )
    .with_metadata("node", name)
    .with_metadata("from", prev.as_str())
}

/// Periodic watch loop. The first pass runs one interval after start so the
/// initial mesh sweep has landed before anything is diffed.
pub fn spawn_watch_loop(watcher: Arc<MeshWatcher>, interval: Duration) -> WorkerHandle {
    let (handle, mut cancel_rx) = worker::cancellation();
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Mesh watcher started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    watcher.check_once().await;
                }
                changed = cancel_rx.changed() => {
                    // A closed channel means the handle owner is gone.
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Mesh watcher stopped");
    });
    handle
}

// =================================================================
// Tests
// =================================================================
