//! Mesh discovery: a live, queryable view of all registered sidecars.
//!
//! ## Sweep cycle
//! Every sweep loads the registry, probes each sidecar's health endpoint
//! concurrently with a fixed per-probe timeout, and swaps in a fresh node
//! map only after the whole sweep finishes — readers always see either the
//! previous or the next fully-committed view, never a partial one. A probe
//! failure marks its own node unhealthy without disturbing the rest of the
//! sweep.
//!
//! ## Queries
//! [`MeshService::snapshot`] returns summary counts plus the name-sorted
//! node list; [`MeshService::topology_context`] renders the same view as a
//! compact text block for injection into a remediation actor's context.

mod probe;

pub use probe::{derive_health_url, extract_port, HealthProbe, ProbeReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::MeshConfig;
use crate::registry::{RegistryStore, SidecarEntry};
use crate::worker::{self, WorkerHandle};

/// Probe-derived health state of one sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Never probed yet.
    Unknown,
    /// Last probe returned HTTP 200.
    Healthy,
    /// Last probe failed or returned a non-200 status.
    Unhealthy,
}

impl NodeStatus {
    /// Lowercase label, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Healthy => "healthy",
            NodeStatus::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One sidecar as seen by mesh discovery.
#[derive(Debug, Clone, Serialize)]
pub struct MeshNode {
    /// Unique sidecar name (registry key).
    pub name: String,
    /// Internal base URL.
    pub url: String,
    /// Externally reachable base URL, when registered.
    pub host_url: Option<String>,
    /// Port extracted from the probed URL.
    pub port: Option<u16>,
    /// Health state from the latest sweep.
    pub status: NodeStatus,
    /// Tool count from the health body, falling back to the registry value.
    pub tools_count: i64,
    /// Free-form grouping label from the registry.
    pub category: Option<String>,
    /// Last successful probe time. Preserved across unhealthy sweeps.
    pub last_seen: Option<DateTime<Utc>>,
    /// Round-trip time of the latest probe.
    pub response_time_ms: Option<u64>,
    /// Diagnostic from the latest failed probe.
    pub error: Option<String>,
}

/// Counts per health state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeshSummary {
    pub total: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub unknown: usize,
}

/// Immutable view of the mesh at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct MeshSnapshot {
    /// When this snapshot was taken.
    pub timestamp: DateTime<Utc>,
    /// When the last sweep committed, if any has.
    pub last_sweep: Option<DateTime<Utc>>,
    /// Counts per health state.
    pub summary: MeshSummary,
    /// Name-sorted node list.
    pub nodes: Vec<MeshNode>,
}

/// Live mesh view. One lock guards both fields so the node map and the
/// sweep mark always commit together.
#[derive(Default)]
struct MeshState {
    nodes: HashMap<String, MeshNode>,
    last_sweep: Option<DateTime<Utc>>,
}

/// Mesh discovery service.
///
/// Owns the live mesh state; all mutation happens through [`sweep`].
///
/// [`sweep`]: MeshService::sweep
pub struct MeshService {
    registry: Arc<dyn RegistryStore>,
    probe: HealthProbe,
    state: RwLock<MeshState>,
}

impl MeshService {
    /// Create a mesh service over the given registry.
    pub fn new(registry: Arc<dyn RegistryStore>, config: &MeshConfig) -> Self {
        Self {
            registry,
            probe: HealthProbe::new(config.probe_timeout()),
            state: RwLock::new(MeshState::default()),
        }
    }

    /// Run one full sweep: load the registry, probe every sidecar
    /// concurrently, and commit the fresh node map.
    ///
    /// Registry load failures skip the cycle and keep the previous view.
    pub async fn sweep(&self) {
        let entries = match self.registry.load_all().await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, "Registry load failed, skipping sweep");
                return;
            }
        };

        let previous = self.state.read().await.nodes.clone();
        let probes = entries.into_iter().map(|entry| {
            let prior_last_seen = previous.get(&entry.name).and_then(|n| n.last_seen);
            self.probe_node(entry, prior_last_seen)
        });
        let fresh = futures::future::join_all(probes).await;

        let total = fresh.len();
        let healthy = fresh
            .iter()
            .filter(|n| n.status == NodeStatus::Healthy)
            .count();

        let mut next = HashMap::with_capacity(total);
        for node in fresh {
            next.insert(node.name.clone(), node);
        }
        {
            let mut state = self.state.write().await;
            state.nodes = next;
            state.last_sweep = Some(Utc::now());
        }

        info!(nodes = total, healthy = healthy, "Mesh sweep complete");
    }

    async fn probe_node(
        &self,
        entry: SidecarEntry,
        prior_last_seen: Option<DateTime<Utc>>,
    ) -> MeshNode {
        let base_url = entry.contact_url().to_string();
        let report = self.probe.check(&base_url).await;
        let port = extract_port(&base_url);

        match report.status {
            NodeStatus::Healthy => MeshNode {
                name: entry.name,
                url: entry.url,
                host_url: entry.host_url,
                port,
                status: NodeStatus::Healthy,
                tools_count: report.tools_count.unwrap_or(entry.tools_count),
                category: entry.category,
                last_seen: Some(Utc::now()),
                response_time_ms: Some(report.response_time_ms),
                error: None,
            },
            NodeStatus::Unhealthy | NodeStatus::Unknown => MeshNode {
                name: entry.name,
                url: entry.url,
                host_url: entry.host_url,
                port,
                status: NodeStatus::Unhealthy,
                tools_count: entry.tools_count,
                category: entry.category,
                last_seen: prior_last_seen,
                response_time_ms: Some(report.response_time_ms),
                error: report.error,
            },
        }
    }

    /// Current mesh view: summary counts plus the name-sorted node list.
    pub async fn snapshot(&self) -> MeshSnapshot {
        let (mut nodes, last_sweep) = {
            let state = self.state.read().await;
            let nodes: Vec<MeshNode> = state.nodes.values().cloned().collect();
            (nodes, state.last_sweep)
        };
        nodes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut summary = MeshSummary {
            total: nodes.len(),
            ..Default::default()
        };
        for node in &nodes {
            match node.status {
                NodeStatus::Healthy => summary.healthy += 1,
                NodeStatus::Unhealthy => summary.unhealthy += 1,
                NodeStatus::Unknown => summary.unknown += 1,
            }
        }

        MeshSnapshot {
            timestamp: Utc::now(),
            last_sweep,
            summary,
            nodes,
        }
    }

    /// Render the current view as a compact text block.
    pub async fn topology_context(&self) -> String {
        let snapshot = self.snapshot().await;
        let mut out = String::from("<mesh_topology>\n");

        match snapshot.last_sweep {
            Some(swept) => out.push_str(&format!("swept: {}\n", swept.to_rfc3339())),
            None => out.push_str("swept: never\n"),
        }
        out.push_str(&format!(
            "nodes: {} | healthy: {} | unhealthy: {} | unknown: {}\n",
            snapshot.summary.total,
            snapshot.summary.healthy,
            snapshot.summary.unhealthy,
            snapshot.summary.unknown,
        ));

        for node in &snapshot.nodes {
            let marker = match node.status {
                NodeStatus::Healthy => "[+]",
                NodeStatus::Unhealthy => "[-]",
                NodeStatus::Unknown => "[?]",
            };
            let port = node
                .port
                .map(|p| format!(" (port {})", p))
                .unwrap_or_default();

            match node.status {
                NodeStatus::Healthy => {
                    let latency = node
                        .response_time_ms
                        .map(|ms| format!(" - {}ms", ms))
                        .unwrap_or_default();
                    out.push_str(&format!(
                        "{} {}{} - {} tools{}\n",
                        marker, node.name, port, node.tools_count, latency
                    ));
                }
                NodeStatus::Unhealthy => {
                    let cause = node.error.as_deref().unwrap_or("unreachable");
                    out.push_str(&format!("{} {}{} - down: {}\n", marker, node.name, port, cause));
                }
                NodeStatus::Unknown => {
                    out.push_str(&format!("{} {}{} - not probed yet\n", marker, node.name, port));
                }
            }
        }

        out.push_str("</mesh_topology>");
        out
    }
}

/// Spawn the periodic sweep loop.
///
/// The first sweep runs immediately; later sweeps follow the configured
/// interval until the handle is stopped.
pub fn spawn_sweep_loop(mesh: Arc<MeshService>, interval: Duration) -> WorkerHandle {
    let (handle, mut cancel_rx) = worker::cancellation();

    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Mesh sweep loop started");
        mesh.sweep().await;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    mesh.sweep().await;
                }
                changed = cancel_rx.changed() => {
                    // A closed channel means the handle owner is gone.
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Mesh sweep loop stopped");
                        break;
                    }
                }
            }
        }
    });

    handle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InMemoryRegistry, RegistryError, Result as RegistryResult};

    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use axum::routing::get;
    use axum::{Json, Router};

    // ========================================================================
    // Test fixtures
    // ========================================================================

    /// Serve a health endpoint returning the given status and body.
    async fn spawn_health_server(
        status: axum::http::StatusCode,
        tools_count: Option<i64>,
    ) -> (String, tokio::task::JoinHandle<()>) {
        let app = Router::new().route(
            "/health",
            get(move || async move {
                let body = match tools_count {
                    Some(count) => serde_json::json!({ "status": "ok", "tools_count": count }),
                    None => serde_json::json!({ "status": "ok" }),
                };
                (status, Json(body))
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), task)
    }

    /// A URL with no listener behind it.
    async fn unreachable_url() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        format!("http://127.0.0.1:{}", port)
    }

    fn make_entry(name: &str, url: &str) -> SidecarEntry {
        SidecarEntry {
            name: name.to_string(),
            url: url.to_string(),
            host_url: None,
            tools_count: 0,
            category: None,
        }
    }

    async fn make_mesh(entries: Vec<SidecarEntry>) -> MeshService {
        let registry = InMemoryRegistry::new();
        for entry in &entries {
            registry.upsert(entry).await.unwrap();
        }
        MeshService::new(
            Arc::new(registry),
            &MeshConfig {
                sweep_interval_secs: 30,
                probe_timeout_secs: 2,
            },
        )
    }

    /// Registry double whose `load_all` can be flipped to fail.
    struct FlakyRegistry {
        inner: InMemoryRegistry,
        fail: AtomicBool,
    }

    impl FlakyRegistry {
        fn new() -> Self {
            Self {
                inner: InMemoryRegistry::new(),
                fail: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl RegistryStore for FlakyRegistry {
        async fn load_all(&self) -> RegistryResult<Vec<SidecarEntry>> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(RegistryError::Storage(sqlx::Error::PoolClosed));
            }
            self.inner.load_all().await
        }

        async fn get(&self, name: &str) -> RegistryResult<SidecarEntry> {
            self.inner.get(name).await
        }

        async fn upsert(&self, entry: &SidecarEntry) -> RegistryResult<()> {
            self.inner.upsert(entry).await
        }

        async fn remove(&self, name: &str) -> RegistryResult<bool> {
            self.inner.remove(name).await
        }
    }

    // ========================================================================
    // Sweep behavior
    // ========================================================================

    #[tokio::test]
    async fn test_sweep_two_nodes_one_healthy_one_down() {
        let (healthy_url, _healthy) =
            spawn_health_server(axum::http::StatusCode::OK, Some(4)).await;
        let down_url = unreachable_url().await;

        let mesh = make_mesh(vec![
            make_entry("billing", &healthy_url),
            make_entry("ledger", &down_url),
        ])
        .await;
        mesh.sweep().await;

        let snapshot = mesh.snapshot().await;
        assert_eq!(
            snapshot.summary,
            MeshSummary {
                total: 2,
                healthy: 1,
                unhealthy: 1,
                unknown: 0
            }
        );

        let billing = &snapshot.nodes[0];
        assert_eq!(billing.name, "billing");
        assert_eq!(billing.status, NodeStatus::Healthy);
        assert_eq!(billing.tools_count, 4);
        assert!(billing.last_seen.is_some());
        assert!(billing.response_time_ms.is_some());
        assert!(billing.error.is_none());

        let ledger = &snapshot.nodes[1];
        assert_eq!(ledger.status, NodeStatus::Unhealthy);
        assert!(ledger.error.is_some());
        assert!(ledger.last_seen.is_none());
    }

    #[tokio::test]
    async fn test_probe_failure_is_isolated_per_node() {
        let (ok_url, _ok) = spawn_health_server(axum::http::StatusCode::OK, Some(2)).await;
        let (err_url, _err) =
            spawn_health_server(axum::http::StatusCode::INTERNAL_SERVER_ERROR, None).await;
        let gone_url = unreachable_url().await;

        let mesh = make_mesh(vec![
            make_entry("alpha", &ok_url),
            make_entry("beta", &err_url),
            make_entry("gamma", &gone_url),
        ])
        .await;
        mesh.sweep().await;

        let snapshot = mesh.snapshot().await;
        assert_eq!(snapshot.summary.total, 3);
        assert_eq!(snapshot.summary.healthy, 1);
        assert_eq!(snapshot.summary.unhealthy, 2);

        assert_eq!(snapshot.nodes[0].status, NodeStatus::Healthy);
        assert_eq!(snapshot.nodes[1].status, NodeStatus::Unhealthy);
        assert_eq!(snapshot.nodes[1].error.as_deref(), Some("HTTP 500"));
        assert_eq!(snapshot.nodes[2].status, NodeStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_unhealthy_sweep_preserves_last_seen() {
        let (url, server) = spawn_health_server(axum::http::StatusCode::OK, None).await;
        let mesh = make_mesh(vec![make_entry("billing", &url)]).await;

        mesh.sweep().await;
        let first_seen = mesh.snapshot().await.nodes[0].last_seen;
        assert!(first_seen.is_some());

        // Take the server down; the next sweep fails but keeps last_seen.
        server.abort();
        tokio::time::sleep(Duration::from_millis(50)).await;
        mesh.sweep().await;

        let node = &mesh.snapshot().await.nodes[0];
        assert_eq!(node.status, NodeStatus::Unhealthy);
        assert_eq!(node.last_seen, first_seen);
    }

    #[tokio::test]
    async fn test_sweep_drops_unregistered_nodes() {
        let (url, _server) = spawn_health_server(axum::http::StatusCode::OK, None).await;
        let registry = Arc::new(InMemoryRegistry::new());
        registry.upsert(&make_entry("billing", &url)).await.unwrap();
        registry.upsert(&make_entry("ledger", &url)).await.unwrap();

        let mesh = MeshService::new(registry.clone(), &MeshConfig::default());
        mesh.sweep().await;
        assert_eq!(mesh.snapshot().await.summary.total, 2);

        registry.remove("ledger").await.unwrap();
        mesh.sweep().await;

        let snapshot = mesh.snapshot().await;
        assert_eq!(snapshot.summary.total, 1);
        assert_eq!(snapshot.nodes[0].name, "billing");
    }

    #[tokio::test]
    async fn test_registry_failure_keeps_previous_snapshot() {
        let (url, _server) = spawn_health_server(axum::http::StatusCode::OK, Some(3)).await;
        let registry = Arc::new(FlakyRegistry::new());
        registry.upsert(&make_entry("billing", &url)).await.unwrap();

        let mesh = MeshService::new(registry.clone(), &MeshConfig::default());
        mesh.sweep().await;
        let before = mesh.snapshot().await;
        assert_eq!(before.summary.healthy, 1);
        assert!(before.last_sweep.is_some());

        // Break the registry; the cycle is skipped and the old view survives.
        registry.fail.store(true, Ordering::SeqCst);
        mesh.sweep().await;

        let after = mesh.snapshot().await;
        assert_eq!(after.summary.total, 1);
        assert_eq!(after.nodes[0].name, "billing");
        assert_eq!(after.nodes[0].status, NodeStatus::Healthy);
        assert_eq!(after.last_sweep, before.last_sweep);
    }

    // ========================================================================
    // Snapshot and context rendering
    // ========================================================================

    #[tokio::test]
    async fn test_snapshot_before_any_sweep() {
        let mesh = make_mesh(vec![]).await;
        let snapshot = mesh.snapshot().await;

        assert_eq!(snapshot.summary, MeshSummary::default());
        assert!(snapshot.last_sweep.is_none());
        assert!(snapshot.nodes.is_empty());
    }

    #[tokio::test]
    async fn test_snapshot_sees_nodes_and_sweep_mark_together() {
        let (url, _server) = spawn_health_server(axum::http::StatusCode::OK, None).await;
        let mesh = Arc::new(make_mesh(vec![make_entry("billing", &url)]).await);

        // Poll snapshots while the first sweep commits: node data must
        // never appear without its sweep mark.
        let observer = {
            let mesh = Arc::clone(&mesh);
            tokio::spawn(async move {
                for _ in 0..200 {
                    let snapshot = mesh.snapshot().await;
                    if !snapshot.nodes.is_empty() {
                        assert!(snapshot.last_sweep.is_some());
                    }
                    tokio::task::yield_now().await;
                }
            })
        };

        mesh.sweep().await;
        observer.await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_context_rendering() {
        let (healthy_url, _healthy) =
            spawn_health_server(axum::http::StatusCode::OK, Some(7)).await;
        let down_url = unreachable_url().await;

        let mesh = make_mesh(vec![
            make_entry("billing", &healthy_url),
            make_entry("ledger", &down_url),
        ])
        .await;
        mesh.sweep().await;

        let context = mesh.topology_context().await;
        assert!(context.starts_with("<mesh_topology>"));
        assert!(context.ends_with("</mesh_topology>"));
        assert!(context.contains("[+] billing"));
        assert!(context.contains("7 tools"));
        assert!(context.contains("[-] ledger"));
        assert!(context.contains("healthy: 1"));
    }

    #[tokio::test]
    async fn test_sweep_loop_stops_on_signal() {
        let mesh = Arc::new(make_mesh(vec![]).await);
        let handle = spawn_sweep_loop(mesh.clone(), Duration::from_secs(60));

        // The immediate first sweep commits a last_sweep mark.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(mesh.snapshot().await.last_sweep.is_some());

        handle.stop();
    }
}
