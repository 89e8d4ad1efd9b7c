//! Shared fixtures for integration tests.
//!
//! Provides a scriptable mock sidecar: a real HTTP server exposing the
//! `/health` and `/tools/{tool}` surface the services talk to.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/// A fake sidecar bound to an ephemeral local port.
///
/// Records every tool invocation in order and can be scripted to fail
/// specific tools with a 500.
pub struct MockSidecar {
    /// Base URL of the running server.
    pub url: String,
    calls: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

#[derive(Clone)]
struct SidecarState {
    calls: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl MockSidecar {
    /// Bind an ephemeral port and start serving.
    pub async fn start() -> Self {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let failing = Arc::new(Mutex::new(HashSet::new()));
        let state = SidecarState {
            calls: Arc::clone(&calls),
            failing: Arc::clone(&failing),
        };

        let app = Router::new()
            .route("/health", get(health))
            .route("/tools/{tool}", post(run_tool))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock sidecar");
        let addr: SocketAddr = listener.local_addr().expect("No local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Mock sidecar died");
        });

        MockSidecar {
            url: format!("http://{addr}"),
            calls,
            failing,
        }
    }

    /// Make `tool` fail with a 500 from now on.
    pub fn fail_tool(&self, tool: &str) {
        self.failing.lock().unwrap().insert(tool.to_string());
    }

    /// Tools invoked so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn run_tool(
    State(state): State<SidecarState>,
    Path(tool): Path<String>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state.calls.lock().unwrap().push(tool.clone());
    if state.failing.lock().unwrap().contains(&tool) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("tool {tool} exploded"),
        ));
    }
    Ok(Json(json!({ "ok": true, "tool": tool })))
}

/// A base URL that nothing listens on.
///
/// Binds an ephemeral port and immediately drops the listener, so
/// connections are refused rather than hanging.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind");
    let addr = listener.local_addr().expect("No local addr");
    drop(listener);
    format!("http://{addr}")
}
