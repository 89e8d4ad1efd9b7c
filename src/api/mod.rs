//! HTTP control surface.
//!
//! One axum router exposes all three services:
//! - `GET /health` — liveness probe
//! - `GET /mesh` — current mesh snapshot
//! - `GET /mesh/context` — topology text block for agent prompts
//! - `GET /pulse/status` — detector state plus the most recent events
//! - `GET /pulse/events` — event log with severity/source filters
//! - `GET|POST /pulse/journal` — incident journal
//! - `GET|POST /sagas`, `GET /sagas/{id}`, `POST /sagas/{id}/execute`,
//!   `POST /sagas/rollback` — saga coordination
//!
//! Handlers stay thin: parse and clamp query input, call the service, map
//! domain errors onto status codes. All state arrives through one shared
//! [`ApiContext`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::mesh::{MeshService, MeshSnapshot};
use crate::pulse::{
    JournalEntry, JournalError, JournalQuery, NewJournalEntry, PulseEvent, PulseService,
    PulseStatus, Severity,
};
use crate::saga::{RollbackReport, Saga, SagaError, SagaManager, SagaStatus, StepSpec};

const DEFAULT_EVENT_LIMIT: usize = 50;
const MAX_EVENT_LIMIT: usize = 200;
const DEFAULT_JOURNAL_LIMIT: u64 = 50;
const MAX_JOURNAL_LIMIT: u64 = 500;
const DEFAULT_SAGA_LIMIT: u64 = 50;
const MAX_SAGA_LIMIT: u64 = 200;

/// Everything the handlers reach for.
pub struct ApiContext {
    pub mesh: Arc<MeshService>,
    pub pulse: Arc<PulseService>,
    pub sagas: Arc<SagaManager>,
}

/// Shared state for axum handlers.
type AppState = Arc<ApiContext>;

/// Errors leave handlers as a status code plus a plain-text body.
type ApiError = (StatusCode, String);

/// Start the control API on the given host and port.
///
/// When `port` is 0, the OS assigns an ephemeral port. The actual bound
/// port is always logged so it can be discovered.
pub async fn serve(
    context: Arc<ApiContext>,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = router(context);
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let actual_port = listener.local_addr()?.port();
    info!(port = actual_port, "control API listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the axum router (separated for testing).
pub fn router(context: Arc<ApiContext>) -> Router {
    // Permissive CORS: the API is consumed by dashboards and local tooling.
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/mesh", get(get_mesh))
        .route("/mesh/context", get(get_mesh_context))
        .route("/pulse/status", get(get_pulse_status))
        .route("/pulse/events", get(get_pulse_events))
        .route("/pulse/journal", get(query_journal).post(append_journal))
        .route("/sagas", get(list_sagas).post(create_saga))
        .route("/sagas/rollback", post(rollback_saga))
        .route("/sagas/{id}", get(get_saga))
        .route("/sagas/{id}/execute", post(execute_saga))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(context)
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_mesh(State(state): State<AppState>) -> Json<MeshSnapshot> {
    Json(state.mesh.snapshot().await)
}

async fn get_mesh_context(State(state): State<AppState>) -> Json<MeshContextResponse> {
    let snapshot = state.mesh.snapshot().await;
    let context = state.mesh.topology_context().await;
    Json(MeshContextResponse {
        context,
        node_count: snapshot.summary.total,
    })
}

async fn get_pulse_status(State(state): State<AppState>) -> Json<PulseStatus> {
    Json(state.pulse.status().await)
}

async fn get_pulse_events(
    State(state): State<AppState>,
    Query(params): Query<EventsParams>,
) -> Result<Json<EventsResponse>, ApiError> {
    let severity = params.severity.as_deref().map(parsed::<Severity>).transpose()?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);
    let events = state
        .pulse
        .events(limit, severity, params.source.as_deref())
        .await;
    Ok(Json(EventsResponse {
        total: events.len(),
        events,
    }))
}

async fn append_journal(
    State(state): State<AppState>,
    Json(body): Json<NewJournalEntry>,
) -> Result<(StatusCode, Json<JournalWritten>), ApiError> {
    let entry = state
        .pulse
        .journal_append(body)
        .await
        .map_err(journal_error_response)?;
    Ok((
        StatusCode::CREATED,
        Json(JournalWritten {
            entry_id: entry.entry_id,
            created_at: entry.created_at,
        }),
    ))
}

async fn query_journal(
    State(state): State<AppState>,
    Query(params): Query<JournalParams>,
) -> Result<Json<JournalResponse>, ApiError> {
    let severity = params.severity.as_deref().map(parsed::<Severity>).transpose()?;
    let category = params.category.as_deref().map(parsed).transpose()?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_JOURNAL_LIMIT)
        .clamp(1, MAX_JOURNAL_LIMIT);
    let query = JournalQuery {
        agent_id: params.agent_id,
        severity,
        category,
        limit: Some(limit),
    };
    let entries = state
        .pulse
        .journal_query(&query)
        .await
        .map_err(journal_error_response)?;
    Ok(Json(JournalResponse {
        total: entries.len(),
        entries,
    }))
}

async fn create_saga(
    State(state): State<AppState>,
    Json(body): Json<CreateSagaRequest>,
) -> Result<(StatusCode, Json<Saga>), ApiError> {
    let saga = state
        .sagas
        .create(&body.name, &body.initiator, body.steps)
        .await
        .map_err(saga_error_response)?;
    Ok((StatusCode::CREATED, Json(saga)))
}

async fn list_sagas(
    State(state): State<AppState>,
    Query(params): Query<ListSagasParams>,
) -> Result<Json<SagasResponse>, ApiError> {
    let status = params.status.as_deref().map(parsed::<SagaStatus>).transpose()?;
    let limit = params
        .limit
        .unwrap_or(DEFAULT_SAGA_LIMIT)
        .clamp(1, MAX_SAGA_LIMIT);
    let sagas = state
        .sagas
        .list(status, limit)
        .await
        .map_err(saga_error_response)?;
    Ok(Json(SagasResponse {
        total: sagas.len(),
        sagas,
    }))
}

async fn get_saga(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Saga>, ApiError> {
    let saga = state.sagas.get(&id).await.map_err(saga_error_response)?;
    Ok(Json(saga))
}

async fn execute_saga(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Saga>, ApiError> {
    let saga = state.sagas.execute(&id).await.map_err(saga_error_response)?;
    Ok(Json(saga))
}

async fn rollback_saga(
    State(state): State<AppState>,
    Json(body): Json<RollbackRequest>,
) -> Result<Json<RollbackReport>, ApiError> {
    let report = state
        .sagas
        .rollback(&body.saga_id, body.reason.as_deref())
        .await
        .map_err(saga_error_response)?;
    Ok(Json(report))
}

// ============================================================================
// Request / response types
// ============================================================================

#[derive(Debug, Deserialize)]
struct EventsParams {
    limit: Option<usize>,
    severity: Option<String>,
    source: Option<String>,
}

#[derive(Serialize)]
struct EventsResponse {
    total: usize,
    events: Vec<PulseEvent>,
}

#[derive(Serialize)]
struct MeshContextResponse {
    context: String,
    node_count: usize,
}

#[derive(Debug, Deserialize)]
struct JournalParams {
    limit: Option<u64>,
    agent_id: Option<String>,
    severity: Option<String>,
    category: Option<String>,
}

#[derive(Serialize)]
struct JournalResponse {
    total: usize,
    entries: Vec<JournalEntry>,
}

#[derive(Serialize)]
struct JournalWritten {
    entry_id: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CreateSagaRequest {
    name: String,
    #[serde(default = "default_initiator")]
    initiator: String,
    steps: Vec<StepSpec>,
}

fn default_initiator() -> String {
    "api".to_string()
}

#[derive(Debug, Deserialize)]
struct ListSagasParams {
    status: Option<String>,
    limit: Option<u64>,
}

#[derive(Serialize)]
struct SagasResponse {
    total: usize,
    sagas: Vec<Saga>,
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    saga_id: String,
    reason: Option<String>,
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse a query-string value, rejecting unknown variants with a 400.
fn parsed<T: std::str::FromStr>(raw: &str) -> Result<T, ApiError>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))
}

fn saga_error_response(err: SagaError) -> ApiError {
    match &err {
        SagaError::NotFound(_) => (StatusCode::NOT_FOUND, err.to_string()),
        SagaError::NotPending(..) | SagaError::EmptySteps => {
            (StatusCode::BAD_REQUEST, err.to_string())
        }
        SagaError::Corrupt(_) | SagaError::Storage(_) => {
            error!(error = %err, "saga operation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "saga storage failure".to_string(),
            )
        }
    }
}

fn journal_error_response(err: JournalError) -> ApiError {
    error!(error = %err, "journal operation failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "journal unavailable".to_string(),
    )
}
