//! HTTP server for the control plane and the chat service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/ingest` | Start (or coalesce) an ingestion; returns `202` at once |
//! | `POST` | `/query` | Retrieve the chunks most similar to a prompt |
//! | `GET`  | `/agents/{agent}/ingestion` | Current ingestion job record |
//! | `DELETE` | `/agents/{agent}/collection` | Drop the agent's collection |
//! | `GET`  | `/outbox/dead` | Status notifications that exhausted their retries |
//! | `POST` | `/outbox/{id}/retry` | Re-arm a dead notification |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "Directory for agent bot1 not found" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `upstream_unavailable` (500), `internal` (500).
//!
//! # Authentication
//!
//! When `[server] api_key` is set, every route except `/health` requires the
//! header named by `api_key_header` to carry that value.
//!
//! `POST /query` is bounded by `request_timeout_secs` on top of the
//! per-call embedding and index timeouts.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::error::{with_timeout, RagError};
use crate::ingest::TriggerOutcome;
use crate::jobs::JobRecord;
use crate::notify::OutboxEntry;
use crate::services::Services;

#[derive(Clone)]
struct AppState {
    services: Services,
}

/// Build the router over already-opened services.
pub fn router(services: Services) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ingest", post(handle_ingest))
        .route("/query", post(handle_query))
        .route("/agents/{agent}/ingestion", get(handle_ingestion_status))
        .route("/agents/{agent}/collection", delete(handle_delete_collection))
        .route("/outbox/dead", get(handle_dead_letters))
        .route("/outbox/{id}/retry", post(handle_retry))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { services })
}

/// Run the server until Ctrl-C.
///
/// Before accepting requests this collects orphaned index generations and
/// reconciles ingestion jobs left `in_progress` by a previous process. The
/// outbox worker runs alongside and is stopped on shutdown.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let services = Services::open(config.clone()).await?;

    let collected = services.index.collect_garbage().await?;
    if collected > 0 {
        tracing::info!(collected, "removed orphaned index generations");
    }
    let reconciled = services.ingestor.reconcile().await?;
    if !reconciled.resumed.is_empty() || !reconciled.failed.is_empty() {
        tracing::info!(
            resumed = ?reconciled.resumed,
            failed = ?reconciled.failed,
            "reconciled interrupted ingestions"
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = tokio::spawn(
        services
            .outbox
            .clone()
            .run_worker(services.notifier.clone(), shutdown_rx),
    );

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "server listening");
    println!("agent-rag listening on http://{}", bind_addr);

    axum::serve(listener, router(services))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        tracing::warn!(error = %e, "outbox worker ended abnormally");
    }
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError::new(StatusCode::NOT_FOUND, "not_found", message)
}

impl From<RagError> for AppError {
    fn from(err: RagError) -> Self {
        match &err {
            RagError::NotFound(msg) => not_found(msg.clone()),
            RagError::Validation(msg) => bad_request(msg.clone()),
            e if e.is_upstream() => {
                tracing::error!(error = %e, "upstream failure");
                AppError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "upstream_unavailable",
                    e.to_string(),
                )
            }
            e => {
                tracing::error!(error = %e, "request failed");
                AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", e.to_string())
            }
        }
    }
}

fn authorize(config: &Config, headers: &HeaderMap) -> Result<(), AppError> {
    let Some(expected) = &config.server.api_key else {
        return Ok(());
    };
    let supplied = headers
        .get(config.server.api_key_header.as_str())
        .and_then(|v| v.to_str().ok());
    if supplied == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(AppError::new(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            format!("missing or invalid {} header", config.server.api_key_header),
        ))
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /ingest ============

#[derive(Deserialize)]
struct IngestRequest {
    agent_name: String,
}

#[derive(Serialize)]
struct IngestResponse {
    agent_name: String,
    outcome: TriggerOutcome,
}

/// Fire-and-forget: the outcome arrives through the status callback.
async fn handle_ingest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), AppError> {
    authorize(&state.services.config, &headers)?;
    let outcome = state.services.ingestor.trigger(&req.agent_name).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            agent_name: req.agent_name,
            outcome,
        }),
    ))
}

// ============ POST /query ============

#[derive(Deserialize)]
struct QueryRequest {
    agent_name: String,
    prompt: String,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct QueryResponse {
    agent_name: String,
    prompt: String,
    results: Vec<String>,
}

async fn handle_query(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    let config = &state.services.config;
    authorize(config, &headers)?;
    let results = with_timeout(
        config.server.request_timeout_secs,
        "query",
        state
            .services
            .retriever
            .retrieve(&req.agent_name, &req.prompt, req.top_k),
    )
    .await?;
    Ok(Json(QueryResponse {
        agent_name: req.agent_name,
        prompt: req.prompt,
        results,
    }))
}

// ============ /agents/{agent} ============

async fn handle_ingestion_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent): Path<String>,
) -> Result<Json<JobRecord>, AppError> {
    authorize(&state.services.config, &headers)?;
    Ok(Json(state.services.ingestor.status(&agent).await?))
}

#[derive(Serialize)]
struct DeleteResponse {
    agent_name: String,
    deleted: bool,
}

async fn handle_delete_collection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(agent): Path<String>,
) -> Result<Json<DeleteResponse>, AppError> {
    authorize(&state.services.config, &headers)?;
    let deleted = state.services.ingestor.delete_agent(&agent).await?;
    Ok(Json(DeleteResponse {
        agent_name: agent,
        deleted,
    }))
}

// ============ /outbox ============

#[derive(Serialize)]
struct DeadLettersResponse {
    entries: Vec<OutboxEntry>,
}

async fn handle_dead_letters(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<DeadLettersResponse>, AppError> {
    authorize(&state.services.config, &headers)?;
    let entries = state.services.outbox.dead_letters().await?;
    Ok(Json(DeadLettersResponse { entries }))
}

async fn handle_retry(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, AppError> {
    authorize(&state.services.config, &headers)?;
    if !state.services.outbox.requeue(id).await? {
        return Err(not_found(format!("no dead outbox entry with id {}", id)));
    }
    Ok(Json(serde_json::json!({ "id": id, "requeued": true })))
}
