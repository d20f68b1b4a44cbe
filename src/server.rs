//! HTTP API over the retrieval service.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/search` | Cached two-stage search |
//! | `GET`  | `/metrics` | Operational metrics snapshot |
//! | `POST` | `/reindex` | Rebuild and promote a new index generation |
//! | `POST` | `/rollback` | Re-activate the previous generation |
//! | `GET`  | `/health` | Health check (returns version and active generation) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "temporarily_unavailable", "message": "..." } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `bad_request` | 400 |
//! | `no_previous_generation` | 404 |
//! | `reindex_in_progress` | 409 |
//! | `index_inconsistency` | 422 |
//! | `temporarily_unavailable` | 503 |
//! | `internal` | 500 |

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::RetrievalError;
use crate::metrics::MetricsSnapshot;
use crate::reindex::ReindexReport;
use crate::retriever::{EnrichedResult, SearchMode};
use crate::service::RetrievalService;

/// Largest `top_k` a client may request.
const MAX_TOP_K: usize = 200;

#[derive(Clone)]
struct AppState {
    service: Arc<RetrievalService>,
}

/// Build the router. Exposed separately from [`run_server`] so tests can
/// serve it on an ephemeral port.
pub fn router(service: Arc<RetrievalService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/search", post(handle_search))
        .route("/metrics", get(handle_metrics))
        .route("/reindex", post(handle_reindex))
        .route("/rollback", post(handle_rollback))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { service })
}

/// Serve on an already-bound listener until the process exits.
pub async fn serve(service: Arc<RetrievalService>, listener: TcpListener) -> anyhow::Result<()> {
    axum::serve(listener, router(service)).await?;
    Ok(())
}

/// Bind to `[server].bind` and serve.
pub async fn run_server(service: Arc<RetrievalService>) -> anyhow::Result<()> {
    let bind_addr = service.config().server.bind.clone();
    let listener = TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");
    println!("crk server listening on http://{}", bind_addr);
    serve(service, listener).await
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

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        let status = match &err {
            RetrievalError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            RetrievalError::ReindexInProgress => StatusCode::CONFLICT,
            RetrievalError::IndexInconsistency { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            RetrievalError::NoPreviousGeneration => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let code = match status {
            StatusCode::INTERNAL_SERVER_ERROR => "internal",
            _ => err.code(),
        };
        AppError {
            status,
            code: code.to_string(),
            message: err.to_string(),
        }
    }
}

// ============ POST /search ============

#[derive(Deserialize)]
struct SearchRequest {
    query: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    top_k: Option<usize>,
}

#[derive(Serialize)]
struct SearchResponse {
    mode: SearchMode,
    results: Vec<EnrichedResult>,
}

async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    let mode = match req.mode.as_deref() {
        None => SearchMode::default(),
        Some(m) => m.parse::<SearchMode>().map_err(|e| bad_request(e.to_string()))?,
    };
    if let Some(k) = req.top_k {
        if k == 0 || k > MAX_TOP_K {
            return Err(bad_request(format!("top_k must be between 1 and {MAX_TOP_K}")));
        }
    }

    let results = state
        .service
        .search_enriched(&req.query, mode, req.top_k)
        .await?;
    Ok(Json(SearchResponse { mode, results }))
}

// ============ GET /metrics ============

async fn handle_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.service.metrics_snapshot())
}

// ============ POST /reindex, POST /rollback ============
//
// Both run on their own task: a client that disconnects mid-request must not
// cancel a reindex between persisting a generation and swapping it in.

fn join_error(err: tokio::task::JoinError) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: format!("Background task failed: {err}"),
    }
}

async fn handle_reindex(State(state): State<AppState>) -> Result<Json<ReindexReport>, AppError> {
    let service = state.service.clone();
    let report = tokio::spawn(async move { service.reindex().await })
        .await
        .map_err(join_error)??;
    Ok(Json(report))
}

#[derive(Serialize)]
struct RollbackResponse {
    active_generation: u64,
}

async fn handle_rollback(
    State(state): State<AppState>,
) -> Result<Json<RollbackResponse>, AppError> {
    let service = state.service.clone();
    let active_generation = tokio::spawn(async move { service.rollback().await })
        .await
        .map_err(join_error)??;
    Ok(Json(RollbackResponse { active_generation }))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
    active_generation: u64,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        active_generation: state.service.coordinator().active().id,
    })
}
