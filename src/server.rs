//! JSON HTTP server.
//!
//! Lets other services start ingestion jobs, poll them and review tag
//! resolution. Jobs run on spawned tasks; the request that starts one only
//! takes the project lease and returns the job id.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/projects/{id}/extract` | Start the full pipeline for a project |
//! | `POST` | `/projects/{id}/tags` | Re-run tag extraction only |
//! | `GET`  | `/projects/{id}/stats` | Project statistics |
//! | `GET`  | `/jobs/{id}` | Job status record |
//! | `POST` | `/jobs/{id}/cancel` | Request cancellation |
//! | `GET`  | `/tags/{id}/suggestions` | Ranked dictionary candidates for a tag |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "conflict", "message": "project 3 is locked by running job ..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `conflict` (409),
//! `internal` (500).

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use crate::config::Config;
use crate::db;
use crate::error::PipelineError;
use crate::jobs;
use crate::models::{JobKind, JobStatus};
use crate::pipeline;
use crate::progress::NoProgress;
use crate::resolve::{self, TagSuggestions};
use crate::stats::{self, ProjectStats};

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    pool: SqlitePool,
}

/// Start the server on `[server].bind`. Runs until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    let bind_addr = config.server.bind.clone();
    let app = router(Arc::new(config.clone()), pool);

    println!("Harvest server listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the application router over an open pool.
pub fn router(config: Arc<Config>, pool: SqlitePool) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/projects/{id}/extract", post(handle_start_extract))
        .route("/projects/{id}/tags", post(handle_start_tags))
        .route("/projects/{id}/stats", get(handle_stats))
        .route("/jobs/{id}", get(handle_job_status))
        .route("/jobs/{id}/cancel", post(handle_cancel))
        .route("/tags/{id}/suggestions", get(handle_suggestions))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { config, pool })
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

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message: message.into(),
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(err.to_string())
    }
}

/// Map pipeline errors raised while handling a request to HTTP statuses.
impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        let message = err.to_string();
        match err {
            PipelineError::Conflict { .. } => AppError {
                status: StatusCode::CONFLICT,
                code: "conflict".to_string(),
                message,
            },
            PipelineError::NotFound(_) => not_found(message),
            PipelineError::Configuration(_) => bad_request(message),
            _ => internal(message),
        }
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

// ============ POST /projects/{id}/extract, /projects/{id}/tags ============

#[derive(Deserialize)]
struct StartRequest {
    #[serde(default)]
    user: String,
}

#[derive(Serialize)]
struct StartResponse {
    job_id: String,
}

async fn handle_start_extract(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    start(state, project_id, req.user, JobKind::Extract).await
}

async fn handle_start_tags(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
    Json(req): Json<StartRequest>,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    start(state, project_id, req.user, JobKind::Tags).await
}

/// Take the lease and hand the job to a background task.
async fn start(
    state: AppState,
    project_id: i64,
    user: String,
    kind: JobKind,
) -> Result<(StatusCode, Json<StartResponse>), AppError> {
    let job_id = jobs::start_job(
        &state.pool,
        project_id,
        &user,
        kind,
        state.config.pipeline.lock_ttl_secs,
    )
    .await?;

    let task_job_id = job_id.clone();
    tokio::spawn(async move {
        let result = pipeline::run_job(
            &state.config,
            &state.pool,
            &task_job_id,
            project_id,
            &user,
            kind,
            Box::new(NoProgress),
        )
        .await;
        if let Err(e) = result {
            error!(job_id = %task_job_id, error = %e, "background job ended with error");
        }
    });

    Ok((StatusCode::ACCEPTED, Json(StartResponse { job_id })))
}

// ============ GET /jobs/{id}, POST /jobs/{id}/cancel ============

async fn handle_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, AppError> {
    let status = jobs::get_job(&state.pool, &job_id)
        .await?
        .ok_or_else(|| not_found(format!("job not found: {}", job_id)))?;
    Ok(Json(status))
}

#[derive(Serialize)]
struct CancelResponse {
    job_id: String,
    cancel_requested: bool,
}

/// Flag a running job. Jobs that already finished answer with
/// `cancel_requested: false`.
async fn handle_cancel(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<CancelResponse>, AppError> {
    if jobs::get_job(&state.pool, &job_id).await?.is_none() {
        return Err(not_found(format!("job not found: {}", job_id)));
    }
    let cancel_requested = jobs::request_cancel(&state.pool, &job_id).await?;
    Ok(Json(CancelResponse {
        job_id,
        cancel_requested,
    }))
}

// ============ GET /tags/{id}/suggestions ============

async fn handle_suggestions(
    State(state): State<AppState>,
    Path(tag_id): Path<i64>,
) -> Result<Json<TagSuggestions>, AppError> {
    let suggestions = resolve::suggest_for_tag(&state.pool, &state.config.resolution, tag_id)
        .await?
        .ok_or_else(|| not_found(format!("tag not found: {}", tag_id)))?;
    Ok(Json(suggestions))
}

// ============ GET /projects/{id}/stats ============

async fn handle_stats(
    State(state): State<AppState>,
    Path(project_id): Path<i64>,
) -> Result<Json<ProjectStats>, AppError> {
    let exists = crate::projects::project_exists(&state.pool, project_id).await?;
    if !exists {
        return Err(not_found(format!("project not found: {}", project_id)));
    }
    Ok(Json(stats::project_stats(&state.pool, project_id).await?))
}
