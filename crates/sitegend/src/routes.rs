//! HTTP routes: run API, health and ready-site serving.

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sitegen_ci::{ChangeResult, RunOptions};
use sitegen_core::{RunId, RunState, RunStatus, SiteError, TreeChange};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::state::AppState;

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    let sites = Router::new()
        .fallback_service(
            ServeDir::new(&state.artifact_root).append_index_html_on_directories(true),
        )
        .layer(middleware::from_fn_with_state(state.clone(), require_ready))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(health))
        .nest("/api", api_router())
        .nest_service("/sites", sites)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .route("/runs", post(create_run).get(list_runs))
        .route("/runs/{run_id}", get(get_run))
        .route("/runs/{run_id}/changes", post(apply_changes))
}

/// Handler error carrying a [`SiteError`].
pub struct ApiError(SiteError);

impl From<SiteError> for ApiError {
    fn from(err: SiteError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &SiteError) -> StatusCode {
    match err {
        SiteError::Validation(_) => StatusCode::BAD_REQUEST,
        SiteError::RunNotFound(_) => StatusCode::NOT_FOUND,
        SiteError::InternalInvariantViolation(_) => StatusCode::CONFLICT,
        SiteError::RemoteConflict(_)
        | SiteError::RemoteUnavailable(_)
        | SiteError::PartialBlobFailure { .. } => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(error = %self.0, "request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    prompt: String,
    #[serde(flatten)]
    options: RunOptions,
}

/// POST /api/runs - start a run; returns its current snapshot.
async fn create_run(
    State(state): State<AppState>,
    Json(request): Json<CreateRunRequest>,
) -> Result<(StatusCode, Json<RunState>), ApiError> {
    let run_id = state
        .service
        .start_run(&request.prompt, request.options)
        .await?;
    let snapshot = state.service.get_run_status(&run_id).await?;
    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

/// GET /api/runs - all runs, oldest first.
async fn list_runs(State(state): State<AppState>) -> Result<Json<Vec<RunState>>, ApiError> {
    Ok(Json(state.service.list_runs().await?))
}

/// GET /api/runs/{run_id}
async fn get_run(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> Result<Json<RunState>, ApiError> {
    Ok(Json(state.service.get_run_status(&RunId::from(run_id.as_str())).await?))
}

#[derive(Debug, Deserialize)]
struct ChangesRequest {
    operations: Vec<TreeChange>,
}

#[derive(Debug, Serialize)]
struct ChangesResponse {
    results: Vec<ChangeResult>,
}

/// POST /api/runs/{run_id}/changes - ordered upserts and deletes.
async fn apply_changes(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
    Json(request): Json<ChangesRequest>,
) -> Result<Json<ChangesResponse>, ApiError> {
    let results = state
        .service
        .apply_changes(&RunId::from(run_id.as_str()), request.operations)
        .await?;
    Ok(Json(ChangesResponse { results }))
}

/// Only serve artifacts of runs that are `ready`.
async fn require_ready(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let run_id = request
        .uri()
        .path()
        .trim_start_matches('/')
        .split('/')
        .next()
        .unwrap_or_default()
        .to_string();
    if run_id.is_empty() {
        return StatusCode::NOT_FOUND.into_response();
    }
    match state.service.get_run_status(&RunId::from(run_id.as_str())).await {
        Ok(run) if run.status == RunStatus::Ready => next.run(request).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}
