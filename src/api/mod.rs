//! JSON HTTP API served by the scheduler node.
//!
//! Every handler forwards to the scheduler loop through a [`SchedulerHandle`];
//! nothing here touches scheduler state directly.

use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::descriptor::JobSpec;
use crate::error::CondorError;
use crate::node::SchedulerHandle;
use crate::scheduler::WorkerAdvertisement;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: SchedulerHandle,
}

/// Body of `POST /api/jobs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub jobs: Vec<JobSpec>,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Wrapper so handlers can return `Result<_, ApiError>` and use `?`.
pub struct ApiError(CondorError);

impl From<CondorError> for ApiError {
    fn from(err: CondorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            CondorError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            CondorError::JobNotFound(_) => (StatusCode::NOT_FOUND, "job_not_found"),
            CondorError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            CondorError::QueueFull(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_full"),
            CondorError::SchedulerUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, "scheduler_unavailable")
            }
            CondorError::StorageUnavailable(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
            }
            CondorError::Io(_) | CondorError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };

        if status.is_server_error() {
            tracing::warn!(error = %self.0, "API request failed");
        }

        let body = ErrorBody {
            kind: kind.to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/jobs", get(list_jobs_handler).post(submit_jobs_handler))
        .route("/api/jobs/:id", get(job_status_handler))
        .route("/api/jobs/:id/cancel", post(cancel_job_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/workers/heartbeat", post(heartbeat_handler))
        .layer(cors)
        .with_state(state)
}

/// Serve the API until `shutdown` is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: ApiState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!(addr = %addr, error = %e, "Failed to bind API server");
        e
    })?;

    tracing::info!(addr = %addr, "Starting API server");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}

async fn submit_jobs_handler(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> ApiResult<impl IntoResponse> {
    let submission = state.scheduler.submit(payload.jobs).await?;
    Ok((StatusCode::CREATED, Json(submission)))
}

async fn list_jobs_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.list().await?))
}

async fn job_status_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.status(id).await?))
}

async fn cancel_job_handler(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.cancel(id).await?;
    Ok(Json(state.scheduler.status(id).await?))
}

async fn list_workers_handler(State(state): State<ApiState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.scheduler.workers().await?))
}

async fn heartbeat_handler(
    State(state): State<ApiState>,
    Json(advertisement): Json<WorkerAdvertisement>,
) -> ApiResult<impl IntoResponse> {
    state.scheduler.heartbeat(advertisement).await?;
    Ok(StatusCode::NO_CONTENT)
}
