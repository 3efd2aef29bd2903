//! HTTP REST surface over [`JobQueue`].

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderValue, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};

use crate::error::QueueError;
use crate::jobs::{JobQueue, NewJob, NewLogMessage, NewWorker};

/// Shared state for the REST handlers.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<JobQueue>,
}

/// Build the Axum router with request tracing and permissive CORS.
pub fn job_routes(queue: Arc<JobQueue>) -> Router {
    let state = AppState { queue };

    Router::new()
        .route("/health", get(health))
        .route("/api/workers", get(list_workers).post(create_worker))
        .route("/api/workers/{id}/claim", post(claim_job))
        .route("/api/jobs", get(list_jobs).post(create_job))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/jobs/{id}/complete", post(complete_job))
        .route("/api/jobs/{id}/logs", post(append_log))
        .route("/api/logs", get(list_logs))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer()),
        )
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any)
}

// ── Errors ──────────────────────────────────────────────────────────────

/// A [`QueueError`] rendered as `{"error": ..., "kind": ...}`.
pub struct ApiError(QueueError);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            QueueError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            QueueError::InvalidState { .. } => (StatusCode::CONFLICT, "invalid_state"),
            QueueError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
            QueueError::Contention { .. } => (StatusCode::SERVICE_UNAVAILABLE, "contention"),
            QueueError::Database(e) => {
                error!(error = %e, "Database error while handling request");
                (StatusCode::INTERNAL_SERVER_ERROR, "database")
            }
        };
        let body = Json(json!({"error": self.0.to_string(), "kind": kind}));

        let mut response = (status, body).into_response();
        if self.0.is_retryable() {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "jobqueue"
    }))
}

// ── Workers ─────────────────────────────────────────────────────────────

async fn create_worker(
    State(state): State<AppState>,
    Json(body): Json<NewWorker>,
) -> ApiResult<impl IntoResponse> {
    let worker = state.queue.create_worker(body).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn list_workers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.list_workers().await?))
}

async fn claim_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<Response> {
    Ok(match state.queue.claim_job(id).await? {
        Some(job) => Json(job).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    })
}

// ── Jobs ────────────────────────────────────────────────────────────────

async fn create_job(
    State(state): State<AppState>,
    Json(body): Json<NewJob>,
) -> ApiResult<impl IntoResponse> {
    let job = state.queue.create_job(body).await?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.list_jobs().await?))
}

async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.get_job(id).await?))
}

#[derive(Debug, Default, Deserialize)]
struct CompleteRequest {
    #[serde(default)]
    out_data: Option<String>,
}

/// The body is optional; an empty body completes without output.
async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    body: Bytes,
) -> ApiResult<impl IntoResponse> {
    let request: CompleteRequest = if body.iter().all(u8::is_ascii_whitespace) {
        CompleteRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            warn!(job_id = id, error = %e, "Malformed completion body");
            QueueError::InvalidInput(format!("malformed completion body: {e}"))
        })?
    };
    let job = state
        .queue
        .complete_job(id, request.out_data.as_deref())
        .await?;
    Ok(Json(job))
}

// ── Logs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AppendLogRequest {
    worker_id: i64,
    text: String,
}

async fn append_log(
    State(state): State<AppState>,
    Path(job_id): Path<i64>,
    Json(body): Json<AppendLogRequest>,
) -> ApiResult<impl IntoResponse> {
    let log = state
        .queue
        .append_log(NewLogMessage::new(job_id, body.worker_id, body.text))
        .await?;
    Ok((StatusCode::CREATED, Json(log)))
}

async fn list_logs(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(state.queue.list_logs().await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::model::JobStatus;

    fn status_of(err: QueueError) -> (StatusCode, Option<HeaderValue>) {
        let response = ApiError::from(err).into_response();
        let retry = response.headers().get(header::RETRY_AFTER).cloned();
        (response.status(), retry)
    }

    #[test]
    fn error_kinds_map_to_statuses() {
        assert_eq!(status_of(QueueError::job_not_found(1)).0, StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(QueueError::InvalidState {
                job_id: 1,
                status: JobStatus::Finished,
                expected: JobStatus::Running,
            })
            .0,
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_of(QueueError::InvalidInput("x".into())).0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(QueueError::Database(crate::error::DatabaseError::Query("x".into()))).0,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn contention_sets_retry_after() {
        let (status, retry) = status_of(QueueError::Contention {
            worker_id: 1,
            attempts: 8,
        });
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(retry, Some(HeaderValue::from_static("1")));

        let (_, retry) = status_of(QueueError::worker_not_found(1));
        assert!(retry.is_none());
    }
}
