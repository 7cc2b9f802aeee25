use axum::{
    extract::{DefaultBodyLimit, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::{
    auth::ApiKey,
    models::{CacheState, ImportAcceptedResponse, ImportRequest, JobRecord, JobState},
    queue::QueuedTask,
    AppState,
};

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        })),
    )
        .into_response()
}

fn job_not_found() -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        "JOB_NOT_FOUND",
        "Import job not found.",
    )
}

fn queue_unavailable() -> Response {
    error_response(
        StatusCode::SERVICE_UNAVAILABLE,
        "QUEUE_UNAVAILABLE",
        "Import queue is unavailable.",
    )
}

pub fn router(state: AppState) -> Router {
    let body_limit = DefaultBodyLimit::max(state.config.max_body_bytes);
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/imports", post(create_import).layer(body_limit))
        .route("/v1/imports/{job_id}", get(get_import))
        .route("/v1/imports/{job_id}/cache", post(request_cache))
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn create_import(
    State(state): State<AppState>,
    _: ApiKey,
    Json(payload): Json<ImportRequest>,
) -> impl IntoResponse {
    if payload.source_file_name.trim().is_empty()
        || payload.source_file_id.trim().is_empty()
        || payload.files.is_empty()
    {
        return error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_IMPORT_REQUEST",
            "Request must include sourceFileName, sourceFileId and at least one file.",
        );
    }

    let job_id = Uuid::new_v4().to_string();
    let record = JobRecord::queued(job_id.clone(), payload);
    let created_at = record.created_at;

    {
        let mut jobs = state.jobs.write().await;
        jobs.insert(job_id.clone(), record);
    }

    if state
        .queue_tx
        .send(QueuedTask::Import(job_id.clone()))
        .await
        .is_err()
    {
        let mut jobs = state.jobs.write().await;
        jobs.remove(&job_id);
        return queue_unavailable();
    }

    let response = ImportAcceptedResponse {
        job_id,
        status: JobState::Queued,
        message: Some("Queued for import".to_string()),
        created_at,
    };

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

pub async fn get_import(
    State(state): State<AppState>,
    _: ApiKey,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let jobs = state.jobs.read().await;
    let Some(job) = jobs.get(&job_id) else {
        return job_not_found();
    };

    (StatusCode::OK, Json(job.to_response())).into_response()
}

pub async fn request_cache(
    State(state): State<AppState>,
    _: ApiKey,
    Path(job_id): Path<String>,
) -> impl IntoResponse {
    let response = {
        let mut jobs = state.jobs.write().await;
        let Some(job) = jobs.get_mut(&job_id) else {
            return job_not_found();
        };

        if !matches!(job.status, JobState::Completed) || job.output.is_none() {
            return error_response(
                StatusCode::CONFLICT,
                "IMPORT_NOT_COMPLETE",
                "Import must complete before its cache can be built.",
            );
        }

        match job.cache_state {
            CacheState::Queued | CacheState::Running => {
                return (StatusCode::ACCEPTED, Json(job.to_response())).into_response();
            }
            CacheState::Completed => {
                return (StatusCode::OK, Json(job.to_response())).into_response();
            }
            CacheState::NotRequested | CacheState::Failed => {}
        }

        job.cache_state = CacheState::Queued;
        job.updated_at = Utc::now();
        job.to_response()
    };

    if state
        .queue_tx
        .send(QueuedTask::Cache(job_id.clone()))
        .await
        .is_err()
    {
        let mut jobs = state.jobs.write().await;
        if let Some(job) = jobs.get_mut(&job_id) {
            job.cache_state = CacheState::Failed;
        }
        return queue_unavailable();
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}
