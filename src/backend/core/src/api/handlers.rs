//! API request handlers.
//!
//! All handlers return `Result<impl IntoResponse, ConveyorError>` so that errors are converted
//! to the right HTTP status by the `IntoResponse` implementation on `ConveyorError`.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};

use super::{ApiResponse, AppState};
use crate::error::{ConveyorError, Result};
use crate::jobs::{JobCounts, JobDefaults, JobId, JobOptions, JobStatus, Queue, WorkerStatsSnapshot};
use crate::telemetry::MetricsRegistry;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

// ═══════════════════════════════════════════════════════════════════════════════
// Queues
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueSummary {
    pub name: String,
    pub concurrency: usize,
    pub defaults: JobDefaults,
    pub counts: JobCounts,
    pub has_handler: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<WorkerStatsSnapshot>,
}

async fn summarize(state: &AppState, queue: &Queue) -> Result<QueueSummary> {
    Ok(QueueSummary {
        name: queue.name().to_string(),
        concurrency: queue.concurrency(),
        defaults: queue.defaults().clone(),
        counts: queue.counts().await?,
        has_handler: state.jobs.has_handler(queue.name()),
        worker: state.jobs.worker_stats().remove(queue.name()),
    })
}

pub async fn list_queues(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let mut summaries = Vec::new();
    for queue in state.jobs.queues() {
        summaries.push(summarize(&state, queue).await?);
    }
    Ok(Json(ApiResponse::success(summaries)))
}

pub async fn get_queue(
    State(state): State<AppState>,
    Path(queue): Path<String>,
) -> Result<impl IntoResponse> {
    let queue = state.jobs.queue(&queue)?;
    Ok(Json(ApiResponse::success(summarize(&state, queue).await?)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub options: Option<JobOptions>,
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse> {
    let handle = state.jobs.queue(&queue)?.enqueue(req.payload, req.options).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(handle))))
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn list_jobs(
    State(state): State<AppState>,
    Path(queue): Path<String>,
    Query(query): Query<ListJobsQuery>,
) -> Result<impl IntoResponse> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<JobStatus>)
        .transpose()?;
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    let jobs = state.jobs.queue(&queue)?.list(status, limit).await?;
    Ok(Json(ApiResponse::success(jobs)))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let job = state.jobs.job(id.parse()?).await?;
    Ok(Json(ApiResponse::success(job)))
}

pub async fn delete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let id: JobId = id.parse()?;
    state.jobs.remove_job(id).await?;
    Ok(Json(ApiResponse::success(serde_json::json!({
        "id": id,
        "removed": true
    }))))
}

pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let handle = state.jobs.retry_job(id.parse()?).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(handle))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recurring
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn list_recurring(State(state): State<AppState>) -> Result<impl IntoResponse> {
    Ok(Json(ApiResponse::success(
        state.jobs.scheduler().definitions(),
    )))
}

pub async fn get_recurring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let info = state
        .jobs
        .scheduler()
        .get(&id)
        .ok_or_else(|| ConveyorError::recurring_job_not_found(&id))?;
    Ok(Json(ApiResponse::success(info)))
}

/// Stop firing a definition until the next restart re-registers it from configuration.
pub async fn delete_recurring(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    if !state.jobs.scheduler().unregister(&id) {
        return Err(ConveyorError::recurring_job_not_found(&id));
    }
    Ok(Json(ApiResponse::success(serde_json::json!({
        "id": id,
        "removed": true
    }))))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn prometheus_metrics() -> Result<impl IntoResponse> {
    let body = MetricsRegistry::global()
        .map(MetricsRegistry::render)
        .ok_or_else(|| ConveyorError::not_found("Metrics", "prometheus"))?;

    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    ))
}
