//! REST API for Conveyor.
//!
//! - `/health`, `/health/ready`, `/health/live`: health report and probes
//! - `/metrics`: Prometheus exposition
//! - `/api/v1/...`: queue inspection, enqueue, job inspection, removal and retry, recurring
//!   definitions
//!
//! Every `/api/v1` response uses the [`ApiResponse`] envelope; errors render through
//! `IntoResponse for ConveyorError`.

mod handlers;

use axum::{
    extract::FromRef,
    routing::{get, post},
    Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::health::{self, HealthService};
use crate::jobs::JobSystem;

pub use handlers::{EnqueueRequest, ListJobsQuery, QueueSummary, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobSystem>,
    pub health: Arc<HealthService>,
}

impl AppState {
    pub fn new(jobs: Arc<JobSystem>, health: Arc<HealthService>) -> Self {
        Self { jobs, health }
    }
}

impl FromRef<AppState> for Arc<HealthService> {
    fn from_ref(state: &AppState) -> Self {
        state.health.clone()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health::health_check))
        .route("/health/ready", get(health::readiness_check))
        .route("/health/live", get(health::liveness_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/queues", get(handlers::list_queues))
        .route("/queues/:queue", get(handlers::get_queue))
        .route(
            "/queues/:queue/jobs",
            get(handlers::list_jobs).post(handlers::enqueue_job),
        )
        .route(
            "/jobs/:id",
            get(handlers::get_job).delete(handlers::delete_job),
        )
        .route("/jobs/:id/retry", post(handlers::retry_job))
        .route("/recurring", get(handlers::list_recurring))
        .route(
            "/recurring/:id",
            get(handlers::get_recurring).delete(handlers::delete_recurring),
        )
}

/// Standard API response envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            error_code: None,
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            error_code: Some(code.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("queued");
        assert!(response.success);
        assert_eq!(response.data, Some("queued"));
        assert!(response.error.is_none());
    }

    #[test]
    fn test_api_response_error_skips_data() {
        let response: ApiResponse<()> = ApiResponse::error_with_code("nope", "JOB_NOT_FOUND");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert!(json.get("data").is_none());
        assert_eq!(json["error_code"], "JOB_NOT_FOUND");
    }
}
