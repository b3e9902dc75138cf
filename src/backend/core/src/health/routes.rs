//! Health check HTTP routes

use super::{HealthService, LivenessResponse, ReadinessResponse};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use std::sync::Arc;

/// GET /health - Full report
pub async fn health_check(State(service): State<Arc<HealthService>>) -> impl IntoResponse {
    let report = service.check_health().await;
    let status = if report.is_operational() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

/// GET /health/ready - Readiness probe
pub async fn readiness_check(State(service): State<Arc<HealthService>>) -> impl IntoResponse {
    let report = service.check_health().await;
    let response = ReadinessResponse::from_health_report(&report);
    let status = if response.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(response))
}

/// GET /health/live - Liveness probe
pub async fn liveness_check() -> impl IntoResponse {
    (StatusCode::OK, Json(LivenessResponse::alive()))
}
