//! Health check definitions and status types.
//!
//! - **Healthy**: Component is fully operational
//! - **Degraded**: Component works but needs attention (slow store, queue without a worker)
//! - **Unhealthy**: Component is not operational

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub(crate) const SERVICE_NAME: &str = "conveyor";

// ═══════════════════════════════════════════════════════════════════════════════
// Health Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Health status of a component or the whole process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Healthy or degraded.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }

    /// Combine two statuses, returning the worse one.
    pub fn combine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    pub fn to_http_status(&self) -> u16 {
        match self {
            Self::Healthy | Self::Degraded => 200,
            Self::Unhealthy => 503,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Component Health
// ═══════════════════════════════════════════════════════════════════════════════

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
    /// Only present when unhealthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentHealth {
    fn with_initial_status(name: impl Into<String>, status: HealthStatus) -> Self {
        Self {
            name: name.into(),
            status,
            message: None,
            latency_ms: None,
            checked_at: Utc::now(),
            metadata: BTreeMap::new(),
            error: None,
        }
    }

    pub fn healthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Healthy)
    }

    pub fn degraded(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Degraded)
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self::with_initial_status(name, HealthStatus::Unhealthy)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(latency.as_millis() as u64);
        self
    }

    /// Add an error message (sets status to Unhealthy).
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.status = HealthStatus::Unhealthy;
        self.error = Some(error.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.metadata.insert(key.into(), v);
        }
        self
    }

    /// Worsen the status; never improves it.
    pub fn downgrade(mut self, status: HealthStatus) -> Self {
        self.status = self.status.combine(status);
        self
    }

    /// Mark a healthy component degraded when its latency exceeds `threshold_ms`.
    pub fn check_latency_threshold(&mut self, threshold_ms: u64) {
        if let Some(latency) = self.latency_ms {
            if latency > threshold_ms && self.status == HealthStatus::Healthy {
                self.status = HealthStatus::Degraded;
                self.message = Some(format!(
                    "High latency detected: {}ms (threshold: {}ms)",
                    latency, threshold_ms
                ));
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Health Report
// ═══════════════════════════════════════════════════════════════════════════════

/// Aggregated health report for the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst component status
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub components: Vec<ComponentHealth>,
    pub summary: HealthSummary,
}

impl HealthReport {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Healthy,
            service: SERVICE_NAME.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            uptime_secs: None,
            components: Vec::new(),
            summary: HealthSummary::default(),
        }
    }

    pub fn with_component(self, component: ComponentHealth) -> Self {
        self.with_components(vec![component])
    }

    pub fn with_components(mut self, components: Vec<ComponentHealth>) -> Self {
        for component in components {
            self.status = self.status.combine(component.status);
            self.summary.record(component.status);
            self.components.push(component);
        }
        self
    }

    pub fn with_uptime(mut self, uptime: Duration) -> Self {
        self.uptime_secs = Some(uptime.as_secs());
        self
    }

    pub fn is_operational(&self) -> bool {
        self.status.is_operational()
    }

    pub fn get_component(&self, name: &str) -> Option<&ComponentHealth> {
        self.components.iter().find(|c| c.name == name)
    }
}

impl Default for HealthReport {
    fn default() -> Self {
        Self::new()
    }
}

/// Component counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
}

impl HealthSummary {
    fn record(&mut self, status: HealthStatus) {
        self.total += 1;
        match status {
            HealthStatus::Healthy => self.healthy += 1,
            HealthStatus::Degraded => self.degraded += 1,
            HealthStatus::Unhealthy => self.unhealthy += 1,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Probes
// ═══════════════════════════════════════════════════════════════════════════════

/// Liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessResponse {
    pub alive: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
}

impl LivenessResponse {
    pub fn alive() -> Self {
        Self {
            alive: true,
            service: SERVICE_NAME.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Readiness probe response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    pub service: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unready_components: Vec<String>,
}

impl ReadinessResponse {
    pub fn from_health_report(report: &HealthReport) -> Self {
        let unready: Vec<String> = report
            .components
            .iter()
            .filter(|c| !c.status.is_operational())
            .map(|c| c.name.clone())
            .collect();

        Self {
            ready: unready.is_empty(),
            service: report.service.clone(),
            timestamp: Utc::now(),
            reason: (!unready.is_empty())
                .then(|| "One or more components are unhealthy".to_string()),
            unready_components: unready,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_combine() {
        assert_eq!(
            HealthStatus::Healthy.combine(HealthStatus::Degraded),
            HealthStatus::Degraded
        );
        assert_eq!(
            HealthStatus::Degraded.combine(HealthStatus::Unhealthy),
            HealthStatus::Unhealthy
        );
        assert_eq!(
            HealthStatus::Healthy.combine(HealthStatus::Healthy),
            HealthStatus::Healthy
        );
    }

    #[test]
    fn test_report_aggregation() {
        let report = HealthReport::new()
            .with_component(ComponentHealth::healthy("store"))
            .with_component(ComponentHealth::degraded("queues"));

        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.summary.total, 2);
        assert_eq!(report.summary.degraded, 1);
        assert!(report.is_operational());
        assert!(report.get_component("store").is_some());
    }

    #[test]
    fn test_latency_threshold_degrades_healthy_only() {
        let mut slow = ComponentHealth::healthy("store").with_latency(Duration::from_millis(250));
        slow.check_latency_threshold(100);
        assert_eq!(slow.status, HealthStatus::Degraded);

        let mut down = ComponentHealth::unhealthy("store").with_latency(Duration::from_millis(250));
        down.check_latency_threshold(100);
        assert_eq!(down.status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_readiness_from_unhealthy_report() {
        let report = HealthReport::new()
            .with_component(ComponentHealth::healthy("queues"))
            .with_component(ComponentHealth::unhealthy("store").with_error("connection refused"));
        let readiness = ReadinessResponse::from_health_report(&report);
        assert!(!readiness.ready);
        assert_eq!(readiness.unready_components, vec!["store".to_string()]);
        assert_eq!(report.status.to_http_status(), 503);
    }
}
