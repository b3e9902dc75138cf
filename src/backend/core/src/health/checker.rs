//! Health checkers for the job store and the job system.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, warn};

use super::check::{ComponentHealth, HealthStatus};
use crate::jobs::{JobCounts, JobStore, JobSystem, WorkerStatsSnapshot};
use crate::telemetry::QueueMetrics;

/// Configuration for health checks.
#[derive(Debug, Clone)]
pub struct HealthCheckConfig {
    pub timeout: Duration,
    /// Latency above which a healthy component is reported degraded
    pub latency_threshold_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            latency_threshold_ms: 100,
        }
    }
}

/// Trait for health checkers.
#[async_trait]
pub trait HealthChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> ComponentHealth;

    /// Run [`check`](Self::check) under a timeout and apply the latency threshold.
    async fn check_with_config(&self, config: &HealthCheckConfig) -> ComponentHealth {
        let start = Instant::now();

        match tokio::time::timeout(config.timeout, self.check()).await {
            Ok(mut health) => {
                if health.latency_ms.is_none() {
                    health = health.with_latency(start.elapsed());
                }
                health.check_latency_threshold(config.latency_threshold_ms);
                health
            }
            Err(_) => ComponentHealth::unhealthy(self.name())
                .with_error(format!("Health check timed out after {:?}", config.timeout))
                .with_latency(start.elapsed()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Store Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

/// Pings the job store.
pub struct StoreHealthChecker {
    store: Arc<dyn JobStore>,
}

impl StoreHealthChecker {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthChecker for StoreHealthChecker {
    fn name(&self) -> &str {
        "store"
    }

    async fn check(&self) -> ComponentHealth {
        let start = Instant::now();
        let backend = self.store.backend_name();

        match self.store.ping().await {
            Ok(()) => ComponentHealth::healthy(self.name())
                .with_message(format!("Connected to {} job store", backend))
                .with_latency(start.elapsed())
                .with_metadata("backend", backend),
            Err(e) => {
                error!(error = %e, backend, "Job store health check failed");
                ComponentHealth::unhealthy(self.name())
                    .with_error(e.to_string())
                    .with_latency(start.elapsed())
                    .with_metadata("backend", backend)
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job System Health Checker
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize)]
struct QueueHealth {
    counts: JobCounts,
    #[serde(skip_serializing_if = "Option::is_none")]
    worker: Option<WorkerStatsSnapshot>,
}

/// Reports per-queue counts and worker state, and publishes them as gauges.
///
/// Degraded when a queue has pending jobs but no worker to run them.
pub struct JobSystemHealthChecker {
    jobs: Arc<JobSystem>,
}

impl JobSystemHealthChecker {
    pub fn new(jobs: Arc<JobSystem>) -> Self {
        Self { jobs }
    }
}

#[async_trait]
impl HealthChecker for JobSystemHealthChecker {
    fn name(&self) -> &str {
        "queues"
    }

    async fn check(&self) -> ComponentHealth {
        if !self.jobs.is_running() {
            return ComponentHealth::unhealthy(self.name())
                .with_error("Job system is not running");
        }

        let counts = match self.jobs.counts().await {
            Ok(counts) => counts,
            Err(e) => {
                return ComponentHealth::unhealthy(self.name()).with_error(e.to_string());
            }
        };
        let mut workers = self.jobs.worker_stats();

        let mut queues = BTreeMap::new();
        let mut unattended = Vec::new();
        for (name, counts) in counts {
            QueueMetrics::record_counts(&name, &counts);
            let worker = workers.remove(&name);
            match &worker {
                Some(stats) => QueueMetrics::record_worker(&name, stats),
                None if counts.pending() > 0 => unattended.push(name.clone()),
                None => {}
            }
            queues.insert(name, QueueHealth { counts, worker });
        }

        let health = ComponentHealth::healthy(self.name())
            .with_metadata("queues", queues)
            .with_metadata("recurring", self.jobs.scheduler().len());

        if unattended.is_empty() {
            health.with_message("All queues with pending jobs have a worker")
        } else {
            warn!(queues = ?unattended, "Pending jobs on queues without a worker");
            health
                .downgrade(HealthStatus::Degraded)
                .with_message(format!(
                    "Pending jobs without a worker: {}",
                    unattended.join(", ")
                ))
        }
    }
}
