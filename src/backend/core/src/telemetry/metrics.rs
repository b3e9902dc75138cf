//! Prometheus metrics for jobs, queues and errors.
//!
//! Counters and histograms are recorded where the events happen (worker, queue, error
//! construction); this module installs the recorder, describes every series and exposes
//! the gauge helpers used by the health checks.

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

use crate::jobs::{JobCounts, JobStatus, WorkerStatsSnapshot};

static METRICS_REGISTRY: OnceLock<MetricsRegistry> = OnceLock::new();

/// Histogram buckets for job execution time, in seconds.
const JOB_DURATION_BUCKETS: &[f64] = &[
    0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0, 300.0, 1800.0,
];

/// Global metrics registry holding the Prometheus handle.
pub struct MetricsRegistry {
    prometheus_handle: PrometheusHandle,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    /// The installed registry, if [`init_metrics`] ran.
    pub fn global() -> Option<&'static MetricsRegistry> {
        METRICS_REGISTRY.get()
    }

    /// Render metrics in the Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle.render()
    }
}

/// Install the Prometheus recorder and describe the Conveyor metrics.
///
/// Calling it again returns the registry installed the first time.
///
/// # Errors
///
/// Returns an error if another recorder is already installed.
pub fn init_metrics(service_name: &str) -> anyhow::Result<&'static MetricsRegistry> {
    if let Some(registry) = METRICS_REGISTRY.get() {
        return Ok(registry);
    }

    let handle = PrometheusBuilder::new()
        .add_global_label("service", service_name)
        .set_buckets_for_metric(
            Matcher::Full("conveyor_job_duration_seconds".to_string()),
            JOB_DURATION_BUCKETS,
        )?
        .install_recorder()?;

    register_metric_descriptions();

    let registry = METRICS_REGISTRY.get_or_init(|| MetricsRegistry {
        prometheus_handle: handle,
    });
    tracing::info!(service_name, "Metrics initialized");
    Ok(registry)
}

fn register_metric_descriptions() {
    describe_counter!(
        "conveyor_jobs_enqueued_total",
        "Jobs added to a queue, including recurring firings"
    );
    describe_counter!(
        "conveyor_jobs_completed_total",
        "Job executions that completed successfully"
    );
    describe_counter!(
        "conveyor_jobs_failed_total",
        "Job executions that failed, labelled by whether the failure was terminal"
    );
    describe_counter!(
        "conveyor_jobs_stalled_total",
        "Jobs recovered after their lease expired"
    );
    describe_histogram!(
        "conveyor_job_duration_seconds",
        metrics::Unit::Seconds,
        "Handler execution time"
    );
    describe_gauge!(
        "conveyor_queue_jobs",
        "Jobs per queue and status, sampled by the health check"
    );
    describe_gauge!(
        "conveyor_worker_active_jobs",
        "Jobs currently executing per queue"
    );
    describe_counter!(
        "conveyor_errors_total",
        "Errors raised, labelled by error code"
    );
}

/// Gauge helpers for queue state.
pub struct QueueMetrics;

impl QueueMetrics {
    /// Publish a count snapshot as `conveyor_queue_jobs{queue, status}`.
    pub fn record_counts(queue: &str, counts: &JobCounts) {
        for status in JobStatus::ALL {
            gauge!(
                "conveyor_queue_jobs",
                "queue" => queue.to_string(),
                "status" => status.as_str()
            )
            .set(counts.get(status) as f64);
        }
    }

    pub fn record_worker(queue: &str, stats: &WorkerStatsSnapshot) {
        gauge!("conveyor_worker_active_jobs", "queue" => queue.to_string())
            .set(stats.active as f64);
    }
}

