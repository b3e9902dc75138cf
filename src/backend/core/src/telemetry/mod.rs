//! Telemetry: Structured Logging, Distributed Tracing, and Prometheus Metrics.
//!
//! This module wires the observability stack for the Conveyor server:
//!
//! - **Logging**: JSON/pretty/compact output filtered by `RUST_LOG` or the configured level
//! - **Tracing**: Optional OTLP export of spans when an endpoint is configured
//! - **Metrics**: Prometheus recorder for job, queue and error metrics
//!
//! # Example
//!
//! ```rust,no_run
//! use conveyor_core::config::ObservabilityConfig;
//! use conveyor_core::telemetry;
//!
//! let handle = telemetry::init(&ObservabilityConfig::default()).expect("telemetry");
//! // ... run the server ...
//! handle.shutdown();
//! ```

pub mod logging;
pub mod metrics;
pub mod otel;

pub use logging::init_logging;
pub use metrics::{init_metrics, MetricsRegistry, QueueMetrics};
pub use otel::{init_otlp_tracer, shutdown_tracing};

use crate::config::ObservabilityConfig;

/// Handle to the initialized telemetry stack.
#[derive(Debug)]
pub struct TelemetryHandle {
    tracing_exported: bool,
    metrics: Option<&'static MetricsRegistry>,
}

impl TelemetryHandle {
    pub fn metrics(&self) -> Option<&'static MetricsRegistry> {
        self.metrics
    }

    pub fn is_tracing_exported(&self) -> bool {
        self.tracing_exported
    }

    /// Flush pending spans.
    pub fn shutdown(self) {
        if self.tracing_exported {
            shutdown_tracing();
        }
    }
}

/// Initialize logging, the optional OTLP exporter and the metrics recorder.
///
/// # Errors
///
/// Fails if a global subscriber or recorder is already installed, or the OTLP pipeline
/// cannot be built.
pub fn init(config: &ObservabilityConfig) -> anyhow::Result<TelemetryHandle> {
    let tracer = match config.otlp_endpoint.as_deref() {
        Some(endpoint) => Some(init_otlp_tracer(endpoint, &config.service_name)?),
        None => None,
    };
    let tracing_exported = tracer.is_some();

    init_logging(config, tracer)?;

    let metrics = if config.metrics_enabled {
        Some(init_metrics(&config.service_name)?)
    } else {
        None
    };

    tracing::info!(
        service = %config.service_name,
        format = ?config.log_format,
        otlp = tracing_exported,
        metrics = config.metrics_enabled,
        "Telemetry initialized"
    );

    Ok(TelemetryHandle {
        tracing_exported,
        metrics,
    })
}
