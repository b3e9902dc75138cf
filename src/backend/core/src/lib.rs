#![allow(clippy::result_large_err)]
//! # Conveyor Core
//!
//! Durable background jobs for a web backend.
//!
//! ## Architecture
//!
//! - **Jobs**: Queues, workers, retry with backoff, stall recovery and cron-driven recurring jobs
//! - **Store**: PostgreSQL-backed job state with atomic claims, or an in-memory store for tests
//! - **API**: REST surface for enqueueing and inspecting jobs
//! - **Health**: Store and queue health with Kubernetes-style probes
//! - **Telemetry**: Structured logging, optional OTLP tracing and Prometheus metrics

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod jobs;
pub mod telemetry;

pub use error::{ConveyorError, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, JobsConfig};
    pub use crate::error::{ConveyorError, ErrorCode, ErrorContext, Result};
    pub use crate::jobs::{
        handler_fn, BackoffStrategy, InMemoryJobStore, JobContext, JobError, JobHandle,
        JobHandler, JobId, JobOptions, JobResult, JobStatus, JobStore, JobSystem, Queue,
        QueueConfig, RecurringJob,
    };
}
