//! Background Job System for Conveyor.
//!
//! This module provides a durable background job system with:
//!
//! - **Jobs**: Persisted records with retry bookkeeping and fixed/exponential backoff
//! - **Store**: The atomic-claim backing store contract (Postgres or in-memory)
//! - **Queue**: Named job channels with default policy and a concurrency limit
//! - **Worker**: Concurrency-bounded, lease-holding execution with panic isolation
//! - **Scheduler**: Cron-triggered recurring jobs, deduplicated by a stable id
//! - **System**: The lifecycle coordinator that starts and drains everything
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                                JobSystem                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  Scheduler  │───▶│    Queue    │───▶│  JobStore   │◀───│   Worker    │  │
//! │  │   (cron)    │    │  (enqueue)  │    │ (PG / mem)  │    │  (claim +   │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    │   handler)  │  │
//! │                            ▲                              └──────┬──────┘  │
//! │                            │ HTTP / producers                    │         │
//! │                                                           ┌──────▼──────┐  │
//! │                                                           │  Handler    │  │
//! │                                                           │  Registry   │  │
//! │                                                           └─────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::jobs::{handler_fn, InMemoryJobStore, JobError, JobSystem};
//!
//! let system = JobSystem::new(&config.jobs, Arc::new(InMemoryJobStore::new()))?;
//! system.register_handler("email", handler_fn(|ctx| async move {
//!     let email: SendEmail = ctx.payload()?;
//!     mailer.send(&email).await.map_err(|e| JobError::retryable(e.to_string()))
//! }))?;
//! system.start()?;
//!
//! system.queue("email")?.enqueue(SendEmail::new("ops@example.com", "Hi"), None).await?;
//!
//! system.shutdown(Duration::from_secs(30)).await?;
//! ```

pub mod job;
pub mod store;
pub mod handler;
pub mod queue;
pub mod worker;
pub mod scheduler;
pub mod system;

pub use job::{
    BackoffStrategy, JobCounts, JobDefaults, JobError, JobId, JobOptions, JobRecord, JobResult,
    JobStatus,
};
pub use store::{InMemoryJobStore, JobStore, RemoveOutcome};
pub use handler::{handler_fn, FnHandler, HandlerRegistry, JobContext, JobHandler};
pub use queue::{JobHandle, Queue, QueueConfig};
pub use worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStats, WorkerStatsSnapshot};
pub use scheduler::{
    CronSchedule, JobScheduler, RecurringJob, RecurringJobInfo, Registration, SchedulerConfig,
    TickOutcome,
};
pub use system::JobSystem;

// Built-in payloads and handlers
mod builtin;
pub use builtin::{
    register_builtin_handlers, BackupKind, DatabaseBackup, DatabaseBackupHandler,
    MaintenanceHandler, MaintenanceKind, MaintenanceTask, SendEmail, SendEmailHandler,
    BACKUP_QUEUE, EMAIL_QUEUE, MAINTENANCE_QUEUE,
};
