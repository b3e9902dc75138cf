//! Handler contract and registry.
//!
//! Handlers are registered explicitly per queue before the job system starts. A worker
//! looks its handler up once, at spawn time.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::job::{JobError, JobId, JobRecord, JobResult};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a handler for one execution attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    job: Arc<JobRecord>,
}

impl JobContext {
    pub fn new(job: JobRecord) -> Self {
        Self { job: Arc::new(job) }
    }

    /// Get the job ID.
    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    /// The current attempt number (1-indexed).
    pub fn attempt(&self) -> u32 {
        self.job.attempts_made + 1
    }

    pub fn max_attempts(&self) -> u32 {
        self.job.max_attempts
    }

    /// True when a failure of this attempt is terminal.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt() >= self.job.max_attempts
    }

    pub fn recurring_id(&self) -> Option<&str> {
        self.job.recurring_id.as_deref()
    }

    /// Snapshot of the job as claimed.
    pub fn job(&self) -> &JobRecord {
        &self.job
    }

    pub fn raw_payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Decode the payload. A payload that does not fit `T` will never succeed, so the
    /// error is fatal.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, JobError> {
        serde_json::from_value(self.job.payload.clone()).map_err(|e| {
            JobError::fatal(format!("invalid payload for queue {}: {}", self.job.queue, e))
                .with_code("INVALID_PAYLOAD")
        })
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        tracing::info!(
            job_id = %self.job.id,
            queue = %self.job.queue,
            attempt = self.attempt(),
            message
        );
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        tracing::warn!(
            job_id = %self.job.id,
            queue = %self.job.queue,
            attempt = self.attempt(),
            message
        );
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        tracing::error!(
            job_id = %self.job.id,
            queue = %self.job.queue,
            attempt = self.attempt(),
            message
        );
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handler Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Executes the jobs of one queue.
///
/// Return `JobError::retryable()` for transient failures that should be retried under the
/// queue's backoff, and `JobError::fatal()` for failures that no retry can fix. Panics are
/// caught by the worker and treated as retryable failures.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext) -> JobResult;
}

/// Handler built from an async closure. See [`handler_fn`].
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a [`JobHandler`].
///
/// ```rust,ignore
/// system.register_handler("email", handler_fn(|ctx| async move {
///     let email: SendEmail = ctx.payload()?;
///     mailer.send(email).await.map_err(|e| JobError::retryable(e.to_string()))
/// }))?;
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = JobResult> + Send + 'static,
{
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        (self.f)(ctx.clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════════════

/// Mapping from queue name to handler.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `queue`. Returns the replaced handler.
    pub fn insert(
        &mut self,
        queue: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Option<Arc<dyn JobHandler>> {
        self.handlers.insert(queue.into(), handler)
    }

    pub fn get(&self, queue: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(queue).cloned()
    }

    pub fn contains(&self, queue: &str) -> bool {
        self.handlers.contains_key(queue)
    }

    pub fn queues(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut queues: Vec<&str> = self.queues().collect();
        queues.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("queues", &queues)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::JobDefaults;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize)]
    struct Greeting {
        name: String,
    }

    fn context(payload: serde_json::Value) -> JobContext {
        JobContext::new(JobRecord::new("email", payload, &JobDefaults::default(), Utc::now()))
    }

    #[test]
    fn test_payload_decode() {
        let ctx = context(json!({"name": "conveyor"}));
        let greeting: Greeting = ctx.payload().unwrap();
        assert_eq!(greeting.name, "conveyor");
        assert_eq!(ctx.attempt(), 1);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn test_payload_mismatch_is_fatal() {
        let ctx = context(json!({"nom": 1}));
        let err = ctx.payload::<Greeting>().unwrap_err();
        assert!(!err.retryable);
        assert_eq!(err.code.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[tokio::test]
    async fn test_handler_fn_and_registry() {
        let mut registry = HandlerRegistry::new();
        registry.insert(
            "email",
            Arc::new(handler_fn(|ctx: JobContext| async move {
                if ctx.attempt() == 1 {
                    Err(JobError::retryable("first attempt fails"))
                } else {
                    Ok(())
                }
            })),
        );

        assert!(registry.contains("email"));
        assert!(registry.get("backup").is_none());

        let handler = registry.get("email").unwrap();
        assert!(handler.handle(&context(json!({}))).await.is_err());
    }
}
