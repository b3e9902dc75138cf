//! Named job queues.
//!
//! A [`Queue`] is a cheap, cloneable handle: the producer side of one queue. It persists jobs
//! through the shared [`JobStore`] and wakes the local worker bound to the same queue.

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

use super::job::{JobCounts, JobDefaults, JobId, JobOptions, JobRecord, JobStatus};
use super::store::{JobStore, RemoveOutcome};
use crate::error::{ConveyorError, ErrorCode, Result};

/// Configuration for one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Maximum simultaneously active jobs
    pub concurrency: usize,
    /// Default job options
    pub defaults: JobDefaults,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            defaults: JobDefaults::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(concurrency: usize, defaults: JobDefaults) -> Self {
        Self {
            concurrency,
            defaults,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.concurrency == 0 {
            return Err(ConveyorError::new(
                ErrorCode::InvalidConfiguration,
                format!("Queue {} must have a concurrency of at least 1", name),
            ));
        }
        self.defaults.validate()
    }
}

/// Returned by a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandle {
    pub id: JobId,
    pub queue: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
}

impl From<&JobRecord> for JobHandle {
    fn from(job: &JobRecord) -> Self {
        Self {
            id: job.id,
            queue: job.queue.clone(),
            status: job.status,
            created_at: job.created_at,
            next_eligible_at: job.next_eligible_at,
        }
    }
}

struct QueueInner {
    name: String,
    config: QueueConfig,
    store: Arc<dyn JobStore>,
    notify: Notify,
}

/// A named channel of jobs with its own default policy and concurrency limit.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl fmt::Debug for Queue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("concurrency", &self.inner.config.concurrency)
            .finish()
    }
}

impl Queue {
    pub fn new(
        name: impl Into<String>,
        config: QueueConfig,
        store: Arc<dyn JobStore>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate(&name)?;
        Ok(Self {
            inner: Arc::new(QueueInner {
                name,
                config,
                store,
                notify: Notify::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn concurrency(&self) -> usize {
        self.inner.config.concurrency
    }

    pub fn defaults(&self) -> &JobDefaults {
        &self.inner.config.defaults
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.inner.store
    }

    pub(crate) fn notify(&self) -> &Notify {
        &self.inner.notify
    }

    /// Persist a new job and return once it is durably stored.
    ///
    /// Store failures are returned to the caller; nothing is dropped silently.
    pub async fn enqueue<P: Serialize>(
        &self,
        payload: P,
        options: Option<JobOptions>,
    ) -> Result<JobHandle> {
        let payload = serde_json::to_value(payload)?;
        let job = self.build(payload, options.as_ref())?;

        self.insert_new(&job).await?;
        self.enqueued(&job);
        Ok(JobHandle::from(&job))
    }

    /// Enqueue on behalf of a recurring definition.
    ///
    /// Returns `None` when a job for `recurring_id` is still waiting, delayed or active.
    pub async fn enqueue_recurring(
        &self,
        recurring_id: &str,
        payload: serde_json::Value,
        options: Option<&JobOptions>,
    ) -> Result<Option<JobHandle>> {
        let job = self.build(payload, options)?.with_recurring_id(recurring_id);

        if !self.inner.store.insert(&job).await? {
            tracing::debug!(
                queue = %self.inner.name,
                recurring_id,
                "Recurring job still pending, skipping"
            );
            return Ok(None);
        }
        self.enqueued(&job);
        Ok(Some(JobHandle::from(&job)))
    }

    /// Enqueue a fresh copy of a failed job. The failed record stays failed.
    pub async fn requeue_failed(&self, id: JobId) -> Result<JobHandle> {
        let failed = self.get(id).await?;
        if failed.status != JobStatus::Failed {
            return Err(ConveyorError::invalid_state_transition(
                failed.status,
                JobStatus::Waiting,
            ));
        }

        let policy = JobDefaults {
            max_attempts: failed.max_attempts,
            backoff: failed.backoff.clone(),
            keep_completed: failed.keep_completed,
            keep_failed: failed.keep_failed,
            max_stalled: self.defaults().max_stalled,
        };
        let mut job = JobRecord::new(&self.inner.name, failed.payload.clone(), &policy, Utc::now());
        // A retried recurring job still counts against its definition.
        job.recurring_id = failed.recurring_id.clone();

        self.insert_new(&job).await?;
        tracing::info!(
            queue = %self.inner.name,
            job_id = %job.id,
            retried_from = %failed.id,
            "Failed job re-enqueued"
        );
        self.enqueued(&job);
        Ok(JobHandle::from(&job))
    }

    /// Insert a job that must not be refused by the store.
    async fn insert_new(&self, job: &JobRecord) -> Result<()> {
        if self.inner.store.insert(job).await? {
            return Ok(());
        }
        let message = match job.recurring_id.as_deref() {
            Some(recurring_id) => format!(
                "A job for recurring id {} is still waiting, delayed or active",
                recurring_id
            ),
            None => format!("Job {} already exists", job.id),
        };
        Err(ConveyorError::new(ErrorCode::DuplicateRecord, message))
    }

    /// Look up a job belonging to this queue.
    pub async fn get(&self, id: JobId) -> Result<JobRecord> {
        match self.inner.store.get(id).await? {
            Some(job) if job.queue == self.inner.name => Ok(job),
            _ => Err(ConveyorError::job_not_found(id)),
        }
    }

    /// Remove a job that has not been claimed yet.
    pub async fn remove(&self, id: JobId) -> Result<()> {
        self.get(id).await?;
        match self.inner.store.remove(id).await? {
            RemoveOutcome::Removed => {
                tracing::info!(queue = %self.inner.name, job_id = %id, "Job removed");
                Ok(())
            }
            RemoveOutcome::NotFound => Err(ConveyorError::job_not_found(id)),
            RemoveOutcome::NotRemovable(status) => {
                Err(ConveyorError::job_not_removable(id, status))
            }
        }
    }

    pub async fn counts(&self) -> Result<JobCounts> {
        self.inner.store.counts(&self.inner.name).await
    }

    /// Jobs in this queue, newest first.
    pub async fn list(&self, status: Option<JobStatus>, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.store.list(&self.inner.name, status, limit).await
    }

    fn build(&self, payload: serde_json::Value, options: Option<&JobOptions>) -> Result<JobRecord> {
        let options = options.cloned().unwrap_or_default();
        let resolved = options.resolve(self.defaults())?;
        let job = JobRecord::new(&self.inner.name, payload, &resolved, Utc::now());
        Ok(match options.delay {
            Some(delay) => job.with_delay(delay),
            None => job,
        })
    }

    fn enqueued(&self, job: &JobRecord) {
        counter!("conveyor_jobs_enqueued_total", "queue" => self.inner.name.clone()).increment(1);
        tracing::debug!(
            queue = %self.inner.name,
            job_id = %job.id,
            status = %job.status,
            recurring_id = ?job.recurring_id,
            "Job enqueued"
        );
        self.inner.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::job::{BackoffStrategy, JobError};
    use crate::jobs::store::InMemoryJobStore;
    use serde_json::json;
    use std::time::Duration;

    fn queue(name: &str) -> Queue {
        let defaults = JobDefaults {
            max_attempts: 3,
            backoff: BackoffStrategy::exponential(Duration::from_secs(2)),
            ..Default::default()
        };
        Queue::new(
            name,
            QueueConfig::new(5, defaults),
            Arc::new(InMemoryJobStore::new()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_persists_waiting_job() {
        let queue = queue("email");
        let handle = queue
            .enqueue(json!({"to": "ops@example.com"}), None)
            .await
            .unwrap();
        assert_eq!(handle.status, JobStatus::Waiting);

        let job = queue.get(handle.id).await.unwrap();
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload["to"], "ops@example.com");
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_enqueue_options_override_defaults() {
        let queue = queue("email");
        let handle = queue
            .enqueue(
                json!({}),
                Some(
                    JobOptions::new()
                        .with_max_attempts(7)
                        .with_delay(Duration::from_secs(30)),
                ),
            )
            .await
            .unwrap();
        assert_eq!(handle.status, JobStatus::Delayed);
        assert_eq!(queue.get(handle.id).await.unwrap().max_attempts, 7);
    }

    #[tokio::test]
    async fn test_enqueue_rejects_zero_attempts() {
        let queue = queue("email");
        let err = queue
            .enqueue(json!({}), Some(JobOptions::new().with_max_attempts(0)))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidJobOptions);
    }

    #[tokio::test]
    async fn test_enqueue_surfaces_store_failure() {
        let queue = queue("email");
        queue.store().close().await;
        let err = queue.enqueue(json!({}), None).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreClosed);
    }

    #[tokio::test]
    async fn test_recurring_dedup_through_queue() {
        let queue = queue("backup");
        let first = queue
            .enqueue_recurring("daily-backup", json!({"kind": "full"}), None)
            .await
            .unwrap();
        assert!(first.is_some());
        let second = queue
            .enqueue_recurring("daily-backup", json!({"kind": "full"}), None)
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_get_scoped_to_queue() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let email = Queue::new("email", QueueConfig::default(), store.clone()).unwrap();
        let backup = Queue::new("backup", QueueConfig::default(), store).unwrap();

        let handle = email.enqueue(json!({}), None).await.unwrap();
        let err = backup.get(handle.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_requeue_requires_failed_job() {
        let queue = queue("email");
        let handle = queue.enqueue(json!({}), None).await.unwrap();
        let err = queue.requeue_failed(handle.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidStateTransition);
    }

    #[tokio::test]
    async fn test_requeue_refused_while_recurring_job_is_live() {
        let queue = queue("backup");
        let store = queue.store().clone();
        let first = queue
            .enqueue_recurring("daily-backup", json!({"kind": "full"}), None)
            .await
            .unwrap()
            .unwrap();

        // drive the first instance to terminal failure
        let failure = JobError::fatal("dump failed");
        store
            .claim("backup", 5, "w1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap()
            .unwrap();
        store.fail(first.id, "w1", &failure, Utc::now()).await.unwrap();
        assert_eq!(queue.get(first.id).await.unwrap().status, JobStatus::Failed);

        // the next tick is pending, so a retry would be a second live instance
        queue
            .enqueue_recurring("daily-backup", json!({"kind": "full"}), None)
            .await
            .unwrap()
            .unwrap();
        let err = queue.requeue_failed(first.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::DuplicateRecord);
        assert_eq!(queue.counts().await.unwrap().waiting, 1);
    }

    #[tokio::test]
    async fn test_requeue_keeps_recurring_id() {
        let queue = queue("backup");
        let store = queue.store().clone();
        let first = queue
            .enqueue_recurring("daily-backup", json!({}), None)
            .await
            .unwrap()
            .unwrap();
        store
            .claim("backup", 5, "w1", Duration::from_secs(30), Utc::now())
            .await
            .unwrap();
        store
            .fail(first.id, "w1", &JobError::fatal("dump failed"), Utc::now())
            .await
            .unwrap();

        let retried = queue.requeue_failed(first.id).await.unwrap();
        let job = queue.get(retried.id).await.unwrap();
        assert_eq!(job.recurring_id.as_deref(), Some("daily-backup"));
        assert_eq!(job.status, JobStatus::Waiting);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let err = Queue::new(
            "backup",
            QueueConfig::new(0, JobDefaults::default()),
            Arc::new(InMemoryJobStore::new()),
        )
        .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidConfiguration);
    }
}
