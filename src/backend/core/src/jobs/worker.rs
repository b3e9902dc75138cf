//! Job worker for concurrent job execution.
//!
//! One worker runs per queue per process. It claims eligible jobs from the store, runs the
//! queue's handler under a lease that is renewed while the handler runs, and records the
//! outcome. A semaphore bounds local concurrency; the store's claim bounds it globally.

use chrono::Utc;
use futures::FutureExt;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::handler::{JobContext, JobHandler};
use super::job::{JobError, JobRecord, JobResult, JobStatus};
use super::queue::Queue;

/// Configuration for job workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Fallback poll interval when no enqueue notification arrives
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// How long a claim stays valid without a heartbeat
    #[serde(with = "humantime_serde")]
    pub lease_duration: Duration,
    /// How often expired leases are swept
    #[serde(with = "humantime_serde")]
    pub stall_check_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_duration: Duration::from_secs(30),
            stall_check_interval: Duration::from_secs(15),
        }
    }
}

impl WorkerConfig {
    /// Heartbeats renew the lease three times per lease period.
    pub fn heartbeat_interval(&self) -> Duration {
        (self.lease_duration / 3).max(Duration::from_millis(10))
    }
}

/// Statistics for a job worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Executions finished (any outcome)
    pub processed: Arc<AtomicU64>,
    pub succeeded: Arc<AtomicU64>,
    /// Terminal failures
    pub failed: Arc<AtomicU64>,
    /// Failures rescheduled with backoff
    pub retried: Arc<AtomicU64>,
    /// Jobs recovered from expired leases
    pub stalled: Arc<AtomicU64>,
    /// Currently executing
    pub active: Arc<AtomicUsize>,
}

impl WorkerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn retried(&self) -> u64 {
        self.retried.load(Ordering::Relaxed)
    }

    pub fn stalled(&self) -> u64 {
        self.stalled.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            processed: self.processed(),
            succeeded: self.succeeded(),
            failed: self.failed(),
            retried: self.retried(),
            stalled: self.stalled(),
            active: self.active(),
        }
    }
}

/// Serializable copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStatsSnapshot {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub stalled: u64,
    pub active: usize,
}

/// Handle for controlling a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: String,
    queue: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
    stats: WorkerStats,
}

impl WorkerHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Stop claiming new jobs. In-flight jobs keep running.
    pub fn stop(&self) {
        self.cancel.cancel();
        self.tracker.close();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait for the loop and every in-flight job to finish. Returns false on timeout.
    pub async fn wait(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tracker.wait()).await.is_ok()
    }

    /// Jobs currently executing.
    pub fn active(&self) -> usize {
        self.stats.active()
    }

    /// Get worker statistics.
    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }
}

/// Job worker that processes jobs from one queue.
pub struct JobWorker {
    id: String,
    queue: Queue,
    handler: Arc<dyn JobHandler>,
    config: WorkerConfig,
    stats: WorkerStats,
}

impl JobWorker {
    /// Create a new job worker.
    pub fn new(queue: Queue, handler: Arc<dyn JobHandler>, config: WorkerConfig) -> Self {
        let id = format!("{}:{}", queue.name(), Uuid::new_v4().simple());
        Self {
            id,
            queue,
            handler,
            config,
            stats: WorkerStats::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the worker, returning a handle for control.
    pub fn start(self) -> WorkerHandle {
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let handle = WorkerHandle {
            id: self.id.clone(),
            queue: self.queue.name().to_string(),
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            stats: self.stats.clone(),
        };

        // The loop is tracked too, so `wait` also covers jobs it spawns while stopping.
        let worker = Arc::new(self);
        tracker.spawn(worker.run(cancel, tracker.clone()));
        handle
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken, tracker: TaskTracker) {
        let semaphore = Arc::new(Semaphore::new(self.queue.concurrency()));
        let mut stall_check = tokio::time::interval(self.config.stall_check_interval);
        stall_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            worker = %self.id,
            queue = %self.queue.name(),
            concurrency = self.queue.concurrency(),
            "Job worker started"
        );

        loop {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = stall_check.tick() => {
                    self.recover_stalled().await;
                    continue;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            if cancel.is_cancelled() {
                break;
            }
            let claim = self.queue.store().claim(
                self.queue.name(),
                self.queue.concurrency(),
                &self.id,
                self.config.lease_duration,
                Utc::now(),
            );
            // A claim that has already returned wins; an unfinished one is dropped on stop,
            // which rolls back its transaction.
            let claimed = tokio::select! {
                biased;
                claimed = claim => claimed,
                _ = cancel.cancelled() => break,
            };

            match claimed {
                Ok(Some(job)) => {
                    let worker = self.clone();
                    tracker.spawn(async move {
                        worker.execute(job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    e.log();
                    warn!(worker = %self.id, queue = %self.queue.name(), error = %e, "Failed to claim job");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.queue.notify().notified() => {}
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }

        info!(worker = %self.id, queue = %self.queue.name(), "Job worker stopped claiming");
    }

    async fn execute(&self, job: JobRecord) {
        let span = info_span!(
            "job",
            queue = %job.queue,
            job_id = %job.id,
            attempt = job.attempts_made + 1,
            worker = %self.id,
        );
        self.execute_inner(job).instrument(span).await
    }

    async fn execute_inner(&self, job: JobRecord) {
        self.stats.active.fetch_add(1, Ordering::AcqRel);
        let started = Instant::now();
        debug!("Job started");

        let result = self.run_handler(&job).await;
        let elapsed = started.elapsed();
        self.record_outcome(&job, result).await;

        histogram!("conveyor_job_duration_seconds", "queue" => job.queue.clone())
            .record(elapsed.as_secs_f64());
        self.stats.processed.fetch_add(1, Ordering::Relaxed);
        self.stats.active.fetch_sub(1, Ordering::AcqRel);
    }

    /// Run the handler to completion, renewing the lease while it runs.
    async fn run_handler(&self, job: &JobRecord) -> JobResult {
        let ctx = JobContext::new(job.clone());
        let handler = self.handler.clone();
        let run = AssertUnwindSafe(async move { handler.handle(&ctx).await }).catch_unwind();
        tokio::pin!(run);

        let period = self.config.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .store()
                        .heartbeat(job.id, &self.id, self.config.lease_duration, Utc::now())
                        .await
                    {
                        Ok(true) => {}
                        Ok(false) => warn!("Job lease lost; the job may run again elsewhere"),
                        Err(e) => warn!(error = %e, "Failed to renew job lease"),
                    }
                }
            }
        };

        outcome.unwrap_or_else(|panic| {
            Err(JobError::retryable(format!(
                "handler panicked: {}",
                panic_message(&*panic)
            )))
        })
    }

    async fn record_outcome(&self, job: &JobRecord, result: JobResult) {
        let store = self.queue.store();
        let queue = job.queue.clone();

        match result {
            Ok(()) => match store.complete(job.id, &self.id, Utc::now()).await {
                Ok(Some(done)) => {
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    counter!("conveyor_jobs_completed_total", "queue" => queue).increment(1);
                    info!(attempts = done.attempts_made, "Job completed");
                    self.trim(JobStatus::Completed, done.keep_completed).await;
                }
                Ok(None) => warn!("Job finished after its lease expired; result discarded"),
                Err(e) => {
                    e.log();
                    error!(error = %e, "Failed to mark job completed");
                }
            },
            Err(job_error) => match store.fail(job.id, &self.id, &job_error, Utc::now()).await {
                Ok(Some(updated)) if updated.status == JobStatus::Failed => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    counter!("conveyor_jobs_failed_total", "queue" => queue, "terminal" => "true")
                        .increment(1);
                    error!(
                        attempts = updated.attempts_made,
                        max_attempts = updated.max_attempts,
                        error = %job_error,
                        "Job failed permanently"
                    );
                    self.trim(JobStatus::Failed, updated.keep_failed).await;
                }
                Ok(Some(updated)) => {
                    self.stats.retried.fetch_add(1, Ordering::Relaxed);
                    counter!("conveyor_jobs_failed_total", "queue" => queue, "terminal" => "false")
                        .increment(1);
                    warn!(
                        attempts = updated.attempts_made,
                        max_attempts = updated.max_attempts,
                        retry_at = %updated.next_eligible_at,
                        error = %job_error,
                        "Job failed, retry scheduled"
                    );
                }
                Ok(None) => warn!(error = %job_error, "Job failed after its lease expired"),
                Err(e) => {
                    e.log();
                    error!(error = %e, "Failed to record job failure");
                }
            },
        }
    }

    async fn recover_stalled(&self) {
        let recovered = match self
            .queue
            .store()
            .recover_stalled(self.queue.name(), self.queue.defaults().max_stalled, Utc::now())
            .await
        {
            Ok(recovered) => recovered,
            Err(e) => {
                warn!(worker = %self.id, queue = %self.queue.name(), error = %e, "Stall check failed");
                return;
            }
        };

        let mut failed = false;
        for job in &recovered {
            self.stats.stalled.fetch_add(1, Ordering::Relaxed);
            counter!("conveyor_jobs_stalled_total", "queue" => job.queue.clone()).increment(1);
            warn!(
                queue = %job.queue,
                job_id = %job.id,
                stalled_count = job.stalled_count,
                status = %job.status,
                "Recovered stalled job"
            );
            if job.status == JobStatus::Failed {
                failed = true;
            }
        }

        if failed {
            self.trim(JobStatus::Failed, self.queue.defaults().keep_failed)
                .await;
        }
        if !recovered.is_empty() {
            self.queue.notify().notify_one();
        }
    }

    async fn trim(&self, status: JobStatus, keep: u32) {
        match self.queue.store().trim(self.queue.name(), status, keep).await {
            Ok(0) => {}
            Ok(removed) => debug!(status = %status, removed, keep, "Trimmed job history"),
            Err(e) => warn!(status = %status, error = %e, "Failed to trim job history"),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::job::{BackoffStrategy, JobDefaults};
    use crate::jobs::queue::QueueConfig;
    use crate::jobs::store::{InMemoryJobStore, JobStore};
    use serde_json::json;

    fn fast_config() -> WorkerConfig {
        WorkerConfig {
            poll_interval: Duration::from_millis(10),
            lease_duration: Duration::from_millis(300),
            stall_check_interval: Duration::from_millis(50),
        }
    }

    fn queue(concurrency: usize, max_attempts: u32) -> Queue {
        let defaults = JobDefaults {
            max_attempts,
            backoff: BackoffStrategy::fixed(Duration::ZERO),
            ..Default::default()
        };
        Queue::new(
            "email",
            QueueConfig::new(concurrency, defaults),
            Arc::new(InMemoryJobStore::new()),
        )
        .unwrap()
    }

    async fn wait_for_status(queue: &Queue, id: crate::jobs::JobId, status: JobStatus) -> JobRecord {
        for _ in 0..300 {
            let job = queue.get(id).await.unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {} never reached {}", id, status);
    }

    #[test]
    fn test_worker_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_worker_stats() {
        let stats = WorkerStats::new();
        assert_eq!(stats.processed(), 0);
        stats.processed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(stats.snapshot().processed, 1);
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(&*payload), "boom");
        let payload: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(&*payload), "bang");
    }

    #[tokio::test]
    async fn test_worker_completes_job() {
        let queue = queue(2, 3);
        let handle = JobWorker::new(
            queue.clone(),
            Arc::new(handler_fn(|_ctx| async { Ok(()) })),
            fast_config(),
        )
        .start();

        let job = queue.enqueue(json!({"n": 1}), None).await.unwrap();
        let done = wait_for_status(&queue, job.id, JobStatus::Completed).await;
        assert_eq!(done.attempts_made, 1);

        handle.stop();
        assert!(handle.wait(Duration::from_secs(1)).await);
        assert_eq!(handle.stats().succeeded(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_worker() {
        let queue = queue(1, 1);
        let handle = JobWorker::new(
            queue.clone(),
            Arc::new(handler_fn(|ctx: JobContext| async move {
                if ctx.raw_payload()["explode"] == true {
                    panic!("handler exploded");
                }
                Ok(())
            })),
            fast_config(),
        )
        .start();

        let bad = queue.enqueue(json!({"explode": true}), None).await.unwrap();
        let good = queue.enqueue(json!({"explode": false}), None).await.unwrap();

        let failed = wait_for_status(&queue, bad.id, JobStatus::Failed).await;
        assert!(failed
            .last_error
            .as_deref()
            .unwrap_or_default()
            .contains("handler panicked: handler exploded"));
        wait_for_status(&queue, good.id, JobStatus::Completed).await;

        handle.stop();
        assert!(handle.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_long_job_alive() {
        let queue = queue(1, 1);
        let handle = JobWorker::new(
            queue.clone(),
            Arc::new(handler_fn(|_ctx| async {
                // longer than the lease; heartbeats must keep it owned
                tokio::time::sleep(Duration::from_millis(700)).await;
                Ok(())
            })),
            fast_config(),
        )
        .start();

        let job = queue.enqueue(json!({}), None).await.unwrap();
        let done = wait_for_status(&queue, job.id, JobStatus::Completed).await;
        assert_eq!(done.stalled_count, 0);
        assert_eq!(handle.stats().stalled(), 0);

        handle.stop();
        assert!(handle.wait(Duration::from_secs(1)).await);
    }

    /// In-memory store whose `claim` parks until released.
    struct GatedStore {
        inner: InMemoryJobStore,
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl JobStore for GatedStore {
        async fn insert(&self, job: &JobRecord) -> crate::error::Result<bool> {
            self.inner.insert(job).await
        }

        async fn claim(
            &self,
            queue: &str,
            limit: usize,
            owner: &str,
            lease: Duration,
            now: chrono::DateTime<Utc>,
        ) -> crate::error::Result<Option<JobRecord>> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.claim(queue, limit, owner, lease, now).await
        }

        async fn heartbeat(
            &self,
            id: crate::jobs::JobId,
            owner: &str,
            lease: Duration,
            now: chrono::DateTime<Utc>,
        ) -> crate::error::Result<bool> {
            self.inner.heartbeat(id, owner, lease, now).await
        }

        async fn complete(
            &self,
            id: crate::jobs::JobId,
            owner: &str,
            now: chrono::DateTime<Utc>,
        ) -> crate::error::Result<Option<JobRecord>> {
            self.inner.complete(id, owner, now).await
        }

        async fn fail(
            &self,
            id: crate::jobs::JobId,
            owner: &str,
            error: &JobError,
            now: chrono::DateTime<Utc>,
        ) -> crate::error::Result<Option<JobRecord>> {
            self.inner.fail(id, owner, error, now).await
        }

        async fn recover_stalled(
            &self,
            queue: &str,
            max_stalled: u32,
            now: chrono::DateTime<Utc>,
        ) -> crate::error::Result<Vec<JobRecord>> {
            self.inner.recover_stalled(queue, max_stalled, now).await
        }

        async fn trim(&self, queue: &str, status: JobStatus, keep: u32) -> crate::error::Result<u64> {
            self.inner.trim(queue, status, keep).await
        }

        async fn remove(
            &self,
            id: crate::jobs::JobId,
        ) -> crate::error::Result<crate::jobs::RemoveOutcome> {
            self.inner.remove(id).await
        }

        async fn get(&self, id: crate::jobs::JobId) -> crate::error::Result<Option<JobRecord>> {
            self.inner.get(id).await
        }

        async fn list(
            &self,
            queue: &str,
            status: Option<JobStatus>,
            limit: usize,
        ) -> crate::error::Result<Vec<JobRecord>> {
            self.inner.list(queue, status, limit).await
        }

        async fn counts(&self, queue: &str) -> crate::error::Result<crate::jobs::JobCounts> {
            self.inner.counts(queue).await
        }

        async fn ping(&self) -> crate::error::Result<()> {
            self.inner.ping().await
        }

        async fn close(&self) {
            self.inner.close().await
        }

        fn backend_name(&self) -> &'static str {
            "gated"
        }
    }

    #[tokio::test]
    async fn test_stop_during_claim_starts_no_job() {
        let store = Arc::new(GatedStore {
            inner: InMemoryJobStore::new(),
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        });
        let queue = Queue::new(
            "email",
            QueueConfig::new(1, JobDefaults::default()),
            store.clone(),
        )
        .unwrap();
        let job = queue.enqueue(json!({}), None).await.unwrap();

        let handle = JobWorker::new(
            queue.clone(),
            Arc::new(handler_fn(|_ctx| async { Ok(()) })),
            fast_config(),
        )
        .start();

        // stop while the first claim is still in flight
        store.entered.notified().await;
        handle.stop();
        store.release.notify_one();

        assert!(handle.wait(Duration::from_secs(1)).await);
        assert_eq!(queue.get(job.id).await.unwrap().status, JobStatus::Waiting);
        assert_eq!(handle.stats().processed(), 0);
    }

    #[tokio::test]
    async fn test_stalled_job_is_recovered() {
        let queue = queue(1, 3);
        // a claim from a worker that died without heartbeating
        let job = queue.enqueue(json!({}), None).await.unwrap();
        queue
            .store()
            .claim("email", 1, "dead-worker", Duration::from_millis(20), Utc::now())
            .await
            .unwrap();

        let handle = JobWorker::new(
            queue.clone(),
            Arc::new(handler_fn(|_ctx| async { Ok(()) })),
            fast_config(),
        )
        .start();

        let done = wait_for_status(&queue, job.id, JobStatus::Completed).await;
        assert_eq!(done.stalled_count, 1);
        assert_eq!(handle.stats().stalled(), 1);

        handle.stop();
        assert!(handle.wait(Duration::from_secs(1)).await);
    }
}
