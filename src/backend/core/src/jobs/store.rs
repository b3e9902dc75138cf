//! Backing store contract for job state.
//!
//! Every mutation is an atomic read-modify-write: a store must never let two workers claim
//! the same job, and must never let a worker that lost its lease overwrite the job.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::job::{chrono_duration, JobCounts, JobError, JobId, JobRecord, JobStatus};
use crate::error::{ConveyorError, Result};

/// Result of a removal request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "status", rename_all = "snake_case")]
pub enum RemoveOutcome {
    Removed,
    NotFound,
    /// The job is active or finished and was left untouched
    NotRemovable(JobStatus),
}

/// Trait for job store backends.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    ///
    /// Returns `false` without inserting when the job carries a recurring id and a live job
    /// with the same `(queue, recurring_id)` already exists.
    async fn insert(&self, job: &JobRecord) -> Result<bool>;

    /// Claim the oldest eligible job in `queue` unless `limit` jobs are already active.
    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Extend the lease of a job still owned by `owner`.
    async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Mark an owned job completed. `None` when ownership was lost.
    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Record a failed attempt on an owned job. `None` when ownership was lost.
    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>>;

    /// Return active jobs with expired leases to `waiting`, or fail them past `max_stalled`.
    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>>;

    /// Delete the oldest `status` records beyond `keep`. Only terminal statuses are trimmed.
    async fn trim(&self, queue: &str, status: JobStatus, keep: u32) -> Result<u64>;

    /// Delete a job that has not been claimed yet.
    async fn remove(&self, id: JobId) -> Result<RemoveOutcome>;

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>>;

    /// Newest first.
    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>>;

    async fn counts(&self, queue: &str) -> Result<JobCounts>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<()>;

    /// Release connections. Further operations fail.
    async fn close(&self);

    /// Name reported by health checks.
    fn backend_name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Store
// ═══════════════════════════════════════════════════════════════════════════════

struct Entry {
    seq: u64,
    job: JobRecord,
}

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Entry>,
    next_seq: u64,
}

impl State {
    fn queue_entries<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a Entry> + 'a {
        self.jobs.values().filter(move |e| e.job.queue == queue)
    }
}

/// In-memory job store for testing and development. Not durable across restarts.
#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<State>,
    closed: AtomicBool,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ConveyorError::store_closed());
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Total number of stored jobs across all queues.
    pub fn len(&self) -> usize {
        self.state.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: &JobRecord) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        if let Some(recurring_id) = job.recurring_id.as_deref() {
            let duplicate = state.queue_entries(&job.queue).any(|e| {
                e.job.status.is_live() && e.job.recurring_id.as_deref() == Some(recurring_id)
            });
            if duplicate {
                return Ok(false);
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.jobs.insert(
            job.id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(true)
    }

    async fn claim(
        &self,
        queue: &str,
        limit: usize,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.state.lock();

        let active = state
            .queue_entries(queue)
            .filter(|e| e.job.status == JobStatus::Active)
            .count();
        if active >= limit {
            return Ok(None);
        }

        let next = state
            .queue_entries(queue)
            .filter(|e| e.job.is_eligible(now))
            .min_by_key(|e| (e.job.next_eligible_at, e.seq))
            .map(|e| e.job.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(entry) = state.jobs.get_mut(&id) else {
            return Ok(None);
        };
        entry.job.activate(owner, now + chrono_duration(lease), now)?;
        Ok(Some(entry.job.clone()))
    }

    async fn heartbeat(
        &self,
        id: JobId,
        owner: &str,
        lease: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        Ok(state
            .jobs
            .get_mut(&id)
            .map_or(false, |e| e.job.renew_lease(owner, now + chrono_duration(lease))))
    }

    async fn complete(
        &self,
        id: JobId,
        owner: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(entry) if entry.job.is_owned_by(owner) => {
                entry.job.record_success(now)?;
                Ok(Some(entry.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn fail(
        &self,
        id: JobId,
        owner: &str,
        error: &JobError,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        match state.jobs.get_mut(&id) {
            Some(entry) if entry.job.is_owned_by(owner) => {
                entry.job.record_failure(error, now)?;
                Ok(Some(entry.job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn recover_stalled(
        &self,
        queue: &str,
        max_stalled: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let mut recovered = Vec::new();
        for entry in state.jobs.values_mut() {
            if entry.job.queue == queue && entry.job.lease_expired(now) {
                entry.job.recover_stall(max_stalled, now)?;
                recovered.push(entry.job.clone());
            }
        }
        Ok(recovered)
    }

    async fn trim(&self, queue: &str, status: JobStatus, keep: u32) -> Result<u64> {
        self.ensure_open()?;
        if !status.is_terminal() {
            return Ok(0);
        }
        let mut state = self.state.lock();

        let mut finished: Vec<(Option<DateTime<Utc>>, u64, JobId)> = state
            .queue_entries(queue)
            .filter(|e| e.job.status == status)
            .map(|e| (e.job.finished_at, e.seq, e.job.id))
            .collect();
        // newest first; everything past `keep` goes
        finished.sort_unstable_by(|a, b| b.cmp(a));

        let mut removed = 0;
        for (_, _, id) in finished.into_iter().skip(keep as usize) {
            state.jobs.remove(&id);
            removed += 1;
        }
        Ok(removed)
    }

    async fn remove(&self, id: JobId) -> Result<RemoveOutcome> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let status = match state.jobs.get(&id) {
            Some(entry) => entry.job.status,
            None => return Ok(RemoveOutcome::NotFound),
        };
        if !status.is_removable() {
            return Ok(RemoveOutcome::NotRemovable(status));
        }
        state.jobs.remove(&id);
        Ok(RemoveOutcome::Removed)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>> {
        self.ensure_open()?;
        Ok(self.state.lock().jobs.get(&id).map(|e| e.job.clone()))
    }

    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.ensure_open()?;
        let state = self.state.lock();
        let mut entries: Vec<&Entry> = state
            .queue_entries(queue)
            .filter(|e| status.map_or(true, |s| e.job.status == s))
            .collect();
        entries.sort_unstable_by(|a, b| b.seq.cmp(&a.seq));
        Ok(entries
            .into_iter()
            .take(limit)
            .map(|e| e.job.clone())
            .collect())
    }

    async fn counts(&self, queue: &str) -> Result<JobCounts> {
        self.ensure_open()?;
        let state = self.state.lock();
        let mut counts = JobCounts::default();
        for entry in state.queue_entries(queue) {
            counts.add(entry.job.status, 1);
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::job::{BackoffStrategy, JobDefaults};
    use serde_json::json;

    const LEASE: Duration = Duration::from_secs(30);

    fn new_job(queue: &str) -> JobRecord {
        let defaults = JobDefaults {
            max_attempts: 2,
            backoff: BackoffStrategy::fixed(Duration::ZERO),
            keep_completed: 2,
            keep_failed: 2,
            max_stalled: 1,
        };
        JobRecord::new(queue, json!({}), &defaults, Utc::now())
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_respects_limit() {
        let store = InMemoryJobStore::new();
        let first = new_job("backup");
        let mut second = new_job("backup");
        second.created_at = first.created_at;
        second.next_eligible_at = first.next_eligible_at;
        store.insert(&first).await.unwrap();
        store.insert(&second).await.unwrap();

        let now = Utc::now();
        let claimed = store.claim("backup", 1, "w1", LEASE, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Active);

        // limit reached: the second job stays waiting
        assert!(store.claim("backup", 1, "w1", LEASE, now).await.unwrap().is_none());
        let waiting = store.get(second.id).await.unwrap().unwrap();
        assert_eq!(waiting.status, JobStatus::Waiting);

        store.complete(first.id, "w1", now).await.unwrap().unwrap();
        let claimed = store.claim("backup", 1, "w1", LEASE, now).await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimed_early() {
        let store = InMemoryJobStore::new();
        let job = new_job("email").with_delay(Duration::from_secs(60));
        store.insert(&job).await.unwrap();

        let now = Utc::now();
        assert!(store.claim("email", 5, "w1", LEASE, now).await.unwrap().is_none());
        let later = now + chrono::Duration::seconds(61);
        assert!(store.claim("email", 5, "w1", LEASE, later).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_recurring_dedup() {
        let store = InMemoryJobStore::new();
        let first = new_job("backup").with_recurring_id("daily-backup");
        let second = new_job("backup").with_recurring_id("daily-backup");
        assert!(store.insert(&first).await.unwrap());
        assert!(!store.insert(&second).await.unwrap());

        let now = Utc::now();
        store.claim("backup", 1, "w1", LEASE, now).await.unwrap();
        // still live while active
        assert!(!store.insert(&second).await.unwrap());
        store.complete(first.id, "w1", now).await.unwrap();
        assert!(store.insert(&second).await.unwrap());
    }

    #[tokio::test]
    async fn test_lost_ownership_is_ignored() {
        let store = InMemoryJobStore::new();
        let job = new_job("email");
        store.insert(&job).await.unwrap();
        let now = Utc::now();
        store.claim("email", 1, "w1", LEASE, now).await.unwrap();

        assert!(store.complete(job.id, "w2", now).await.unwrap().is_none());
        assert!(!store.heartbeat(job.id, "w2", LEASE, now).await.unwrap());
        assert!(store.heartbeat(job.id, "w1", LEASE, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_recover_stalled() {
        let store = InMemoryJobStore::new();
        let job = new_job("maintenance");
        store.insert(&job).await.unwrap();
        let now = Utc::now();
        store
            .claim("maintenance", 1, "w1", Duration::from_secs(1), now)
            .await
            .unwrap();

        assert!(store.recover_stalled("maintenance", 1, now).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(5);
        let recovered = store.recover_stalled("maintenance", 1, later).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].status, JobStatus::Waiting);
        // the old owner can no longer finish it
        assert!(store.complete(job.id, "w1", later).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_trim_keeps_newest() {
        let store = InMemoryJobStore::new();
        let mut ids = Vec::new();
        for i in 0..4 {
            let job = new_job("email");
            ids.push(job.id);
            store.insert(&job).await.unwrap();
            let now = Utc::now() + chrono::Duration::seconds(i);
            store.claim("email", 1, "w1", LEASE, now).await.unwrap();
            store.complete(job.id, "w1", now).await.unwrap();
        }

        let removed = store.trim("email", JobStatus::Completed, 2).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get(ids[0]).await.unwrap().is_none());
        assert!(store.get(ids[1]).await.unwrap().is_none());
        assert!(store.get(ids[3]).await.unwrap().is_some());
        assert_eq!(store.counts("email").await.unwrap().completed, 2);
    }

    #[tokio::test]
    async fn test_remove_only_unclaimed() {
        let store = InMemoryJobStore::new();
        let waiting = new_job("email");
        let active = new_job("email");
        store.insert(&active).await.unwrap();
        store.insert(&waiting).await.unwrap();
        store.claim("email", 1, "w1", LEASE, Utc::now()).await.unwrap();

        assert_eq!(
            store.remove(active.id).await.unwrap(),
            RemoveOutcome::NotRemovable(JobStatus::Active)
        );
        assert_eq!(store.remove(waiting.id).await.unwrap(), RemoveOutcome::Removed);
        assert_eq!(store.remove(waiting.id).await.unwrap(), RemoveOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_closed_store_rejects_operations() {
        let store = InMemoryJobStore::new();
        store.close().await;
        let err = store.insert(&new_job("email")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StoreClosed);
        assert!(store.ping().await.is_err());
    }
}
