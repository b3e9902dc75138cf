//! Job records and execution policy.
//!
//! This module provides the data model shared by every part of the job system:
//!
//! - **JobRecord**: The persisted state of a single job, with its lifecycle transitions
//! - **JobStatus**: The five states a job can be in
//! - **BackoffStrategy**: Fixed or exponential retry delays
//! - **JobDefaults / JobOptions**: Queue-level policy and per-enqueue overrides
//! - **JobError**: The failure value returned by handlers
//!
//! Transitions live on [`JobRecord`] so that every [`JobStore`](super::JobStore)
//! implementation applies identical rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{ConveyorError, Result};

/// Error message recorded on jobs failed by stall recovery.
pub const STALLED_ERROR: &str = "job stalled more than allowable limit";

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Create a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for JobId {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ConveyorError::validation(format!("Invalid job id: {}", s)))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of a job.
///
/// ```text
/// waiting ──▶ active ──▶ completed
///               │  ▲
///               ▼  │
///             delayed ──▶ active ──▶ failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Eligible to be claimed
    Waiting,
    /// Claimed by a worker and executing
    Active,
    /// Waiting for a backoff (or initial) delay to elapse
    Delayed,
    /// Finished successfully
    Completed,
    /// Attempts exhausted or failed fatally
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 5] = [
        Self::Waiting,
        Self::Active,
        Self::Delayed,
        Self::Completed,
        Self::Failed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Pending or running: counts toward recurring-job deduplication.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed | Self::Active)
    }

    /// Only jobs nobody has claimed yet may be removed.
    pub fn is_removable(&self) -> bool {
        matches!(self, Self::Waiting | Self::Delayed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Delayed => "delayed",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "delayed" => Ok(Self::Delayed),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(ConveyorError::validation(format!(
                "Unknown job status: {}",
                other
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Error type for job execution failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Whether this error is retryable
    pub retryable: bool,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            code: None,
            context: None,
        }
    }

    /// Create a new non-retryable (fatal) error. Remaining attempts are skipped.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            code: None,
            context: None,
        }
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<ConveyorError> for JobError {
    fn from(error: ConveyorError) -> Self {
        Self {
            message: error.user_message().to_string(),
            retryable: error.is_retryable(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

impl From<anyhow::Error> for JobError {
    fn from(error: anyhow::Error) -> Self {
        Self::retryable(format!("{:#}", error))
    }
}

/// Result type for job execution.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays.
///
/// Serialized with a `type` tag and humantime durations:
/// `{ type = "exponential", base = "2s", max = "10m" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Constant delay between attempts
    Fixed {
        #[serde(with = "humantime_serde")]
        delay: Duration,
    },
    /// `base * 2^(attempts_made - 1)`, optionally capped
    Exponential {
        #[serde(with = "humantime_serde")]
        base: Duration,
        #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
        max: Option<Duration>,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_secs(1),
            max: None,
        }
    }
}

impl BackoffStrategy {
    /// Create a fixed backoff strategy.
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed { delay }
    }

    /// Create an uncapped exponential backoff strategy.
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential { base, max: None }
    }

    /// Cap an exponential strategy. No effect on fixed backoff.
    pub fn with_max(self, cap: Duration) -> Self {
        match self {
            Self::Exponential { base, .. } => Self::Exponential {
                base,
                max: Some(cap),
            },
            fixed => fixed,
        }
    }

    /// Delay before the next attempt, given the number of attempts already made (1-based).
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        match self {
            Self::Fixed { delay } => *delay,
            Self::Exponential { base, max } => {
                let exponent = attempts_made.max(1) - 1;
                let delay = 2u32
                    .checked_pow(exponent)
                    .and_then(|factor| base.checked_mul(factor))
                    .unwrap_or(Duration::MAX);
                match max {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Fixed { .. } => "fixed",
            Self::Exponential { .. } => "exponential",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Options
// ═══════════════════════════════════════════════════════════════════════════════

/// Default execution policy attached to a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    /// Total executions allowed, including the first one
    pub max_attempts: u32,
    /// Delay policy between attempts
    pub backoff: BackoffStrategy,
    /// Completed records retained per queue
    pub keep_completed: u32,
    /// Failed records retained per queue
    pub keep_failed: u32,
    /// Lease expiries tolerated before a job is failed
    pub max_stalled: u32,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
            keep_completed: 100,
            keep_failed: 500,
            max_stalled: 1,
        }
    }
}

impl JobDefaults {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(ConveyorError::invalid_job_options(
                "max_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Per-enqueue overrides. Unset fields fall back to the queue's [`JobDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<BackoffStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_completed: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_failed: Option<u32>,
    /// Initial delay; the job starts `delayed`
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub delay: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn with_retention(mut self, keep_completed: u32, keep_failed: u32) -> Self {
        self.keep_completed = Some(keep_completed);
        self.keep_failed = Some(keep_failed);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Merge onto queue defaults and validate the result.
    pub fn resolve(&self, defaults: &JobDefaults) -> Result<JobDefaults> {
        let resolved = JobDefaults {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            backoff: self.backoff.clone().unwrap_or_else(|| defaults.backoff.clone()),
            keep_completed: self.keep_completed.unwrap_or(defaults.keep_completed),
            keep_failed: self.keep_failed.unwrap_or(defaults.keep_failed),
            max_stalled: defaults.max_stalled,
        };
        resolved.validate()?;
        Ok(resolved)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Record
// ═══════════════════════════════════════════════════════════════════════════════

/// Persisted state of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub keep_completed: u32,
    pub keep_failed: u32,
    pub stalled_count: u32,
    /// Set when the job was produced by a recurring definition
    pub recurring_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_eligible_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Create a `waiting` job with already-resolved options.
    pub fn new(
        queue: impl Into<String>,
        payload: serde_json::Value,
        options: &JobDefaults,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            queue: queue.into(),
            payload,
            status: JobStatus::Waiting,
            attempts_made: 0,
            max_attempts: options.max_attempts,
            backoff: options.backoff.clone(),
            keep_completed: options.keep_completed,
            keep_failed: options.keep_failed,
            stalled_count: 0,
            recurring_id: None,
            created_at: now,
            next_eligible_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    /// Start the job `delayed` until `now + delay`. A zero delay leaves it `waiting`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        if !delay.is_zero() {
            self.status = JobStatus::Delayed;
            self.next_eligible_at = self.created_at + chrono_duration(delay);
        }
        self
    }

    pub fn with_recurring_id(mut self, recurring_id: impl Into<String>) -> Self {
        self.recurring_id = Some(recurring_id.into());
        self
    }

    /// Waiting, or delayed with its delay elapsed.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Waiting => true,
            JobStatus::Delayed => self.next_eligible_at <= now,
            _ => false,
        }
    }

    pub fn is_owned_by(&self, owner: &str) -> bool {
        self.status == JobStatus::Active && self.lease_owner.as_deref() == Some(owner)
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Active
            && self.lease_expires_at.map_or(true, |expires| expires <= now)
    }

    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_made)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────────

    /// waiting | due delayed → active
    pub fn activate(
        &mut self,
        owner: &str,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !self.is_eligible(now) {
            return Err(ConveyorError::invalid_state_transition(
                self.status,
                JobStatus::Active,
            ));
        }
        self.status = JobStatus::Active;
        self.started_at = Some(now);
        self.lease_owner = Some(owner.to_string());
        self.lease_expires_at = Some(lease_until);
        Ok(())
    }

    /// active → completed
    pub fn record_success(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.ensure_active(JobStatus::Completed)?;
        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.status = JobStatus::Completed;
        self.finished_at = Some(now);
        self.release_lease();
        Ok(())
    }

    /// active → delayed (attempts remain, error retryable) or failed
    pub fn record_failure(&mut self, error: &JobError, now: DateTime<Utc>) -> Result<()> {
        let target = if error.retryable && self.attempts_made + 1 < self.max_attempts {
            JobStatus::Delayed
        } else {
            JobStatus::Failed
        };
        self.ensure_active(target)?;

        self.attempts_made = (self.attempts_made + 1).min(self.max_attempts);
        self.last_error = Some(error.to_string());
        self.release_lease();

        match target {
            JobStatus::Delayed => {
                let delay = self.backoff.delay_for_attempt(self.attempts_made);
                self.status = JobStatus::Delayed;
                self.next_eligible_at = now + chrono_duration(delay);
            }
            _ => {
                self.status = JobStatus::Failed;
                self.finished_at = Some(now);
            }
        }
        Ok(())
    }

    /// active with an expired lease → waiting, or failed past `max_stalled`
    pub fn recover_stall(&mut self, max_stalled: u32, now: DateTime<Utc>) -> Result<()> {
        let target = if self.stalled_count + 1 > max_stalled {
            JobStatus::Failed
        } else {
            JobStatus::Waiting
        };
        self.ensure_active(target)?;

        self.stalled_count += 1;
        self.release_lease();

        if target == JobStatus::Failed {
            self.status = JobStatus::Failed;
            self.finished_at = Some(now);
            self.last_error = Some(STALLED_ERROR.to_string());
        } else {
            self.status = JobStatus::Waiting;
            self.next_eligible_at = now;
        }
        Ok(())
    }

    /// Extend the lease. Returns false when `owner` no longer holds the job.
    pub fn renew_lease(&mut self, owner: &str, until: DateTime<Utc>) -> bool {
        if !self.is_owned_by(owner) {
            return false;
        }
        self.lease_expires_at = Some(until);
        true
    }

    fn ensure_active(&self, target: JobStatus) -> Result<()> {
        if self.status != JobStatus::Active {
            return Err(ConveyorError::invalid_state_transition(self.status, target));
        }
        Ok(())
    }

    fn release_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Counts
// ═══════════════════════════════════════════════════════════════════════════════

/// Number of jobs in each status for one queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn get(&self, status: JobStatus) -> u64 {
        match status {
            JobStatus::Waiting => self.waiting,
            JobStatus::Active => self.active,
            JobStatus::Delayed => self.delayed,
            JobStatus::Completed => self.completed,
            JobStatus::Failed => self.failed,
        }
    }

    pub fn add(&mut self, status: JobStatus, n: u64) {
        match status {
            JobStatus::Waiting => self.waiting += n,
            JobStatus::Active => self.active += n,
            JobStatus::Delayed => self.delayed += n,
            JobStatus::Completed => self.completed += n,
            JobStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> u64 {
        self.waiting + self.active + self.delayed + self.completed + self.failed
    }

    /// Jobs that still need to run.
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed
    }
}

/// Convert a std duration to chrono, saturating at 100 years.
pub fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
