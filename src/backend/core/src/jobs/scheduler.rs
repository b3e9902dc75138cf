//! Recurring job scheduling with cron expressions.
//!
//! Definitions are keyed by a stable id. Each tick enqueues through
//! [`Queue::enqueue_recurring`], which the store turns into a no-op while a job from the same
//! definition is still waiting, delayed or active.

use chrono::{DateTime, Utc};
use cron::Schedule;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::job::{JobId, JobOptions};
use super::queue::Queue;
use crate::error::{ConveyorError, Result};

/// Scheduler settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Disable on every process but one; a single active scheduler is assumed
    pub enabled: bool,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_interval: Duration::from_secs(1),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cron Schedule
// ═══════════════════════════════════════════════════════════════════════════════

/// A parsed cron expression, evaluated in UTC.
///
/// Accepts standard 5-field Unix expressions (`0 2 * * *`) as well as the 6/7-field form
/// with leading seconds and trailing year.
#[derive(Clone)]
pub struct CronSchedule {
    expression: String,
    schedule: Schedule,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let normalized = Self::normalize(expression)?;
        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| ConveyorError::invalid_cron(expression, e.to_string()))?;
        Ok(Self {
            expression: expression.trim().to_string(),
            schedule,
        })
    }

    fn normalize(expression: &str) -> Result<String> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        match fields.len() {
            5 => Ok(format!("0 {}", fields.join(" "))),
            6 | 7 => Ok(fields.join(" ")),
            n => Err(ConveyorError::invalid_cron(
                expression,
                format!("expected 5, 6 or 7 fields, found {}", n),
            )),
        }
    }

    /// The expression as written.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&after).next()
    }
}

impl fmt::Debug for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CronSchedule").field(&self.expression).finish()
    }
}

impl FromStr for CronSchedule {
    type Err = ConveyorError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Definitions
// ═══════════════════════════════════════════════════════════════════════════════

/// A cron-triggered template that produces jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringJob {
    /// Stable id; at most one live job per id
    pub id: String,
    pub queue: String,
    pub cron: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<JobOptions>,
}

impl RecurringJob {
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        cron: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            cron: cron.into(),
            payload,
            options: None,
        }
    }

    pub fn with_options(mut self, options: JobOptions) -> Self {
        self.options = Some(options);
        self
    }
}

/// What `register` did with a definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Registration {
    Created,
    /// Same id, new cron, template or options
    Updated,
    Unchanged,
}

/// A registered definition with its scheduling state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringJobInfo {
    #[serde(flatten)]
    pub definition: RecurringJob,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Ticks that enqueued a job
    pub run_count: u64,
    /// Ticks skipped because a job was still pending
    pub skipped_count: u64,
}

/// Result of one definition firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    Enqueued { recurring_id: String, job_id: JobId },
    /// A job for this definition is still waiting, delayed or active
    Skipped { recurring_id: String },
    Failed { recurring_id: String, error: String },
}

struct Entry {
    definition: RecurringJob,
    schedule: CronSchedule,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
    skipped_count: u64,
}

impl Entry {
    fn info(&self) -> RecurringJobInfo {
        RecurringJobInfo {
            definition: self.definition.clone(),
            next_run: self.next_run,
            last_run: self.last_run,
            run_count: self.run_count,
            skipped_count: self.skipped_count,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler
// ═══════════════════════════════════════════════════════════════════════════════

/// Job scheduler managing recurring definitions.
pub struct JobScheduler {
    queues: HashMap<String, Queue>,
    entries: RwLock<BTreeMap<String, Entry>>,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(queues: HashMap<String, Queue>, config: SchedulerConfig) -> Self {
        Self {
            queues,
            entries: RwLock::new(BTreeMap::new()),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Register or update a definition. Registering an identical definition again is a no-op.
    pub fn register(&self, definition: RecurringJob) -> Result<Registration> {
        let queue = self
            .queues
            .get(&definition.queue)
            .ok_or_else(|| ConveyorError::queue_not_found(&definition.queue))?;
        let schedule = CronSchedule::parse(&definition.cron)?;
        if let Some(options) = &definition.options {
            options.resolve(queue.defaults())?;
        }

        let now = Utc::now();
        let mut entries = self.entries.write();

        let registration = match entries.get_mut(&definition.id) {
            Some(existing) if existing.definition == definition => Registration::Unchanged,
            Some(existing) => {
                if existing.definition.cron != definition.cron {
                    existing.next_run = schedule.next_after(now);
                }
                existing.definition = definition.clone();
                existing.schedule = schedule;
                Registration::Updated
            }
            None => {
                entries.insert(
                    definition.id.clone(),
                    Entry {
                        next_run: schedule.next_after(now),
                        definition: definition.clone(),
                        schedule,
                        last_run: None,
                        run_count: 0,
                        skipped_count: 0,
                    },
                );
                Registration::Created
            }
        };

        let next_run = entries.get(&definition.id).and_then(|e| e.next_run);
        info!(
            recurring_id = %definition.id,
            queue = %definition.queue,
            cron = %definition.cron,
            next_run = ?next_run,
            registration = ?registration,
            "Recurring job registered"
        );
        Ok(registration)
    }

    /// Remove a definition. Jobs it already produced are left alone.
    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            info!(recurring_id = id, "Recurring job unregistered");
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<RecurringJobInfo> {
        self.entries.read().get(id).map(Entry::info)
    }

    /// All definitions, ordered by id.
    pub fn definitions(&self) -> Vec<RecurringJobInfo> {
        self.entries.read().values().map(Entry::info).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Fire every definition due at `now`.
    ///
    /// The next fire time moves past `now` whether or not a job was enqueued; missed ticks
    /// are not replayed.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<TickOutcome> {
        let due: Vec<RecurringJob> = {
            let mut entries = self.entries.write();
            entries
                .values_mut()
                .filter(|entry| entry.next_run.map_or(false, |next| next <= now))
                .map(|entry| {
                    entry.next_run = entry.schedule.next_after(now);
                    entry.last_run = Some(now);
                    entry.definition.clone()
                })
                .collect()
        };

        let mut outcomes = Vec::with_capacity(due.len());
        for definition in due {
            let outcome = self.fire(&definition).await;
            if let Some(entry) = self.entries.write().get_mut(&definition.id) {
                match outcome {
                    TickOutcome::Enqueued { .. } => entry.run_count += 1,
                    TickOutcome::Skipped { .. } => entry.skipped_count += 1,
                    TickOutcome::Failed { .. } => {}
                }
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn fire(&self, definition: &RecurringJob) -> TickOutcome {
        let recurring_id = definition.id.clone();
        let Some(queue) = self.queues.get(&definition.queue) else {
            return TickOutcome::Failed {
                recurring_id,
                error: format!("queue not found: {}", definition.queue),
            };
        };

        match queue
            .enqueue_recurring(
                &definition.id,
                definition.payload.clone(),
                definition.options.as_ref(),
            )
            .await
        {
            Ok(Some(handle)) => {
                info!(
                    recurring_id = %definition.id,
                    queue = %definition.queue,
                    job_id = %handle.id,
                    "Recurring job enqueued"
                );
                TickOutcome::Enqueued {
                    recurring_id,
                    job_id: handle.id,
                }
            }
            Ok(None) => {
                debug!(recurring_id = %definition.id, "Previous run still pending, tick skipped");
                TickOutcome::Skipped { recurring_id }
            }
            Err(e) => {
                e.log();
                warn!(recurring_id = %definition.id, error = %e, "Failed to enqueue recurring job");
                TickOutcome::Failed {
                    recurring_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Tick every `tick_interval` until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            definitions = self.len(),
            tick_interval = ?self.config.tick_interval,
            "Job scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
            }
        }

        info!("Job scheduler stopped");
    }
}
