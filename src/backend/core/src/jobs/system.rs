//! Lifecycle coordinator for the job system.
//!
//! [`JobSystem`] is the explicit context object that owns the store handle, the queues, the
//! handler registry, the scheduler and the running workers. It is built once at startup,
//! shared behind an `Arc`, and torn down with [`JobSystem::shutdown`].

use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::handler::{HandlerRegistry, JobHandler};
use super::job::{JobCounts, JobId, JobRecord};
use super::queue::{JobHandle, Queue};
use super::scheduler::JobScheduler;
use super::store::JobStore;
use super::worker::{JobWorker, WorkerConfig, WorkerHandle, WorkerStatsSnapshot};
use crate::config::JobsConfig;
use crate::error::{ConveyorError, ErrorCode, Result};

struct Running {
    workers: Vec<WorkerHandle>,
    scheduler_cancel: CancellationToken,
    scheduler_task: Option<JoinHandle<()>>,
}

enum Lifecycle {
    Created,
    Running(Running),
    Stopped,
}

/// Owns every queue, worker and the scheduler of one process.
pub struct JobSystem {
    store: Arc<dyn JobStore>,
    queues: BTreeMap<String, Queue>,
    scheduler: Arc<JobScheduler>,
    worker_config: WorkerConfig,
    shutdown_timeout: Duration,
    handlers: RwLock<HandlerRegistry>,
    lifecycle: Mutex<Lifecycle>,
}

impl JobSystem {
    /// Build queues and the scheduler, and register the configured recurring definitions.
    pub fn new(config: &JobsConfig, store: Arc<dyn JobStore>) -> Result<Self> {
        let mut queues = BTreeMap::new();
        for (name, queue_config) in &config.queues {
            let queue = Queue::new(name.clone(), queue_config.clone(), store.clone())?;
            queues.insert(name.clone(), queue);
        }

        let scheduler_queues: HashMap<String, Queue> = queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.clone()))
            .collect();
        let scheduler = Arc::new(JobScheduler::new(
            scheduler_queues,
            config.scheduler.clone(),
        ));
        for definition in &config.recurring {
            scheduler.register(definition.clone())?;
        }

        info!(
            queues = queues.len(),
            recurring = scheduler.len(),
            store = store.backend_name(),
            "Job system initialized"
        );

        Ok(Self {
            store,
            queues,
            scheduler,
            worker_config: config.worker.clone(),
            shutdown_timeout: config.shutdown_timeout,
            handlers: RwLock::new(HandlerRegistry::new()),
            lifecycle: Mutex::new(Lifecycle::Created),
        })
    }

    /// Register the handler for `queue`. Only allowed before [`start`](Self::start).
    pub fn register_handler<H>(&self, queue: &str, handler: H) -> Result<()>
    where
        H: JobHandler + 'static,
    {
        self.register_shared_handler(queue, Arc::new(handler))
    }

    pub fn register_shared_handler(&self, queue: &str, handler: Arc<dyn JobHandler>) -> Result<()> {
        if !matches!(*self.lifecycle.lock(), Lifecycle::Created) {
            return Err(ConveyorError::new(
                ErrorCode::SystemAlreadyStarted,
                "Handlers must be registered before the job system starts",
            ));
        }
        if !self.queues.contains_key(queue) {
            return Err(ConveyorError::queue_not_found(queue));
        }

        let mut handlers = self.handlers.write();
        if handlers.contains(queue) {
            return Err(ConveyorError::handler_already_registered(queue));
        }
        handlers.insert(queue, handler);
        info!(queue, "Job handler registered");
        Ok(())
    }

    pub fn has_handler(&self, queue: &str) -> bool {
        self.handlers.read().contains(queue)
    }

    /// Spawn one worker per queue with a handler, then the scheduler loop.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(ConveyorError::already_started()),
            Lifecycle::Stopped => return Err(ConveyorError::shutting_down()),
        }

        let handlers = self.handlers.read();
        let mut workers = Vec::with_capacity(self.queues.len());
        for (name, queue) in &self.queues {
            match handlers.get(name) {
                Some(handler) => {
                    let worker = JobWorker::new(queue.clone(), handler, self.worker_config.clone());
                    workers.push(worker.start());
                }
                None => warn!(
                    queue = %name,
                    "No handler registered; jobs will accumulate until one is"
                ),
            }
        }

        let scheduler_cancel = CancellationToken::new();
        let scheduler_task = if self.scheduler.config().enabled {
            Some(tokio::spawn(
                self.scheduler.clone().run(scheduler_cancel.clone()),
            ))
        } else {
            info!("Scheduler disabled on this process");
            None
        };

        info!(workers = workers.len(), "Job system started");
        *lifecycle = Lifecycle::Running(Running {
            workers,
            scheduler_cancel,
            scheduler_task,
        });
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock(), Lifecycle::Running(_))
    }

    /// Stop the scheduler, stop claiming, wait up to `timeout` for in-flight jobs, close
    /// the store.
    ///
    /// Returns `ShutdownTimedOut` when jobs were still running at the deadline; the store is
    /// closed regardless. Calling it again is a no-op.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Stopped);
        let running = match previous {
            Lifecycle::Running(running) => running,
            Lifecycle::Created => {
                self.store.close().await;
                info!("Job system closed before start");
                return Ok(());
            }
            Lifecycle::Stopped => return Ok(()),
        };

        info!(timeout = ?timeout, "Job system shutting down");
        let deadline = tokio::time::Instant::now() + timeout;

        running.scheduler_cancel.cancel();
        if let Some(task) = running.scheduler_task {
            if tokio::time::timeout_at(deadline, task).await.is_err() {
                warn!("Scheduler did not stop before the shutdown deadline");
            }
        }

        for worker in &running.workers {
            worker.stop();
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let drained = futures::future::join_all(
            running.workers.iter().map(|worker| worker.wait(remaining)),
        )
        .await;

        let active: usize = running.workers.iter().map(WorkerHandle::active).sum();
        self.store.close().await;

        if drained.iter().all(|done| *done) {
            info!("Job system shut down cleanly");
            Ok(())
        } else {
            warn!(active, "Shutdown timed out with jobs still running");
            Err(ConveyorError::shutdown_timed_out(timeout, active))
        }
    }

    /// Shut down with the configured timeout.
    pub async fn shutdown_default(&self) -> Result<()> {
        self.shutdown(self.shutdown_timeout).await
    }

    pub fn shutdown_timeout(&self) -> Duration {
        self.shutdown_timeout
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn queue(&self, name: &str) -> Result<&Queue> {
        self.queues
            .get(name)
            .ok_or_else(|| ConveyorError::queue_not_found(name))
    }

    /// Queues ordered by name.
    pub fn queues(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Per-queue job counts.
    pub async fn counts(&self) -> Result<BTreeMap<String, JobCounts>> {
        let mut counts = BTreeMap::new();
        for (name, queue) in &self.queues {
            counts.insert(name.clone(), queue.counts().await?);
        }
        Ok(counts)
    }

    /// Stats for queues with a running worker.
    pub fn worker_stats(&self) -> BTreeMap<String, WorkerStatsSnapshot> {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running
                .workers
                .iter()
                .map(|worker| (worker.queue().to_string(), worker.stats().snapshot()))
                .collect(),
            _ => BTreeMap::new(),
        }
    }

    pub fn has_worker(&self, queue: &str) -> bool {
        match &*self.lifecycle.lock() {
            Lifecycle::Running(running) => running
                .workers
                .iter()
                .any(|worker| worker.queue() == queue && !worker.is_stopped()),
            _ => false,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Job operations by id
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn job(&self, id: JobId) -> Result<JobRecord> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| ConveyorError::job_not_found(id))
    }

    /// Remove a waiting or delayed job.
    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        let job = self.job(id).await?;
        self.queue(&job.queue)?.remove(id).await
    }

    /// Re-enqueue a failed job as a new job.
    pub async fn retry_job(&self, id: JobId) -> Result<JobHandle> {
        let job = self.job(id).await?;
        self.queue(&job.queue)?.requeue_failed(id).await
    }
}

impl Drop for JobSystem {
    fn drop(&mut self) {
        if let Lifecycle::Running(running) = &*self.lifecycle.lock() {
            running.scheduler_cancel.cancel();
            for worker in &running.workers {
                worker.stop();
            }
        }
    }
}
