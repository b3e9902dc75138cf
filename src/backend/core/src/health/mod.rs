//! Health Check System
//!
//! Component health for the job store and the job system, served as a full report and as
//! liveness/readiness probes.

mod check;
mod checker;
mod routes;

pub use check::*;
pub use checker::*;
pub use routes::*;

use std::sync::Arc;
use std::time::Instant;

use crate::jobs::JobSystem;

/// Runs every registered checker.
pub struct HealthService {
    config: HealthCheckConfig,
    checkers: Vec<Arc<dyn HealthChecker>>,
    started_at: Instant,
}

impl HealthService {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            checkers: Vec::new(),
            started_at: Instant::now(),
        }
    }

    /// Service with the store and job system checkers registered.
    pub fn for_job_system(jobs: Arc<JobSystem>, config: HealthCheckConfig) -> Self {
        let mut service = Self::new(config);
        service.register_checker(Arc::new(StoreHealthChecker::new(jobs.store().clone())));
        service.register_checker(Arc::new(JobSystemHealthChecker::new(jobs)));
        service
    }

    pub fn register_checker(&mut self, checker: Arc<dyn HealthChecker>) {
        self.checkers.push(checker);
    }

    /// Run all health checks concurrently.
    pub async fn check_health(&self) -> HealthReport {
        let checks = self
            .checkers
            .iter()
            .map(|checker| checker.check_with_config(&self.config));
        let components = futures::future::join_all(checks).await;

        HealthReport::new()
            .with_uptime(self.started_at.elapsed())
            .with_components(components)
    }

    pub async fn is_ready(&self) -> bool {
        self.check_health().await.is_operational()
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }
}

impl std::fmt::Debug for HealthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthService")
            .field("config", &self.config)
            .field("checkers", &self.checkers.len())
            .finish()
    }
}
