//! Database layer for Conveyor.
//!
//! Uses PostgreSQL for durable job storage with sqlx. [`Database`] owns the pool and the
//! migrations; [`PostgresJobStore`] implements the job store contract on top of it.

mod job_store;

pub use job_store::PostgresJobStore;

use serde::Serialize;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::DatabaseConfig;
use crate::error::{ConveyorError, ErrorCode, ErrorContext, Result};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    max_connections: u32,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("max_connections", &self.max_connections)
            .field("closed", &self.pool.is_closed())
            .finish()
    }
}

impl Database {
    /// Create a new database connection pool.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.url)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to the job store database");
                ConveyorError::with_internal(
                    ErrorCode::StoreConnectionFailed,
                    "Unable to connect to the job store database",
                    e.to_string(),
                )
                .with_source(e)
            })?;

        info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Database pool created"
        );

        Ok(Self {
            pool,
            max_connections: config.max_connections,
        })
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: PgPool, max_connections: u32) -> Self {
        Self {
            pool,
            max_connections,
        }
    }

    /// Run migrations.
    pub async fn migrate(&self) -> Result<()> {
        info!("Running database migrations...");
        let start = Instant::now();
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Database migration failed")?;
        info!(
            duration_ms = start.elapsed().as_millis() as u64,
            "Database migrations completed"
        );
        Ok(())
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check connectivity with a trivial query and return its latency.
    pub async fn check_connectivity(&self) -> Result<Duration> {
        let start = Instant::now();
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!(error = %e, "Database connectivity check failed");
                ConveyorError::from(e)
            })?;
        let latency = start.elapsed();
        if latency > Duration::from_millis(100) {
            warn!(
                latency_ms = latency.as_millis() as u64,
                "Database connectivity check latency is high"
            );
        }
        Ok(latency)
    }

    /// Get connection pool metrics.
    pub fn pool_metrics(&self) -> PoolMetrics {
        let pool_size = self.pool.size();
        let idle = self.pool.num_idle() as u32;
        let active = pool_size.saturating_sub(idle);
        let utilization = if self.max_connections > 0 {
            (active as f64 / self.max_connections as f64) * 100.0
        } else {
            0.0
        };

        PoolMetrics {
            pool_size,
            idle_connections: idle,
            active_connections: active,
            max_connections: self.max_connections,
            utilization_pct: utilization,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }
}

/// Metrics collected from the connection pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_size: u32,
    pub idle_connections: u32,
    pub active_connections: u32,
    pub max_connections: u32,
    pub utilization_pct: f64,
}
