//! Conveyor Server - Main entry point
//!
//! Loads configuration, starts the job system and serves the HTTP API until SIGINT/SIGTERM,
//! then drains in-flight jobs.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::{
    api::{self, AppState},
    config::{Config, StoreBackend},
    db::{Database, PostgresJobStore},
    health::{HealthCheckConfig, HealthService},
    jobs::{register_builtin_handlers, InMemoryJobStore, JobStore, JobSystem},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "conveyor-server", version, about = "Conveyor background job server")]
struct Args {
    /// Configuration file (defaults to config/conveyor.toml when present)
    #[arg(short, long, env = "CONVEYOR_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;

    let telemetry = telemetry::init(&config.observability)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        store = ?config.jobs.store,
        "Starting Conveyor server"
    );

    let store: Arc<dyn JobStore> = match config.jobs.store {
        StoreBackend::Postgres => {
            let db = Database::connect(&config.database).await?;
            if config.database.run_migrations {
                db.migrate().await?;
            }
            db.check_connectivity().await?;
            Arc::new(PostgresJobStore::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using the in-memory job store; jobs will not survive a restart");
            Arc::new(InMemoryJobStore::new())
        }
    };

    let jobs = Arc::new(JobSystem::new(&config.jobs, store)?);
    let builtin = register_builtin_handlers(&jobs)?;
    tracing::info!(builtin, "Built-in job handlers registered");
    jobs.start()?;

    let health = Arc::new(HealthService::for_job_system(
        jobs.clone(),
        HealthCheckConfig::default(),
    ));
    let app = api::build_router(AppState::new(jobs.clone(), health));

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Err(e) = jobs.shutdown_default().await {
        tracing::error!(error = %e, "Job system did not shut down cleanly");
    }

    tracing::info!("Server shutdown complete");
    telemetry.shutdown();

    Ok(())
}

/// Wait for shutdown signal.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
