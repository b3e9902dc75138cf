//! Conveyor CLI - Command-line interface for a running Conveyor server.
//!
//! Provides commands for queue, job, recurring definition, health, and configuration management.

mod client;
mod commands;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{config, health, job, queue, recurring};
use output::OutputFormat;

/// Conveyor - Durable Background Job Queue CLI
#[derive(Parser)]
#[command(
    name = "conveyor",
    version,
    about = "Conveyor - Durable Background Job Queue",
    long_about = "CLI tool for inspecting queues, enqueuing and managing jobs, and checking server health.",
    propagate_version = true
)]
pub struct Cli {
    /// Output format
    #[arg(short, long, global = true, default_value = "table")]
    output: OutputFormat,

    /// API server URL
    #[arg(long, global = true, env = "CONVEYOR_API_URL")]
    api_url: Option<String>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Queue inspection
    #[command(subcommand)]
    Queue(queue::QueueCommands),

    /// Job operations
    #[command(subcommand)]
    Job(job::JobCommands),

    /// Recurring job definitions
    #[command(subcommand)]
    Recurring(recurring::RecurringCommands),

    /// Check server health
    Health(health::HealthArgs),

    /// Configuration management
    #[command(subcommand)]
    Config(config::ConfigCommands),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }

    let api_url = cli
        .api_url
        .clone()
        .or_else(config::load_api_url)
        .unwrap_or_else(|| "http://localhost:8080".to_string());

    let client = client::ApiClient::new(&api_url)?;
    let format = cli.output;

    let result = match cli.command {
        Commands::Queue(cmd) => queue::execute(cmd, &client, format).await,
        Commands::Job(cmd) => job::execute(cmd, &client, format).await,
        Commands::Recurring(cmd) => recurring::execute(cmd, &client, format).await,
        Commands::Health(args) => health::execute(args, &client, format).await,
        Commands::Config(cmd) => config::execute(cmd, format).await,
    };

    if let Err(e) = result {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }

    Ok(())
}
