//! Recurring job definition commands.

use anyhow::Result;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use super::timestamp;
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum RecurringCommands {
    /// List registered definitions and their next run
    List,
}

#[derive(Debug, Deserialize, Serialize)]
struct RecurringInfo {
    id: String,
    queue: String,
    cron: String,
    #[serde(default)]
    payload: serde_json::Value,
    #[serde(default)]
    next_run: Option<DateTime<Utc>>,
    #[serde(default)]
    last_run: Option<DateTime<Utc>>,
    run_count: u64,
    skipped_count: u64,
}

#[derive(Debug, Serialize, Tabled)]
struct RecurringRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Queue")]
    queue: String,
    #[tabled(rename = "Cron")]
    cron: String,
    #[tabled(rename = "Next Run")]
    next_run: String,
    #[tabled(rename = "Last Run")]
    last_run: String,
    #[tabled(rename = "Runs")]
    run_count: u64,
    #[tabled(rename = "Skipped")]
    skipped_count: u64,
}

pub async fn execute(
    cmd: RecurringCommands,
    client: &ApiClient,
    format: OutputFormat,
) -> Result<()> {
    match cmd {
        RecurringCommands::List => {
            let definitions: Vec<RecurringInfo> = client.get("/api/v1/recurring").await?;

            match format {
                OutputFormat::Table => {
                    let rows: Vec<RecurringRow> = definitions
                        .into_iter()
                        .map(|d| RecurringRow {
                            id: d.id,
                            queue: d.queue,
                            cron: d.cron,
                            next_run: timestamp(d.next_run),
                            last_run: timestamp(d.last_run),
                            run_count: d.run_count,
                            skipped_count: d.skipped_count,
                        })
                        .collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&definitions, format)?,
            }
        }
    }

    Ok(())
}
