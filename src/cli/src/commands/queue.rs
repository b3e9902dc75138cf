//! Queue inspection commands.

use anyhow::Result;
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;

use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum QueueCommands {
    /// List configured queues with job counts
    List,

    /// Show one queue's policy, counts and worker stats
    Show {
        /// Queue name
        name: String,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize, Serialize)]
struct JobCounts {
    waiting: u64,
    active: u64,
    delayed: u64,
    completed: u64,
    failed: u64,
}

#[derive(Debug, Deserialize, Serialize)]
struct WorkerStats {
    processed: u64,
    succeeded: u64,
    failed: u64,
    retried: u64,
    stalled: u64,
    active: usize,
}

#[derive(Debug, Deserialize, Serialize)]
struct QueueSummary {
    name: String,
    concurrency: usize,
    defaults: serde_json::Value,
    counts: JobCounts,
    has_handler: bool,
    #[serde(default)]
    worker: Option<WorkerStats>,
}

#[derive(Debug, Serialize, Tabled)]
struct QueueRow {
    #[tabled(rename = "Queue")]
    name: String,
    #[tabled(rename = "Concurrency")]
    concurrency: usize,
    #[tabled(rename = "Waiting")]
    waiting: u64,
    #[tabled(rename = "Active")]
    active: u64,
    #[tabled(rename = "Delayed")]
    delayed: u64,
    #[tabled(rename = "Completed")]
    completed: u64,
    #[tabled(rename = "Failed")]
    failed: u64,
    #[tabled(rename = "Worker")]
    worker: String,
}

impl From<&QueueSummary> for QueueRow {
    fn from(q: &QueueSummary) -> Self {
        Self {
            name: q.name.clone(),
            concurrency: q.concurrency,
            waiting: q.counts.waiting,
            active: q.counts.active,
            delayed: q.counts.delayed,
            completed: q.counts.completed,
            failed: q.counts.failed,
            worker: match (&q.worker, q.has_handler) {
                (Some(_), _) => "running".to_string(),
                (None, true) => "stopped".to_string(),
                (None, false) => "no handler".to_string(),
            },
        }
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: QueueCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        QueueCommands::List => {
            let queues: Vec<QueueSummary> = client.get("/api/v1/queues").await?;
            match format {
                OutputFormat::Table => {
                    let rows: Vec<QueueRow> = queues.iter().map(QueueRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&queues, format)?,
            }
        }

        QueueCommands::Show { name } => {
            let queue: QueueSummary = client.get(&format!("/api/v1/queues/{}", name)).await?;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Queue: {}", queue.name));
                    output::print_detail("Concurrency", &queue.concurrency.to_string());
                    output::print_detail("Handler", &queue.has_handler.to_string());
                    output::print_detail("Defaults", &queue.defaults.to_string());
                    output::print_detail("Waiting", &queue.counts.waiting.to_string());
                    output::print_detail("Active", &queue.counts.active.to_string());
                    output::print_detail("Delayed", &queue.counts.delayed.to_string());
                    output::print_detail("Completed", &queue.counts.completed.to_string());
                    output::print_detail("Failed", &queue.counts.failed.to_string());

                    match &queue.worker {
                        Some(stats) => {
                            output::print_header("Worker");
                            output::print_detail("Processed", &stats.processed.to_string());
                            output::print_detail("Succeeded", &stats.succeeded.to_string());
                            output::print_detail("Failed", &stats.failed.to_string());
                            output::print_detail("Retried", &stats.retried.to_string());
                            output::print_detail("Stalled", &stats.stalled.to_string());
                            output::print_detail("Active", &stats.active.to_string());
                        }
                        None if queue.counts.waiting + queue.counts.delayed > 0 => {
                            output::print_warning("Jobs are pending but no worker is running")
                        }
                        None => {}
                    }
                }
                _ => output::print_item(&queue, format)?,
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_row_from_server_json() {
        let summary: QueueSummary = serde_json::from_value(serde_json::json!({
            "name": "email",
            "concurrency": 5,
            "defaults": {"max_attempts": 3},
            "counts": {"waiting": 2, "active": 1, "delayed": 0, "completed": 10, "failed": 1},
            "has_handler": true
        }))
        .unwrap();

        let row = QueueRow::from(&summary);
        assert_eq!(row.waiting, 2);
        assert_eq!(row.completed, 10);
        assert_eq!(row.worker, "stopped");
    }
}
