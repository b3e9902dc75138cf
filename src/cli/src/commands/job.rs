//! Job management commands.
//!
//! Provides enqueue, list, show, remove, and retry operations for jobs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Subcommand;
use serde::{Deserialize, Serialize};
use tabled::Tabled;
use uuid::Uuid;

use super::{short_id, timestamp};
use crate::client::ApiClient;
use crate::output::{self, OutputFormat};

#[derive(Subcommand)]
pub enum JobCommands {
    /// Enqueue a job
    Enqueue {
        /// Target queue
        queue: String,

        /// JSON payload
        #[arg(short, long, conflicts_with = "file")]
        payload: Option<String>,

        /// Read the JSON payload from a file
        #[arg(short, long)]
        file: Option<String>,

        /// Delay before the job becomes eligible (e.g. 30s, 10m)
        #[arg(short, long)]
        delay: Option<String>,

        /// Override the queue's max attempts
        #[arg(long)]
        max_attempts: Option<u32>,
    },

    /// List jobs in a queue, newest first
    List {
        /// Queue name
        queue: String,

        /// Filter by status (waiting, active, delayed, completed, failed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of results
        #[arg(short, long, default_value = "50")]
        limit: u32,
    },

    /// Show a job
    Show {
        /// Job ID
        job_id: Uuid,
    },

    /// Remove a waiting or delayed job
    Remove {
        /// Job ID
        job_id: Uuid,
    },

    /// Re-enqueue a failed job as a new job
    Retry {
        /// Job ID
        job_id: Uuid,
    },
}

// ── API types ───────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
struct EnqueueOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_attempts: Option<u32>,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest {
    payload: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<EnqueueOptions>,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobHandle {
    id: Uuid,
    queue: String,
    status: String,
    created_at: DateTime<Utc>,
    next_eligible_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize, Serialize)]
struct JobInfo {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    status: String,
    attempts_made: u32,
    max_attempts: u32,
    #[serde(default)]
    stalled_count: u32,
    #[serde(default)]
    recurring_id: Option<String>,
    created_at: DateTime<Utc>,
    next_eligible_at: DateTime<Utc>,
    #[serde(default)]
    started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    last_error: Option<String>,
}

#[derive(Debug, Serialize, Tabled)]
struct JobRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Attempts")]
    attempts: String,
    #[tabled(rename = "Created")]
    created_at: String,
    #[tabled(rename = "Finished")]
    finished_at: String,
    #[tabled(rename = "Last Error")]
    last_error: String,
}

impl From<&JobInfo> for JobRow {
    fn from(job: &JobInfo) -> Self {
        Self {
            id: short_id(&job.id),
            status: job.status.clone(),
            attempts: format!("{}/{}", job.attempts_made, job.max_attempts),
            created_at: timestamp(Some(job.created_at)),
            finished_at: timestamp(job.finished_at),
            last_error: job.last_error.clone().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RemoveResponse {
    id: Uuid,
    removed: bool,
}

fn read_payload(payload: Option<String>, file: Option<String>) -> Result<serde_json::Value> {
    let raw = match (payload, file) {
        (Some(inline), _) => inline,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read payload file: {}", path))?,
        (None, None) => return Ok(serde_json::json!({})),
    };
    serde_json::from_str(&raw).context("Payload is not valid JSON")
}

fn print_handle(title: &str, handle: &JobHandle, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            output::print_success(title);
            output::print_detail("ID", &handle.id.to_string());
            output::print_detail("Queue", &handle.queue);
            output::print_detail("Status", &output::colorize_status(&handle.status).to_string());
            output::print_detail("Eligible At", &timestamp(Some(handle.next_eligible_at)));
            Ok(())
        }
        _ => output::print_item(handle, format),
    }
}

// ── Execution ───────────────────────────────────────────────────────────────

pub async fn execute(cmd: JobCommands, client: &ApiClient, format: OutputFormat) -> Result<()> {
    match cmd {
        JobCommands::Enqueue {
            queue,
            payload,
            file,
            delay,
            max_attempts,
        } => {
            let options = (delay.is_some() || max_attempts.is_some()).then(|| EnqueueOptions {
                delay,
                max_attempts,
            });
            let body = EnqueueRequest {
                payload: read_payload(payload, file)?,
                options,
            };

            let handle: JobHandle = client
                .post(&format!("/api/v1/queues/{}/jobs", queue), &body)
                .await?;
            print_handle("Job enqueued", &handle, format)?;
        }

        JobCommands::List {
            queue,
            status,
            limit,
        } => {
            let path = match &status {
                Some(s) => format!("/api/v1/queues/{}/jobs?status={}&limit={}", queue, s, limit),
                None => format!("/api/v1/queues/{}/jobs?limit={}", queue, limit),
            };
            let jobs: Vec<JobInfo> = client.get(&path).await?;

            match format {
                OutputFormat::Table => {
                    let rows: Vec<JobRow> = jobs.iter().map(JobRow::from).collect();
                    output::print_list(&rows, format)?;
                }
                _ => output::print_item(&jobs, format)?,
            }
        }

        JobCommands::Show { job_id } => {
            let job: JobInfo = client.get(&format!("/api/v1/jobs/{}", job_id)).await?;

            match format {
                OutputFormat::Table => {
                    output::print_header(&format!("Job: {}", job.id));
                    output::print_detail("Queue", &job.queue);
                    output::print_detail("Status", &output::colorize_status(&job.status).to_string());
                    output::print_detail(
                        "Attempts",
                        &format!("{}/{}", job.attempts_made, job.max_attempts),
                    );
                    output::print_detail("Stalled", &job.stalled_count.to_string());
                    if let Some(recurring_id) = &job.recurring_id {
                        output::print_detail("Recurring", recurring_id);
                    }
                    output::print_detail("Created", &timestamp(Some(job.created_at)));
                    output::print_detail("Eligible At", &timestamp(Some(job.next_eligible_at)));
                    output::print_detail("Started", &timestamp(job.started_at));
                    output::print_detail("Finished", &timestamp(job.finished_at));
                    if let Some(error) = &job.last_error {
                        output::print_detail("Last Error", error);
                    }
                    output::print_detail("Payload", &job.payload.to_string());
                }
                _ => output::print_item(&job, format)?,
            }
        }

        JobCommands::Remove { job_id } => {
            let resp: RemoveResponse = client.delete(&format!("/api/v1/jobs/{}", job_id)).await?;
            match format {
                OutputFormat::Table => output::print_success(&format!("Job {} removed", resp.id)),
                _ => output::print_item(&resp, format)?,
            }
        }

        JobCommands::Retry { job_id } => {
            let handle: JobHandle = client
                .post(
                    &format!("/api/v1/jobs/{}/retry", job_id),
                    &serde_json::json!({}),
                )
                .await?;
            print_handle(&format!("Job {} re-enqueued", job_id), &handle, format)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_payload_inline_and_default() {
        let payload = read_payload(Some(r#"{"to":["ops@example.com"]}"#.into()), None).unwrap();
        assert_eq!(payload["to"][0], "ops@example.com");
        assert_eq!(read_payload(None, None).unwrap(), serde_json::json!({}));
        assert!(read_payload(Some("not json".into()), None).is_err());
    }

    #[test]
    fn test_enqueue_request_omits_empty_options() {
        let body = EnqueueRequest {
            payload: serde_json::json!({"kind": "full"}),
            options: None,
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({"payload": {"kind": "full"}})
        );

        let body = EnqueueRequest {
            payload: serde_json::json!({}),
            options: Some(EnqueueOptions {
                delay: Some("10m".into()),
                max_attempts: None,
            }),
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap()["options"],
            serde_json::json!({"delay": "10m"})
        );
    }

    #[test]
    fn test_job_row_from_server_json() {
        let job: JobInfo = serde_json::from_value(serde_json::json!({
            "id": "6f1c0c5e-8f5e-4c1a-9a57-3d8f2b1c4e77",
            "queue": "email",
            "payload": {},
            "status": "failed",
            "attempts_made": 3,
            "max_attempts": 3,
            "created_at": "2026-01-05T10:00:00Z",
            "next_eligible_at": "2026-01-05T10:00:00Z",
            "finished_at": "2026-01-05T10:05:00Z",
            "last_error": "smtp down (code: RETRYABLE)"
        }))
        .unwrap();

        let row = JobRow::from(&job);
        assert_eq!(row.id, "6f1c0c5e");
        assert_eq!(row.attempts, "3/3");
        assert_eq!(row.finished_at, "2026-01-05 10:05:00");
    }
}
