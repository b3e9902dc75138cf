//! Built-in payloads and default handlers for the reference queues.
//!
//! The default handlers validate their payload and log what they would do. Deployments plug
//! in real delivery, dump and cleanup logic by registering their own handler for the queue
//! before calling [`register_builtin_handlers`], which only fills the gaps.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::handler::{JobContext, JobHandler};
use super::job::{JobError, JobResult};
use super::system::JobSystem;
use crate::error::Result;

pub const EMAIL_QUEUE: &str = "email";
pub const BACKUP_QUEUE: &str = "backup";
pub const MAINTENANCE_QUEUE: &str = "maintenance";

// ═══════════════════════════════════════════════════════════════════════════════
// Payloads
// ═══════════════════════════════════════════════════════════════════════════════

/// Payload: send one outbound email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendEmail {
    pub to: Vec<String>,
    pub subject: String,
    /// Template name, rendered by the mailer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub variables: serde_json::Map<String, serde_json::Value>,
}

impl SendEmail {
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            subject: subject.into(),
            template: None,
            variables: serde_json::Map::new(),
        }
    }

    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    fn validate(&self) -> std::result::Result<(), JobError> {
        if self.to.is_empty() {
            return Err(JobError::fatal("email has no recipients").with_code("INVALID_PAYLOAD"));
        }
        if let Some(bad) = self.to.iter().find(|addr| !addr.contains('@')) {
            return Err(JobError::fatal(format!("invalid recipient address: {}", bad))
                .with_code("INVALID_PAYLOAD"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupKind {
    #[default]
    Full,
    Incremental,
}

/// Payload: dump the database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseBackup {
    #[serde(default)]
    pub kind: BackupKind,
    /// Target location understood by the backup tool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceKind {
    FileCleanup,
    SessionPurge,
    VacuumAnalyze,
}

/// Payload: one maintenance sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub task: MaintenanceKind,
    /// Age threshold for cleanup tasks
    #[serde(default, with = "humantime_serde::option", skip_serializing_if = "Option::is_none")]
    pub older_than: Option<Duration>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Handlers
// ═══════════════════════════════════════════════════════════════════════════════

/// Handler: validates and logs email jobs.
#[derive(Debug, Clone, Default)]
pub struct SendEmailHandler;

#[async_trait]
impl JobHandler for SendEmailHandler {
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let email: SendEmail = ctx.payload()?;
        email.validate()?;
        ctx.log_info(&format!(
            "Delivering email '{}' to {} recipient(s)",
            email.subject,
            email.to.len()
        ));
        Ok(())
    }
}

/// Handler: validates and logs backup jobs.
#[derive(Debug, Clone, Default)]
pub struct DatabaseBackupHandler;

#[async_trait]
impl JobHandler for DatabaseBackupHandler {
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let backup: DatabaseBackup = ctx.payload()?;
        ctx.log_info(&format!(
            "Running {:?} database backup to {}",
            backup.kind,
            backup.destination.as_deref().unwrap_or("default destination")
        ));
        Ok(())
    }
}

/// Handler: validates and logs maintenance jobs.
#[derive(Debug, Clone, Default)]
pub struct MaintenanceHandler;

#[async_trait]
impl JobHandler for MaintenanceHandler {
    async fn handle(&self, ctx: &JobContext) -> JobResult {
        let task: MaintenanceTask = ctx.payload()?;
        match task.older_than {
            Some(age) => ctx.log_info(&format!(
                "Running {:?} for items older than {:?}",
                task.task, age
            )),
            None => ctx.log_info(&format!("Running {:?}", task.task)),
        }
        Ok(())
    }
}

/// Register the default handler on each reference queue that exists and has none yet.
///
/// Returns the number of handlers registered.
pub fn register_builtin_handlers(system: &JobSystem) -> Result<usize> {
    let mut registered = 0;
    if system.queue(EMAIL_QUEUE).is_ok() && !system.has_handler(EMAIL_QUEUE) {
        system.register_handler(EMAIL_QUEUE, SendEmailHandler)?;
        registered += 1;
    }
    if system.queue(BACKUP_QUEUE).is_ok() && !system.has_handler(BACKUP_QUEUE) {
        system.register_handler(BACKUP_QUEUE, DatabaseBackupHandler)?;
        registered += 1;
    }
    if system.queue(MAINTENANCE_QUEUE).is_ok() && !system.has_handler(MAINTENANCE_QUEUE) {
        system.register_handler(MAINTENANCE_QUEUE, MaintenanceHandler)?;
        registered += 1;
    }
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JobsConfig;
    use crate::jobs::handler::handler_fn;
    use crate::jobs::job::{JobDefaults, JobRecord};
    use crate::jobs::store::InMemoryJobStore;
    use chrono::Utc;
    use serde_json::json;
    use std::sync::Arc;

    fn ctx(queue: &str, payload: serde_json::Value) -> JobContext {
        JobContext::new(JobRecord::new(queue, payload, &JobDefaults::default(), Utc::now()))
    }

    #[tokio::test]
    async fn test_email_handler_validates_recipients() {
        let ok = serde_json::to_value(SendEmail::new("ops@example.com", "Nightly report")).unwrap();
        assert!(SendEmailHandler.handle(&ctx(EMAIL_QUEUE, ok)).await.is_ok());

        let err = SendEmailHandler
            .handle(&ctx(EMAIL_QUEUE, json!({"to": ["nobody"], "subject": "x"})))
            .await
            .unwrap_err();
        assert!(!err.retryable);
    }

    #[tokio::test]
    async fn test_backup_payload_defaults_to_full() {
        let backup: DatabaseBackup = serde_json::from_value(json!({})).unwrap();
        assert_eq!(backup.kind, BackupKind::Full);
        assert!(DatabaseBackupHandler
            .handle(&ctx(BACKUP_QUEUE, json!({"kind": "incremental"})))
            .await
            .is_ok());
    }

    #[test]
    fn test_maintenance_payload_humantime() {
        let task: MaintenanceTask =
            serde_json::from_value(json!({"task": "file_cleanup", "older_than": "30days"})).unwrap();
        assert_eq!(task.task, MaintenanceKind::FileCleanup);
        assert_eq!(task.older_than, Some(Duration::from_secs(30 * 86_400)));
    }

    #[test]
    fn test_register_builtin_fills_gaps() {
        let system =
            JobSystem::new(&JobsConfig::default(), Arc::new(InMemoryJobStore::new())).unwrap();
        system
            .register_handler(EMAIL_QUEUE, handler_fn(|_ctx| async { Ok(()) }))
            .unwrap();
        assert_eq!(register_builtin_handlers(&system).unwrap(), 2);
        assert!(system.has_handler(BACKUP_QUEUE));
        assert_eq!(register_builtin_handlers(&system).unwrap(), 0);
    }
}
