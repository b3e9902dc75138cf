//! Error handling for Conveyor.
//!
//! This module provides:
//! - A single error type with machine-readable codes and error chaining
//! - HTTP status code mapping for API responses
//! - User-facing messages kept apart from internal detail
//! - Severity-aware logging and an error counter metric
//!
//! # Usage
//!
//! ```rust,ignore
//! use conveyor_core::error::{ConveyorError, ErrorContext, Result};
//!
//! fn load(path: &str) -> Result<String> {
//!     std::fs::read_to_string(path).context("Failed to read job payload")
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Conveyor operations.
pub type Result<T> = std::result::Result<T, ConveyorError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Job Errors (1000-1099)
    JobNotFound,
    QueueNotFound,
    InvalidStateTransition,
    JobNotRemovable,
    InvalidJobOptions,

    // Handler Errors (1100-1199)
    HandlerAlreadyRegistered,

    // Scheduler Errors (1200-1299)
    InvalidCronExpression,
    RecurringJobNotFound,

    // Lifecycle Errors (1300-1399)
    SystemAlreadyStarted,
    SystemShuttingDown,
    ShutdownTimedOut,

    // Store Errors (2000-2099)
    StoreError,
    StoreConnectionFailed,
    StoreQueryFailed,
    StoreClosed,
    RecordNotFound,
    DuplicateRecord,

    // Serialization Errors (2200-2299)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Validation Errors (4100-4199)
    ValidationError,
    InvalidInput,

    // Configuration Errors (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal Errors (9000-9099)
    InternalError,
    TimeLimitExceeded,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::JobNotFound => 1000,
            Self::QueueNotFound => 1001,
            Self::InvalidStateTransition => 1002,
            Self::JobNotRemovable => 1003,
            Self::InvalidJobOptions => 1004,

            Self::HandlerAlreadyRegistered => 1100,

            Self::InvalidCronExpression => 1200,
            Self::RecurringJobNotFound => 1201,

            Self::SystemAlreadyStarted => 1300,
            Self::SystemShuttingDown => 1301,
            Self::ShutdownTimedOut => 1302,

            Self::StoreError => 2000,
            Self::StoreConnectionFailed => 2001,
            Self::StoreQueryFailed => 2002,
            Self::StoreClosed => 2003,
            Self::RecordNotFound => 2004,
            Self::DuplicateRecord => 2005,

            Self::SerializationError => 2200,
            Self::DeserializationError => 2201,
            Self::InvalidJson => 2202,

            Self::ValidationError => 4100,
            Self::InvalidInput => 4101,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::TimeLimitExceeded => 9001,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::JobNotFound
            | Self::QueueNotFound
            | Self::RecurringJobNotFound
            | Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::InvalidStateTransition
            | Self::JobNotRemovable
            | Self::DuplicateRecord
            | Self::HandlerAlreadyRegistered
            | Self::SystemAlreadyStarted => StatusCode::CONFLICT,

            Self::InvalidJobOptions
            | Self::InvalidCronExpression
            | Self::ValidationError
            | Self::InvalidInput
            | Self::DeserializationError
            | Self::InvalidJson => StatusCode::UNPROCESSABLE_ENTITY,

            Self::StoreConnectionFailed
            | Self::StoreClosed
            | Self::SystemShuttingDown => StatusCode::SERVICE_UNAVAILABLE,

            Self::ShutdownTimedOut | Self::TimeLimitExceeded => StatusCode::GATEWAY_TIMEOUT,

            Self::StoreError
            | Self::StoreQueryFailed
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreConnectionFailed
                | Self::StoreQueryFailed
                | Self::StoreError
                | Self::TimeLimitExceeded
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "job",
            1100..=1199 => "handler",
            1200..=1299 => "scheduler",
            1300..=1399 => "lifecycle",
            2000..=2099 => "store",
            2200..=2299 => "serialization",
            4100..=4199 => "validation",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, unknown ids)
    Low,
    /// Operational issues (timeouts, shutdown in progress)
    Medium,
    /// System errors (store failures, serialization bugs)
    High,
    /// The backing store is gone or an invariant broke
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::JobNotFound
            | ErrorCode::QueueNotFound
            | ErrorCode::RecurringJobNotFound
            | ErrorCode::RecordNotFound
            | ErrorCode::JobNotRemovable
            | ErrorCode::InvalidJobOptions
            | ErrorCode::InvalidCronExpression
            | ErrorCode::ValidationError
            | ErrorCode::InvalidInput
            | ErrorCode::DuplicateRecord
            | ErrorCode::HandlerAlreadyRegistered
            | ErrorCode::SystemAlreadyStarted
            | ErrorCode::InvalidStateTransition => Self::Low,

            ErrorCode::SystemShuttingDown
            | ErrorCode::ShutdownTimedOut
            | ErrorCode::TimeLimitExceeded
            | ErrorCode::StoreClosed => Self::Medium,

            ErrorCode::StoreError
            | ErrorCode::StoreQueryFailed
            | ErrorCode::SerializationError
            | ErrorCode::DeserializationError
            | ErrorCode::InvalidJson
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::StoreConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (job, queue, recurring definition)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Suggested action for resolution
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggested_action = Some(suggestion.into());
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Conveyor.
///
/// Carries a stable [`ErrorCode`], a message that is safe to show to API clients,
/// an optional internal message for logs, and the source error when there is one.
#[derive(Error, Debug)]
pub struct ConveyorError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for ConveyorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl ConveyorError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InternalError,
            "An internal error occurred",
            message,
        )
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the user-friendly message.
    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    /// Get the internal message (if any).
    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Get the HTTP status code.
    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "conveyor_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error response for API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Whether the request was successful (always false for errors)
    pub success: bool,

    /// Human readable message, mirrored from `details.message` for simple clients
    pub error: String,

    /// Machine-readable error code
    pub error_code: ErrorCode,

    /// Detailed error information
    pub details: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Numeric error code
    pub numeric_code: u32,

    /// User-friendly error message
    pub message: String,

    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,

    /// Timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&ConveyorError> for ErrorResponse {
    fn from(error: &ConveyorError) -> Self {
        Self {
            success: false,
            error: error.user_message.to_string(),
            error_code: error.code,
            details: ErrorInfo {
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.context.is_empty() && error.details.entity_id.is_none() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for ConveyorError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| ConveyorError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| ConveyorError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| ConveyorError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| ConveyorError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for ConveyorError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    return Self::with_internal(
                        ErrorCode::DuplicateRecord,
                        "A record with this identifier already exists",
                        format!("Constraint violation: {}", constraint),
                    )
                    .with_source(error);
                }
                (ErrorCode::StoreQueryFailed, "A job store query failed")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::StoreConnectionFailed,
                "Unable to reach the job store",
            ),
            _ => (ErrorCode::StoreError, "A job store error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for ConveyorError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<cron::error::Error> for ConveyorError {
    fn from(error: cron::error::Error) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            "Invalid cron expression",
            error.to_string(),
        )
    }
}

impl From<tokio::time::error::Elapsed> for ConveyorError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(
            ErrorCode::TimeLimitExceeded,
            "Operation timed out",
            error.to_string(),
        )
        .with_source(error)
    }
}

impl From<std::io::Error> for ConveyorError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::NotFound => (ErrorCode::RecordNotFound, "File or resource not found"),
            ErrorKind::TimedOut => (ErrorCode::TimeLimitExceeded, "Operation timed out"),
            ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
                (ErrorCode::StoreConnectionFailed, "Connection failed")
            }
            _ => (ErrorCode::InternalError, "An I/O error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<anyhow::Error> for ConveyorError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<ConveyorError>() {
            Ok(conveyor_error) => conveyor_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for ConveyorError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (
                ErrorCode::ConfigurationError,
                "Configuration error occurred",
            ),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Convenience Constructors for Domain Errors
// ═══════════════════════════════════════════════════════════════════════════════

impl ConveyorError {
    /// A job id that does not exist (or was trimmed by retention).
    pub fn job_not_found(job_id: impl fmt::Display) -> Self {
        let id = job_id.to_string();
        Self::new(ErrorCode::JobNotFound, format!("Job not found: {}", id))
            .with_details(ErrorDetails::new().with_entity("job", id))
    }

    /// A queue name that was never configured.
    pub fn queue_not_found(queue: &str) -> Self {
        Self::new(ErrorCode::QueueNotFound, format!("Queue not found: {}", queue))
            .with_details(ErrorDetails::new().with_entity("queue", queue))
    }

    /// A job status change that the lifecycle does not allow.
    pub fn invalid_state_transition(from: impl fmt::Display, to: impl fmt::Display) -> Self {
        let from = from.to_string();
        let to = to.to_string();
        Self::new(
            ErrorCode::InvalidStateTransition,
            format!("Invalid job state transition: {} -> {}", from, to),
        )
        .with_context("from_state", from)
        .with_context("to_state", to)
    }

    /// Removal was refused because the job is active or already finished.
    pub fn job_not_removable(job_id: impl fmt::Display, status: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::JobNotRemovable,
            format!("Job {} cannot be removed while {}", job_id, status),
        )
        .with_details(
            ErrorDetails::new()
                .with_entity("job", job_id.to_string())
                .with_suggestion("Only waiting or delayed jobs can be removed"),
        )
    }

    pub fn invalid_job_options(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidJobOptions, message.into())
    }

    pub fn handler_already_registered(queue: &str) -> Self {
        Self::new(
            ErrorCode::HandlerAlreadyRegistered,
            format!("A handler is already registered for queue: {}", queue),
        )
    }

    pub fn invalid_cron(expression: &str, reason: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::InvalidCronExpression,
            format!("Invalid cron expression: {}", expression),
            reason,
        )
    }

    pub fn recurring_job_not_found(id: &str) -> Self {
        Self::new(
            ErrorCode::RecurringJobNotFound,
            format!("Recurring job not found: {}", id),
        )
        .with_details(ErrorDetails::new().with_entity("recurring_job", id))
    }

    pub fn already_started() -> Self {
        Self::new(ErrorCode::SystemAlreadyStarted, "Job system already started")
    }

    pub fn shutting_down() -> Self {
        Self::new(ErrorCode::SystemShuttingDown, "Job system is shutting down")
    }

    /// Shutdown hit its deadline with jobs still executing.
    pub fn shutdown_timed_out(timeout: Duration, active: usize) -> Self {
        Self::new(
            ErrorCode::ShutdownTimedOut,
            format!(
                "Shutdown timed out after {:?} with {} job(s) still active",
                timeout, active
            ),
        )
        .with_context("active_jobs", active)
        .with_context("timeout_ms", timeout.as_millis() as u64)
    }

    pub fn store_closed() -> Self {
        Self::new(ErrorCode::StoreClosed, "The job store has been closed")
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::JobNotFound.http_status(), StatusCode::NOT_FOUND);
        assert_eq!(ErrorCode::JobNotRemovable.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::InvalidJobOptions.http_status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            ErrorCode::StoreConnectionFailed.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_error_code_category() {
        assert_eq!(ErrorCode::JobNotFound.category(), "job");
        assert_eq!(ErrorCode::InvalidCronExpression.category(), "scheduler");
        assert_eq!(ErrorCode::ShutdownTimedOut.category(), "lifecycle");
        assert_eq!(ErrorCode::StoreClosed.category(), "store");
    }

    #[test]
    fn test_retryable_codes() {
        assert!(ErrorCode::StoreConnectionFailed.is_retryable());
        assert!(!ErrorCode::ValidationError.is_retryable());
        assert!(!ErrorCode::JobNotFound.is_retryable());
    }

    #[test]
    fn test_error_display_includes_internal_message() {
        let error = ConveyorError::with_internal(
            ErrorCode::StoreQueryFailed,
            "A job store query failed",
            "relation \"jobs\" does not exist",
        );
        let rendered = error.to_string();
        assert!(rendered.contains("StoreQueryFailed"));
        assert!(rendered.contains("relation"));
    }

    #[test]
    fn test_shutdown_timed_out_context() {
        let error = ConveyorError::shutdown_timed_out(Duration::from_secs(5), 2);
        assert_eq!(error.code(), ErrorCode::ShutdownTimedOut);
        assert_eq!(
            error.details().context.get("active_jobs"),
            Some(&serde_json::json!(2))
        );
    }

    #[test]
    fn test_option_context() {
        let missing: Option<u32> = None;
        let error = missing.context("job vanished").unwrap_err();
        assert_eq!(error.code(), ErrorCode::RecordNotFound);
    }

    #[test]
    fn test_error_response_shape() {
        let error = ConveyorError::queue_not_found("reports");
        let response = ErrorResponse::from(&error);
        assert!(!response.success);
        assert_eq!(response.error_code, ErrorCode::QueueNotFound);
        assert_eq!(response.details.numeric_code, 1001);
        assert!(response.details.details.is_some());
    }
}
