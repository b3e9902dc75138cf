pub mod config;
pub mod health;
pub mod job;
pub mod queue;
pub mod recurring;

/// Shorten a UUID for table display.
pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

/// Render an optional timestamp for table display.
pub(crate) fn timestamp(value: Option<chrono::DateTime<chrono::Utc>>) -> String {
    value
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string())
}
