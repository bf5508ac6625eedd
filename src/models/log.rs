use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Append-only audit record shown on the dashboard activity feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub name: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self { name: name.into(), description: description.into(), created_at: Utc::now() }
    }
}
