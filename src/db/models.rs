//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A persisted classification-change event.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub time: DateTime<Utc>,
    /// `inactive`, `active` or `departed`.
    pub kind: String,
    pub device_key: String,
    pub ip: String,
    pub mac: Option<String>,
    /// Only set for `inactive` events.
    pub idle_seconds: Option<i64>,
}

/// Event history statistics for the status page.
#[derive(Debug, Clone, Serialize)]
pub struct EventStats {
    pub count: i64,
    pub db_size_bytes: i64,
}
