//! HTTP request handlers.

use super::AppState;
use crate::config::MonitorConfig;
use crate::db::EventStats;
use crate::scheduler::TickSummary;
use crate::tracker::{ActivityEvent, DeviceState, EventKind, LedgerEntry};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{Html, IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Templates (simple string replacement)
// ============================================================================

const DASHBOARD_TEMPLATE: &str = include_str!("templates/dashboard.html");
const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");

const DEFAULT_EVENT_LIMIT: i64 = 100;
const MAX_EVENT_LIMIT: i64 = 1000;

// ============================================================================
// Dashboard
// ============================================================================

pub async fn handle_dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let devices: Vec<DeviceView> = state
        .ledger
        .snapshot()
        .iter()
        .map(|e| DeviceView::from_entry(e, now))
        .collect();
    let last_tick = state.status.read().await.clone();

    let device_rows: String = devices
        .iter()
        .map(|d| {
            format!(
                "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                d.state_name(),
                d.ip,
                d.mac.as_deref().unwrap_or("unknown"),
                d.state_name(),
                d.last_rate.map(|r| format!("{:.1}", r)).unwrap_or_else(|| "-".to_string()),
                d.idle_seconds.map(format_idle).unwrap_or_else(|| "-".to_string()),
                d.last_seen_at.format("%Y-%m-%d %H:%M:%S"),
            )
        })
        .collect::<Vec<_>>()
        .join("\n");

    let last_tick_str = match &last_tick {
        Some(t) if t.skipped => format!("{} (skipped, discovery failed)", t.at.format("%Y-%m-%d %H:%M:%S")),
        Some(t) => t.at.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "never".to_string(),
    };

    let content = DASHBOARD_TEMPLATE
        .replace("{{device_count}}", &devices.len().to_string())
        .replace("{{inactive_count}}", &state.ledger.inactive_count().to_string())
        .replace("{{last_tick}}", &last_tick_str)
        .replace("{{threshold}}", &state.config.inactivity_threshold.to_string())
        .replace("{{time_limit}}", &format_idle(state.config.inactivity_time_limit_secs as i64))
        .replace("{{device_rows}}", &device_rows);

    let page = LAYOUT_TEMPLATE
        .replace("{{title}}", "idlewatch")
        .replace("{{content}}", &content);

    Html(page)
}

// ============================================================================
// API: Devices
// ============================================================================

/// One ledger entry as served by the API.
#[derive(Debug, Serialize)]
pub struct DeviceView {
    pub key: String,
    pub ip: String,
    pub mac: Option<String>,
    pub state: DeviceState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub last_rate: Option<f64>,
    pub low_activity_since: Option<DateTime<Utc>>,
    pub idle_seconds: Option<i64>,
    pub missing_ticks: u32,
}

impl DeviceView {
    pub fn from_entry(entry: &LedgerEntry, now: DateTime<Utc>) -> Self {
        Self {
            key: entry.identity.key().to_string(),
            ip: entry.identity.ip.to_string(),
            mac: entry.identity.mac.clone(),
            state: entry.state,
            first_seen_at: entry.first_seen_at,
            last_seen_at: entry.last_seen_at,
            last_rate: entry.last_rate,
            low_activity_since: entry.low_activity_since,
            idle_seconds: entry.idle_for(now).map(|d| d.num_seconds()),
            missing_ticks: entry.missing_ticks,
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            DeviceState::Active => "active",
            DeviceState::Inactive => "inactive",
        }
    }
}

pub async fn handle_get_devices(State(state): State<AppState>) -> impl IntoResponse {
    let now = Utc::now();
    let devices: Vec<DeviceView> = state
        .ledger
        .snapshot()
        .iter()
        .map(|e| DeviceView::from_entry(e, now))
        .collect();
    Json(devices)
}

// ============================================================================
// API: Events
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
    /// Device key as rendered in event history, e.g. `mac:aa:bb:cc:dd:ee:ff`.
    #[serde(default)]
    pub device: Option<String>,
}

pub async fn handle_get_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_EVENT_LIMIT)
        .clamp(1, MAX_EVENT_LIMIT);

    match state.store.get_events(query.device.as_deref(), limit) {
        Ok(events) => Json(events).into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

// ============================================================================
// API: Report
// ============================================================================

pub async fn handle_report(State(state): State<AppState>) -> impl IntoResponse {
    let body = render_report(&state.ledger.snapshot(), Utc::now());
    ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body)
}

/// One `[Inactive]` line per inactive device, idle time measured at `now`.
pub fn render_report(entries: &[LedgerEntry], now: DateTime<Utc>) -> String {
    entries
        .iter()
        .filter(|e| e.state == DeviceState::Inactive)
        .filter_map(|e| {
            let idle_duration = e.idle_for(now)?;
            let event = ActivityEvent::new(now, e.identity.clone(), EventKind::BecameInactive { idle_duration });
            Some(event.report_line() + "\n")
        })
        .collect()
}

// ============================================================================
// API: Status
// ============================================================================

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub last_tick: Option<TickSummary>,
    pub tracked: usize,
    pub inactive: usize,
    pub events: Option<EventStats>,
    pub config: MonitorConfig,
}

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    let last_tick = state.status.read().await.clone();
    let events = match state.store.get_event_stats() {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::warn!("Failed to read event stats: {}", e);
            None
        }
    };

    Json(StatusResponse {
        last_tick,
        tracked: state.ledger.len(),
        inactive: state.ledger.inactive_count(),
        events,
        config: state.config.clone(),
    })
}

fn format_idle(secs: i64) -> String {
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else {
        format!("{}m", mins)
    }
}
