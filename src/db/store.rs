//! SQLite event history store.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;
use crate::tracker::{ActivityEvent, EventKind};

mod embedded {
    refinery::embed_migrations!("migrations");
}

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("database lock poisoned")]
    LockPoisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.lock()?;
        let report = embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        for migration in report.applied_migrations() {
            tracing::info!("Applied migration {}", migration);
        }
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    /// Add events in batch, preserving their order.
    pub fn add_events(&self, events: &[ActivityEvent]) -> Result<(), DbError> {
        if events.is_empty() {
            return Ok(());
        }

        let conn = self.lock()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO events (time, kind, device_key, ip, mac, idle_seconds) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
            )?;

            for e in events {
                let idle_seconds = match &e.kind {
                    EventKind::BecameInactive { idle_duration } => Some(idle_duration.num_seconds()),
                    _ => None,
                };
                stmt.execute(params![
                    e.at.format(TIME_FORMAT).to_string(),
                    e.kind.name(),
                    e.identity.key().to_string(),
                    e.identity.ip.to_string(),
                    e.identity.mac,
                    idle_seconds,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Most recent events, newest first, optionally for one device key.
    pub fn get_events(&self, device_key: Option<&str>, limit: i64) -> Result<Vec<StoredEvent>, DbError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, time, kind, device_key, ip, mac, idle_seconds FROM events
             WHERE ?1 IS NULL OR device_key = ?1
             ORDER BY time DESC, id DESC LIMIT ?2"
        )?;

        let events = stmt
            .query_map(params![device_key, limit], |row| {
                let time_str: String = row.get(1)?;
                let time = parse_db_time(&time_str).unwrap_or_else(Utc::now);
                Ok(StoredEvent {
                    id: row.get(0)?,
                    time,
                    kind: row.get(2)?,
                    device_key: row.get(3)?,
                    ip: row.get(4)?,
                    mac: row.get(5)?,
                    idle_seconds: row.get(6)?,
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    /// Delete events before a cutoff time. Returns the number of rows removed.
    pub fn delete_events_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM events WHERE time < ?1",
            params![cutoff.format(TIME_FORMAT).to_string()],
        )?;
        Ok(removed)
    }

    // --- Status Page Stats ---

    pub fn get_event_stats(&self) -> Result<EventStats, DbError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(EventStats {
            count,
            db_size_bytes: page_count * page_size,
        })
    }
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [TIME_FORMAT, "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::DeviceIdentity;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::NamedTempFile;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn events() -> Vec<ActivityEvent> {
        let phone = DeviceIdentity::new("192.168.1.20".parse().unwrap(), Some("aa:bb:cc:dd:ee:14"));
        let printer = DeviceIdentity::new("192.168.1.30".parse().unwrap(), None);
        vec![
            ActivityEvent::new(
                at(300),
                phone.clone(),
                EventKind::BecameInactive {
                    idle_duration: TimeDelta::seconds(300),
                },
            ),
            ActivityEvent::new(at(360), printer, EventKind::Departed),
            ActivityEvent::new(at(420), phone, EventKind::BecameActive),
        ]
    }

    #[test]
    fn test_event_roundtrip() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.add_events(&events()).unwrap();

        let all = store.get_events(None, 10).unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].kind, "active");
        assert_eq!(all[2].kind, "inactive");
        assert_eq!(all[2].idle_seconds, Some(300));
        assert_eq!(all[2].time, at(300));
        assert_eq!(all[1].mac, None);
        assert_eq!(all[1].device_key, "ip:192.168.1.30");

        let phone = store.get_events(Some("mac:aa:bb:cc:dd:ee:14"), 10).unwrap();
        assert_eq!(phone.len(), 2);

        let limited = store.get_events(None, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_delete_events_before() {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        store.add_events(&events()).unwrap();

        let removed = store.delete_events_before(at(400)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get_event_stats().unwrap().count, 1);
    }

    #[test]
    fn test_reopen_keeps_history() {
        let tmp = NamedTempFile::new().unwrap();
        Store::new(tmp.path()).unwrap().add_events(&events()).unwrap();

        let reopened = Store::new(tmp.path()).unwrap();
        assert_eq!(reopened.get_event_stats().unwrap().count, 3);
    }
}
