//! Textual report log.
//!
//! Lines look like `[2026-10-17 09:30:00] [Inactive] 192.168.1.20 (MAC: ..) - 60 mins idle`.
//! The file is rotated to `<name>.1` once it grows past the size cap.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use super::{EventSink, SinkError};
use crate::tracker::ActivityEvent;

const HEADER: &str = "=== Inactivity Log ===";

/// Percentage of the size cap at which a warning is logged.
const SIZE_WARNING_PERCENT: u128 = 90;

/// Appends report lines to a size-capped log file.
#[derive(Debug)]
pub struct ReportLog {
    path: PathBuf,
    max_bytes: u64,
    write_lock: Mutex<()>,
    /// Set once the current file has crossed the warning size.
    size_warned: AtomicBool,
}

impl ReportLog {
    /// Open (creating if needed) the report log at `path`.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, SinkError> {
        let log = Self {
            path: path.into(),
            max_bytes,
            write_lock: Mutex::new(()),
            size_warned: AtomicBool::new(false),
        };
        if !log.path.exists() {
            start_file(&log.path)?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, line: &str) -> Result<(), SinkError> {
        let _guard = self.write_lock.lock().map_err(|_| SinkError::LockPoisoned)?;

        let size = fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size >= self.max_bytes {
            self.rotate()?;
        } else if size == 0 && !self.path.exists() {
            start_file(&self.path)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{}", line)?;

        let size = file.metadata()?.len();
        if near_cap(size, self.max_bytes) && !self.size_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                "Report log {} is at {} of {} bytes, rotation is near",
                self.path.display(),
                size,
                self.max_bytes
            );
        }
        Ok(())
    }

    fn rotate(&self) -> Result<(), SinkError> {
        let mut rotated = self.path.clone().into_os_string();
        rotated.push(".1");
        let rotated = PathBuf::from(rotated);

        if rotated.exists() {
            fs::remove_file(&rotated)?;
        }
        fs::rename(&self.path, &rotated)?;
        start_file(&self.path)?;
        self.size_warned.store(false, Ordering::Relaxed);

        tracing::info!(
            "Rotated report log {} -> {}",
            self.path.display(),
            rotated.display()
        );
        Ok(())
    }
}

fn near_cap(size: u64, max_bytes: u64) -> bool {
    u128::from(size) * 100 >= u128::from(max_bytes) * SIZE_WARNING_PERCENT
}

fn start_file(path: &Path) -> Result<(), SinkError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    writeln!(file, "{}", HEADER)?;
    Ok(())
}

impl EventSink for ReportLog {
    fn publish(&self, event: &ActivityEvent) -> Result<(), SinkError> {
        let line = format!("[{}] {}", event.at.format("%Y-%m-%d %H:%M:%S"), event.report_line());
        self.append(&line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{DeviceIdentity, EventKind};
    use chrono::{TimeDelta, TimeZone, Utc};

    fn inactive_event() -> ActivityEvent {
        ActivityEvent::new(
            Utc.with_ymd_and_hms(2026, 10, 17, 9, 30, 0).unwrap(),
            DeviceIdentity::new("192.168.1.20".parse().unwrap(), Some("aa:bb:cc:dd:ee:14")),
            EventKind::BecameInactive {
                idle_duration: TimeDelta::minutes(61),
            },
        )
    }

    #[test]
    fn test_writes_header_and_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReportLog::open(dir.path().join("inactivity_log.log"), 1024 * 1024).unwrap();
        log.publish(&inactive_event()).unwrap();

        let contents = fs::read_to_string(log.path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(
            lines,
            vec![
                HEADER,
                "[2026-10-17 09:30:00] [Inactive] 192.168.1.20 (MAC: aa:bb:cc:dd:ee:14) - 61 mins idle",
            ]
        );
    }

    #[test]
    fn test_existing_log_is_appended() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");
        fs::write(&path, "earlier line\n").unwrap();

        let log = ReportLog::open(&path, 1024 * 1024).unwrap();
        log.publish(&inactive_event()).unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("earlier line\n"));
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_near_cap() {
        assert!(!near_cap(89, 100));
        assert!(near_cap(90, 100));
        assert!(near_cap(u64::MAX, u64::MAX));
    }

    #[test]
    fn test_size_warning_resets_on_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let log = ReportLog::open(dir.path().join("report.log"), 200).unwrap();

        // Header plus one line is 109 bytes, under 90% of the cap.
        log.publish(&inactive_event()).unwrap();
        assert!(!log.size_warned.load(Ordering::Relaxed));

        log.publish(&inactive_event()).unwrap();
        assert!(log.size_warned.load(Ordering::Relaxed));

        // 281 bytes: past the cap, rotated on the next write.
        log.publish(&inactive_event()).unwrap();
        assert!(!dir.path().join("report.log.1").exists());
        log.publish(&inactive_event()).unwrap();
        assert!(dir.path().join("report.log.1").exists());
        assert!(!log.size_warned.load(Ordering::Relaxed));
    }

    #[test]
    fn test_rotates_past_cap() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.log");
        let log = ReportLog::open(&path, 64).unwrap();

        log.publish(&inactive_event()).unwrap();
        log.publish(&inactive_event()).unwrap();

        let rotated = fs::read_to_string(dir.path().join("report.log.1")).unwrap();
        assert_eq!(rotated.lines().count(), 2);
        let current = fs::read_to_string(&path).unwrap();
        assert_eq!(current.lines().count(), 2);
        assert!(current.starts_with(HEADER));
    }
}
