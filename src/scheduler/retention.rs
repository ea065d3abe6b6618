//! Retention manager for pruning old event history.

use crate::db::Store;

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);

/// Manager for deleting events past the retention period.
pub struct RetentionManager {
    store: Arc<Store>,
    retention: TimeDelta,
    stop: Arc<Mutex<Option<tokio::sync::broadcast::Sender<()>>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, retention_days: u32) -> Self {
        Self {
            store,
            retention: TimeDelta::days(i64::from(retention_days)),
            stop: Arc::new(Mutex::new(None)),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let store = self.store.clone();
        let retention = self.retention;
        let stop = self.stop.clone();

        tokio::spawn(async move {
            let (tx, _) = tokio::sync::broadcast::channel(1);
            {
                let mut stop_guard = stop.lock().await;
                *stop_guard = Some(tx.clone());
            }

            let mut rx = tx.subscribe();
            let mut interval = tokio::time::interval(RETENTION_INTERVAL);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, retention, Utc::now());
                    }
                }
            }
        });
    }

    /// Stop the retention manager.
    pub async fn stop(&self) {
        let stop = self.stop.lock().await;
        if let Some(tx) = stop.as_ref() {
            let _ = tx.send(());
        }
    }
}

/// Delete events older than `retention` as of `now`. Returns the number removed.
fn process_retention(store: &Store, retention: TimeDelta, now: DateTime<Utc>) -> usize {
    let cutoff = now - retention;

    match store.delete_events_before(cutoff) {
        Ok(0) => 0,
        Ok(n) => {
            tracing::info!("RetentionManager: Pruned {} events older than {}", n, cutoff);
            n
        }
        Err(e) => {
            tracing::error!("RetentionManager: Failed to prune events: {}", e);
            0
        }
    }
}
