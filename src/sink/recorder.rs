//! Event history recorder.
//!
//! Events are handed to a channel and persisted by a batch writer task, so
//! a slow database never stalls a tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::{EventSink, SinkError};
use crate::db::Store;
use crate::tracker::ActivityEvent;

const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const FLUSH_BATCH: usize = 500;

/// Sink that persists events to the store.
#[derive(Clone)]
pub struct EventRecorder {
    tx: mpsc::UnboundedSender<ActivityEvent>,
}

impl EventRecorder {
    /// Spawn the batch writer. It exits, after a final flush, once every
    /// recorder handle has been dropped.
    pub fn spawn(store: Arc<Store>) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(run_batch_writer(rx, store));
        (Self { tx }, handle)
    }
}

impl EventSink for EventRecorder {
    fn publish(&self, event: &ActivityEvent) -> Result<(), SinkError> {
        self.tx.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}

/// Accumulate events and flush them in order.
async fn run_batch_writer(mut rx: mpsc::UnboundedReceiver<ActivityEvent>, store: Arc<Store>) {
    let mut buffer: Vec<ActivityEvent> = Vec::with_capacity(64);
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(e) => {
                        buffer.push(e);
                        if buffer.len() >= FLUSH_BATCH {
                            flush_buffer(&store, &mut buffer);
                        }
                    }
                    None => {
                        flush_buffer(&store, &mut buffer);
                        break;
                    }
                }
            }
            _ = interval.tick() => {
                flush_buffer(&store, &mut buffer);
            }
        }
    }

    tracing::debug!("Event recorder stopped");
}

fn flush_buffer(store: &Store, buffer: &mut Vec<ActivityEvent>) {
    if buffer.is_empty() {
        return;
    }

    match store.add_events(buffer) {
        Ok(()) => buffer.clear(),
        // Keep the batch and retry on the next flush.
        Err(e) => tracing::error!("Failed to record {} events: {}", buffer.len(), e),
    }
}
