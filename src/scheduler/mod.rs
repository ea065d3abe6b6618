//! Tick scheduler driving discovery, sampling and classification.

mod retention;

pub use retention::*;

use crate::config::MonitorConfig;
use crate::sink::EventSink;
use crate::source::{SampleSource, SourceError};
use crate::tracker::{
    Absence, ActivityEvent, ActivityLedger, ActivityPolicy, CounterSample, DeviceIdentity, DeviceKey,
    DeviceState, EventKind, LedgerError, LedgerUpdate,
};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::task::{JoinHandle, JoinSet};

/// Outcome of one tick, exposed through the status API.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickSummary {
    pub at: DateTime<Utc>,
    /// Trackable devices in the presence snapshot.
    pub present: usize,
    /// Ledger entries after the tick.
    pub tracked: usize,
    pub inactive: usize,
    pub events: usize,
    pub sample_errors: usize,
    /// Discovery failed and the ledger was left untouched.
    pub skipped: bool,
}

/// Shared handle to the most recent tick summary.
pub type TickStatus = Arc<RwLock<Option<TickSummary>>>;

/// Runs ticks at a fixed interval and publishes the resulting events.
pub struct Scheduler<S: SampleSource> {
    source: Arc<S>,
    ledger: Arc<ActivityLedger>,
    policy: ActivityPolicy,
    inactivity_warning: TimeDelta,
    check_interval: Duration,
    absence_purge_limit: u32,
    sinks: Vec<Arc<dyn EventSink>>,
    status: TickStatus,
    stop_tx: broadcast::Sender<()>,
}

impl<S: SampleSource> Scheduler<S> {
    pub fn new(source: Arc<S>, ledger: Arc<ActivityLedger>, config: &MonitorConfig) -> Self {
        let (stop_tx, _) = broadcast::channel(1);

        Self {
            source,
            ledger,
            policy: config.policy(),
            inactivity_warning: config.inactivity_warning(),
            check_interval: config.check_interval(),
            absence_purge_limit: config.absence_purge_limit,
            sinks: Vec::new(),
            status: Arc::new(RwLock::new(None)),
            stop_tx,
        }
    }

    /// Add a sink. Events reach sinks in the order they were added.
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn status_handle(&self) -> TickStatus {
        self.status.clone()
    }

    pub async fn status(&self) -> Option<TickSummary> {
        self.status.read().await.clone()
    }

    /// Start the tick loop. The first tick runs immediately.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        tracing::info!(
            "Starting scheduler: interval {:?}, threshold {} B/s, limit {}s",
            self.check_interval,
            self.policy.threshold_bytes_per_sec,
            self.policy.time_limit.num_seconds()
        );

        let stop_rx = self.stop_tx.subscribe();
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run(stop_rx).await })
    }

    /// Ask the loop to exit. A tick already in progress runs to completion.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }

    async fn run(&self, mut stop_rx: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.recv() => break,
                _ = interval.tick() => {
                    self.run_tick().await;
                }
            }
        }

        tracing::info!("Scheduler stopped");
    }

    pub async fn run_tick(&self) -> TickSummary {
        self.run_tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    pub async fn run_tick_at(&self, now: DateTime<Utc>) -> TickSummary {
        let present = match self.source.present_devices(now).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Skipping tick, discovery failed: {}", e);
                let summary = TickSummary {
                    at: now,
                    tracked: self.ledger.len(),
                    inactive: self.ledger.inactive_count(),
                    skipped: true,
                    ..Default::default()
                };
                *self.status.write().await = Some(summary.clone());
                return summary;
            }
        };

        let mut snapshot: BTreeMap<DeviceKey, DeviceIdentity> = BTreeMap::new();
        for identity in present {
            if identity.is_trackable() {
                snapshot.insert(identity.key(), identity);
            }
        }

        let mut samples = self.read_all(&snapshot, now).await;
        let mut events = Vec::new();
        let mut sample_errors = 0;

        for (key, identity) in &snapshot {
            if self.ledger.observe(identity, now) {
                tracing::info!("Discovered device {}", identity);
            }

            let sample = match samples.remove(key) {
                Some(Ok(sample)) => sample,
                Some(Err(SourceError::NotTracked(ip))) => {
                    tracing::debug!("No counters for {} yet", ip);
                    sample_errors += 1;
                    continue;
                }
                Some(Err(e)) => {
                    tracing::warn!("Failed to read counters for {}: {}", identity, e);
                    sample_errors += 1;
                    continue;
                }
                None => {
                    sample_errors += 1;
                    continue;
                }
            };

            match self.ledger.update(identity, sample, now, &self.policy) {
                Ok(update) => {
                    if let Some(remaining) = warning_crossed(&update, now, &self.policy, self.inactivity_warning) {
                        tracing::warn!(
                            "Device {} has been quiet for {} mins, inactive in {} mins",
                            identity,
                            (self.policy.time_limit - remaining).num_minutes(),
                            remaining.num_minutes()
                        );
                    }
                    if let Some(transition) = update.classification.transition {
                        let event = ActivityEvent::new(now, identity.clone(), transition.into());
                        tracing::info!("{}", event.report_line());
                        events.push(event);
                    }
                }
                Err(LedgerError::Classify(e)) => {
                    tracing::debug!("Ignoring sample for {}: {}", identity, e);
                }
                Err(e) => {
                    tracing::warn!("Ledger update failed for {}: {}", identity, e);
                }
            }
        }

        let mut absent: Vec<DeviceKey> = self
            .ledger
            .keys()
            .into_iter()
            .filter(|k| !snapshot.contains_key(k))
            .collect();
        absent.sort();

        for key in absent {
            match self.ledger.mark_absent(&key, self.absence_purge_limit) {
                Some(Absence::Purged(entry)) => {
                    let event = ActivityEvent::new(now, entry.identity, EventKind::Departed);
                    tracing::info!("{}", event.report_line());
                    events.push(event);
                }
                Some(Absence::Missing(n)) => {
                    tracing::debug!("Device {} missing for {} ticks", key, n);
                }
                None => {}
            }
        }

        self.publish(&events);

        let summary = TickSummary {
            at: now,
            present: snapshot.len(),
            tracked: self.ledger.len(),
            inactive: self.ledger.inactive_count(),
            events: events.len(),
            sample_errors,
            skipped: false,
        };
        *self.status.write().await = Some(summary.clone());
        summary
    }

    /// Read counters for every present device concurrently.
    async fn read_all(
        &self,
        snapshot: &BTreeMap<DeviceKey, DeviceIdentity>,
        now: DateTime<Utc>,
    ) -> HashMap<DeviceKey, Result<CounterSample, SourceError>> {
        let mut reads = JoinSet::new();
        for (key, identity) in snapshot {
            let source = Arc::clone(&self.source);
            let key = key.clone();
            let identity = identity.clone();
            reads.spawn(async move {
                let result = source.read_counters(&identity, now).await;
                (key, result)
            });
        }

        let mut samples = HashMap::with_capacity(snapshot.len());
        while let Some(joined) = reads.join_next().await {
            match joined {
                Ok((key, result)) => {
                    samples.insert(key, result);
                }
                Err(e) => tracing::error!("Counter read task failed: {}", e),
            }
        }
        samples
    }

    fn publish(&self, events: &[ActivityEvent]) {
        for event in events {
            for sink in &self.sinks {
                if let Err(e) = sink.publish(event) {
                    tracing::error!("Failed to publish event \"{}\": {}", event.report_line(), e);
                }
            }
        }
    }
}

/// Time left before the limit, when this update is the first of the quiet
/// period to reach `warning` before it.
fn warning_crossed(
    update: &LedgerUpdate,
    now: DateTime<Utc>,
    policy: &ActivityPolicy,
    warning: TimeDelta,
) -> Option<TimeDelta> {
    let c = &update.classification;
    if warning <= TimeDelta::zero() || c.state != DeviceState::Active {
        return None;
    }
    let since = c.low_activity_since?;
    let warn_at = policy.time_limit - warning;
    let idle = now - since;
    let previous_idle = update
        .previous
        .map(|p| p.observed_at - since)
        .unwrap_or_else(TimeDelta::zero);

    if previous_idle < warn_at && idle >= warn_at && idle < policy.time_limit {
        Some(policy.time_limit - idle)
    } else {
        None
    }
}
