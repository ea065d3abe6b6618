//! Per-device activity ledger.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use thiserror::Error;

use super::classifier::{classify, ActivityPolicy, Classification, ClassifyError};
use super::models::{CounterSample, DeviceIdentity, DeviceKey, DeviceState, LedgerEntry};

/// Ledger error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("device {0} is not tracked")]
    UnknownDevice(DeviceKey),
    #[error(transparent)]
    Classify(#[from] ClassifyError),
}

/// Result of recording a sample.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerUpdate {
    pub previous: Option<CounterSample>,
    pub classification: Classification,
}

/// Result of a tick on which a known device was not discovered.
#[derive(Debug, Clone)]
pub enum Absence {
    Missing(u32),
    Purged(LedgerEntry),
}

/// Rolling state for every tracked device, keyed by MAC (or IP).
///
/// Entries live in a sharded map: writers to different devices do not
/// block each other, and each entry is only mutated under its shard lock.
#[derive(Debug, Default)]
pub struct ActivityLedger {
    entries: DashMap<DeviceKey, LedgerEntry>,
}

impl ActivityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a device as present on this tick. Returns `true` on first sighting.
    pub fn observe(&self, identity: &DeviceIdentity, now: DateTime<Utc>) -> bool {
        match self.entries.entry(identity.key()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.identity.ip != identity.ip {
                    tracing::info!(
                        "Device {} moved from {} to {}",
                        identity.mac_or_unknown(),
                        entry.identity.ip,
                        identity.ip
                    );
                }
                entry.identity = identity.clone();
                entry.last_seen_at = now;
                entry.missing_ticks = 0;
                false
            }
            Entry::Vacant(vacant) => {
                vacant.insert(LedgerEntry::new(identity.clone(), now));
                true
            }
        }
    }

    /// Record `sample` as the device's latest counters and classify it.
    ///
    /// The previous sample and the resulting classification are returned.
    /// A sample that is not newer than the stored one leaves the entry untouched.
    pub fn update(
        &self,
        identity: &DeviceIdentity,
        sample: CounterSample,
        now: DateTime<Utc>,
        policy: &ActivityPolicy,
    ) -> Result<LedgerUpdate, LedgerError> {
        let key = identity.key();
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or(LedgerError::UnknownDevice(key))?;

        let previous = entry.last_counters;
        let classification = classify(previous.as_ref(), &sample, &entry, now, policy)?;

        entry.last_counters = Some(sample);
        entry.low_activity_since = classification.low_activity_since;
        entry.state = classification.state;
        if classification.rate.is_some() {
            entry.last_rate = classification.rate;
        }

        Ok(LedgerUpdate {
            previous,
            classification,
        })
    }

    /// Count a missed tick for `key`, purging the entry once `limit` is reached.
    pub fn mark_absent(&self, key: &DeviceKey, limit: u32) -> Option<Absence> {
        let missing = {
            let mut entry = self.entries.get_mut(key)?;
            entry.missing_ticks += 1;
            entry.missing_ticks
        };

        if missing < limit {
            return Some(Absence::Missing(missing));
        }

        self.entries
            .remove(key)
            .map(|(_, entry)| Absence::Purged(entry))
    }

    pub fn get(&self, key: &DeviceKey) -> Option<LedgerEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn keys(&self) -> Vec<DeviceKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Copy of every entry, ordered by key.
    pub fn snapshot(&self) -> Vec<LedgerEntry> {
        let mut entries: Vec<(DeviceKey, LedgerEntry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, e)| e).collect()
    }

    pub fn inactive_count(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state == DeviceState::Inactive)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
