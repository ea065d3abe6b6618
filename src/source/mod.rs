//! Sample sources: device discovery and per-device byte counters.
//!
//! The host implementation reads the ARP table for presence and an iptables
//! accounting chain for counters.

mod accounting;
mod arp;

pub use accounting::*;
pub use arp::*;

use chrono::{DateTime, Utc};
use std::future::Future;
use std::net::IpAddr;
use thiserror::Error;

use crate::tracker::{CounterSample, DeviceIdentity};

/// Sample source error types.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("counter read failed: {0}")]
    Counter(String),
    #[error("no accounting counters for {0} yet")]
    NotTracked(IpAddr),
    #[error("command failed: {0}")]
    Command(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Supplies the per-tick presence snapshot and counter samples.
pub trait SampleSource: Send + Sync + 'static {
    /// Devices currently present on the network.
    fn present_devices(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<DeviceIdentity>, SourceError>> + Send;

    /// Cumulative counters for one present device.
    fn read_counters(
        &self,
        identity: &DeviceIdentity,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<CounterSample, SourceError>> + Send;
}

/// Discovery from the host ARP table, counters from iptables accounting.
pub struct HostSampleSource {
    arp: ArpTable,
    counters: AccountingCounters,
}

impl HostSampleSource {
    pub fn new(arp: ArpTable, counters: AccountingCounters) -> Self {
        Self { arp, counters }
    }

    /// Prepare the accounting chain. Failure is not fatal: counters will
    /// simply be unavailable until the chain exists.
    pub async fn install(&self) {
        if let Err(e) = self.counters.install().await {
            tracing::warn!("Accounting chain setup failed, counters unavailable: {}", e);
        }
    }
}

impl SampleSource for HostSampleSource {
    async fn present_devices(&self, _now: DateTime<Utc>) -> Result<Vec<DeviceIdentity>, SourceError> {
        self.arp.read().await
    }

    async fn read_counters(
        &self,
        identity: &DeviceIdentity,
        now: DateTime<Utc>,
    ) -> Result<CounterSample, SourceError> {
        self.counters.read(identity.ip, now).await
    }
}
