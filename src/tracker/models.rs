//! Device, sample and event types shared by the tracker.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

/// Key a ledger entry is stored under.
///
/// MAC is preferred so a device keeps its history across DHCP renewals;
/// the IP is only used when no MAC is known.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKey {
    Mac(String),
    Ip(IpAddr),
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKey::Mac(mac) => write!(f, "mac:{}", mac),
            DeviceKey::Ip(ip) => write!(f, "ip:{}", ip),
        }
    }
}

/// A network endpoint as reported by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub ip: IpAddr,
    pub mac: Option<String>,
}

impl DeviceIdentity {
    /// Build an identity, normalizing the MAC to lowercase colon-separated form.
    ///
    /// Empty and all-zero MACs (incomplete ARP entries) are treated as unknown.
    pub fn new(ip: IpAddr, mac: Option<&str>) -> Self {
        Self {
            ip,
            mac: mac.and_then(normalize_mac),
        }
    }

    pub fn key(&self) -> DeviceKey {
        match &self.mac {
            Some(mac) => DeviceKey::Mac(mac.clone()),
            None => DeviceKey::Ip(self.ip),
        }
    }

    /// Broadcast, multicast and unspecified addresses never belong to a device.
    pub fn is_trackable(&self) -> bool {
        !(self.ip.is_unspecified()
            || self.ip.is_multicast()
            || self.ip == IpAddr::V4(Ipv4Addr::BROADCAST))
    }

    pub fn mac_or_unknown(&self) -> &str {
        self.mac.as_deref().unwrap_or("unknown")
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (MAC: {})", self.ip, self.mac_or_unknown())
    }
}

fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_ascii_lowercase().replace('-', ":");
    if mac.is_empty() || mac.chars().all(|c| c == '0' || c == ':') {
        return None;
    }
    Some(mac)
}

/// Cumulative byte counters for one device at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterSample {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub observed_at: DateTime<Utc>,
}

impl CounterSample {
    pub fn new(bytes_sent: u64, bytes_received: u64, observed_at: DateTime<Utc>) -> Self {
        Self {
            bytes_sent,
            bytes_received,
            observed_at,
        }
    }
}

/// Activity classification of a tracked device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Inactive,
}

/// Per-device rolling state held by the ledger.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub identity: DeviceIdentity,
    pub last_counters: Option<CounterSample>,
    /// Start of the current quiet period; unset while the device is busy.
    pub low_activity_since: Option<DateTime<Utc>>,
    pub state: DeviceState,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Most recent computed rate in bytes/sec.
    pub last_rate: Option<f64>,
    /// Consecutive ticks the device was missing from discovery.
    pub missing_ticks: u32,
}

impl LedgerEntry {
    /// A freshly sighted device: active, no counters yet.
    pub fn new(identity: DeviceIdentity, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            last_counters: None,
            low_activity_since: None,
            state: DeviceState::Active,
            first_seen_at: now,
            last_seen_at: now,
            last_rate: None,
            missing_ticks: 0,
        }
    }

    /// How long the device has been quiet at `now`, if it is quiet at all.
    pub fn idle_for(&self, now: DateTime<Utc>) -> Option<TimeDelta> {
        self.low_activity_since.map(|since| now - since)
    }
}

/// What happened to a device on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    BecameInactive { idle_duration: TimeDelta },
    BecameActive,
    Departed,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::BecameInactive { .. } => "inactive",
            EventKind::BecameActive => "active",
            EventKind::Departed => "departed",
        }
    }
}

/// A classification change emitted by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub identity: DeviceIdentity,
    pub kind: EventKind,
}

impl ActivityEvent {
    pub fn new(at: DateTime<Utc>, identity: DeviceIdentity, kind: EventKind) -> Self {
        Self { at, identity, kind }
    }

    /// Render the event in the report line format consumed by existing log tooling.
    pub fn report_line(&self) -> String {
        match &self.kind {
            EventKind::BecameInactive { idle_duration } => {
                format!("[Inactive] {} - {} mins idle", self.identity, idle_duration.num_minutes())
            }
            EventKind::BecameActive => format!("[Active] {} - resumed", self.identity),
            EventKind::Departed => format!("[Departed] {}", self.identity),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 1, last))
    }

    #[test]
    fn test_key_prefers_mac() {
        let with_mac = DeviceIdentity::new(ip(20), Some("AA-BB-CC-DD-EE-FF"));
        assert_eq!(with_mac.key(), DeviceKey::Mac("aa:bb:cc:dd:ee:ff".to_string()));

        let moved = DeviceIdentity::new(ip(21), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(with_mac.key(), moved.key());

        let without_mac = DeviceIdentity::new(ip(22), None);
        assert_eq!(without_mac.key(), DeviceKey::Ip(ip(22)));
    }

    #[test]
    fn test_incomplete_mac_falls_back_to_ip() {
        let identity = DeviceIdentity::new(ip(30), Some("00:00:00:00:00:00"));
        assert_eq!(identity.mac, None);
        assert_eq!(identity.key(), DeviceKey::Ip(ip(30)));
    }

    #[test]
    fn test_broadcast_is_not_trackable() {
        assert!(DeviceIdentity::new(ip(20), None).is_trackable());
        assert!(!DeviceIdentity::new(IpAddr::V4(Ipv4Addr::BROADCAST), None).is_trackable());
        assert!(!DeviceIdentity::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), None).is_trackable());
        assert!(!DeviceIdentity::new("224.0.0.251".parse().unwrap(), None).is_trackable());
    }

    #[test]
    fn test_report_line_floors_minutes() {
        let identity = DeviceIdentity::new(ip(20), Some("aa:bb:cc:dd:ee:ff"));
        let event = ActivityEvent::new(
            Utc::now(),
            identity,
            EventKind::BecameInactive {
                idle_duration: TimeDelta::seconds(359),
            },
        );
        assert_eq!(
            event.report_line(),
            "[Inactive] 192.168.1.20 (MAC: aa:bb:cc:dd:ee:ff) - 5 mins idle"
        );
    }

    #[test]
    fn test_report_line_unknown_mac() {
        let event = ActivityEvent::new(Utc::now(), DeviceIdentity::new(ip(9), None), EventKind::Departed);
        assert_eq!(event.report_line(), "[Departed] 192.168.1.9 (MAC: unknown)");
    }
}
