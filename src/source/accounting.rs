//! Per-device byte counters from an iptables accounting chain.
//!
//! The chain holds one rule per direction per device, with no target, so
//! packets are only counted. The whole chain is listed once per tick and
//! every device read in that tick is served from the cached listing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::process::Stdio;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tokio::process::Command;

use super::SourceError;
use crate::tracker::CounterSample;

/// Parent chains the accounting chain is attached to.
const PARENT_CHAINS: [&str; 3] = ["FORWARD", "INPUT", "OUTPUT"];

/// Bytes counted for one device, as seen from the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceBytes {
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug)]
struct CounterTable {
    read_at: DateTime<Utc>,
    counters: HashMap<IpAddr, DeviceBytes>,
}

/// Reads and maintains the accounting chain.
#[derive(Debug)]
pub struct AccountingCounters {
    chain: String,
    program: String,
    cache: tokio::sync::Mutex<Option<CounterTable>>,
}

impl AccountingCounters {
    pub fn new(chain: &str) -> Self {
        Self {
            chain: chain.to_string(),
            program: "iptables".to_string(),
            cache: tokio::sync::Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_program(chain: &str, program: &str) -> Self {
        Self {
            program: program.to_string(),
            ..Self::new(chain)
        }
    }

    /// Create the chain and hook it into the parent chains.
    pub async fn install(&self) -> Result<(), SourceError> {
        if let Err(e) = self.run(&["-N", &self.chain]).await {
            if !e.to_string().contains("exists") {
                return Err(e);
            }
        }

        for parent in PARENT_CHAINS {
            if self.run(&["-C", parent, "-j", &self.chain]).await.is_err() {
                self.run(&["-I", parent, "-j", &self.chain]).await?;
            }
        }

        tracing::info!("Accounting chain {} installed", self.chain);
        Ok(())
    }

    /// Counters for `ip` as of the tick at `now`.
    ///
    /// A device missing from the listing gets its rules (re)added and
    /// reports `NotTracked` until a later tick sees them.
    pub async fn read(&self, ip: IpAddr, now: DateTime<Utc>) -> Result<CounterSample, SourceError> {
        if ip.is_ipv6() {
            return Err(SourceError::Counter(format!("no IPv6 accounting for {}", ip)));
        }

        let bytes = {
            let mut cache = self.cache.lock().await;
            let stale = cache.as_ref().map_or(true, |t| t.read_at != now);
            if stale {
                let output = self.run(&["-nvxL", &self.chain]).await?;
                *cache = Some(CounterTable {
                    read_at: now,
                    counters: parse_accounting(&output),
                });
            }
            cache.as_ref().and_then(|t| t.counters.get(&ip).copied())
        };

        match bytes {
            Some(b) => Ok(CounterSample::new(b.sent, b.received, now)),
            None => {
                if let Err(e) = self.ensure_rules(ip).await {
                    tracing::warn!("Failed to add accounting rules for {}: {}", ip, e);
                }
                Err(SourceError::NotTracked(ip))
            }
        }
    }

    /// Add whichever of the two counting rules for `ip` is missing.
    async fn ensure_rules(&self, ip: IpAddr) -> Result<(), SourceError> {
        let addr = ip.to_string();
        for flag in ["-s", "-d"] {
            if self.run(&["-C", &self.chain, flag, &addr]).await.is_ok() {
                continue;
            }
            self.run(&["-A", &self.chain, flag, &addr]).await?;
            tracing::debug!("Added accounting rule {} {}", flag, addr);
        }
        Ok(())
    }

    async fn run(&self, args: &[&str]) -> Result<String, SourceError> {
        let output = Command::new(&self.program)
            .arg("-w")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| SourceError::Command(format!("failed to execute {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SourceError::Command(format!(
                "{} {} failed: {}",
                self.program,
                args.join(" "),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse `iptables -nvxL <chain>` into per-device byte counts.
///
/// A rule matching `source == ip` counts bytes sent by the device; a rule
/// matching `destination == ip` counts bytes it received.
pub fn parse_accounting(output: &str) -> HashMap<IpAddr, DeviceBytes> {
    static RULE_RE: OnceLock<Regex> = OnceLock::new();
    let re = RULE_RE.get_or_init(|| {
        Regex::new(r"^\s*(?P<pkts>\d+)\s+(?P<bytes>\d+)\s+.*\s(?P<src>\S+)\s+(?P<dst>\S+)\s*$")
            .unwrap()
    });

    let mut counters: HashMap<IpAddr, DeviceBytes> = HashMap::new();

    for line in output.lines() {
        let caps = match re.captures(line) {
            Some(c) => c,
            None => continue,
        };
        let bytes: u64 = match caps["bytes"].parse() {
            Ok(b) => b,
            Err(_) => continue,
        };

        if let Ok(src) = caps["src"].parse::<IpAddr>() {
            counters.entry(src).or_default().sent += bytes;
        }
        if let Ok(dst) = caps["dst"].parse::<IpAddr>() {
            counters.entry(dst).or_default().received += bytes;
        }
    }

    counters
}
