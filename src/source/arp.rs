//! Device discovery from the ARP table, with `arp -n` command fallback.

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use regex::Regex;
use tokio::process::Command;

use super::SourceError;
use crate::tracker::DeviceIdentity;

const BROADCAST_MAC: &str = "ff:ff:ff:ff:ff:ff";

/// Reads present devices from the kernel neighbour table.
#[derive(Debug, Clone)]
pub struct ArpTable {
    path: PathBuf,
}

impl ArpTable {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read the current device set.
    pub async fn read(&self) -> Result<Vec<DeviceIdentity>, SourceError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(parse_proc_arp(&contents)),
            Err(e) => {
                tracing::debug!(
                    "ARP table {} unreadable ({}), falling back to arp command",
                    self.path.display(),
                    e
                );
                run_arp_command().await
            }
        }
    }
}

/// Run `arp -n` and parse its output.
async fn run_arp_command() -> Result<Vec<DeviceIdentity>, SourceError> {
    let output = Command::new("arp")
        .arg("-n")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| SourceError::Discovery(format!("failed to execute arp: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceError::Discovery(format!("arp failed: {}", stderr.trim())));
    }

    Ok(parse_arp_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Parse `/proc/net/arp`. Incomplete entries (flags 0x0) are skipped.
pub fn parse_proc_arp(contents: &str) -> Vec<DeviceIdentity> {
    contents
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 || fields[2] == "0x0" {
                return None;
            }
            let ip: IpAddr = fields[0].parse().ok()?;
            identity(ip, Some(fields[3]))
        })
        .collect()
}

/// Parse `arp -n` / `arp -a` output from Linux, macOS or Windows.
///
/// Lines without a hardware address are unresolved and skipped.
pub fn parse_arp_output(output: &str) -> Vec<DeviceIdentity> {
    static IP_RE: OnceLock<Regex> = OnceLock::new();
    static MAC_RE: OnceLock<Regex> = OnceLock::new();
    let ip_re = IP_RE.get_or_init(|| Regex::new(r"\b(\d{1,3}(?:\.\d{1,3}){3})\b").unwrap());
    let mac_re = MAC_RE.get_or_init(|| {
        Regex::new(r"\b([0-9A-Fa-f]{1,2}(?:[:-][0-9A-Fa-f]{1,2}){5})\b").unwrap()
    });

    output
        .lines()
        .filter_map(|line| {
            let ip: IpAddr = ip_re.captures(line)?.get(1)?.as_str().parse().ok()?;
            let mac = mac_re.captures(line)?.get(1)?.as_str();
            identity(ip, Some(mac))
        })
        .collect()
}

fn identity(ip: IpAddr, mac: Option<&str>) -> Option<DeviceIdentity> {
    let identity = DeviceIdentity::new(ip, mac);
    if identity.mac.as_deref() == Some(BROADCAST_MAC) {
        return None;
    }
    Some(identity)
}
