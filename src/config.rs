//! Configuration module for idlewatch.
//!
//! Loads configuration from environment variables with sensible defaults.
//! Unlike a missing variable, a malformed or out-of-range value is fatal.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::Serialize;
use thiserror::Error;

use crate::tracker::{ActivityPolicy, RateAggregation, ThresholdBoundary};

/// Configuration error types.
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("{var}: cannot parse {value:?}: {reason}")]
    Parse {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Monitor configuration loaded from environment variables.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
    /// Seconds between checks (default: 60)
    pub check_interval_secs: u64,
    /// Bytes/sec below which a device counts as quiet (default: 1024)
    pub inactivity_threshold: f64,
    /// Seconds a device must stay quiet to become inactive (default: 3600)
    pub inactivity_time_limit_secs: u64,
    /// Seconds before the time limit at which a quiet device is warned about
    /// (default: 300). Zero, or a value not below the limit, disables it.
    pub inactivity_warning_secs: u64,
    /// Consecutive missed discoveries before a device is purged (default: 5)
    pub absence_purge_limit: u32,
    pub rate_aggregation: RateAggregation,
    pub threshold_boundary: ThresholdBoundary,
    /// HTTP port for the status API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite event history (default: "idlewatch.db")
    pub db_path: String,
    /// Textual report log (default: "inactivity_log.log")
    pub report_log: String,
    pub report_log_max_bytes: u64,
    /// Days of event history to keep (default: 30)
    pub event_retention_days: u32,
    pub arp_path: String,
    pub accounting_chain: String,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            inactivity_threshold: 1024.0,
            inactivity_time_limit_secs: 3600,
            inactivity_warning_secs: 300,
            absence_purge_limit: 5,
            rate_aggregation: RateAggregation::Sum,
            threshold_boundary: ThresholdBoundary::Exclusive,
            http_port: 8080,
            db_path: "idlewatch.db".to_string(),
            report_log: "inactivity_log.log".to_string(),
            report_log_max_bytes: 10 * 1024 * 1024,
            event_retention_days: 30,
            arp_path: "/proc/net/arp".to_string(),
            accounting_chain: "IDLEWATCH".to_string(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables and validate it.
    ///
    /// Environment variables:
    /// - `IDLEWATCH_CHECK_INTERVAL_SECS`
    /// - `IDLEWATCH_INACTIVITY_THRESHOLD` (bytes/sec)
    /// - `IDLEWATCH_INACTIVITY_TIME_LIMIT_SECS`
    /// - `IDLEWATCH_INACTIVITY_WARNING_SECS`
    /// - `IDLEWATCH_ABSENCE_PURGE_LIMIT` (ticks)
    /// - `IDLEWATCH_RATE_AGGREGATION` (`sum` | `max`)
    /// - `IDLEWATCH_THRESHOLD_BOUNDARY` (`exclusive` | `inclusive`)
    /// - `IDLEWATCH_HTTP_PORT`
    /// - `IDLEWATCH_DB_PATH`
    /// - `IDLEWATCH_REPORT_LOG`
    /// - `IDLEWATCH_REPORT_LOG_MAX_BYTES`
    /// - `IDLEWATCH_EVENT_RETENTION_DAYS`
    /// - `IDLEWATCH_ARP_PATH`
    /// - `IDLEWATCH_ACCOUNTING_CHAIN`
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        parse_var(&lookup, "IDLEWATCH_CHECK_INTERVAL_SECS", &mut cfg.check_interval_secs)?;
        parse_var(&lookup, "IDLEWATCH_INACTIVITY_THRESHOLD", &mut cfg.inactivity_threshold)?;
        parse_var(&lookup, "IDLEWATCH_INACTIVITY_TIME_LIMIT_SECS", &mut cfg.inactivity_time_limit_secs)?;
        parse_var(&lookup, "IDLEWATCH_INACTIVITY_WARNING_SECS", &mut cfg.inactivity_warning_secs)?;
        parse_var(&lookup, "IDLEWATCH_ABSENCE_PURGE_LIMIT", &mut cfg.absence_purge_limit)?;
        parse_var(&lookup, "IDLEWATCH_RATE_AGGREGATION", &mut cfg.rate_aggregation)?;
        parse_var(&lookup, "IDLEWATCH_THRESHOLD_BOUNDARY", &mut cfg.threshold_boundary)?;
        parse_var(&lookup, "IDLEWATCH_HTTP_PORT", &mut cfg.http_port)?;
        parse_var(&lookup, "IDLEWATCH_REPORT_LOG_MAX_BYTES", &mut cfg.report_log_max_bytes)?;
        parse_var(&lookup, "IDLEWATCH_EVENT_RETENTION_DAYS", &mut cfg.event_retention_days)?;

        if let Some(db_path) = lookup("IDLEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        if let Some(report_log) = lookup("IDLEWATCH_REPORT_LOG") {
            cfg.report_log = report_log;
        }
        if let Some(arp_path) = lookup("IDLEWATCH_ARP_PATH") {
            cfg.arp_path = arp_path;
        }
        if let Some(chain) = lookup("IDLEWATCH_ACCOUNTING_CHAIN") {
            cfg.accounting_chain = chain;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval_secs == 0 {
            return Err(ConfigError::Invalid("check interval must be positive".to_string()));
        }
        if !self.inactivity_threshold.is_finite() || self.inactivity_threshold <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "inactivity threshold must be a positive rate, got {}",
                self.inactivity_threshold
            )));
        }
        if self.inactivity_time_limit_secs == 0 {
            return Err(ConfigError::Invalid("inactivity time limit must be positive".to_string()));
        }
        if i64::try_from(self.inactivity_time_limit_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .is_none()
        {
            return Err(ConfigError::Invalid("inactivity time limit is too large".to_string()));
        }
        if self.inactivity_warning_secs > self.inactivity_time_limit_secs {
            tracing::warn!(
                "Inactivity warning ({}s) exceeds the time limit ({}s), warnings disabled",
                self.inactivity_warning_secs,
                self.inactivity_time_limit_secs
            );
        }
        if self.absence_purge_limit == 0 {
            return Err(ConfigError::Invalid("absence purge limit must be at least one tick".to_string()));
        }
        if self.report_log_max_bytes == 0 {
            return Err(ConfigError::Invalid("report log size cap must be positive".to_string()));
        }
        if self.accounting_chain.trim().is_empty() {
            return Err(ConfigError::Invalid("accounting chain name is empty".to_string()));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    /// Lead time for the pre-limit warning; zero when disabled.
    pub fn inactivity_warning(&self) -> TimeDelta {
        if self.inactivity_warning_secs >= self.inactivity_time_limit_secs {
            return TimeDelta::zero();
        }
        TimeDelta::seconds(self.inactivity_warning_secs as i64)
    }

    pub fn policy(&self) -> ActivityPolicy {
        ActivityPolicy {
            threshold_bytes_per_sec: self.inactivity_threshold,
            time_limit: TimeDelta::seconds(self.inactivity_time_limit_secs as i64),
            aggregation: self.rate_aggregation,
            boundary: self.threshold_boundary,
        }
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, target: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(value) = lookup(var) {
        *target = value.trim().parse().map_err(|e: T::Err| ConfigError::Parse {
            var,
            value: value.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.check_interval_secs, 60);
        assert_eq!(cfg.inactivity_threshold, 1024.0);
        assert_eq!(cfg.absence_purge_limit, 5);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "idlewatch.db");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let cfg = MonitorConfig::from_lookup(lookup(&[
            ("IDLEWATCH_CHECK_INTERVAL_SECS", "15"),
            ("IDLEWATCH_INACTIVITY_THRESHOLD", "512.5"),
            ("IDLEWATCH_INACTIVITY_TIME_LIMIT_SECS", "300"),
            ("IDLEWATCH_RATE_AGGREGATION", "max"),
            ("IDLEWATCH_THRESHOLD_BOUNDARY", "inclusive"),
            ("IDLEWATCH_DB_PATH", "/var/lib/idlewatch/events.db"),
        ]))
        .unwrap();

        assert_eq!(cfg.check_interval(), Duration::from_secs(15));
        assert_eq!(cfg.db_path, "/var/lib/idlewatch/events.db");

        let policy = cfg.policy();
        assert_eq!(policy.threshold_bytes_per_sec, 512.5);
        assert_eq!(policy.time_limit, TimeDelta::seconds(300));
        assert_eq!(policy.aggregation, RateAggregation::Max);
        assert_eq!(policy.boundary, ThresholdBoundary::Inclusive);
    }

    #[test]
    fn test_inactivity_warning_lead_time() {
        let cfg = MonitorConfig::default();
        assert_eq!(cfg.inactivity_warning(), TimeDelta::seconds(300));

        let cfg = MonitorConfig::from_lookup(lookup(&[
            ("IDLEWATCH_INACTIVITY_TIME_LIMIT_SECS", "300"),
            ("IDLEWATCH_INACTIVITY_WARNING_SECS", "300"),
        ]))
        .unwrap();
        assert_eq!(cfg.inactivity_warning(), TimeDelta::zero());

        let cfg = MonitorConfig::from_lookup(lookup(&[("IDLEWATCH_INACTIVITY_WARNING_SECS", "0")])).unwrap();
        assert_eq!(cfg.inactivity_warning(), TimeDelta::zero());
    }

    #[test]
    fn test_malformed_value_is_fatal() {
        let err = MonitorConfig::from_lookup(lookup(&[("IDLEWATCH_HTTP_PORT", "eighty")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { var: "IDLEWATCH_HTTP_PORT", .. }));
    }

    #[test]
    fn test_non_positive_values_rejected() {
        for (var, value) in [
            ("IDLEWATCH_CHECK_INTERVAL_SECS", "0"),
            ("IDLEWATCH_INACTIVITY_THRESHOLD", "0"),
            ("IDLEWATCH_INACTIVITY_THRESHOLD", "-5"),
            ("IDLEWATCH_INACTIVITY_TIME_LIMIT_SECS", "0"),
            ("IDLEWATCH_ABSENCE_PURGE_LIMIT", "0"),
        ] {
            let result = MonitorConfig::from_lookup(lookup(&[(var, value)]));
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "{}={} accepted", var, value);
        }
    }

    #[test]
    fn test_negative_interval_does_not_parse() {
        let err = MonitorConfig::from_lookup(lookup(&[("IDLEWATCH_CHECK_INTERVAL_SECS", "-60")])).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
