//! Inactivity classification.
//!
//! A pure function of two consecutive samples and the device's ledger entry.
//! It never touches the ledger; the caller applies the returned decision.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

use super::models::{CounterSample, DeviceState, EventKind, LedgerEntry};

/// Classifier error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassifyError {
    #[error("non-positive sample interval ({0} ms)")]
    NonPositiveInterval(i64),
}

/// How sent and received traffic combine into one rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateAggregation {
    /// Sent and received deltas are summed.
    #[default]
    Sum,
    /// Each direction is evaluated on its own; the busier one decides.
    Max,
}

impl FromStr for RateAggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(RateAggregation::Sum),
            "max" => Ok(RateAggregation::Max),
            other => Err(format!("unknown rate aggregation: {}", other)),
        }
    }
}

/// Whether a rate equal to the threshold counts as quiet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdBoundary {
    /// Quiet iff `rate < threshold`.
    #[default]
    Exclusive,
    /// Quiet iff `rate <= threshold`.
    Inclusive,
}

impl FromStr for ThresholdBoundary {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exclusive" => Ok(ThresholdBoundary::Exclusive),
            "inclusive" => Ok(ThresholdBoundary::Inclusive),
            other => Err(format!("unknown threshold boundary: {}", other)),
        }
    }
}

/// Thresholds and policy points the classifier decides with.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivityPolicy {
    pub threshold_bytes_per_sec: f64,
    #[serde(serialize_with = "serialize_secs")]
    pub time_limit: TimeDelta,
    pub aggregation: RateAggregation,
    pub boundary: ThresholdBoundary,
}

fn serialize_secs<S: serde::Serializer>(value: &TimeDelta, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_i64(value.num_seconds())
}

impl ActivityPolicy {
    pub fn new(threshold_bytes_per_sec: f64, time_limit: TimeDelta) -> Self {
        Self {
            threshold_bytes_per_sec,
            time_limit,
            aggregation: RateAggregation::default(),
            boundary: ThresholdBoundary::default(),
        }
    }

    fn is_quiet(&self, rate: f64) -> bool {
        match self.boundary {
            ThresholdBoundary::Exclusive => rate < self.threshold_bytes_per_sec,
            ThresholdBoundary::Inclusive => rate <= self.threshold_bytes_per_sec,
        }
    }
}

/// State change produced by a classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    BecameInactive { idle_duration: TimeDelta },
    BecameActive,
}

impl From<Transition> for EventKind {
    fn from(t: Transition) -> Self {
        match t {
            Transition::BecameInactive { idle_duration } => EventKind::BecameInactive { idle_duration },
            Transition::BecameActive => EventKind::BecameActive,
        }
    }
}

/// The classifier's verdict for one sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    /// Bytes/sec between the two samples; `None` on first observation.
    pub rate: Option<f64>,
    pub low_activity_since: Option<DateTime<Utc>>,
    pub state: DeviceState,
    pub transition: Option<Transition>,
}

/// Classify `current` against the previous sample for the device in `entry`.
pub fn classify(
    previous: Option<&CounterSample>,
    current: &CounterSample,
    entry: &LedgerEntry,
    now: DateTime<Utc>,
    policy: &ActivityPolicy,
) -> Result<Classification, ClassifyError> {
    let unchanged = Classification {
        rate: None,
        low_activity_since: entry.low_activity_since,
        state: entry.state,
        transition: None,
    };

    let previous = match previous {
        Some(p) => p,
        None => return Ok(unchanged),
    };

    let elapsed = current.observed_at - previous.observed_at;
    if elapsed <= TimeDelta::zero() {
        return Err(ClassifyError::NonPositiveInterval(elapsed.num_milliseconds()));
    }
    let elapsed_secs = elapsed
        .to_std()
        .map_err(|_| ClassifyError::NonPositiveInterval(elapsed.num_milliseconds()))?
        .as_secs_f64();

    let rate = compute_rate(previous, current, elapsed_secs, policy.aggregation);

    if policy.is_quiet(rate) {
        // The quiet period began when the previous sample was taken.
        let since = entry.low_activity_since.unwrap_or(previous.observed_at);
        let idle = now - since;

        if entry.state == DeviceState::Active && idle >= policy.time_limit {
            return Ok(Classification {
                rate: Some(rate),
                low_activity_since: Some(since),
                state: DeviceState::Inactive,
                transition: Some(Transition::BecameInactive { idle_duration: idle }),
            });
        }

        return Ok(Classification {
            rate: Some(rate),
            low_activity_since: Some(since),
            ..unchanged
        });
    }

    let transition = match entry.state {
        DeviceState::Inactive => Some(Transition::BecameActive),
        DeviceState::Active => None,
    };

    Ok(Classification {
        rate: Some(rate),
        low_activity_since: None,
        state: DeviceState::Active,
        transition,
    })
}

/// Rate in bytes/sec; a counter that went backwards contributes nothing.
fn compute_rate(
    previous: &CounterSample,
    current: &CounterSample,
    elapsed_secs: f64,
    aggregation: RateAggregation,
) -> f64 {
    let sent = i128::from(current.bytes_sent) - i128::from(previous.bytes_sent);
    let received = i128::from(current.bytes_received) - i128::from(previous.bytes_received);

    let delta = match aggregation {
        RateAggregation::Sum => (sent + received).max(0),
        RateAggregation::Max => sent.max(0).max(received.max(0)),
    };

    delta as f64 / elapsed_secs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::models::DeviceIdentity;
    use chrono::TimeZone;
    use std::net::{IpAddr, Ipv4Addr};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn entry() -> LedgerEntry {
        let identity = DeviceIdentity::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 5)), Some("aa:bb:cc:00:11:22"));
        LedgerEntry::new(identity, at(0))
    }

    fn policy() -> ActivityPolicy {
        ActivityPolicy::new(1024.0, TimeDelta::seconds(300))
    }

    #[test]
    fn test_first_sample_takes_no_action() {
        let current = CounterSample::new(100, 100, at(0));
        let c = classify(None, &current, &entry(), at(0), &policy()).unwrap();
        assert_eq!(c.rate, None);
        assert_eq!(c.low_activity_since, None);
        assert_eq!(c.state, DeviceState::Active);
        assert_eq!(c.transition, None);
    }

    #[test]
    fn test_non_positive_interval_is_rejected() {
        let previous = CounterSample::new(0, 0, at(60));
        let duplicate = CounterSample::new(0, 0, at(60));
        let older = CounterSample::new(0, 0, at(30));

        let err = classify(Some(&previous), &duplicate, &entry(), at(60), &policy()).unwrap_err();
        assert_eq!(err, ClassifyError::NonPositiveInterval(0));
        assert!(classify(Some(&previous), &older, &entry(), at(60), &policy()).is_err());
    }

    #[test]
    fn test_quiet_sample_starts_countdown() {
        let previous = CounterSample::new(1000, 1000, at(0));
        let current = CounterSample::new(1000, 1000, at(60));
        let c = classify(Some(&previous), &current, &entry(), at(60), &policy()).unwrap();
        assert_eq!(c.rate, Some(0.0));
        assert_eq!(c.low_activity_since, Some(at(0)));
        assert_eq!(c.state, DeviceState::Active);
        assert_eq!(c.transition, None);
    }

    #[test]
    fn test_quiet_past_limit_goes_inactive() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        let previous = CounterSample::new(0, 0, at(240));
        let current = CounterSample::new(10, 10, at(300));

        let c = classify(Some(&previous), &current, &e, at(300), &policy()).unwrap();
        assert_eq!(c.state, DeviceState::Inactive);
        assert_eq!(
            c.transition,
            Some(Transition::BecameInactive {
                idle_duration: TimeDelta::seconds(300)
            })
        );
        assert_eq!(c.low_activity_since, Some(at(0)));
    }

    #[test]
    fn test_already_inactive_does_not_fire_again() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        e.state = DeviceState::Inactive;
        let previous = CounterSample::new(0, 0, at(600));
        let current = CounterSample::new(0, 0, at(660));

        let c = classify(Some(&previous), &current, &e, at(660), &policy()).unwrap();
        assert_eq!(c.state, DeviceState::Inactive);
        assert_eq!(c.transition, None);
    }

    #[test]
    fn test_activity_resumes() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        e.state = DeviceState::Inactive;
        let previous = CounterSample::new(0, 0, at(600));
        let current = CounterSample::new(100_000, 20_000, at(660));

        let c = classify(Some(&previous), &current, &e, at(660), &policy()).unwrap();
        assert_eq!(c.state, DeviceState::Active);
        assert_eq!(c.low_activity_since, None);
        assert_eq!(c.transition, Some(Transition::BecameActive));
        assert_eq!(c.rate, Some(2000.0));
    }

    #[test]
    fn test_just_below_threshold_stays_inactive() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        e.state = DeviceState::Inactive;
        let previous = CounterSample::new(0, 0, at(600));
        // 1000 B/s
        let current = CounterSample::new(50_000, 10_000, at(660));

        let c = classify(Some(&previous), &current, &e, at(660), &policy()).unwrap();
        assert_eq!(c.rate, Some(1000.0));
        assert_eq!(c.state, DeviceState::Inactive);
        assert_eq!(c.transition, None);
    }

    #[test]
    fn test_sub_millisecond_interval_keeps_precision() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        e.state = DeviceState::Inactive;
        let previous = CounterSample::new(0, 0, at(600));
        let current = CounterSample::new(0, 0, at(600) + TimeDelta::microseconds(500));

        let c = classify(Some(&previous), &current, &e, current.observed_at, &policy()).unwrap();
        assert_eq!(c.rate, Some(0.0));
        assert_eq!(c.state, DeviceState::Inactive);
        assert_eq!(c.transition, None);
        assert_eq!(c.low_activity_since, Some(at(0)));

        // 1 byte in 500us is 2000 B/s.
        let busy = CounterSample::new(1, 0, current.observed_at);
        let c = classify(Some(&previous), &busy, &e, busy.observed_at, &policy()).unwrap();
        assert!((c.rate.unwrap() - 2000.0).abs() < 1e-6);
        assert_eq!(c.transition, Some(Transition::BecameActive));
    }

    #[test]
    fn test_rate_equal_to_threshold_is_active() {
        let mut e = entry();
        e.low_activity_since = Some(at(0));
        let previous = CounterSample::new(0, 0, at(0));
        let current = CounterSample::new(1024, 0, at(1));

        let c = classify(Some(&previous), &current, &e, at(1), &policy()).unwrap();
        assert_eq!(c.rate, Some(1024.0));
        assert_eq!(c.low_activity_since, None);

        let inclusive = ActivityPolicy {
            boundary: ThresholdBoundary::Inclusive,
            ..policy()
        };
        let c = classify(Some(&previous), &current, &e, at(1), &inclusive).unwrap();
        assert_eq!(c.low_activity_since, Some(at(0)));
    }

    #[test]
    fn test_counter_reset_counts_as_zero() {
        let previous = CounterSample::new(9_000_000, 9_000_000, at(0));
        let current = CounterSample::new(10, 20, at(60));

        let c = classify(Some(&previous), &current, &entry(), at(60), &policy()).unwrap();
        assert_eq!(c.rate, Some(0.0));
        assert_eq!(c.low_activity_since, Some(at(0)));
    }

    #[test]
    fn test_max_aggregation_evaluates_directions_independently() {
        // 600 B/s each way: busy when summed, quiet when each direction stands alone.
        let previous = CounterSample::new(0, 0, at(0));
        let current = CounterSample::new(600, 600, at(1));

        let summed = classify(Some(&previous), &current, &entry(), at(1), &policy()).unwrap();
        assert_eq!(summed.rate, Some(1200.0));
        assert_eq!(summed.low_activity_since, None);

        let max = ActivityPolicy {
            aggregation: RateAggregation::Max,
            ..policy()
        };
        let independent = classify(Some(&previous), &current, &entry(), at(1), &max).unwrap();
        assert_eq!(independent.rate, Some(600.0));
        assert_eq!(independent.low_activity_since, Some(at(0)));
    }

    #[test]
    fn test_parse_policy_points() {
        assert_eq!("SUM".parse::<RateAggregation>(), Ok(RateAggregation::Sum));
        assert_eq!("max".parse::<RateAggregation>(), Ok(RateAggregation::Max));
        assert!("avg".parse::<RateAggregation>().is_err());
        assert_eq!(" inclusive ".parse::<ThresholdBoundary>(), Ok(ThresholdBoundary::Inclusive));
        assert!("open".parse::<ThresholdBoundary>().is_err());
    }
}
