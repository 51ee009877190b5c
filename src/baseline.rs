//! Durable per-source state: baseline entries and the resume checkpoint.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Duration, FixedOffset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::detect::estimator::ELAPSED_EPSILON_SECS;
use crate::detect::AlertLevel;

/// Baseline key: a dimension, optionally inside a traffic-regime bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BaselineKey {
    pub bucket: Option<String>,
    pub dimension: String,
}

impl BaselineKey {
    pub fn new(bucket: Option<String>, dimension: impl Into<String>) -> Self {
        Self {
            bucket,
            dimension: dimension.into(),
        }
    }
}

impl fmt::Display for BaselineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bucket {
            Some(bucket) => write!(f, "{}/{}", bucket, self.dimension),
            None => f.write_str(&self.dimension),
        }
    }
}

/// Lifetime report count and the time it was observed over.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub observed_count: u64,
    pub elapsed_secs: f64,
    pub alert_level: AlertLevel,
}

impl BaselineEntry {
    /// State of a key the first time it is seen.
    pub fn cold() -> Self {
        Self {
            observed_count: 0,
            elapsed_secs: ELAPSED_EPSILON_SECS,
            alert_level: AlertLevel::Normal,
        }
    }

    /// Entry whose rate is `per_hour` over a window of `window_hours`.
    pub fn with_rate(per_hour: f64, window_hours: f64) -> Self {
        let per_hour = if per_hour.is_finite() && per_hour > 0.0 { per_hour } else { 0.0 };
        let window_hours = if window_hours.is_finite() && window_hours > 0.0 {
            window_hours
        } else {
            ELAPSED_EPSILON_SECS / 3600.0
        };
        Self {
            observed_count: (per_hour * window_hours).round() as u64,
            elapsed_secs: (window_hours * 3600.0).max(ELAPSED_EPSILON_SECS),
            alert_level: AlertLevel::Normal,
        }
    }

    pub fn rate_per_hour(&self) -> f64 {
        self.observed_count as f64 / self.elapsed_secs * 3600.0
    }

    /// Fold one period into the lifetime totals.
    pub fn absorb(&self, new_count: u64, period_secs: f64, level: AlertLevel) -> Self {
        Self {
            observed_count: self.observed_count.saturating_add(new_count),
            elapsed_secs: self.elapsed_secs + period_secs.max(0.0),
            alert_level: level,
        }
    }
}

/// Resume position for incremental fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Cursor {
    /// Highest record id already counted.
    Id(u64),
    /// Newest creation time already counted.
    Time(DateTime<Utc>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub cursor: Option<Cursor>,
    /// End of the last processed period; the next period starts here.
    pub period_end: Option<DateTime<Utc>>,
}

/// Everything persisted for one source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceState {
    pub checkpoint: Checkpoint,
    pub entries: BTreeMap<BaselineKey, BaselineEntry>,
    /// Last counted report time per reporter, for those still inside the
    /// duplicate window at the end of the last period.
    pub recent_reporters: BTreeMap<String, DateTime<Utc>>,
}

impl SourceState {
    pub fn cold_start() -> Self {
        Self::default()
    }

    pub fn is_first_run(&self) -> bool {
        self.checkpoint.period_end.is_none()
    }

    pub fn entry(&self, key: &BaselineKey) -> BaselineEntry {
        self.entries.get(key).copied().unwrap_or_else(BaselineEntry::cold)
    }
}

/// Split baselines by traffic regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Bucketing {
    #[default]
    None,
    /// `weekday` / `weekend` in the given UTC offset.
    DayType {
        #[serde(default)]
        utc_offset_hours: i32,
    },
    /// `on-hours` for weekdays between `start_hour` (inclusive) and
    /// `end_hour` (exclusive), `off-hours` otherwise.
    OfficeHours {
        #[serde(default)]
        utc_offset_hours: i32,
        #[serde(default = "default_start_hour")]
        start_hour: u32,
        #[serde(default = "default_end_hour")]
        end_hour: u32,
    },
}

fn default_start_hour() -> u32 {
    9
}

fn default_end_hour() -> u32 {
    17
}

impl Bucketing {
    pub fn bucket_for(&self, at: DateTime<Utc>) -> Option<String> {
        match *self {
            Bucketing::None => None,
            Bucketing::DayType { utc_offset_hours } => {
                let local = local_time(at, utc_offset_hours);
                let name = if is_weekend(local.weekday()) { "weekend" } else { "weekday" };
                Some(name.to_string())
            }
            Bucketing::OfficeHours {
                utc_offset_hours,
                start_hour,
                end_hour,
            } => {
                let local = local_time(at, utc_offset_hours);
                let on = !is_weekend(local.weekday()) && local.hour() >= start_hour && local.hour() < end_hour;
                Some(if on { "on-hours" } else { "off-hours" }.to_string())
            }
        }
    }
}

fn local_time(at: DateTime<Utc>, utc_offset_hours: i32) -> DateTime<FixedOffset> {
    match FixedOffset::east_opt(utc_offset_hours.clamp(-23, 23) * 3600) {
        Some(offset) => at.with_timezone(&offset),
        None => at.fixed_offset(),
    }
}

fn is_weekend(day: Weekday) -> bool {
    matches!(day, Weekday::Sat | Weekday::Sun)
}

/// Seconds between two instants, never negative.
pub fn seconds_between(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    let delta: Duration = end - start;
    (delta.num_milliseconds() as f64 / 1000.0).max(0.0)
}
