//! Record filtering and dimension labelling.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::sources::Record;

/// Key of the source-wide total.
pub const TOTAL_KEY: &str = "all";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DimensionMode {
    PerDimension,
    #[default]
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClassifierConfig {
    pub dimensions: DimensionMode,
    /// In per-dimension mode, also count every kept record under `all`.
    pub track_total: bool,
    /// A record must carry at least one of these tags, when non-empty.
    pub require_tags: Vec<String>,
    pub exclude_tags: Vec<String>,
    pub exclude_reporters: Vec<String>,
    /// Shared identities never subject to duplicate suppression.
    pub anonymous_reporters: Vec<String>,
    pub duplicate_window_secs: i64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            dimensions: DimensionMode::Aggregate,
            track_total: false,
            require_tags: Vec::new(),
            exclude_tags: Vec::new(),
            exclude_reporters: Vec::new(),
            anonymous_reporters: vec!["anonymous".to_string()],
            duplicate_window_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DropReason {
    OutsideWindow,
    Spam,
    Batch,
    MissingTag,
    ExcludedTag,
    ExcludedReporter,
    NoDimension,
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Count(String),
    Drop(DropReason),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tally {
    pub counts: BTreeMap<String, u64>,
    pub dropped: BTreeMap<DropReason, u64>,
    /// Creation time of the oldest counted record.
    pub oldest: Option<DateTime<Utc>>,
    /// The same, per counted key.
    pub oldest_by_key: BTreeMap<String, DateTime<Utc>>,
}

impl Tally {
    pub fn total_dropped(&self) -> u64 {
        self.dropped.values().sum()
    }
}

pub struct Classifier {
    config: ClassifierConfig,
    since: DateTime<Utc>,
    until: DateTime<Utc>,
    last_counted: HashMap<String, DateTime<Utc>>,
}

impl Classifier {
    /// Classify records inside `(since, until]`.
    pub fn new(config: ClassifierConfig, since: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        Self {
            config,
            since,
            until,
            last_counted: HashMap::new(),
        }
    }

    /// Seed duplicate suppression with reporters counted before `since`.
    pub fn with_recent_reporters(mut self, recent: &BTreeMap<String, DateTime<Utc>>) -> Self {
        self.last_counted
            .extend(recent.iter().map(|(reporter, at)| (reporter.clone(), *at)));
        self
    }

    /// Reporters whose last counted report can still suppress one arriving
    /// after `until`.
    pub fn recent_reporters(&self) -> BTreeMap<String, DateTime<Utc>> {
        let window = chrono::Duration::seconds(self.config.duplicate_window_secs);
        self.last_counted
            .iter()
            .filter(|(_, at)| self.until - **at < window)
            .map(|(reporter, at)| (reporter.clone(), *at))
            .collect()
    }

    fn has_tag(record: &Record, wanted: &[String]) -> bool {
        record.tags.iter().any(|t| wanted.iter().any(|w| w.eq_ignore_ascii_case(t)))
    }

    /// Records must be fed in ascending creation order for duplicate
    /// suppression to look backwards.
    pub fn classify(&mut self, record: &Record) -> Verdict {
        if record.created_at <= self.since || record.created_at > self.until {
            return Verdict::Drop(DropReason::OutsideWindow);
        }
        if record.spam {
            return Verdict::Drop(DropReason::Spam);
        }
        if record.batch {
            return Verdict::Drop(DropReason::Batch);
        }
        if !self.config.require_tags.is_empty() && !Self::has_tag(record, &self.config.require_tags) {
            return Verdict::Drop(DropReason::MissingTag);
        }
        if Self::has_tag(record, &self.config.exclude_tags) {
            return Verdict::Drop(DropReason::ExcludedTag);
        }
        if let Some(reporter) = &record.reporter {
            if self.config.exclude_reporters.iter().any(|r| r == reporter) {
                return Verdict::Drop(DropReason::ExcludedReporter);
            }
        }

        let key = match self.config.dimensions {
            DimensionMode::Aggregate => TOTAL_KEY.to_string(),
            DimensionMode::PerDimension => match &record.dimension {
                Some(d) if !d.trim().is_empty() => d.trim().to_string(),
                _ => {
                    warn!(id = record.id, "Record has no dimension, dropping");
                    return Verdict::Drop(DropReason::NoDimension);
                }
            },
        };

        if let Some(reporter) = &record.reporter {
            if !self.config.anonymous_reporters.iter().any(|a| a == reporter) {
                let window = chrono::Duration::seconds(self.config.duplicate_window_secs);
                if let Some(previous) = self.last_counted.get(reporter) {
                    if record.created_at - *previous < window {
                        debug!(id = record.id, reporter = %reporter, "Duplicate report, dropping");
                        return Verdict::Drop(DropReason::Duplicate);
                    }
                }
                self.last_counted.insert(reporter.clone(), record.created_at);
            }
        }

        Verdict::Count(key)
    }

    pub fn tally(&mut self, records: &[Record]) -> Tally {
        let mut tally = Tally::default();
        for record in records {
            match self.classify(record) {
                Verdict::Count(key) => {
                    let counts_total = self.config.dimensions == DimensionMode::PerDimension && self.config.track_total;
                    let mut keys = vec![key];
                    if counts_total {
                        keys.push(TOTAL_KEY.to_string());
                    }
                    for key in keys {
                        let oldest = tally.oldest_by_key.entry(key.clone()).or_insert(record.created_at);
                        *oldest = (*oldest).min(record.created_at);
                        *tally.counts.entry(key).or_default() += 1;
                    }
                    tally.oldest = Some(tally.oldest.map_or(record.created_at, |o| o.min(record.created_at)));
                }
                Verdict::Drop(reason) => *tally.dropped.entry(reason).or_default() += 1,
            }
        }
        tally
    }
}
