//! One monitoring pass over one source:
//! load, fetch, classify, estimate, alert, persist.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use crate::baseline::{seconds_between, BaselineKey, Bucketing, Checkpoint, SourceState};
use crate::classify::{Classifier, ClassifierConfig, DimensionMode, TOTAL_KEY};
use crate::detect::estimator::estimate;
use crate::detect::incident::Incident;
use crate::detect::policy::{AlertAction, AlertPolicy, AlertSubject};
use crate::detect::PeriodSummary;
use crate::fetch::{FetchOutcome, FetchWindow, Fetched, IncrementalFetcher, RetryPolicy};
use crate::notify::Notifier;
use crate::sources::Source;
use crate::storage::{BaselineStore, RunRecord, StoreError};

/// Per-source knobs resolved from configuration.
#[derive(Debug, Clone)]
pub struct SourceSettings {
    pub classifier: ClassifierConfig,
    pub policy: AlertPolicy,
    pub bucketing: Bucketing,
    /// First-run lookback; the source's default when `None`.
    pub lookback: Option<chrono::Duration>,
    /// Overrides the source's own freshness lag.
    pub freshness_lag: Option<chrono::Duration>,
    pub retry: RetryPolicy,
    pub max_pages: u32,
    pub link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryOutcome {
    Sent,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub key: String,
    pub action: AlertAction,
    pub outcome: DeliveryOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// The period is still inside the source's freshness lag; nothing was
    /// fetched or persisted.
    NotReady,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub source: String,
    pub status: RunStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub fetched: usize,
    pub counted: u64,
    pub dropped: u64,
    pub summaries: Vec<PeriodSummary>,
    pub deliveries: Vec<Delivery>,
}

impl RunReport {
    fn not_ready(source: &str, period_start: DateTime<Utc>, period_end: DateTime<Utc>) -> Self {
        Self {
            source: source.to_string(),
            status: RunStatus::NotReady,
            period_start,
            period_end,
            fetched: 0,
            counted: 0,
            dropped: 0,
            summaries: Vec::new(),
            deliveries: Vec::new(),
        }
    }

    pub fn failed_deliveries(&self) -> usize {
        self.deliveries
            .iter()
            .filter(|d| matches!(d.outcome, DeliveryOutcome::Failed(_)))
            .count()
    }
}

pub struct SourceRunner {
    source: Box<dyn Source>,
    settings: SourceSettings,
    store: BaselineStore,
    notifier: Arc<dyn Notifier>,
}

impl SourceRunner {
    pub fn new(
        source: Box<dyn Source>,
        settings: SourceSettings,
        store: BaselineStore,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            source,
            settings,
            store,
            notifier,
        }
    }

    pub fn name(&self) -> &str {
        self.source.name()
    }

    fn freshness_lag(&self) -> chrono::Duration {
        self.settings.freshness_lag.unwrap_or_else(|| self.source.freshness_lag())
    }

    /// Corrupt rows start the source cold; any other store error aborts
    /// the run so nothing is overwritten.
    fn load_state(&self) -> anyhow::Result<SourceState> {
        match self.store.load(self.name()) {
            Ok(state) => Ok(state),
            Err(StoreError::Corrupt(e)) => {
                warn!(source = %self.name(), error = %e, "Stored state unusable, starting cold");
                Ok(SourceState::cold_start())
            }
            Err(e) => Err(e).with_context(|| format!("failed to load state for source '{}'", self.name())),
        }
    }

    /// Keys estimated this period: the bucket's known keys plus every key
    /// counted now, and the total when it is tracked.
    fn period_keys(&self, state: &SourceState, bucket: &Option<String>, counted: &[&String]) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = state
            .entries
            .keys()
            .filter(|k| &k.bucket == bucket)
            .map(|k| k.dimension.clone())
            .collect();
        keys.extend(counted.iter().map(|k| (*k).clone()));
        let c = &self.settings.classifier;
        if c.dimensions == DimensionMode::Aggregate || c.track_total {
            keys.insert(TOTAL_KEY.to_string());
        }
        keys
    }

    async fn deliver(&self, action: &AlertAction) -> DeliveryOutcome {
        let result = match action {
            AlertAction::Notify {
                channel,
                severity,
                message,
            } => self.notifier.notify(message, channel, *severity).await,
            AlertAction::Page { service, message } => self.notifier.page(message, service).await,
        };
        match result {
            Ok(()) => DeliveryOutcome::Sent,
            Err(e) => {
                error!(source = %self.name(), action = action.kind(), target = %action.target(), "Delivery failed: {}", e);
                DeliveryOutcome::Failed(e.to_string())
            }
        }
    }

    /// Run one period ending at `now` (less the freshness lag).
    pub async fn run(&self, now: DateTime<Utc>) -> anyhow::Result<RunReport> {
        let name = self.name().to_string();
        let mut state = self.load_state()?;
        let first_run = state.is_first_run();

        let lookback = self.settings.lookback.unwrap_or_else(|| self.source.default_lookback());
        let lookback_start = now - lookback;
        let since = state.checkpoint.period_end.unwrap_or(lookback_start);
        let until = now - self.freshness_lag();

        if until <= since {
            info!(source = %name, period_end = %until, "Period not ready yet");
            return Ok(RunReport::not_ready(&name, since, until));
        }

        let window = FetchWindow {
            cursor: state.checkpoint.cursor.clone(),
            since,
            until,
        };
        let fetcher = IncrementalFetcher::new(self.source.as_ref(), self.settings.retry.clone(), self.settings.max_pages)
            .with_freshness_lag(self.freshness_lag());
        let outcome: FetchOutcome = match fetcher
            .fetch(&window, now)
            .await
            .with_context(|| format!("fetch failed for source '{}'", name))?
        {
            Fetched::NotReady => return Ok(RunReport::not_ready(&name, since, until)),
            Fetched::Ready(outcome) => outcome,
        };

        let mut classifier = Classifier::new(self.settings.classifier.clone(), since, until)
            .with_recent_reporters(&state.recent_reporters);
        let tally = classifier.tally(&outcome.records);
        info!(
            source = %name,
            fetched = outcome.records.len(),
            pages = outcome.pages,
            counted = tally.counts.values().sum::<u64>(),
            dropped = tally.total_dropped(),
            "Fetched period"
        );

        // A first run measures each key from its own oldest report, not
        // from the lookback edge.
        let period_start = if first_run {
            tally.oldest.unwrap_or(lookback_start)
        } else {
            since
        };
        let bucket = self.settings.bucketing.bucket_for(until);
        let counted: Vec<&String> = tally.counts.keys().collect();
        let keys = self.period_keys(&state, &bucket, &counted);

        let subject = AlertSubject {
            source: &name,
            link: self.settings.link.as_deref(),
        };
        let mut summaries = Vec::with_capacity(keys.len());
        let mut deliveries = Vec::new();
        let mut incidents = Vec::new();

        for dimension in keys {
            let key = BaselineKey::new(bucket.clone(), dimension.clone());
            let entry = state.entry(&key);
            let new_count = tally.counts.get(&dimension).copied().unwrap_or(0);
            let key_start = match tally.oldest_by_key.get(&dimension) {
                Some(oldest) if first_run => *oldest,
                _ => period_start,
            };
            let period_secs = seconds_between(key_start, until);
            let e = estimate(entry.observed_count, entry.elapsed_secs, new_count, period_secs);

            let mut summary = PeriodSummary {
                key: dimension.clone(),
                historical_count: entry.observed_count,
                historical_secs: entry.elapsed_secs,
                new_count,
                period_secs,
                mean: e.mean,
                probability: e.probability,
                level: entry.alert_level,
            };
            let decision = self.settings.policy.decide(entry.alert_level, &summary, subject);
            summary.level = decision.level;
            info!(
                source = %name,
                key = %key,
                historical_count = summary.historical_count,
                historical_secs = summary.historical_secs,
                new_count = summary.new_count,
                period_secs = summary.period_secs,
                mean = summary.mean,
                probability = summary.probability,
                level = %summary.level,
                "Period summary"
            );

            for action in decision.actions {
                let outcome = self.deliver(&action).await;
                let error = match &outcome {
                    DeliveryOutcome::Sent => None,
                    DeliveryOutcome::Failed(e) => Some(e.clone()),
                };
                incidents.push(Incident::new(&name, &summary, &action, error, now));
                deliveries.push(Delivery {
                    key: dimension.clone(),
                    action,
                    outcome,
                });
            }

            state
                .entries
                .insert(key, entry.absorb(new_count, period_secs, decision.level));
            summaries.push(summary);
        }

        state.recent_reporters = classifier.recent_reporters();
        state.checkpoint = Checkpoint {
            cursor: outcome.cursor.clone(),
            period_end: Some(until),
        };
        let counted: u64 = tally.counts.get(TOTAL_KEY).copied().unwrap_or_else(|| tally.counts.values().sum());
        let run = RunRecord {
            period_start,
            period_end: until,
            fetched: outcome.records.len(),
            counted,
            alerts: deliveries.len(),
        };
        self.store
            .save(&name, &state, &run, &incidents)
            .with_context(|| format!("failed to persist state for source '{}'", name))?;

        Ok(RunReport {
            source: name,
            status: RunStatus::Completed,
            period_start,
            period_end: until,
            fetched: outcome.records.len(),
            counted,
            dropped: tally.total_dropped(),
            summaries,
            deliveries,
        })
    }
}
