//! End-to-end runs against an in-memory source, a recording notifier and a
//! real on-disk store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use bugwatch::baseline::{BaselineEntry, BaselineKey, Bucketing};
use bugwatch::classify::{ClassifierConfig, TOTAL_KEY};
use bugwatch::detect::incident::IncidentManager;
use bugwatch::detect::policy::{AlertAction, AlertPolicy, PolicyMode, Thresholds};
use bugwatch::detect::{AlertLevel, Severity};
use bugwatch::fetch::{RetryPolicy, DEFAULT_MAX_PAGES};
use bugwatch::notify::{Notifier, NotifyError};
use bugwatch::runner::{DeliveryOutcome, RunStatus, SourceRunner, SourceSettings};
use bugwatch::sources::{CursorKind, Page, PageOrder, PageRequest, Record, Source, SourceError};
use bugwatch::storage::BaselineStore;

#[derive(Default)]
struct Feed {
    records: Mutex<Vec<Record>>,
    broken: AtomicBool,
}

struct MemorySource(Arc<Feed>);

#[async_trait]
impl Source for MemorySource {
    fn name(&self) -> &str {
        "helpdesk"
    }

    fn order(&self) -> PageOrder {
        PageOrder::Ascending
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Time
    }

    fn default_lookback(&self) -> Duration {
        Duration::days(7)
    }

    async fn fetch_page(&self, _request: &PageRequest<'_>) -> Result<Page, SourceError> {
        if self.0.broken.load(Ordering::SeqCst) {
            return Err(SourceError::Auth(401));
        }
        Ok(Page {
            records: self.0.records.lock().unwrap().clone(),
            next: None,
        })
    }
}

#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, message: &str, channel: &str, _severity: Severity) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Status {
                status: 500,
                body: "webhook down".into(),
            });
        }
        self.sent.lock().unwrap().push((format!("notify {}", channel), message.to_string()));
        Ok(())
    }

    async fn page(&self, message: &str, service: &str) -> Result<(), NotifyError> {
        self.sent.lock().unwrap().push((format!("page {}", service), message.to_string()));
        Ok(())
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    store: BaselineStore,
    feed: Arc<Feed>,
    recorder: Arc<Recorder>,
    runner: SourceRunner,
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
}

fn harness() -> Harness {
    harness_with(Bucketing::None)
}

fn harness_with(bucketing: Bucketing) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = BaselineStore::open(&dir.path().join("bugwatch.db")).unwrap();
    let feed = Arc::new(Feed::default());
    let recorder = Arc::new(Recorder::default());
    let settings = SourceSettings {
        classifier: ClassifierConfig::default(),
        policy: AlertPolicy::new(
            Thresholds::default(),
            PolicyMode::Poisson,
            "#1s-and-0s",
            Some("on-call".to_string()),
        ),
        bucketing,
        lookback: None,
        freshness_lag: None,
        retry: RetryPolicy::default(),
        max_pages: DEFAULT_MAX_PAGES,
        link: Some("https://support.example.com/triage".to_string()),
    };
    let runner = SourceRunner::new(
        Box::new(MemorySource(feed.clone())),
        settings,
        store.clone(),
        recorder.clone(),
    );
    Harness {
        _dir: dir,
        store,
        feed,
        recorder,
        runner,
    }
}

/// `n` reports spread over the minutes after `start`.
fn burst(first_id: u64, n: u64, start: DateTime<Utc>) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new(first_id + i, start + Duration::seconds(20 * i as i64 + 1)))
        .collect()
}

fn total_key() -> BaselineKey {
    BaselineKey::new(None, TOTAL_KEY)
}

/// First run at `t0`, then a history of 10 reports over 10 hours.
async fn seeded() -> Harness {
    let h = harness();
    let report = h.runner.run(t0()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    h.store
        .reset_entry("helpdesk", &total_key(), &BaselineEntry::with_rate(1.0, 10.0))
        .unwrap();
    h
}

#[tokio::test]
async fn test_first_run_builds_cold_baseline_without_alerting() {
    let h = harness();
    *h.feed.records.lock().unwrap() = burst(1, 40, t0() - Duration::hours(3));

    let report = h.runner.run(t0()).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.counted, 40);
    assert!(report.deliveries.is_empty());
    assert!(h.recorder.sent.lock().unwrap().is_empty());

    let state = h.store.load("helpdesk").unwrap();
    let entry = state.entry(&total_key());
    assert_eq!(entry.observed_count, 40);
    // measured from the oldest report, not from the lookback edge
    assert!(entry.elapsed_secs < 3.0 * 3600.0);
    assert_eq!(state.checkpoint.period_end, Some(t0()));
}

#[tokio::test]
async fn test_spike_notifies_pages_and_does_not_repeat() {
    let h = seeded().await;

    *h.feed.records.lock().unwrap() = burst(1, 20, t0());
    let report = h.runner.run(t0() + Duration::minutes(10)).await.unwrap();
    assert_eq!(report.summaries.len(), 1);
    let summary = &report.summaries[0];
    assert_eq!(summary.new_count, 20);
    assert!((summary.mean - 10.0 / 36_000.0 * 600.0).abs() < 1e-9);
    assert!(summary.probability > 0.9995);
    assert_eq!(summary.level, AlertLevel::Critical);

    assert_eq!(report.deliveries.len(), 2);
    assert!(report.deliveries.iter().all(|d| d.outcome == DeliveryOutcome::Sent));
    assert!(matches!(report.deliveries[1].action, AlertAction::Page { .. }));
    {
        let sent = h.recorder.sent.lock().unwrap();
        assert_eq!(sent[0].0, "notify #1s-and-0s");
        assert_eq!(sent[1].0, "page on-call");
        assert!(sent[0].1.contains("Elevated bug report rate on helpdesk"));
        assert!(sent[0].1.ends_with("See https://support.example.com/triage"));
    }

    let incidents = IncidentManager::new(h.store.pool().clone())
        .list_recent(Some("helpdesk"), 10)
        .unwrap();
    assert_eq!(incidents.len(), 2);
    assert!(incidents.iter().all(|i| i.delivered));

    // the spike continues: level holds, nothing new is sent
    *h.feed.records.lock().unwrap() = burst(100, 20, t0() + Duration::minutes(10));
    let report = h.runner.run(t0() + Duration::minutes(20)).await.unwrap();
    assert_eq!(report.summaries[0].level, AlertLevel::Critical);
    assert!(report.deliveries.is_empty());
    assert_eq!(h.recorder.sent.lock().unwrap().len(), 2);

    let entry = h.store.load("helpdesk").unwrap().entry(&total_key());
    assert_eq!(entry.observed_count, 50);
    assert_eq!(entry.alert_level, AlertLevel::Critical);
}

#[tokio::test]
async fn test_normal_rate_stays_quiet() {
    let h = seeded().await;
    *h.feed.records.lock().unwrap() = burst(1, 1, t0());
    let report = h.runner.run(t0() + Duration::hours(1)).await.unwrap();
    assert_eq!(report.summaries[0].level, AlertLevel::Normal);
    assert!(report.deliveries.is_empty());
}

#[tokio::test]
async fn test_fatal_fetch_leaves_store_untouched() {
    let h = seeded().await;
    let before = h.store.load("helpdesk").unwrap();

    h.feed.broken.store(true, Ordering::SeqCst);
    *h.feed.records.lock().unwrap() = burst(1, 20, t0());
    let err = h.runner.run(t0() + Duration::minutes(10)).await.unwrap_err();
    assert!(format!("{:#}", err).contains("authentication rejected"));

    assert_eq!(h.store.load("helpdesk").unwrap(), before);
    assert!(h.recorder.sent.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_delivery_is_recorded_and_run_completes() {
    let h = seeded().await;
    h.recorder.failing.store(true, Ordering::SeqCst);

    *h.feed.records.lock().unwrap() = burst(1, 20, t0());
    let report = h.runner.run(t0() + Duration::minutes(10)).await.unwrap();
    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.failed_deliveries(), 1);
    assert!(matches!(&report.deliveries[0].outcome, DeliveryOutcome::Failed(e) if e.contains("webhook down")));
    // the page still went out
    assert_eq!(report.deliveries[1].outcome, DeliveryOutcome::Sent);

    let incidents = IncidentManager::new(h.store.pool().clone())
        .list_recent(Some("helpdesk"), 10)
        .unwrap();
    let failed: Vec<_> = incidents.iter().filter(|i| !i.delivered).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].error.as_deref(), Some("HTTP 500: webhook down"));

    let state = h.store.load("helpdesk").unwrap();
    assert_eq!(state.checkpoint.period_end, Some(t0() + Duration::minutes(10)));
    assert_eq!(state.entry(&total_key()).observed_count, 30);
}

#[tokio::test]
async fn test_day_type_buckets_advance_independently() {
    let h = harness_with(Bucketing::DayType { utc_offset_hours: 0 });
    let weekday = |dimension: &str| BaselineKey::new(Some("weekday".to_string()), dimension);
    let weekend = |dimension: &str| BaselineKey::new(Some("weekend".to_string()), dimension);

    // Monday
    *h.feed.records.lock().unwrap() = burst(1, 5, t0() - Duration::hours(3));
    h.runner.run(t0()).await.unwrap();
    let monday = h.store.load("helpdesk").unwrap().entry(&weekday(TOTAL_KEY));
    assert_eq!(monday.observed_count, 5);
    assert!(h.store.load("helpdesk").unwrap().entries.get(&weekend(TOTAL_KEY)).is_none());

    // Saturday: the whole period since Monday goes to the weekend bucket
    *h.feed.records.lock().unwrap() = burst(10, 4, t0() + Duration::days(4));
    let report = h.runner.run(t0() + Duration::days(5)).await.unwrap();
    assert_eq!(report.summaries.len(), 1);
    let state = h.store.load("helpdesk").unwrap();
    let saturday = state.entry(&weekend(TOTAL_KEY));
    assert_eq!(saturday.observed_count, 4);
    assert!((saturday.elapsed_secs - 5.0 * 86_400.0).abs() < 1.0);
    assert_eq!(state.entry(&weekday(TOTAL_KEY)), monday);

    // next Monday: back to the weekday bucket, the weekend one is untouched
    *h.feed.records.lock().unwrap() = burst(20, 3, t0() + Duration::days(6));
    h.runner.run(t0() + Duration::days(7)).await.unwrap();
    let state = h.store.load("helpdesk").unwrap();
    assert_eq!(state.entry(&weekend(TOTAL_KEY)), saturday);
    let next_monday = state.entry(&weekday(TOTAL_KEY));
    assert_eq!(next_monday.observed_count, 8);
    assert!((next_monday.elapsed_secs - (monday.elapsed_secs + 2.0 * 86_400.0)).abs() < 1.0);
    assert!(h.recorder.sent.lock().unwrap().is_empty());
}
