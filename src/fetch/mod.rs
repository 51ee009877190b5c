//! Incremental page walk over a source, bounded by the checkpoint and the
//! period end.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::debug;

use crate::baseline::Cursor;
use crate::sources::{Continuation, CursorKind, PageOrder, PageRequest, Record, Source, SourceError};

pub mod retry;

pub use retry::{with_retry, RetryError, RetryPolicy};

pub const DEFAULT_MAX_PAGES: u32 = 1000;

/// The slice of the source a run asks for: `(since, until]`, resumed after
/// `cursor` when the source keys its checkpoint by id.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchWindow {
    pub cursor: Option<Cursor>,
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome {
    /// Ascending by `(created_at, id)`, unique by id.
    pub records: Vec<Record>,
    pub oldest: Option<DateTime<Utc>>,
    pub cursor: Option<Cursor>,
    pub pages: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Fetched {
    /// The window ends inside the source's freshness lag.
    NotReady,
    Ready(FetchOutcome),
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("{source_name}: page {page}: gave up after {attempts} attempts: {last}")]
    Exhausted {
        source_name: String,
        page: u32,
        attempts: u32,
        last: SourceError,
    },
    #[error("{source_name}: page {page}: {error}")]
    Fatal {
        source_name: String,
        page: u32,
        error: SourceError,
    },
    #[error("{source_name}: more than {limit} pages in one window")]
    PageLimit { source_name: String, limit: u32 },
}

pub struct IncrementalFetcher<'a> {
    source: &'a dyn Source,
    retry: RetryPolicy,
    max_pages: u32,
    freshness_lag: chrono::Duration,
}

// Accumulator threaded through the page loop.
#[derive(Default)]
struct Walk {
    kept: BTreeMap<u64, Record>,
    seen: Vec<Continuation>,
    pages: u32,
}

impl<'a> IncrementalFetcher<'a> {
    pub fn new(source: &'a dyn Source, retry: RetryPolicy, max_pages: u32) -> Self {
        Self {
            source,
            retry,
            max_pages: max_pages.max(1),
            freshness_lag: source.freshness_lag(),
        }
    }

    /// Replace the source's own freshness lag.
    pub fn with_freshness_lag(mut self, lag: chrono::Duration) -> Self {
        self.freshness_lag = lag;
        self
    }

    fn cursor_id(window: &FetchWindow) -> Option<u64> {
        match window.cursor {
            Some(Cursor::Id(id)) => Some(id),
            _ => None,
        }
    }

    /// Whether a record is new and inside the window.
    fn in_window(&self, window: &FetchWindow, record: &Record) -> bool {
        if record.created_at > window.until {
            return false;
        }
        match (self.source.cursor_kind(), Self::cursor_id(window)) {
            (CursorKind::Id, Some(last)) => record.id > last,
            _ => record.created_at > window.since,
        }
    }

    /// Whether a record proves that every later page is already known.
    fn past_boundary(&self, window: &FetchWindow, record: &Record) -> bool {
        match self.source.order() {
            PageOrder::Descending => match (self.source.cursor_kind(), Self::cursor_id(window)) {
                (CursorKind::Id, Some(last)) => record.id <= last,
                _ => record.created_at <= window.since,
            },
            PageOrder::Ascending => record.created_at > window.until,
        }
    }

    pub async fn fetch(&self, window: &FetchWindow, now: DateTime<Utc>) -> Result<Fetched, FetchError> {
        if window.until > now - self.freshness_lag {
            return Ok(Fetched::NotReady);
        }

        let name = self.source.name();
        let mut walk = Walk::default();
        let mut continuation: Option<Continuation> = None;

        loop {
            if walk.pages >= self.max_pages {
                return Err(FetchError::PageLimit {
                    source_name: name.to_string(),
                    limit: self.max_pages,
                });
            }
            let page_no = walk.pages + 1;
            let request = PageRequest {
                since: window.since,
                until: window.until,
                continuation: continuation.as_ref(),
            };
            let description = format!("{} page {}", name, page_no);
            let page = with_retry(&self.retry, &description, || self.source.fetch_page(&request))
                .await
                .map_err(|e| match e {
                    RetryError::Fatal(error) => FetchError::Fatal {
                        source_name: name.to_string(),
                        page: page_no,
                        error,
                    },
                    RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                        source_name: name.to_string(),
                        page: page_no,
                        attempts,
                        last,
                    },
                })?;
            walk.pages = page_no;

            let returned = page.records.len();
            let mut done = page.records.is_empty();
            for record in page.records {
                if self.past_boundary(window, &record) {
                    done = true;
                }
                if self.in_window(window, &record) {
                    walk.kept.entry(record.id).or_insert(record);
                }
            }
            debug!(source = %name, page = page_no, returned, kept = walk.kept.len(), "Fetched page");

            if let Some(c) = &continuation {
                walk.seen.push(c.clone());
            }
            continuation = match page.next {
                None => None,
                Some(Continuation::After(t)) if t >= window.until => None,
                Some(next) if walk.seen.contains(&next) => None,
                Some(next) => Some(next),
            };
            if done || continuation.is_none() {
                break;
            }
        }

        let mut records: Vec<Record> = walk.kept.into_values().collect();
        records.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
        let oldest = records.first().map(|r| r.created_at);
        let cursor = match self.source.cursor_kind() {
            CursorKind::Id => {
                let max_id = records.iter().map(|r| r.id).max();
                match (max_id, Self::cursor_id(window)) {
                    (Some(m), Some(c)) => Some(Cursor::Id(m.max(c))),
                    (Some(m), None) => Some(Cursor::Id(m)),
                    (None, c) => c.map(Cursor::Id),
                }
            }
            CursorKind::Time => Some(Cursor::Time(window.until)),
        };

        Ok(Fetched::Ready(FetchOutcome {
            records,
            oldest,
            cursor,
            pages: walk.pages,
        }))
    }
}
