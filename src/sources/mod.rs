//! Bug-tracker sources: the paging contract shared by every adapter.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod github;
pub mod http;
pub mod jira;
pub mod uservoice;
pub mod zendesk;

/// A raw report as returned by a source, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    /// Tracked dimension (exercise, content item, ...), if the record names one.
    pub dimension: Option<String>,
    /// Identity of the person who submitted the report, for duplicate suppression.
    pub reporter: Option<String>,
    pub tags: Vec<String>,
    pub spam: bool,
    /// Created in bulk by a system process rather than by a user.
    pub batch: bool,
}

impl Record {
    pub fn new(id: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            created_at,
            dimension: None,
            reporter: None,
            tags: Vec::new(),
            spam: false,
            batch: false,
        }
    }

    pub fn with_dimension(mut self, dimension: impl Into<String>) -> Self {
        self.dimension = Some(dimension.into());
        self
    }

    pub fn with_reporter(mut self, reporter: impl Into<String>) -> Self {
        self.reporter = Some(reporter.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Native creation-time order of a source's pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOrder {
    Ascending,
    Descending,
}

/// What the checkpoint of a source remembers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    /// Highest record id; only for sources with monotonically increasing ids.
    Id,
    /// Creation time.
    Time,
}

/// How to ask for the page after the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Continuation {
    /// 1-based page number.
    Page(u32),
    /// Offset of the first record of the next page.
    Offset(u64),
    /// Records created after this instant.
    After(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    /// Lower time bound of the fetch window.
    pub since: DateTime<Utc>,
    /// Upper time bound of the fetch window.
    pub until: DateTime<Utc>,
    /// `None` for the first page.
    pub continuation: Option<&'a Continuation>,
}

#[derive(Debug, Clone, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// `None` when the source has no further pages.
    pub next: Option<Continuation>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("server error: HTTP {0}")]
    Server(u16),
    #[error("truncated response: {0}")]
    Truncated(String),
    #[error("authentication rejected: HTTP {0}")]
    Auth(u16),
    #[error("request rejected: HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("unexpected response schema: {0}")]
    Schema(String),
}

impl SourceError {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. }
                | SourceError::Transport(_)
                | SourceError::Server(_)
                | SourceError::Truncated(_)
        )
    }

    /// Server-provided pause before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SourceError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// A paginated, read-only bug-report feed.
#[async_trait::async_trait]
pub trait Source: Send + Sync {
    fn name(&self) -> &str;

    fn order(&self) -> PageOrder;

    fn cursor_kind(&self) -> CursorKind;

    /// How far behind real time the source's data may lag.
    fn freshness_lag(&self) -> chrono::Duration {
        chrono::Duration::zero()
    }

    /// How far back the very first run looks.
    fn default_lookback(&self) -> chrono::Duration;

    /// Fetch one page of the window.
    async fn fetch_page(&self, request: &PageRequest<'_>) -> Result<Page, SourceError>;
}

/// Read a secret (password, token, API key) from a file, trimmed.
pub fn read_secret(path: &Path) -> anyhow::Result<String> {
    use anyhow::Context;
    let secret = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read credentials file: {}", path.display()))?;
    let secret = secret.trim().to_string();
    if secret.is_empty() {
        anyhow::bail!("credentials file is empty: {}", path.display());
    }
    Ok(secret)
}

/// Parse the timestamp formats the supported trackers emit.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, SourceError> {
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Ok(t.with_timezone(&Utc));
    }
    const FORMATS: [&str; 3] = [
        "%Y-%m-%d %H:%M:%S %z",   // Zendesk export
        "%Y-%m-%dT%H:%M:%S%.f%z", // JIRA
        "%Y/%m/%d %H:%M:%S %z",   // UserVoice
    ];
    for format in FORMATS {
        if let Ok(t) = DateTime::parse_from_str(s, format) {
            return Ok(t.with_timezone(&Utc));
        }
    }
    Err(SourceError::Schema(format!("unrecognized timestamp '{}'", s)))
}
