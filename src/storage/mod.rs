//! SQLite storage layer: the baseline store, schema and migrations.

pub mod schema;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{info, warn};

use crate::baseline::{BaselineEntry, BaselineKey, Checkpoint, Cursor, SourceState};
use crate::detect::incident::{self, Incident};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt stored state: {0}")]
    Corrupt(String),
}

/// Open (or create) the SQLite database and return a connection pool.
///
/// A file that exists but is not a SQLite database is moved aside and a
/// fresh one is created in its place.
pub fn open_pool(path: &Path) -> Result<Pool, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    if path.exists() && is_not_a_database(path) {
        let aside = quarantine_path(path);
        std::fs::rename(path, &aside)?;
        warn!(path = %path.display(), moved_to = %aside.display(), "State file is not a database, starting from a cold baseline");
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::builder().max_size(2).build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

fn is_not_a_database(path: &Path) -> bool {
    let Ok(conn) = Connection::open(path) else {
        return false;
    };
    matches!(
        conn.query_row("PRAGMA schema_version", [], |row| row.get::<_, i64>(0)),
        Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::NotADatabase
    )
}

fn quarantine_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
    path.with_file_name(name)
}

pub fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{}': {}", s, e)))
}

/// Bookkeeping row written with every persisted run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub fetched: usize,
    pub counted: u64,
    pub alerts: usize,
}

/// Persisted baselines and checkpoints, one namespace per source.
#[derive(Clone)]
pub struct BaselineStore {
    pool: Pool,
}

impl BaselineStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Load a source's state. Nothing stored yet gives the cold-start state;
    /// rows that fail validation give `StoreError::Corrupt`.
    pub fn load(&self, source: &str) -> Result<SourceState, StoreError> {
        let conn = self.pool.get()?;
        read_state(&conn, source)
    }

    /// Replace a source's state and record the run, all in one transaction.
    pub fn save(
        &self,
        source: &str,
        state: &SourceState,
        run: &RunRecord,
        incidents: &[Incident],
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;

        write_state(&tx, source, state)?;
        for incident in incidents {
            incident::insert(&tx, incident)?;
        }
        tx.execute(
            "INSERT INTO runs (source, period_start, period_end, fetched, counted, alerts, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                source,
                format_time(&run.period_start),
                format_time(&run.period_end),
                run.fetched as i64,
                to_sql_count(run.counted),
                run.alerts as i64,
                format_time(&Utc::now()),
            ],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Overwrite a single baseline entry, leaving the checkpoint alone.
    pub fn reset_entry(&self, source: &str, key: &BaselineKey, entry: &BaselineEntry) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        upsert_entry(&tx, source, key, entry)?;
        tx.commit()?;
        info!(%source, %key, rate_per_hour = entry.rate_per_hour(), "Baseline reset");
        Ok(())
    }

    /// Names of all sources with stored state.
    pub fn sources(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare("SELECT source FROM baselines UNION SELECT source FROM checkpoints ORDER BY 1")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut names = Vec::new();
        for r in rows {
            names.push(r?);
        }
        Ok(names)
    }
}

fn read_state(conn: &Connection, source: &str) -> Result<SourceState, StoreError> {
    let row = conn
        .query_row(
            "SELECT cursor_json, period_end FROM checkpoints WHERE source = ?1",
            params![source],
            |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
        )
        .optional()?;

    let checkpoint = match row {
        None => Checkpoint::default(),
        Some((cursor_json, period_end)) => Checkpoint {
            cursor: cursor_json
                .map(|json| {
                    serde_json::from_str::<Cursor>(&json)
                        .map_err(|e| StoreError::Corrupt(format!("cursor '{}': {}", json, e)))
                })
                .transpose()?,
            period_end: period_end.as_deref().map(parse_time).transpose()?,
        },
    };

    let mut stmt = conn.prepare(
        "SELECT bucket, dimension, observed_count, elapsed_secs, alert_level
         FROM baselines WHERE source = ?1",
    )?;
    let rows = stmt.query_map(params![source], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, f64>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;

    let mut entries = BTreeMap::new();
    for r in rows {
        let (bucket, dimension, count, elapsed, level) = r?;
        let observed_count = u64::try_from(count)
            .map_err(|_| StoreError::Corrupt(format!("negative count {} for '{}'", count, dimension)))?;
        if !elapsed.is_finite() || elapsed <= 0.0 {
            return Err(StoreError::Corrupt(format!(
                "elapsed time {} for '{}' is not positive",
                elapsed, dimension
            )));
        }
        let alert_level = level
            .parse()
            .map_err(|e| StoreError::Corrupt(format!("'{}': {}", dimension, e)))?;
        let bucket = if bucket.is_empty() { None } else { Some(bucket) };
        entries.insert(
            BaselineKey { bucket, dimension },
            BaselineEntry {
                observed_count,
                elapsed_secs: elapsed,
                alert_level,
            },
        );
    }

    let mut stmt = conn.prepare("SELECT reporter, last_counted FROM reporters WHERE source = ?1")?;
    let rows = stmt.query_map(params![source], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?;
    let mut recent_reporters = BTreeMap::new();
    for r in rows {
        let (reporter, last_counted) = r?;
        recent_reporters.insert(reporter, parse_time(&last_counted)?);
    }

    Ok(SourceState {
        checkpoint,
        entries,
        recent_reporters,
    })
}

fn write_state(conn: &Connection, source: &str, state: &SourceState) -> Result<(), StoreError> {
    conn.execute("DELETE FROM baselines WHERE source = ?1", params![source])?;
    for (key, entry) in &state.entries {
        upsert_entry(conn, source, key, entry)?;
    }

    conn.execute("DELETE FROM reporters WHERE source = ?1", params![source])?;
    for (reporter, last_counted) in &state.recent_reporters {
        conn.execute(
            "INSERT INTO reporters (source, reporter, last_counted) VALUES (?1, ?2, ?3)",
            params![source, reporter, format_time(last_counted)],
        )?;
    }

    let cursor_json = state
        .checkpoint
        .cursor
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Corrupt(format!("cursor: {}", e)))?;
    conn.execute(
        "INSERT INTO checkpoints (source, cursor_json, period_end, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(source) DO UPDATE SET
            cursor_json = excluded.cursor_json,
            period_end = excluded.period_end,
            updated_at = excluded.updated_at",
        params![source, cursor_json, state.checkpoint.period_end.as_ref().map(format_time)],
    )?;
    Ok(())
}

fn upsert_entry(conn: &Connection, source: &str, key: &BaselineKey, entry: &BaselineEntry) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO baselines (source, bucket, dimension, observed_count, elapsed_secs, alert_level)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(source, bucket, dimension) DO UPDATE SET
            observed_count = excluded.observed_count,
            elapsed_secs = excluded.elapsed_secs,
            alert_level = excluded.alert_level",
        params![
            source,
            key.bucket.as_deref().unwrap_or(""),
            key.dimension,
            to_sql_count(entry.observed_count),
            entry.elapsed_secs,
            entry.alert_level.as_str(),
        ],
    )?;
    Ok(())
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::AlertLevel;
    use chrono::TimeZone;

    fn sample_state() -> SourceState {
        let mut entries = BTreeMap::new();
        entries.insert(
            BaselineKey::new(None, "all"),
            BaselineEntry {
                observed_count: 1234,
                elapsed_secs: 604_800.123_456_789,
                alert_level: AlertLevel::Elevated,
            },
        );
        entries.insert(
            BaselineKey::new(Some("weekend".to_string()), "fractions"),
            BaselineEntry::cold(),
        );
        SourceState {
            checkpoint: Checkpoint {
                cursor: Some(Cursor::Id(500)),
                period_end: Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap() + chrono::Duration::nanoseconds(17)),
            },
            entries,
            recent_reporters: BTreeMap::from([(
                "u1".to_string(),
                Utc.with_ymd_and_hms(2024, 6, 1, 11, 59, 0).unwrap(),
            )]),
        }
    }

    fn run_record() -> RunRecord {
        let end = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        RunRecord {
            period_start: end - chrono::Duration::minutes(10),
            period_end: end,
            fetched: 3,
            counted: 2,
            alerts: 0,
        }
    }

    #[test]
    fn test_missing_state_is_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        assert_eq!(store.load("zendesk").unwrap(), SourceState::cold_start());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        let state = sample_state();

        store.save("github", &state, &run_record(), &[]).unwrap();
        let loaded = store.load("github").unwrap();
        assert_eq!(loaded, state);

        // load -> save -> load is a no-op
        store.save("github", &loaded, &run_record(), &[]).unwrap();
        assert_eq!(store.load("github").unwrap(), state);
    }

    #[test]
    fn test_sources_are_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        store.save("github", &sample_state(), &run_record(), &[]).unwrap();
        assert_eq!(store.load("zendesk").unwrap(), SourceState::cold_start());
        assert_eq!(store.sources().unwrap(), vec!["github".to_string()]);
    }

    #[test]
    fn test_corrupt_rows_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        store.save("jira", &sample_state(), &run_record(), &[]).unwrap();

        let conn = store.pool().get().unwrap();
        conn.execute("UPDATE checkpoints SET cursor_json = '{not json' WHERE source = 'jira'", [])
            .unwrap();
        drop(conn);
        assert!(matches!(store.load("jira"), Err(StoreError::Corrupt(_))));

        let conn = store.pool().get().unwrap();
        conn.execute("UPDATE checkpoints SET cursor_json = NULL WHERE source = 'jira'", [])
            .unwrap();
        conn.execute("UPDATE baselines SET elapsed_secs = 0 WHERE source = 'jira'", [])
            .unwrap();
        drop(conn);
        assert!(matches!(store.load("jira"), Err(StoreError::Corrupt(_))));

        let conn = store.pool().get().unwrap();
        conn.execute("UPDATE baselines SET elapsed_secs = 60 WHERE source = 'jira'", [])
            .unwrap();
        conn.execute("UPDATE reporters SET last_counted = 'yesterday' WHERE source = 'jira'", [])
            .unwrap();
        drop(conn);
        assert!(matches!(store.load("jira"), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_failed_save_leaves_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        let before = sample_state();
        store.save("zendesk", &before, &run_record(), &[]).unwrap();

        let summary = crate::detect::PeriodSummary {
            key: "all".to_string(),
            historical_count: 1,
            historical_secs: 1.0,
            new_count: 9,
            period_secs: 600.0,
            mean: 1.0,
            probability: 0.9999,
            level: AlertLevel::Elevated,
        };
        let action = crate::detect::policy::AlertAction::Page {
            service: "on-call".to_string(),
            message: "spike".to_string(),
        };
        let incident = Incident::new("zendesk", &summary, &action, None, Utc::now());

        let mut after = before.clone();
        after.checkpoint.cursor = Some(Cursor::Id(900));
        after.entries.clear();

        // Duplicate primary key makes the second insert fail mid-transaction.
        let result = store.save("zendesk", &after, &run_record(), &[incident.clone(), incident]);
        assert!(result.is_err());
        assert_eq!(store.load("zendesk").unwrap(), before);
    }

    #[test]
    fn test_reset_entry() {
        let dir = tempfile::tempdir().unwrap();
        let store = BaselineStore::open(&dir.path().join("state.db")).unwrap();
        store.save("zendesk", &sample_state(), &run_record(), &[]).unwrap();

        let key = BaselineKey::new(None, "all");
        store.reset_entry("zendesk", &key, &BaselineEntry::with_rate(3.0, 24.0)).unwrap();

        let state = store.load("zendesk").unwrap();
        assert_eq!(state.entries[&key].observed_count, 72);
        assert_eq!(state.checkpoint, sample_state().checkpoint);
    }

    #[test]
    fn test_garbage_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();

        let store = BaselineStore::open(&path).unwrap();
        assert_eq!(store.load("zendesk").unwrap(), SourceState::cold_start());

        let moved = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .any(|e| e.file_name().to_string_lossy().starts_with("state.db.corrupt-"));
        assert!(moved);
    }
}
