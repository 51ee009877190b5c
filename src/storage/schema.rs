//! Database schema and migrations.

use rusqlite::Connection;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS checkpoints (
            source TEXT PRIMARY KEY,
            cursor_json TEXT,
            period_end TEXT,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS baselines (
            source TEXT NOT NULL,
            bucket TEXT NOT NULL DEFAULT '',
            dimension TEXT NOT NULL,
            observed_count INTEGER NOT NULL,
            elapsed_secs REAL NOT NULL,
            alert_level TEXT NOT NULL DEFAULT 'normal',
            PRIMARY KEY (source, bucket, dimension)
        );

        CREATE TABLE IF NOT EXISTS incidents (
            id TEXT PRIMARY KEY,
            source TEXT NOT NULL,
            dimension TEXT NOT NULL,
            severity TEXT NOT NULL,
            action TEXT NOT NULL,
            target TEXT NOT NULL,
            message TEXT NOT NULL,
            delivered INTEGER NOT NULL,
            error TEXT,
            new_count INTEGER NOT NULL,
            mean REAL NOT NULL,
            probability REAL NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            period_start TEXT NOT NULL,
            period_end TEXT NOT NULL,
            fetched INTEGER NOT NULL,
            counted INTEGER NOT NULL,
            alerts INTEGER NOT NULL,
            finished_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS reporters (
            source TEXT NOT NULL,
            reporter TEXT NOT NULL,
            last_counted TEXT NOT NULL,
            PRIMARY KEY (source, reporter)
        );

        CREATE INDEX IF NOT EXISTS idx_incidents_created ON incidents(created_at);
        CREATE INDEX IF NOT EXISTS idx_runs_source ON runs(source);",
    )?;

    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (1)", [])?;
    conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (2)", [])?;
    Ok(())
}
