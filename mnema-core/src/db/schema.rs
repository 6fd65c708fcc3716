//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! The working-memory store and the pattern store live in separate database
//! files with separate migration sets: sessions churn under a capacity
//! limit while patterns accumulate over months.

use rusqlite::Connection;

/// Current working-memory schema version
pub const MEMORY_SCHEMA_VERSION: i32 = 1;

/// Current pattern store schema version
pub const PATTERN_SCHEMA_VERSION: i32 = 1;

/// Working-memory migrations, indexed by version number
const MEMORY_MIGRATIONS: &[&str] = &[
    // Version 1: sessions and their messages
    r#"
    CREATE TABLE IF NOT EXISTS sessions (
        id               TEXT PRIMARY KEY,
        kind             TEXT NOT NULL,
        started_at       DATETIME NOT NULL,
        ended_at         DATETIME,
        status           TEXT NOT NULL CHECK(status IN ('active', 'completed')),
        last_activity_at DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS messages (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id       TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
        role             TEXT NOT NULL,
        content          TEXT NOT NULL,
        ts               DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
    CREATE INDEX IF NOT EXISTS idx_sessions_started ON sessions(started_at);
    CREATE INDEX IF NOT EXISTS idx_sessions_last_activity ON sessions(last_activity_at DESC);
    CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
    CREATE INDEX IF NOT EXISTS idx_messages_ts ON messages(ts);
    "#,
];

/// Pattern store migrations, indexed by version number
const PATTERN_MIGRATIONS: &[&str] = &[
    // Version 1: patterns plus a contentless-sync FTS5 index over title/content
    r#"
    CREATE TABLE IF NOT EXISTS patterns (
        id            TEXT PRIMARY KEY,
        title         TEXT NOT NULL,
        content       TEXT NOT NULL,
        pattern_type  TEXT NOT NULL,
        confidence    REAL NOT NULL DEFAULT 0.0,
        access_count  INTEGER NOT NULL DEFAULT 0,
        last_accessed DATETIME,
        namespaces    JSON NOT NULL DEFAULT '[]',
        pinned        BOOLEAN NOT NULL DEFAULT 0
    );

    CREATE INDEX IF NOT EXISTS idx_patterns_type ON patterns(pattern_type);
    CREATE INDEX IF NOT EXISTS idx_patterns_confidence ON patterns(confidence);

    CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
        title,
        content,
        content='patterns',
        content_rowid='rowid'
    );

    CREATE TRIGGER IF NOT EXISTS patterns_ai AFTER INSERT ON patterns BEGIN
        INSERT INTO patterns_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END;

    CREATE TRIGGER IF NOT EXISTS patterns_ad AFTER DELETE ON patterns BEGIN
        INSERT INTO patterns_fts(patterns_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
    END;

    CREATE TRIGGER IF NOT EXISTS patterns_au AFTER UPDATE ON patterns BEGIN
        INSERT INTO patterns_fts(patterns_fts, rowid, title, content)
        VALUES ('delete', old.rowid, old.title, old.content);
        INSERT INTO patterns_fts(rowid, title, content)
        VALUES (new.rowid, new.title, new.content);
    END;
    "#,
];

/// Run all pending working-memory migrations
pub fn run_memory_migrations(conn: &Connection) -> crate::error::Result<()> {
    run_migrations(conn, MEMORY_MIGRATIONS, MEMORY_SCHEMA_VERSION, "memory")
}

/// Run all pending pattern store migrations
pub fn run_pattern_migrations(conn: &Connection) -> crate::error::Result<()> {
    run_migrations(conn, PATTERN_MIGRATIONS, PATTERN_SCHEMA_VERSION, "patterns")
}

fn run_migrations(
    conn: &Connection,
    migrations: &[&str],
    target_version: i32,
    store: &str,
) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        store,
        current_version,
        target_version,
        "Checking database migrations"
    );

    for (i, migration) in migrations.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(store, version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    Ok(())
}

/// Get the current schema version from a database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
