//! Pattern store
//!
//! Longer-lived memory: reusable, named insights extracted from observed
//! activity, each carrying a confidence score and a searchable full-text
//! index. Patterns live in their own database file with their own lifecycle:
//! sessions churn under a capacity limit, patterns accumulate and are only
//! removed by explicit pruning.

pub mod confidence;

use crate::error::{Error, Result};
use crate::types::{ConfidenceFactors, Pattern, PatternType};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

/// Upper bound on pattern title + content size, in bytes.
///
/// Matches the ingestion payload limit: oversized input is rejected, never
/// truncated.
const MAX_PATTERN_BYTES: usize = 256 * 1024;

/// Aggregate pattern store statistics.
#[derive(Debug, Clone, Default)]
pub struct PatternStats {
    /// Total stored patterns
    pub total: i64,
    /// Pinned patterns (exempt from pruning)
    pub pinned: i64,
    /// Mean confidence across all patterns
    pub avg_confidence: f64,
    /// Breakdown by pattern type, sorted by count descending
    pub by_type: Vec<(String, i64)>,
}

/// SQLite-backed pattern store with an FTS5 index over title/content.
pub struct PatternStore {
    conn: Mutex<Connection>,
}

impl PatternStore {
    /// Open or create a pattern store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        crate::db::schema::run_pattern_migrations(&conn)
    }

    /// Insert a new pattern.
    ///
    /// Fails with [`Error::PatternExists`] if the id is already taken; the
    /// existing row is left untouched. Title and content must be non-empty
    /// and within the size limit.
    pub fn add_pattern(&self, pattern: &Pattern) -> Result<()> {
        if pattern.title.trim().is_empty() {
            return Err(Error::Validation("pattern title is empty".to_string()));
        }
        if pattern.content.trim().is_empty() {
            return Err(Error::Validation("pattern content is empty".to_string()));
        }
        let payload = pattern.title.len() + pattern.content.len();
        if payload > MAX_PATTERN_BYTES {
            return Err(Error::Validation(format!(
                "pattern payload is {} bytes, limit is {}",
                payload, MAX_PATTERN_BYTES
            )));
        }
        if !(0.0..=1.0).contains(&pattern.confidence) {
            return Err(Error::Validation(format!(
                "pattern confidence {} is outside [0, 1]",
                pattern.confidence
            )));
        }

        let namespaces = serde_json::to_string(&pattern.namespaces)?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM patterns WHERE id = ?",
            [&pattern.id],
            |r| r.get(0),
        )?;
        if exists > 0 {
            return Err(Error::PatternExists(pattern.id.clone()));
        }

        tx.execute(
            r#"
            INSERT INTO patterns
                (id, title, content, pattern_type, confidence, access_count,
                 last_accessed, namespaces, pinned)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                pattern.id,
                pattern.title,
                pattern.content,
                pattern.pattern_type.as_str(),
                pattern.confidence,
                pattern.access_count,
                pattern.last_accessed.map(|t| t.to_rfc3339()),
                namespaces,
                pattern.pinned,
            ],
        )?;
        tx.commit()?;

        tracing::debug!(pattern_id = %pattern.id, "Pattern stored");
        Ok(())
    }

    /// Get a pattern by ID
    pub fn get_pattern(&self, pattern_id: &str) -> Result<Option<Pattern>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM patterns WHERE id = ?",
            [pattern_id],
            Self::row_to_pattern,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Relevance-ranked full-text search over title and content.
    ///
    /// With a namespace, only patterns tagged with it are returned. An empty
    /// query returns no results rather than everything.
    pub fn search(
        &self,
        text: &str,
        namespace: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Pattern>> {
        let Some(query) = fts_query(text) else {
            return Ok(Vec::new());
        };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            r#"
            SELECT p.* FROM patterns_fts f
            JOIN patterns p ON p.rowid = f.rowid
            WHERE patterns_fts MATCH ?1
            ORDER BY bm25(patterns_fts)
            "#,
        )?;

        let ranked = stmt
            .query_map([&query], Self::row_to_pattern)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(ranked
            .into_iter()
            .filter(|p| match namespace {
                Some(ns) => p.namespaces.iter().any(|n| n == ns),
                None => true,
            })
            .take(limit)
            .collect())
    }

    /// Record one use of a pattern: bumps `access_count`, sets
    /// `last_accessed`. Confidence is not recomputed here; callers follow up
    /// with [`recompute_confidence`](Self::recompute_confidence) once the
    /// outcome of the use is known.
    pub fn record_access(&self, pattern_id: &str) -> Result<()> {
        self.record_access_as_of(pattern_id, Utc::now())
    }

    pub fn record_access_as_of(
        &self,
        pattern_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE patterns SET access_count = access_count + 1, last_accessed = ?1 \
             WHERE id = ?2",
            params![now.to_rfc3339(), pattern_id],
        )?;
        if updated == 0 {
            return Err(Error::PatternNotFound(pattern_id.to_string()));
        }
        Ok(())
    }

    /// Recompute and persist the confidence score from fresh usage signals.
    /// Returns the new score.
    pub fn recompute_confidence(
        &self,
        pattern_id: &str,
        factors: &ConfidenceFactors,
    ) -> Result<f64> {
        self.recompute_confidence_as_of(pattern_id, factors, Utc::now())
    }

    pub fn recompute_confidence_as_of(
        &self,
        pattern_id: &str,
        factors: &ConfidenceFactors,
        now: DateTime<Utc>,
    ) -> Result<f64> {
        let score = confidence::score_as_of(factors, now);

        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE patterns SET confidence = ?1 WHERE id = ?2",
            params![score, pattern_id],
        )?;
        if updated == 0 {
            return Err(Error::PatternNotFound(pattern_id.to_string()));
        }

        tracing::debug!(pattern_id, score, "Confidence recomputed");
        Ok(score)
    }

    /// Delete unpinned patterns that are both below the confidence threshold
    /// and unused for longer than `max_age_days` (never-used counts as
    /// stale). Pinned patterns are exempt unconditionally. Returns the
    /// number removed.
    pub fn prune(&self, min_confidence: f64, max_age_days: u32) -> Result<usize> {
        self.prune_as_of(min_confidence, max_age_days, Utc::now())
    }

    pub fn prune_as_of(
        &self,
        min_confidence: f64,
        max_age_days: u32,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let cutoff = now - chrono::Duration::days(i64::from(max_age_days));

        let conn = self.conn.lock().unwrap();
        let removed = conn.execute(
            r#"
            DELETE FROM patterns
            WHERE pinned = 0
              AND confidence < ?1
              AND (last_accessed IS NULL OR last_accessed < ?2)
            "#,
            params![min_confidence, cutoff.to_rfc3339()],
        )?;

        if removed > 0 {
            tracing::info!(removed, min_confidence, max_age_days, "Pruned stale patterns");
        }
        Ok(removed)
    }

    /// Aggregate statistics over the store
    pub fn stats(&self) -> Result<PatternStats> {
        let conn = self.conn.lock().unwrap();

        let (total, pinned, avg_confidence): (i64, i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(pinned), 0), COALESCE(AVG(confidence), 0.0) \
             FROM patterns",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;

        let mut stmt = conn.prepare(
            "SELECT pattern_type, COUNT(*) AS n FROM patterns \
             GROUP BY pattern_type ORDER BY n DESC",
        )?;
        let by_type = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(PatternStats {
            total,
            pinned,
            avg_confidence,
            by_type,
        })
    }

    fn row_to_pattern(row: &Row) -> rusqlite::Result<Pattern> {
        let type_str: String = row.get("pattern_type")?;
        let last_accessed_str: Option<String> = row.get("last_accessed")?;
        let namespaces_str: String = row.get("namespaces")?;

        Ok(Pattern {
            id: row.get("id")?,
            title: row.get("title")?,
            content: row.get("content")?,
            pattern_type: type_str.parse::<PatternType>().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(
                    3,
                    rusqlite::types::Type::Text,
                    e.into(),
                )
            })?,
            confidence: row.get("confidence")?,
            access_count: row.get("access_count")?,
            last_accessed: last_accessed_str
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|dt| dt.with_timezone(&Utc)),
            namespaces: serde_json::from_str(&namespaces_str).unwrap_or_default(),
            pinned: row.get("pinned")?,
        })
    }
}

/// Build an FTS5 match expression from free text.
///
/// Each whitespace token is double-quoted so user input cannot smuggle FTS5
/// operators or column filters into the query. Returns None for blank input.
fn fts_query(text: &str) -> Option<String> {
    let tokens: Vec<String> = text
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" "))
    }
}
