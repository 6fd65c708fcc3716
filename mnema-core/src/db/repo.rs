//! Working-memory store
//!
//! Durable persistence for sessions and their messages, capacity-bounded by
//! FIFO eviction over completed sessions.
//!
//! ## Lazy session closing
//!
//! `active_session()` is NOT a pure read: when the stored active session has
//! been idle past the boundary, the call closes it (status `completed`,
//! `ended_at` set) and persists that closure before reporting "none". This is
//! deliberate: there is no background expiry thread, so correctness depends
//! on evaluating the boundary at read and write time. Do not "fix" this into
//! a pure query.

use crate::error::{Error, Result};
use crate::types::{MessageRole, Session, SessionKind, SessionStatus, StoredMessage};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use uuid::Uuid;

/// Working-memory counts for health reporting.
#[derive(Debug, Clone, Default)]
pub struct MemoryStats {
    /// Total stored sessions (active + completed)
    pub total_sessions: i64,
    /// Currently active sessions (0 or 1)
    pub active_sessions: i64,
    /// Total stored messages
    pub total_messages: i64,
}

/// Session and message store backed by a single SQLite connection.
///
/// All mutating operations take the connection lock for their full duration,
/// so they are atomic with respect to concurrent callers.
pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open or create a store at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // Foreign keys drive message cascade-delete on eviction; WAL keeps
        // readers off the writer's back.
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
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
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this store
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_memory_migrations(&conn)
    }

    // ============================================
    // Session lifecycle
    // ============================================

    /// Open a new session, closing any session that is still active.
    ///
    /// Closing first preserves the single-active-session invariant even if a
    /// caller opens a session while ambient capture has one in flight.
    pub fn begin_session(&self, kind: SessionKind) -> Result<Session> {
        self.begin_session_as_of(kind, Utc::now())
    }

    pub fn begin_session_as_of(
        &self,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> Result<Session> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let displaced = tx.execute(
            "UPDATE sessions SET status = 'completed', ended_at = ?1 WHERE status = 'active'",
            params![now.to_rfc3339()],
        )?;
        if displaced > 0 {
            tracing::warn!(displaced, "Closed lingering active session before opening a new one");
        }

        let session = Session {
            id: Uuid::new_v4().to_string(),
            kind,
            started_at: now,
            ended_at: None,
            status: SessionStatus::Active,
            last_activity_at: now,
        };

        tx.execute(
            r#"
            INSERT INTO sessions (id, kind, started_at, ended_at, status, last_activity_at)
            VALUES (?1, ?2, ?3, NULL, 'active', ?4)
            "#,
            params![
                session.id,
                session.kind.as_str(),
                session.started_at.to_rfc3339(),
                session.last_activity_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;

        tracing::info!(session_id = %session.id, kind = %session.kind.as_str(), "Session opened");
        Ok(session)
    }

    /// The currently active session, applying the lazy-close rule.
    ///
    /// Returns `Ok(None)` when no session is active, including when the
    /// stored active session just went stale and was closed by this call.
    /// Storage failures propagate as errors, never as an empty result.
    pub fn active_session(&self, idle_boundary: chrono::Duration) -> Result<Option<Session>> {
        self.active_session_as_of(idle_boundary, Utc::now())
    }

    pub fn active_session_as_of(
        &self,
        idle_boundary: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();

        let session = conn
            .query_row(
                "SELECT * FROM sessions WHERE status = 'active' LIMIT 1",
                [],
                Self::row_to_session,
            )
            .optional()?;

        let Some(session) = session else {
            return Ok(None);
        };

        if now.signed_duration_since(session.last_activity_at) > idle_boundary {
            // Stale: persist the closure before reporting "none".
            conn.execute(
                "UPDATE sessions SET status = 'completed', ended_at = ?1 WHERE id = ?2",
                params![now.to_rfc3339(), session.id],
            )?;
            tracing::info!(
                session_id = %session.id,
                idle_minutes = session.idle_minutes(now),
                "Closed idle session on read"
            );
            return Ok(None);
        }

        Ok(Some(session))
    }

    /// Explicitly end a session. Idempotent for already-completed sessions.
    pub fn end_session(&self, session_id: &str) -> Result<()> {
        self.end_session_as_of(session_id, Utc::now())
    }

    pub fn end_session_as_of(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sessions SET status = 'completed', ended_at = ?1 \
             WHERE id = ?2 AND status = 'active'",
            params![now.to_rfc3339(), session_id],
        )?;

        if updated == 0 {
            let exists: i64 = conn.query_row(
                "SELECT COUNT(*) FROM sessions WHERE id = ?",
                [session_id],
                |r| r.get(0),
            )?;
            if exists == 0 {
                return Err(Error::SessionNotFound(session_id.to_string()));
            }
        } else {
            tracing::info!(session_id, "Session ended");
        }
        Ok(())
    }

    // ============================================
    // Messages
    // ============================================

    /// Append a message to an active session.
    ///
    /// Fails with [`Error::SessionNotFound`] if the session does not exist or
    /// is not active; a message is never allowed to conjure a session into
    /// existence. `last_activity_at` advances monotonically: an out-of-order
    /// timestamp never moves the session clock backwards.
    pub fn append_message(
        &self,
        session_id: &str,
        role: MessageRole,
        content: &str,
        ts: DateTime<Utc>,
    ) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM sessions WHERE id = ?",
                [session_id],
                |r| r.get(0),
            )
            .optional()?;

        match status.as_deref() {
            Some("active") => {}
            _ => return Err(Error::SessionNotFound(session_id.to_string())),
        }

        tx.execute(
            "INSERT INTO messages (session_id, role, content, ts) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, role.as_str(), content, ts.to_rfc3339()],
        )?;
        let message_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE sessions SET last_activity_at = MAX(last_activity_at, ?1) WHERE id = ?2",
            params![ts.to_rfc3339(), session_id],
        )?;

        tx.commit()?;
        Ok(message_id)
    }

    /// All messages for a session, oldest first.
    pub fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT * FROM messages WHERE session_id = ? ORDER BY ts ASC, id ASC",
        )?;
        let messages = stmt
            .query_map([session_id], Self::row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(messages)
    }

    // ============================================
    // Retention
    // ============================================

    /// Evict oldest completed sessions until the store fits the capacity.
    ///
    /// Active sessions are never evicted, so the count can remain above
    /// capacity if everything over the limit is still active. Messages go
    /// with their session via cascade. Returns the number evicted.
    pub fn enforce_capacity(&self, capacity: usize) -> Result<usize> {
        let conn = self.conn.lock().unwrap();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let excess = total - capacity as i64;
        if excess <= 0 {
            return Ok(0);
        }

        let evicted = conn.execute(
            r#"
            DELETE FROM sessions WHERE id IN (
                SELECT id FROM sessions
                WHERE status = 'completed'
                ORDER BY started_at ASC
                LIMIT ?1
            )
            "#,
            params![excess],
        )?;

        if evicted > 0 {
            tracing::debug!(evicted, capacity, "Evicted oldest completed sessions");
        }
        Ok(evicted)
    }

    // ============================================
    // Queries
    // ============================================

    /// Get a session by ID
    pub fn get_session(&self, session_id: &str) -> Result<Option<Session>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT * FROM sessions WHERE id = ?",
            [session_id],
            Self::row_to_session,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Most recently started sessions, newest first.
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT * FROM sessions ORDER BY started_at DESC LIMIT ?")?;
        let sessions = stmt
            .query_map([limit as i64], Self::row_to_session)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(sessions)
    }

    /// Total stored sessions (active + completed)
    pub fn session_count(&self) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Store-level counts for health reporting
    pub fn stats(&self) -> Result<MemoryStats> {
        let conn = self.conn.lock().unwrap();
        let total_sessions: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))?;
        let active_sessions: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE status = 'active'",
            [],
            |r| r.get(0),
        )?;
        let total_messages: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?;
        Ok(MemoryStats {
            total_sessions,
            active_sessions,
            total_messages,
        })
    }

    // ============================================
    // Row mappers
    // ============================================

    fn row_to_session(row: &Row) -> rusqlite::Result<Session> {
        let kind_str: String = row.get("kind")?;
        let status_str: String = row.get("status")?;
        let started_at_str: String = row.get("started_at")?;
        let ended_at_str: Option<String> = row.get("ended_at")?;
        let last_activity_str: String = row.get("last_activity_at")?;

        Ok(Session {
            id: row.get("id")?,
            kind: kind_str
                .parse::<SessionKind>()
                .map_err(|e| conversion_error(1, e))?,
            started_at: parse_ts(&started_at_str, 2)?,
            ended_at: match ended_at_str {
                Some(s) => Some(parse_ts(&s, 3)?),
                None => None,
            },
            status: status_str
                .parse::<SessionStatus>()
                .map_err(|e| conversion_error(4, e))?,
            last_activity_at: parse_ts(&last_activity_str, 5)?,
        })
    }

    fn row_to_message(row: &Row) -> rusqlite::Result<StoredMessage> {
        let role_str: String = row.get("role")?;
        let ts_str: String = row.get("ts")?;

        Ok(StoredMessage {
            id: row.get("id")?,
            session_id: row.get("session_id")?,
            role: role_str
                .parse::<MessageRole>()
                .map_err(|e| conversion_error(2, e))?,
            content: row.get("content")?,
            ts: parse_ts(&ts_str, 4)?,
        })
    }
}

/// Parse an RFC 3339 column into a UTC timestamp.
fn parse_ts(s: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(column, e.to_string()))
}

fn conversion_error(column: usize, message: impl ToString) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        message.to_string().into(),
    )
}
