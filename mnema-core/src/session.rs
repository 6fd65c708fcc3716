//! Session attribution
//!
//! Consumes merged batches from the debouncer and decides whether they
//! belong to the currently open session or start a new one.
//!
//! The manager is a two-state machine per store:
//!
//! ```text
//!                    first batch / idle boundary elapsed
//!  ┌───────────────────┐ ─────────────────────────────► ┌─────────────────┐
//!  │ No-Active-Session │                                │ Active-Session  │
//!  └───────────────────┘ ◄───────────────────────────── └─────────────────┘
//!                    explicit end / lazy close on read        │  ▲
//!                                                             └──┘
//!                                              batch within idle boundary
//! ```
//!
//! Closing is lazy: there is no expiry timer. The boundary is evaluated when
//! the active session is read (see [`MemoryStore::active_session`]), which
//! happens on every batch, so a stale session is always closed and persisted
//! before new activity is attributed.

use crate::db::MemoryStore;
use crate::debounce::FlushSink;
use crate::error::Result;
use crate::types::{ActivityEvent, MessageRole, SessionKind};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of persisting one batch.
#[derive(Debug, Default)]
pub struct PersistOutcome {
    /// Session the batch was attributed to
    pub session_id: String,
    /// Whether that session was opened for this batch
    pub is_new_session: bool,
    /// Messages written
    pub messages_inserted: usize,
    /// Completed sessions evicted by the capacity pass
    pub sessions_evicted: usize,
}

/// Attributes merged batches to bounded sessions and enforces retention.
pub struct SessionManager {
    store: Arc<MemoryStore>,
    idle_boundary: chrono::Duration,
    capacity: usize,
}

impl SessionManager {
    pub fn new(store: Arc<MemoryStore>, idle_boundary: chrono::Duration, capacity: usize) -> Self {
        Self {
            store,
            idle_boundary,
            capacity,
        }
    }

    /// Persist one merged batch.
    ///
    /// Reuses the open session when the idle boundary has not elapsed,
    /// otherwise opens a fresh one. Eviction runs best-effort after a
    /// successful insert: an eviction failure is logged, never propagated,
    /// because the ingested data is already safe.
    pub fn persist_batch(&self, batch: &[ActivityEvent]) -> Result<PersistOutcome> {
        self.persist_batch_as_of(batch, Utc::now())
    }

    pub fn persist_batch_as_of(
        &self,
        batch: &[ActivityEvent],
        now: DateTime<Utc>,
    ) -> Result<PersistOutcome> {
        if batch.is_empty() {
            return Ok(PersistOutcome::default());
        }

        // Reading the active session applies the lazy-close rule first, so a
        // stale session is completed before any of this batch lands on it.
        let (session, is_new_session) =
            match self.store.active_session_as_of(self.idle_boundary, now)? {
                Some(session) => (session, false),
                None => (
                    self.store.begin_session_as_of(SessionKind::Ambient, now)?,
                    true,
                ),
            };

        let mut messages_inserted = 0;
        for event in batch {
            self.store.append_message(
                &session.id,
                role_for(event),
                &event.describe(),
                event.occurred_at(),
            )?;
            messages_inserted += 1;
        }

        let sessions_evicted = match self.store.enforce_capacity(self.capacity) {
            Ok(evicted) => evicted,
            Err(e) => {
                tracing::warn!(error = %e, "Capacity eviction failed; ingest still succeeded");
                0
            }
        };

        tracing::debug!(
            session_id = %session.id,
            is_new_session,
            messages_inserted,
            "Batch attributed"
        );

        Ok(PersistOutcome {
            session_id: session.id,
            is_new_session,
            messages_inserted,
            sessions_evicted,
        })
    }
}

impl FlushSink for SessionManager {
    fn deliver(&self, batch: Vec<ActivityEvent>) -> Result<()> {
        self.persist_batch(&batch)?;
        Ok(())
    }
}

/// Role attribution per event kind: file edits and commands are things the
/// developer did; hooks and editor polls are environmental.
fn role_for(event: &ActivityEvent) -> MessageRole {
    match event {
        ActivityEvent::FileChange(_) | ActivityEvent::TerminalCommand(_) => MessageRole::Human,
        ActivityEvent::VcsHook(_) | ActivityEvent::EditorPoll(_) => MessageRole::System,
    }
}
