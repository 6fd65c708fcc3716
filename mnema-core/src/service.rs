//! Capture service
//!
//! The front door of the pipeline: adapters push normalized event records
//! in, presentation and pattern-mining layers read sessions and patterns
//! out.
//!
//! ```text
//! ┌──────────┐ ingest() ┌───────────┐ flush ┌────────────────┐      ┌─────────────┐
//! │ adapters │ ───────► │ Debouncer │ ────► │ SessionManager │ ───► │ MemoryStore │
//! └──────────┘          └───────────┘       └────────────────┘      └─────────────┘
//!                                                                   ┌──────────────┐
//!                                    pattern mining (external) ───► │ PatternStore │
//!                                                                   └──────────────┘
//! ```
//!
//! The service is an explicit object with an explicit lifecycle and no
//! global state, so several instances can run side by side in tests.
//! Construct it
//! with injected stores, `start()` it to begin accepting events, `stop()` it
//! to flush and join the worker.

use crate::config::Config;
use crate::db::{MemoryStats, MemoryStore};
use crate::debounce::{DebounceStats, Debouncer};
use crate::error::{Error, Result};
use crate::patterns::{PatternStats, PatternStore};
use crate::session::SessionManager;
use crate::types::{ActivityEvent, EventKind, EventRecord, Pattern, Session, StoredMessage};
use std::sync::Arc;

/// Ambient capture pipeline with an explicit start/stop lifecycle.
pub struct CaptureService {
    config: Config,
    memory: Arc<MemoryStore>,
    patterns: Arc<PatternStore>,
    sessions: Arc<SessionManager>,
    debouncer: Option<Debouncer>,
}

impl CaptureService {
    /// Build a service over injected stores. The service starts stopped.
    pub fn new(config: Config, memory: Arc<MemoryStore>, patterns: Arc<PatternStore>) -> Self {
        let sessions = Arc::new(SessionManager::new(
            Arc::clone(&memory),
            config.session.idle_boundary(),
            config.session.capacity,
        ));
        Self {
            config,
            memory,
            patterns,
            sessions,
            debouncer: None,
        }
    }

    /// Open stores at the default XDG paths, run migrations, and build a
    /// (stopped) service.
    pub fn open(config: Config) -> Result<Self> {
        let memory = Arc::new(MemoryStore::open(&Config::memory_db_path())?);
        memory.migrate()?;
        let patterns = Arc::new(PatternStore::open(&Config::patterns_db_path())?);
        patterns.migrate()?;
        Ok(Self::new(config, memory, patterns))
    }

    /// Begin accepting events. Idempotent.
    pub fn start(&mut self) -> Result<()> {
        if self.debouncer.is_some() {
            return Ok(());
        }
        let sink: Arc<SessionManager> = Arc::clone(&self.sessions);
        self.debouncer = Some(Debouncer::new(&self.config.capture, sink)?);
        tracing::info!(
            debounce_secs = self.config.capture.debounce_secs,
            idle_minutes = self.config.session.idle_minutes,
            capacity = self.config.session.capacity,
            "Capture service started"
        );
        Ok(())
    }

    /// Flush pending events and join the worker. Idempotent.
    pub fn stop(&mut self) -> Result<()> {
        let Some(debouncer) = self.debouncer.take() else {
            return Ok(());
        };
        let result = debouncer.flush_now();
        drop(debouncer);
        tracing::info!("Capture service stopped");
        result
    }

    pub fn is_running(&self) -> bool {
        self.debouncer.is_some()
    }

    // ============================================
    // Ingestion API
    // ============================================

    /// Accept one normalized event record from an adapter.
    ///
    /// Validates the record (oversized or empty subjects are rejected with
    /// [`Error::Validation`], never truncated and never retried), applies a
    /// second line of secret redaction, and buffers the event. Returns
    /// without touching storage; persistence happens on the debounce worker.
    pub fn ingest(&self, record: EventRecord) -> Result<()> {
        let Some(debouncer) = &self.debouncer else {
            return Err(Error::Validation(
                "capture service is not running".to_string(),
            ));
        };

        let mut record = record;
        if record.kind == EventKind::TerminalCommand {
            record.subject = redact_secrets(&record.subject);
        }

        let event = ActivityEvent::from_record(record, self.config.capture.max_payload_bytes)?;
        debouncer.add_event(event);
        Ok(())
    }

    /// Synchronously flush buffered events. Primarily for tests and
    /// collaborators that need read-your-writes before the quiet period.
    pub fn flush(&self) -> Result<()> {
        match &self.debouncer {
            Some(debouncer) => debouncer.flush_now(),
            None => Ok(()),
        }
    }

    // ============================================
    // Query API
    // ============================================

    /// The currently active session, applying the lazy-close rule.
    ///
    /// `Ok(None)` means "no active session", a normal, empty result. A
    /// storage failure is an `Err`, never an empty result, so callers can
    /// tell the two apart.
    pub fn active_session(&self) -> Result<Option<Session>> {
        self.memory.active_session(self.config.session.idle_boundary())
    }

    /// Most recently started sessions, newest first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.memory.recent_sessions(limit)
    }

    /// All messages for a session, oldest first
    pub fn session_messages(&self, session_id: &str) -> Result<Vec<StoredMessage>> {
        self.memory.session_messages(session_id)
    }

    /// Explicitly end a session
    pub fn end_session(&self, session_id: &str) -> Result<()> {
        self.memory.end_session(session_id)
    }

    /// Relevance-ranked pattern search, optionally scoped to a namespace
    pub fn search_patterns(&self, text: &str, namespace: Option<&str>) -> Result<Vec<Pattern>> {
        self.patterns.search(text, namespace, 20)
    }

    /// Aggregate pattern store statistics
    pub fn pattern_stats(&self) -> Result<PatternStats> {
        self.patterns.stats()
    }

    /// Prune stale low-confidence patterns using the configured thresholds.
    ///
    /// Maintenance is non-fatal by contract: a storage failure here is
    /// logged as a warning and reported as zero removals.
    pub fn prune_patterns(&self) -> usize {
        match self.patterns.prune(
            self.config.patterns.prune_min_confidence,
            self.config.patterns.prune_max_age_days,
        ) {
            Ok(removed) => removed,
            Err(e) => {
                tracing::warn!(error = %e, "Pattern pruning failed");
                0
            }
        }
    }

    /// Working-memory counts
    pub fn memory_stats(&self) -> Result<MemoryStats> {
        self.memory.stats()
    }

    /// Debouncer counters; zeroed defaults when stopped
    pub fn debounce_stats(&self) -> DebounceStats {
        self.debouncer
            .as_ref()
            .map(|d| d.stats())
            .unwrap_or_default()
    }

    /// The pattern store, for pattern-extraction collaborators
    pub fn pattern_store(&self) -> &Arc<PatternStore> {
        &self.patterns
    }
}

impl Drop for CaptureService {
    fn drop(&mut self) {
        // Debouncer::drop flushes what it can; errors are already logged.
        if let Err(e) = self.stop() {
            tracing::warn!(error = %e, "Final flush failed during shutdown");
        }
    }
}

const SECRET_KEYS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "api_key",
    "apikey",
    "access_key",
    "auth",
];

/// Mask `key=value` arguments whose key looks secret-bearing.
///
/// Adapters are responsible for real redaction; this is a second line for
/// the obvious cases so a pasted `--token=...` never reaches the store.
fn redact_secrets(command: &str) -> String {
    command
        .split(' ')
        .map(|word| {
            let Some((key, _value)) = word.split_once('=') else {
                return word.to_string();
            };
            let key_lower = key.to_ascii_lowercase();
            if SECRET_KEYS.iter().any(|s| key_lower.contains(s)) {
                format!("{}=[redacted]", key)
            } else {
                word.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn test_service() -> CaptureService {
        let memory = Arc::new(MemoryStore::open_in_memory().unwrap());
        memory.migrate().unwrap();
        let patterns = Arc::new(PatternStore::open_in_memory().unwrap());
        patterns.migrate().unwrap();

        let mut config = Config::default();
        // Keep the worker quiet so tests drive flushes explicitly.
        config.capture.debounce_secs = 600;
        CaptureService::new(config, memory, patterns)
    }

    fn record(subject: &str) -> EventRecord {
        EventRecord::new(
            EventKind::FileChange,
            subject,
            Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        )
    }

    #[test]
    fn test_lifecycle() {
        let mut service = test_service();
        assert!(!service.is_running());

        service.start().unwrap();
        assert!(service.is_running());
        service.start().unwrap(); // idempotent

        service.stop().unwrap();
        assert!(!service.is_running());
        service.stop().unwrap(); // idempotent
    }

    #[test]
    fn test_ingest_requires_running_service() {
        let service = test_service();
        let err = service.ingest(record("src/lib.rs")).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_ingest_rejects_oversized_subject() {
        let mut service = test_service();
        service.start().unwrap();

        let big = "x".repeat(service.config.capture.max_payload_bytes + 1);
        let err = service.ingest(record(&big)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(service.debounce_stats().events_buffered, 0);
    }

    #[test]
    fn test_ingest_flush_query_round_trip() {
        let mut service = test_service();
        service.start().unwrap();

        service.ingest(record("src/main.rs")).unwrap();
        service.ingest(record("src/main.rs")).unwrap();
        service
            .ingest(EventRecord::new(
                EventKind::TerminalCommand,
                "cargo test",
                Utc.timestamp_opt(1_700_000_010, 0).unwrap(),
            ))
            .unwrap();
        service.flush().unwrap();

        let session = service.active_session().unwrap().expect("session open");
        let messages = service.session_messages(&session.id).unwrap();
        // Two saves of one file merged into one message, plus the command.
        assert_eq!(messages.len(), 2);

        let stats = service.memory_stats().unwrap();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_messages, 2);
    }

    #[test]
    fn test_no_active_session_is_ok_none() {
        let service = test_service();
        assert!(service.active_session().unwrap().is_none());
    }

    #[test]
    fn test_command_subjects_are_redacted() {
        let mut service = test_service();
        service.start().unwrap();

        service
            .ingest(EventRecord::new(
                EventKind::TerminalCommand,
                "curl -H auth=abc123 --api_key=hunter2 https://example.com",
                Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            ))
            .unwrap();
        service.flush().unwrap();

        let session = service.active_session().unwrap().unwrap();
        let messages = service.session_messages(&session.id).unwrap();
        assert!(messages[0].content.contains("auth=[redacted]"));
        assert!(messages[0].content.contains("--api_key=[redacted]"));
        assert!(!messages[0].content.contains("hunter2"));
    }

    #[test]
    fn test_redact_secrets_leaves_plain_words() {
        let input = "cargo build --release";
        assert_eq!(redact_secrets(input), input);

        let input = "make TARGET=release";
        assert_eq!(redact_secrets(input), input);
    }

    #[test]
    fn test_two_services_coexist() {
        let mut a = test_service();
        let mut b = test_service();
        a.start().unwrap();
        b.start().unwrap();

        a.ingest(record("src/a.rs")).unwrap();
        a.flush().unwrap();

        // b shares no state with a.
        assert!(b.active_session().unwrap().is_none());
        assert!(a.active_session().unwrap().is_some());
    }
}
