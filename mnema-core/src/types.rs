//! Core domain types for mnema
//!
//! These types represent the canonical data model for the capture pipeline.
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One observed activity signal (file edit, command run, ...) |
//! | **Batch** | The merged events emitted together by one debouncer flush |
//! | **Session** | A bounded unit of developer activity, closed after idleness |
//! | **Message** | One persisted unit of session content |
//! | **Pattern** | A reusable insight with a confidence score |
//!
//! Events arrive from adapters as the open [`EventRecord`] shape and are
//! immediately converted into the closed [`ActivityEvent`] variants, so the
//! per-kind merge identity is checked exhaustively at compile time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================
// Events
// ============================================

/// The kinds of raw activity signal the pipeline accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A file was created, modified, or deleted
    FileChange,
    /// A command ran in the integrated terminal
    TerminalCommand,
    /// A version-control hook fired (commit, checkout, merge)
    VcsHook,
    /// A periodic editor-state snapshot (focused file, cursor area)
    EditorPoll,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::FileChange => "file_change",
            EventKind::TerminalCommand => "terminal_command",
            EventKind::VcsHook => "vcs_hook",
            EventKind::EditorPoll => "editor_poll",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_change" => Ok(EventKind::FileChange),
            "terminal_command" => Ok(EventKind::TerminalCommand),
            "vcs_hook" => Ok(EventKind::VcsHook),
            "editor_poll" => Ok(EventKind::EditorPoll),
            _ => Err(format!("unknown event kind: {}", s)),
        }
    }
}

/// The normalized event shape produced by source adapters.
///
/// This is the only type adapters need to construct. The subject carries the
/// natural identity of the signal: a file path, the command text, a hook
/// name, or the focused editor target. Adapters are expected to redact
/// secrets before handing records over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// What kind of signal this is
    pub kind: EventKind,
    /// File path, command text, hook name, or focus target
    pub subject: String,
    /// When the signal was observed
    pub occurred_at: DateTime<Utc>,
    /// Small classification map (e.g. change type, exit code)
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl EventRecord {
    pub fn new(kind: EventKind, subject: impl Into<String>, occurred_at: DateTime<Utc>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            occurred_at,
            metadata: BTreeMap::new(),
        }
    }

    /// Attach one metadata entry, builder-style.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Total byte size of subject plus metadata, used for input limits.
    pub fn payload_bytes(&self) -> usize {
        self.subject.len()
            + self
                .metadata
                .iter()
                .map(|(k, v)| k.len() + v.len())
                .sum::<usize>()
    }
}

/// A file-change signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChangeEvent {
    /// Path of the touched file
    pub path: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// A terminal-command signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    /// The command line as observed (already redacted by the adapter)
    pub command: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// A version-control hook signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VcsHookEvent {
    /// Hook name (post-commit, post-checkout, ...)
    pub hook: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// An editor-state poll signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EditorPollEvent {
    /// Focus target reported by the editor
    pub focus: String,
    pub occurred_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

/// One observed activity signal, as a closed tagged variant.
///
/// Keeping one payload shape per kind means the debouncer's merge-by-key
/// logic is an exhaustive `match`: adding a kind without deciding its merge
/// identity is a compile error, not a silent passthrough.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActivityEvent {
    FileChange(FileChangeEvent),
    TerminalCommand(CommandEvent),
    VcsHook(VcsHookEvent),
    EditorPoll(EditorPollEvent),
}

/// Merge identity for debouncing.
///
/// Events with equal keys collapse into one representative event per flush
/// window; events with different keys are never combined.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MergeKey {
    /// File-change events merge per path
    File(String),
    /// Terminal commands merge per exact command text
    Command(String),
    /// Hooks merge per hook name
    Hook(String),
    /// All editor polls in a window collapse to the latest snapshot
    Editor,
}

impl ActivityEvent {
    /// Build from a normalized adapter record.
    ///
    /// Rejects empty subjects and payloads larger than `max_payload_bytes`
    /// with [`Error::Validation`](crate::Error::Validation). Oversized input
    /// is never truncated; a corrupt half-record in the store is worse than a
    /// rejected one.
    pub fn from_record(record: EventRecord, max_payload_bytes: usize) -> crate::Result<Self> {
        if record.subject.trim().is_empty() {
            return Err(crate::Error::Validation(format!(
                "{} event with empty subject",
                record.kind
            )));
        }
        let payload = record.payload_bytes();
        if payload > max_payload_bytes {
            return Err(crate::Error::Validation(format!(
                "{} event payload is {} bytes, limit is {}",
                record.kind, payload, max_payload_bytes
            )));
        }

        let EventRecord {
            kind,
            subject,
            occurred_at,
            metadata,
        } = record;

        Ok(match kind {
            EventKind::FileChange => ActivityEvent::FileChange(FileChangeEvent {
                path: subject,
                occurred_at,
                metadata,
            }),
            EventKind::TerminalCommand => ActivityEvent::TerminalCommand(CommandEvent {
                command: subject,
                occurred_at,
                metadata,
            }),
            EventKind::VcsHook => ActivityEvent::VcsHook(VcsHookEvent {
                hook: subject,
                occurred_at,
                metadata,
            }),
            EventKind::EditorPoll => ActivityEvent::EditorPoll(EditorPollEvent {
                focus: subject,
                occurred_at,
                metadata,
            }),
        })
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ActivityEvent::FileChange(_) => EventKind::FileChange,
            ActivityEvent::TerminalCommand(_) => EventKind::TerminalCommand,
            ActivityEvent::VcsHook(_) => EventKind::VcsHook,
            ActivityEvent::EditorPoll(_) => EventKind::EditorPoll,
        }
    }

    /// The natural identity of the signal (path, command, hook, focus).
    pub fn subject(&self) -> &str {
        match self {
            ActivityEvent::FileChange(e) => &e.path,
            ActivityEvent::TerminalCommand(e) => &e.command,
            ActivityEvent::VcsHook(e) => &e.hook,
            ActivityEvent::EditorPoll(e) => &e.focus,
        }
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ActivityEvent::FileChange(e) => e.occurred_at,
            ActivityEvent::TerminalCommand(e) => e.occurred_at,
            ActivityEvent::VcsHook(e) => e.occurred_at,
            ActivityEvent::EditorPoll(e) => e.occurred_at,
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        match self {
            ActivityEvent::FileChange(e) => &e.metadata,
            ActivityEvent::TerminalCommand(e) => &e.metadata,
            ActivityEvent::VcsHook(e) => &e.metadata,
            ActivityEvent::EditorPoll(e) => &e.metadata,
        }
    }

    /// Merge identity for this event; see [`MergeKey`].
    pub fn merge_key(&self) -> MergeKey {
        match self {
            ActivityEvent::FileChange(e) => MergeKey::File(e.path.clone()),
            ActivityEvent::TerminalCommand(e) => MergeKey::Command(e.command.clone()),
            ActivityEvent::VcsHook(e) => MergeKey::Hook(e.hook.clone()),
            ActivityEvent::EditorPoll(_) => MergeKey::Editor,
        }
    }

    /// Fold a later event with the same merge key into this one.
    ///
    /// Keeps the latest timestamp and the union of metadata; on a metadata
    /// key collision the newer event wins, consistent with last-write-wins.
    pub fn absorb(&mut self, other: ActivityEvent) {
        debug_assert_eq!(self.merge_key(), other.merge_key());

        match (self, other) {
            (ActivityEvent::FileChange(a), ActivityEvent::FileChange(b)) => {
                a.metadata.extend(b.metadata);
                if b.occurred_at > a.occurred_at {
                    a.occurred_at = b.occurred_at;
                }
            }
            (ActivityEvent::TerminalCommand(a), ActivityEvent::TerminalCommand(b)) => {
                a.metadata.extend(b.metadata);
                if b.occurred_at > a.occurred_at {
                    a.occurred_at = b.occurred_at;
                }
            }
            (ActivityEvent::VcsHook(a), ActivityEvent::VcsHook(b)) => {
                a.metadata.extend(b.metadata);
                if b.occurred_at > a.occurred_at {
                    a.occurred_at = b.occurred_at;
                }
            }
            (ActivityEvent::EditorPoll(a), ActivityEvent::EditorPoll(b)) => {
                a.metadata.extend(b.metadata);
                if b.occurred_at > a.occurred_at {
                    // Editor polls share one merge key, so the focus target
                    // must follow the latest snapshot too.
                    a.focus = b.focus;
                    a.occurred_at = b.occurred_at;
                }
            }
            // Merge keys differ across kinds, so mixed pairs cannot occur.
            _ => unreachable!("absorb called with mismatched merge keys"),
        }
    }

    /// Human-readable one-liner used as message content.
    pub fn describe(&self) -> String {
        match self {
            ActivityEvent::FileChange(e) => match e.metadata.get("change") {
                Some(change) => format!("{} {}", change, e.path),
                None => format!("edited {}", e.path),
            },
            ActivityEvent::TerminalCommand(e) => match e.metadata.get("exit_code") {
                Some(code) => format!("ran `{}` (exit {})", e.command, code),
                None => format!("ran `{}`", e.command),
            },
            ActivityEvent::VcsHook(e) => match e.metadata.get("ref") {
                Some(r) => format!("vcs {} on {}", e.hook, r),
                None => format!("vcs {}", e.hook),
            },
            ActivityEvent::EditorPoll(e) => format!("focused {}", e.focus),
        }
    }
}

// ============================================
// Sessions
// ============================================

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Open and accepting activity
    Active,
    /// Closed; `ended_at` is set
    Completed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "completed" => Ok(SessionStatus::Completed),
            _ => Err(format!("unknown session status: {}", s)),
        }
    }
}

/// How a session came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Opened by the pipeline when activity arrived with no open session
    Ambient,
    /// Opened explicitly by a caller through the store API
    Explicit,
}

impl SessionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionKind::Ambient => "ambient",
            SessionKind::Explicit => "explicit",
        }
    }
}

impl std::str::FromStr for SessionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ambient" => Ok(SessionKind::Ambient),
            "explicit" => Ok(SessionKind::Explicit),
            _ => Err(format!("unknown session kind: {}", s)),
        }
    }
}

/// A bounded unit of developer activity.
///
/// Invariants: at most one session is `active` per store; `ended_at` is set
/// exactly when status is `completed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique identifier
    pub id: String,
    /// How the session was opened
    pub kind: SessionKind,
    /// When the session started
    pub started_at: DateTime<Utc>,
    /// When the session closed (None while active)
    pub ended_at: Option<DateTime<Utc>>,
    /// Current lifecycle status
    pub status: SessionStatus,
    /// Most recent activity timestamp
    pub last_activity_at: DateTime<Utc>,
}

impl Session {
    /// Minutes of inactivity as of `now`.
    pub fn idle_minutes(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.last_activity_at).num_minutes()
    }
}

// ============================================
// Messages
// ============================================

/// Role attributed to a persisted message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// Developer-initiated activity (file edits, commands)
    Human,
    /// Environmental activity (hooks, editor polls) and injected context
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::Human => "human",
            MessageRole::System => "system",
        }
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(MessageRole::Human),
            "system" => Ok(MessageRole::System),
            _ => Err(format!("unknown message role: {}", s)),
        }
    }
}

/// One persisted unit of session content.
///
/// Owned exclusively by its session and deleted with it on eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Database ID (auto-incremented)
    pub id: i64,
    /// Owning session
    pub session_id: String,
    /// Who the content is attributed to
    pub role: MessageRole,
    /// Message body
    pub content: String,
    /// Timestamp of the underlying activity
    pub ts: DateTime<Utc>,
}

// ============================================
// Patterns
// ============================================

/// Category of a stored pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    /// A shell command worth reusing
    Command,
    /// A multi-step working sequence
    Workflow,
    /// A recurring code change
    CodeEdit,
    /// A diagnosis of a recurring failure
    Diagnosis,
    /// A stated or inferred developer preference
    Preference,
}

impl PatternType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternType::Command => "command",
            PatternType::Workflow => "workflow",
            PatternType::CodeEdit => "code_edit",
            PatternType::Diagnosis => "diagnosis",
            PatternType::Preference => "preference",
        }
    }
}

impl std::str::FromStr for PatternType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "command" => Ok(PatternType::Command),
            "workflow" => Ok(PatternType::Workflow),
            "code_edit" => Ok(PatternType::CodeEdit),
            "diagnosis" => Ok(PatternType::Diagnosis),
            "preference" => Ok(PatternType::Preference),
            _ => Err(format!("unknown pattern type: {}", s)),
        }
    }
}

/// A reusable, named insight extracted from observed activity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    /// Unique identifier
    pub id: String,
    /// Short human-readable title
    pub title: String,
    /// Full pattern body
    pub content: String,
    /// Category
    pub pattern_type: PatternType,
    /// Normalized confidence in [0, 1]
    pub confidence: f64,
    /// How many times the pattern has been retrieved/applied
    pub access_count: i64,
    /// When the pattern was last used (None if never)
    pub last_accessed: Option<DateTime<Utc>>,
    /// Scoping tags for retrieval
    pub namespaces: Vec<String>,
    /// Pinned patterns are exempt from pruning
    pub pinned: bool,
}

/// The weighted inputs to a confidence computation.
///
/// Transient; only the resulting scalar is stored on [`Pattern`].
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceFactors {
    /// How well the pattern matched when it was applied, in [0, 1]
    pub match_quality: f64,
    /// Total times the pattern has been used
    pub usage_count: u64,
    /// Fraction of uses that succeeded, in [0, 1]
    pub success_rate: f64,
    /// When the pattern was last used (None if unknown)
    pub last_used: Option<DateTime<Utc>>,
}

/// Discrete label for a confidence percentage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfidenceLabel {
    VeryHigh,
    High,
    Medium,
    Low,
    VeryLow,
}

impl ConfidenceLabel {
    /// Label thresholds are contract values: ≥90, ≥75, ≥50, ≥30, else.
    pub fn from_percent(percent: u8) -> Self {
        match percent {
            90..=u8::MAX => ConfidenceLabel::VeryHigh,
            75..=89 => ConfidenceLabel::High,
            50..=74 => ConfidenceLabel::Medium,
            30..=49 => ConfidenceLabel::Low,
            _ => ConfidenceLabel::VeryLow,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLabel::VeryHigh => "Very High",
            ConfidenceLabel::High => "High",
            ConfidenceLabel::Medium => "Medium",
            ConfidenceLabel::Low => "Low",
            ConfidenceLabel::VeryLow => "Very Low",
        }
    }
}

impl std::fmt::Display for ConfidenceLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_event_kind_round_trip() {
        for kind in [
            EventKind::FileChange,
            EventKind::TerminalCommand,
            EventKind::VcsHook,
            EventKind::EditorPoll,
        ] {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_from_record_rejects_empty_subject() {
        let record = EventRecord::new(EventKind::FileChange, "  ", ts(0));
        let err = ActivityEvent::from_record(record, 1024).unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn test_from_record_rejects_oversized_payload() {
        let record = EventRecord::new(EventKind::TerminalCommand, "x".repeat(100), ts(0));
        let err = ActivityEvent::from_record(record, 99).unwrap_err();
        assert!(matches!(err, crate::Error::Validation(_)));
    }

    #[test]
    fn test_merge_keys_distinguish_kinds() {
        let file = ActivityEvent::from_record(
            EventRecord::new(EventKind::FileChange, "src/main.rs", ts(0)),
            1024,
        )
        .unwrap();
        let cmd = ActivityEvent::from_record(
            EventRecord::new(EventKind::TerminalCommand, "src/main.rs", ts(0)),
            1024,
        )
        .unwrap();
        // Same subject text, different kinds: must never combine.
        assert_ne!(file.merge_key(), cmd.merge_key());
    }

    #[test]
    fn test_absorb_keeps_latest_timestamp_and_unions_metadata() {
        let mut first = ActivityEvent::from_record(
            EventRecord::new(EventKind::FileChange, "src/lib.rs", ts(0))
                .with_meta("change", "created"),
            1024,
        )
        .unwrap();
        let second = ActivityEvent::from_record(
            EventRecord::new(EventKind::FileChange, "src/lib.rs", ts(30))
                .with_meta("change", "modified")
                .with_meta("lines", "12"),
            1024,
        )
        .unwrap();

        first.absorb(second);

        assert_eq!(first.occurred_at(), ts(30));
        assert_eq!(first.metadata().get("change").unwrap(), "modified");
        assert_eq!(first.metadata().get("lines").unwrap(), "12");
    }

    #[test]
    fn test_absorb_never_moves_timestamp_backwards() {
        let mut newer = ActivityEvent::from_record(
            EventRecord::new(EventKind::VcsHook, "post-commit", ts(60)),
            1024,
        )
        .unwrap();
        let older = ActivityEvent::from_record(
            EventRecord::new(EventKind::VcsHook, "post-commit", ts(10)),
            1024,
        )
        .unwrap();

        newer.absorb(older);
        assert_eq!(newer.occurred_at(), ts(60));
    }

    #[test]
    fn test_confidence_label_thresholds() {
        assert_eq!(ConfidenceLabel::from_percent(100), ConfidenceLabel::VeryHigh);
        assert_eq!(ConfidenceLabel::from_percent(90), ConfidenceLabel::VeryHigh);
        assert_eq!(ConfidenceLabel::from_percent(89), ConfidenceLabel::High);
        assert_eq!(ConfidenceLabel::from_percent(75), ConfidenceLabel::High);
        assert_eq!(ConfidenceLabel::from_percent(74), ConfidenceLabel::Medium);
        assert_eq!(ConfidenceLabel::from_percent(50), ConfidenceLabel::Medium);
        assert_eq!(ConfidenceLabel::from_percent(49), ConfidenceLabel::Low);
        assert_eq!(ConfidenceLabel::from_percent(30), ConfidenceLabel::Low);
        assert_eq!(ConfidenceLabel::from_percent(29), ConfidenceLabel::VeryLow);
        assert_eq!(ConfidenceLabel::from_percent(0), ConfidenceLabel::VeryLow);
    }

    #[test]
    fn test_session_status_round_trip() {
        assert_eq!("active".parse::<SessionStatus>().unwrap(), SessionStatus::Active);
        assert_eq!(
            "completed".parse::<SessionStatus>().unwrap(),
            SessionStatus::Completed
        );
        assert!("stale".parse::<SessionStatus>().is_err());
    }
}
