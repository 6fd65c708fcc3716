//! Event debouncing
//!
//! Collapses bursts of raw activity into infrequent merged batches so the
//! session layer is not overwhelmed by, say, an editor auto-save firing on
//! every keystroke. Twenty saves of one file inside a window must persist as
//! one message, not twenty.
//!
//! ```text
//! ┌───────────┐  add_event   ┌───────────────┐  merged batch  ┌───────────┐
//! │ adapters  │ ───────────► │   Debouncer   │ ─────────────► │ FlushSink │
//! │ (N threads)│             │ buffer + timer │  (worker thread)│ (sessions)│
//! └───────────┘              └───────────────┘                └───────────┘
//! ```
//!
//! The buffer and timer deadlines are guarded by a single mutex per
//! instance. The worker takes the buffer out under the lock and performs
//! merging and persistence after releasing it, so a slow write never blocks
//! producers.

use crate::config::CaptureConfig;
use crate::error::Result;
use crate::types::{ActivityEvent, MergeKey};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Receives merged batches from the debouncer.
///
/// Implemented by the session manager; kept as a trait so the debouncer can
/// be exercised against an in-memory sink in tests.
pub trait FlushSink: Send + Sync {
    /// Persist one merged batch. Events arrive first-seen-ordered.
    fn deliver(&self, batch: Vec<ActivityEvent>) -> Result<()>;
}

/// Debouncing statistics
#[derive(Debug, Default, Clone)]
pub struct DebounceStats {
    /// Raw events accepted into the buffer
    pub events_buffered: usize,
    /// Events that were merged into an earlier event for the same key
    pub events_merged_away: usize,
    /// Batches delivered to the sink
    pub batches_flushed: usize,
    /// Delivery attempts that failed (including retries)
    pub flush_failures: usize,
    /// Batches dropped after retries were exhausted
    pub batches_dropped: usize,
}

struct State {
    buffer: Vec<ActivityEvent>,
    /// Quiet-period deadline, pushed forward by every add_event
    deadline: Option<Instant>,
    /// Hard cap set when the first event of a batch arrives (if configured)
    hard_deadline: Option<Instant>,
    shutdown: bool,
    stats: DebounceStats,
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
    sink: Arc<dyn FlushSink>,
    delay: Duration,
    max_wait: Option<Duration>,
    flush_threshold: usize,
    flush_retries: usize,
}

/// Thread-safe event debouncer with one background worker.
///
/// `add_event` may be called from any number of producer threads. Each call
/// resets the quiet-period timer to `delay`; a flush happens once the buffer
/// has been quiet that long, when the buffer crosses `flush_threshold`, or,
/// if a maximum wait is configured, when the oldest buffered event has
/// waited that long under sustained activity.
pub struct Debouncer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(config: &CaptureConfig, sink: Arc<dyn FlushSink>) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: Vec::new(),
                deadline: None,
                hard_deadline: None,
                shutdown: false,
                stats: DebounceStats::default(),
            }),
            wakeup: Condvar::new(),
            sink,
            delay: config.debounce(),
            max_wait: config.max_wait(),
            flush_threshold: config.flush_threshold,
            flush_retries: config.flush_retries,
        });

        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("mnema-debounce".to_string())
            .spawn(move || worker_loop(worker_shared))?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Buffer one event and reset the quiet-period timer.
    ///
    /// Never blocks on I/O; persistence happens on the worker thread.
    pub fn add_event(&self, event: ActivityEvent) {
        let mut state = self.shared.state.lock().unwrap();
        let now = Instant::now();

        state.buffer.push(event);
        state.stats.events_buffered += 1;

        if state.buffer.len() >= self.shared.flush_threshold {
            // Buffer pressure: flush as soon as the worker wakes.
            state.deadline = Some(now);
        } else {
            state.deadline = Some(now + self.shared.delay);
        }

        if let Some(max_wait) = self.shared.max_wait {
            if state.hard_deadline.is_none() {
                state.hard_deadline = Some(now + max_wait);
            }
        }

        drop(state);
        self.shared.wakeup.notify_one();
    }

    /// Flush the current buffer synchronously.
    ///
    /// Used by tests and by `stop()`. Returns the final delivery error if
    /// retries were exhausted; the batch is dropped in that case.
    pub fn flush_now(&self) -> Result<()> {
        let batch = {
            let mut state = self.shared.state.lock().unwrap();
            take_batch(&mut state)
        };
        if batch.is_empty() {
            return Ok(());
        }
        deliver_with_retry(&self.shared, batch)
    }

    /// Raw events currently buffered
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().unwrap().buffer.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    /// Snapshot of debouncing statistics
    pub fn stats(&self) -> DebounceStats {
        self.shared.state.lock().unwrap().stats.clone()
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.shutdown = true;
        }
        self.shared.wakeup.notify_one();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Debounce worker panicked");
            }
        }
    }
}

/// Pull the buffer out and clear the deadlines. Caller merges and delivers
/// after releasing the state lock.
fn take_batch(state: &mut State) -> Vec<ActivityEvent> {
    state.deadline = None;
    state.hard_deadline = None;
    std::mem::take(&mut state.buffer)
}

/// The deadline that should drive the next flush: the quiet-period timer,
/// capped by the hard deadline when one is set.
fn effective_deadline(state: &State) -> Option<Instant> {
    match (state.deadline, state.hard_deadline) {
        (Some(soft), Some(hard)) => Some(soft.min(hard)),
        (Some(soft), None) => Some(soft),
        (None, hard) => hard,
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let batch = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    break;
                }
                match effective_deadline(&state) {
                    None => {
                        state = shared.wakeup.wait(state).unwrap();
                    }
                    Some(due) => {
                        let now = Instant::now();
                        if due <= now {
                            break;
                        }
                        let (next, _) = shared.wakeup.wait_timeout(state, due - now).unwrap();
                        state = next;
                    }
                }
            }

            if state.shutdown && state.buffer.is_empty() {
                return;
            }
            take_batch(&mut state)
        };

        if batch.is_empty() {
            continue;
        }

        // Lock released: merging is pure, delivery may do I/O.
        if let Err(e) = deliver_with_retry(&shared, batch) {
            tracing::error!(error = %e, "Dropped batch after exhausting flush retries");
        }
    }
}

/// Merge a raw buffer into representative events.
///
/// Events are grouped by [`MergeKey`]; within a group the representative
/// keeps the latest timestamp and the union of metadata (last-write-wins).
/// First-seen order is preserved across groups.
fn merge_events(events: Vec<ActivityEvent>) -> Vec<ActivityEvent> {
    let mut merged: Vec<ActivityEvent> = Vec::with_capacity(events.len());
    let mut index: HashMap<MergeKey, usize> = HashMap::new();

    for event in events {
        match index.entry(event.merge_key()) {
            Entry::Occupied(slot) => merged[*slot.get()].absorb(event),
            Entry::Vacant(slot) => {
                slot.insert(merged.len());
                merged.push(event);
            }
        }
    }

    merged
}

/// Merge and deliver one batch, retrying storage failures with exponential
/// backoff. Input problems are never retried; they cannot succeed later.
fn deliver_with_retry(shared: &Shared, raw: Vec<ActivityEvent>) -> Result<()> {
    let raw_len = raw.len();
    let batch = merge_events(raw);
    let merged_away = raw_len - batch.len();

    let mut delay = Duration::from_millis(500);
    let mut last_error = None;

    for attempt in 0..=shared.flush_retries {
        if attempt > 0 {
            tracing::debug!(
                attempt,
                max = shared.flush_retries,
                "Retrying batch delivery after {:?}",
                delay
            );
            std::thread::sleep(delay);
            delay = std::cmp::min(delay * 2, Duration::from_secs(5));
        }

        match shared.sink.deliver(batch.clone()) {
            Ok(()) => {
                let mut state = shared.state.lock().unwrap();
                state.stats.batches_flushed += 1;
                state.stats.events_merged_away += merged_away;
                tracing::debug!(
                    events = batch.len(),
                    merged_away,
                    "Flushed batch"
                );
                return Ok(());
            }
            Err(e) if e.is_storage() => {
                tracing::warn!(error = %e, attempt, "Transient failure delivering batch");
                shared.state.lock().unwrap().stats.flush_failures += 1;
                last_error = Some(e);
            }
            Err(e) => {
                let mut state = shared.state.lock().unwrap();
                state.stats.flush_failures += 1;
                state.stats.batches_dropped += 1;
                return Err(e);
            }
        }
    }

    shared.state.lock().unwrap().stats.batches_dropped += 1;
    Err(last_error.unwrap_or_else(|| {
        crate::Error::Validation("batch delivery failed without an error".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, EventRecord};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn event(kind: EventKind, subject: &str, secs: i64) -> ActivityEvent {
        ActivityEvent::from_record(EventRecord::new(kind, subject, ts(secs)), 1024).unwrap()
    }

    /// Sink that records every delivered batch.
    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<ActivityEvent>>>,
    }

    impl FlushSink for RecordingSink {
        fn deliver(&self, batch: Vec<ActivityEvent>) -> Result<()> {
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    /// Sink that fails with a storage error N times before succeeding.
    struct FlakySink {
        failures_left: AtomicUsize,
        delivered: AtomicUsize,
    }

    impl FlushSink for FlakySink {
        fn deliver(&self, _batch: Vec<ActivityEvent>) -> Result<()> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(crate::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "store offline",
                )));
            }
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn test_config() -> CaptureConfig {
        CaptureConfig {
            // Long quiet period so tests control flushes via flush_now().
            debounce_secs: 60,
            max_wait_secs: None,
            flush_threshold: 1000,
            max_payload_bytes: 256 * 1024,
            flush_retries: 3,
        }
    }

    #[test]
    fn test_merge_collapses_same_path() {
        let events: Vec<ActivityEvent> = (0..20)
            .map(|i| event(EventKind::FileChange, "src/main.rs", i))
            .collect();

        let merged = merge_events(events);
        assert_eq!(merged.len(), 1);
        // Representative keeps the maximum timestamp in the burst.
        assert_eq!(merged[0].occurred_at(), ts(19));
    }

    #[test]
    fn test_merge_preserves_first_seen_order_across_keys() {
        let events = vec![
            event(EventKind::FileChange, "src/a.rs", 0),
            event(EventKind::TerminalCommand, "cargo check", 1),
            event(EventKind::FileChange, "src/b.rs", 2),
            event(EventKind::FileChange, "src/a.rs", 3),
        ];

        let merged = merge_events(events);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].subject(), "src/a.rs");
        assert_eq!(merged[0].occurred_at(), ts(3));
        assert_eq!(merged[1].subject(), "cargo check");
        assert_eq!(merged[2].subject(), "src/b.rs");
    }

    #[test]
    fn test_merge_never_combines_different_keys() {
        let events = vec![
            event(EventKind::FileChange, "src/a.rs", 0),
            event(EventKind::FileChange, "src/b.rs", 1),
        ];
        assert_eq!(merge_events(events).len(), 2);
    }

    #[test]
    fn test_editor_polls_collapse_to_latest() {
        let events = vec![
            event(EventKind::EditorPoll, "src/a.rs", 0),
            event(EventKind::EditorPoll, "src/b.rs", 5),
        ];
        let merged = merge_events(events);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].subject(), "src/b.rs");
    }

    #[test]
    fn test_flush_now_delivers_merged_batch() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = Debouncer::new(&test_config(), sink.clone()).unwrap();

        for i in 0..5 {
            debouncer.add_event(event(EventKind::FileChange, "src/lib.rs", i));
        }
        debouncer.add_event(event(EventKind::TerminalCommand, "cargo test", 6));

        assert_eq!(debouncer.pending_count(), 6);
        debouncer.flush_now().unwrap();
        assert!(!debouncer.has_pending());

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);

        let stats = debouncer.stats();
        assert_eq!(stats.events_buffered, 6);
        assert_eq!(stats.events_merged_away, 4);
        assert_eq!(stats.batches_flushed, 1);
    }

    #[test]
    fn test_timer_flush_without_explicit_trigger() {
        let sink = Arc::new(RecordingSink::default());
        let config = CaptureConfig {
            debounce_secs: 1,
            ..test_config()
        };
        let debouncer = Debouncer::new(&config, sink.clone()).unwrap();

        debouncer.add_event(event(EventKind::VcsHook, "post-commit", 0));

        // Quiet period is 1s; give the worker some slack.
        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.batches.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].subject(), "post-commit");
    }

    #[test]
    fn test_max_wait_flushes_under_sustained_activity() {
        let sink = Arc::new(RecordingSink::default());
        let config = CaptureConfig {
            debounce_secs: 1,
            max_wait_secs: Some(2),
            ..test_config()
        };
        let debouncer = Arc::new(Debouncer::new(&config, sink.clone()).unwrap());

        // Producer keeps resetting the quiet-period timer: events arrive
        // every 150ms for ~3.5s, so the 1s quiet period never elapses.
        let producer_done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let producer = {
            let debouncer = Arc::clone(&debouncer);
            let done = Arc::clone(&producer_done);
            std::thread::spawn(move || {
                for i in 0..24 {
                    debouncer.add_event(event(EventKind::FileChange, "src/lib.rs", i));
                    std::thread::sleep(Duration::from_millis(150));
                }
                done.store(true, Ordering::SeqCst);
            })
        };

        // The 2s hard cap must force a flush while the producer is active.
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut flushed_while_active = false;
        while Instant::now() < deadline {
            if !sink.batches.lock().unwrap().is_empty() {
                flushed_while_active = !producer_done.load(Ordering::SeqCst);
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        producer.join().unwrap();

        assert!(
            flushed_while_active,
            "hard cap should flush before the stream goes quiet"
        );
    }

    #[test]
    fn test_buffer_threshold_forces_early_flush() {
        let sink = Arc::new(RecordingSink::default());
        let config = CaptureConfig {
            debounce_secs: 60,
            flush_threshold: 3,
            ..test_config()
        };
        let debouncer = Debouncer::new(&config, sink.clone()).unwrap();

        debouncer.add_event(event(EventKind::FileChange, "a.rs", 0));
        debouncer.add_event(event(EventKind::FileChange, "b.rs", 1));
        debouncer.add_event(event(EventKind::FileChange, "c.rs", 2));

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.batches.lock().unwrap().is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
        }

        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_failed_delivery_retries_then_succeeds() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(2),
            delivered: AtomicUsize::new(0),
        });
        let debouncer = Debouncer::new(&test_config(), sink.clone()).unwrap();

        debouncer.add_event(event(EventKind::FileChange, "src/lib.rs", 0));
        debouncer.flush_now().unwrap();

        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        let stats = debouncer.stats();
        assert_eq!(stats.flush_failures, 2);
        assert_eq!(stats.batches_flushed, 1);
        assert_eq!(stats.batches_dropped, 0);
    }

    #[test]
    fn test_exhausted_retries_drop_batch() {
        let sink = Arc::new(FlakySink {
            failures_left: AtomicUsize::new(usize::MAX),
            delivered: AtomicUsize::new(0),
        });
        let config = CaptureConfig {
            flush_retries: 1,
            ..test_config()
        };
        let debouncer = Debouncer::new(&config, sink.clone()).unwrap();

        debouncer.add_event(event(EventKind::FileChange, "src/lib.rs", 0));
        let err = debouncer.flush_now().unwrap_err();
        assert!(err.is_storage());

        let stats = debouncer.stats();
        assert_eq!(stats.batches_dropped, 1);
        assert_eq!(stats.batches_flushed, 0);
    }

    #[test]
    fn test_concurrent_producers() {
        let sink = Arc::new(RecordingSink::default());
        let debouncer = Arc::new(Debouncer::new(&test_config(), sink.clone()).unwrap());

        let mut handles = Vec::new();
        for t in 0..4 {
            let debouncer = Arc::clone(&debouncer);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    debouncer.add_event(event(
                        EventKind::FileChange,
                        &format!("src/file{}.rs", t),
                        i,
                    ));
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        debouncer.flush_now().unwrap();

        let batches = sink.batches.lock().unwrap();
        let total: usize = batches.iter().map(|b| b.len()).sum();
        // One merged event per distinct path.
        assert_eq!(total, 4);
        assert_eq!(debouncer.stats().events_buffered, 200);
    }

    #[test]
    fn test_drop_flushes_remaining_events() {
        let sink = Arc::new(RecordingSink::default());
        {
            let debouncer = Debouncer::new(&test_config(), sink.clone()).unwrap();
            debouncer.add_event(event(EventKind::TerminalCommand, "git status", 0));
            // Dropped with a pending buffer and a far-future deadline.
        }
        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
    }
}
