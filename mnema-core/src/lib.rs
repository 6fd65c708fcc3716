//! # mnema-core
//!
//! Core library for mnema - an ambient developer-activity capture and
//! tiered memory pipeline for AI coding assistants.
//!
//! This library provides:
//! - A thread-safe debouncer that collapses bursts of raw activity
//! - A session-boundary state machine with lazy idle closing
//! - A capacity-bounded working-memory store (SQLite)
//! - A confidence-scored pattern store with full-text search
//!
//! ## Architecture
//!
//! Activity flows through three tiers:
//! - **Tier 0 (Signals):** raw events pushed by source adapters (transient)
//! - **Tier 1 (Working memory):** debounced, merged, session-scoped messages
//! - **Tier 2 (Patterns):** extracted reusable insights with confidence
//!
//! ## Example
//!
//! ```rust,no_run
//! use mnema_core::{CaptureService, Config};
//!
//! let config = Config::load().expect("failed to load config");
//! let mut service = CaptureService::open(config).expect("failed to open stores");
//! service.start().expect("failed to start");
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use db::{MemoryStats, MemoryStore};
pub use debounce::{DebounceStats, Debouncer, FlushSink};
pub use error::{Error, Result};
pub use patterns::{PatternStats, PatternStore};
pub use service::CaptureService;
pub use session::{PersistOutcome, SessionManager};
pub use types::*;

// Public modules
pub mod config;
pub mod db;
pub mod debounce;
pub mod error;
pub mod logging;
pub mod patterns;
pub mod service;
pub mod session;
pub mod types;
