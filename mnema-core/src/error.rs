//! Error types for mnema-core

use thiserror::Error;

/// Main error type for the mnema-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or oversized input, rejected before persistence
    #[error("invalid input: {0}")]
    Validation(String),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Session not found (or not active where an active session is required)
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Pattern not found
    #[error("pattern not found: {0}")]
    PatternNotFound(String),

    /// Pattern id already exists
    #[error("pattern already exists: {0}")]
    PatternExists(String),
}

impl Error {
    /// Whether this error indicates the backing store is unavailable.
    ///
    /// Callers use this to distinguish a transient storage failure (worth
    /// retrying) from an input problem that will never succeed.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_))
    }
}

/// Result type alias for mnema-core
pub type Result<T> = std::result::Result<T, Error>;
