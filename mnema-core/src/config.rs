//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/mnema/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/mnema/` (~/.config/mnema/)
//! - Data: `$XDG_DATA_HOME/mnema/` (~/.local/share/mnema/)
//! - State/Logs: `$XDG_STATE_HOME/mnema/` (~/.local/state/mnema/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default, Clone)]
pub struct Config {
    /// Event capture and debouncing
    #[serde(default)]
    pub capture: CaptureConfig,

    /// Session boundaries and retention
    #[serde(default)]
    pub session: SessionConfig,

    /// Pattern store pruning
    #[serde(default)]
    pub patterns: PatternConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Event capture and debouncing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Quiet period before a flush, in seconds
    #[serde(default = "default_debounce_secs")]
    pub debounce_secs: u64,

    /// Hard cap on how long a batch may wait under sustained activity,
    /// in seconds. Off by default.
    #[serde(default)]
    pub max_wait_secs: Option<u64>,

    /// Buffered events that trigger an immediate flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,

    /// Upper bound on event subject + metadata size, in bytes.
    /// Oversized events are rejected, never truncated.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Flush retry attempts before a batch is dropped
    #[serde(default = "default_flush_retries")]
    pub flush_retries: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            debounce_secs: default_debounce_secs(),
            max_wait_secs: None,
            flush_threshold: default_flush_threshold(),
            max_payload_bytes: default_max_payload_bytes(),
            flush_retries: default_flush_retries(),
        }
    }
}

impl CaptureConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_secs(self.debounce_secs)
    }

    pub fn max_wait(&self) -> Option<Duration> {
        self.max_wait_secs.map(Duration::from_secs)
    }
}

fn default_debounce_secs() -> u64 {
    5
}

fn default_flush_threshold() -> usize {
    256
}

fn default_max_payload_bytes() -> usize {
    // A few hundred KB; larger subjects indicate a misbehaving adapter.
    256 * 1024
}

fn default_flush_retries() -> usize {
    3
}

/// Session boundary and retention configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Minutes of inactivity after which the open session is considered closed
    #[serde(default = "default_idle_minutes")]
    pub idle_minutes: u32,

    /// Maximum stored sessions (active + completed) before FIFO eviction
    /// of the oldest completed sessions
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_minutes: default_idle_minutes(),
            capacity: default_capacity(),
        }
    }
}

impl SessionConfig {
    pub fn idle_boundary(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.idle_minutes))
    }
}

fn default_idle_minutes() -> u32 {
    30
}

fn default_capacity() -> usize {
    50
}

/// Pattern store pruning configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PatternConfig {
    /// Unpinned patterns below this confidence are prune candidates
    #[serde(default = "default_prune_min_confidence")]
    pub prune_min_confidence: f64,

    /// Unpinned patterns unused for longer than this are prune candidates
    #[serde(default = "default_prune_max_age_days")]
    pub prune_max_age_days: u32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            prune_min_confidence: default_prune_min_confidence(),
            prune_max_age_days: default_prune_max_age_days(),
        }
    }
}

fn default_prune_min_confidence() -> f64 {
    0.3
}

fn default_prune_max_age_days() -> u32 {
    90
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.capture.debounce_secs == 0 {
            return Err(Error::Config(
                "capture.debounce_secs must be at least 1".to_string(),
            ));
        }
        if let Some(max_wait) = self.capture.max_wait_secs {
            if max_wait < self.capture.debounce_secs {
                return Err(Error::Config(
                    "capture.max_wait_secs must be >= capture.debounce_secs".to_string(),
                ));
            }
        }
        if self.capture.flush_threshold == 0 {
            return Err(Error::Config(
                "capture.flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.session.capacity == 0 {
            return Err(Error::Config(
                "session.capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.patterns.prune_min_confidence) {
            return Err(Error::Config(
                "patterns.prune_min_confidence must be within [0, 1]".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/mnema/config.toml` (~/.config/mnema/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("mnema").join("config.toml")
    }

    /// Returns the data directory path (for SQLite databases)
    ///
    /// `$XDG_DATA_HOME/mnema/` (~/.local/share/mnema/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("mnema")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/mnema/` (~/.local/state/mnema/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("mnema")
    }

    /// Returns the working-memory database file path
    ///
    /// `$XDG_DATA_HOME/mnema/memory.db`
    pub fn memory_db_path() -> PathBuf {
        Self::data_dir().join("memory.db")
    }

    /// Returns the pattern store database file path
    ///
    /// `$XDG_DATA_HOME/mnema/patterns.db`
    pub fn patterns_db_path() -> PathBuf {
        Self::data_dir().join("patterns.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/mnema/mnema.log`
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("mnema.log")
    }
}
