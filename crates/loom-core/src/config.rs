//! Server configuration
//!
//! Loaded from an optional TOML file by the daemon; every section and field
//! falls back to its default.

use loom_decode::GenerationConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoomConfig {
    /// Queueing and resolution
    pub scheduler: SchedulerConfig,
    /// Decoding and validation
    pub generation: GenerationConfig,
    /// Persistence
    pub store: StoreConfig,
    /// Network surface
    pub server: ServerConfig,
}

impl LoomConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With successive lines generated per job
    #[inline]
    #[must_use]
    pub fn with_alternatives(mut self, alternatives: usize) -> Self {
        self.scheduler.alternatives = alternatives.max(1);
        self
    }

    /// With outline auto-insertion switched on or off
    #[inline]
    #[must_use]
    pub fn with_outlines(mut self, outlines: bool) -> Self {
        self.scheduler.outlines = outlines;
        self
    }

    /// With dispatch poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.scheduler.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// With database path
    #[inline]
    #[must_use]
    pub fn with_database(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.database = path.into();
        self
    }

    /// With generation settings
    #[inline]
    #[must_use]
    pub fn with_generation(mut self, generation: GenerationConfig) -> Self {
        self.generation = generation;
        self
    }
}

/// Scheduler settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Longest idle wait of the dispatch loop, in milliseconds
    pub poll_interval_ms: u64,
    /// Successive lines generated per job, stored at `key`, `key+a`, `key+aa`, ...
    ///
    /// Each one is a separate backend call with its own repetition window and
    /// forced speaker.
    pub alternatives: usize,
    /// Extra attempts after a backend failure that may not happen again
    pub generation_retries: usize,
    /// Inject outline sentences as stage directions
    pub outlines: bool,
    /// Trailing lines a new line must not repeat
    pub forbidden_window: usize,
    /// Largest numeric suffix tried when a scene id is taken
    pub max_scene_suffix: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 5_000,
            alternatives: 1,
            generation_retries: 1,
            outlines: false,
            forbidden_window: 4,
            max_scene_suffix: 1_000,
        }
    }
}

impl SchedulerConfig {
    /// Poll interval as a duration
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Store settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database file
    pub database: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from("database.db"),
        }
    }
}

/// Network settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to listen on
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Users accepted without a token
    pub allowed_users: Vec<String>,
    /// Shared secret for request tokens; auth is off when unset
    pub token_secret: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8456,
            allowed_users: Vec::new(),
            token_secret: None,
        }
    }
}
