//! Engine configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via FLOWGATE_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// State lock configuration.
    pub locks: LockConfig,
    /// Domain event stream configuration.
    pub events: EventsConfig,
    /// Side-effect executor configuration.
    pub executor: ExecutorConfig,
}

impl EngineConfig {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("FLOWGATE_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.locks.apply_env_overrides();
        self.events.apply_env_overrides();
        self.executor.apply_env_overrides();
    }

    /// Validates value ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.locks.ttl_secs == 0 {
            return Err(ConfigError::ValidationError(
                "locks.ttl_secs must be greater than zero".to_string(),
            ));
        }
        if self.locks.key_prefix.is_empty() {
            return Err(ConfigError::ValidationError(
                "locks.key_prefix must not be empty".to_string(),
            ));
        }
        if self.events.channel_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "events.channel_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// State lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Lock time-to-live in seconds. Locks are released explicitly on
    /// completion or failure; the TTL only bounds a lock whose side effects
    /// never report back.
    pub ttl_secs: u64,
    /// Prefix of every lock key in the shared store.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 7 * 24 * 60 * 60,
            key_prefix: "flowgate-lock".to_string(),
        }
    }
}

impl LockConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(ttl) = std::env::var("FLOWGATE_LOCK_TTL_SECS") {
            if let Ok(secs) = ttl.parse() {
                self.ttl_secs = secs;
            }
        }

        if let Ok(prefix) = std::env::var("FLOWGATE_LOCK_PREFIX") {
            self.key_prefix = prefix;
        }
    }

    /// Returns the lock TTL as Duration.
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Domain event stream configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Broadcast channel capacity. Slow subscribers lag past this many events.
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

impl EventsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("FLOWGATE_EVENT_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.channel_capacity = n;
            }
        }
    }
}

/// How side effects are run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorMode {
    /// On the calling thread, before `invoke` returns.
    #[default]
    Inline,
    /// On the tokio blocking pool; completion is reported out of band.
    BlockingPool,
}

/// Side-effect executor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub mode: ExecutorMode,
}

impl ExecutorConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(mode) = std::env::var("FLOWGATE_EXECUTOR") {
            self.mode = match mode.to_lowercase().as_str() {
                "blocking_pool" | "blockingpool" | "pool" => ExecutorMode::BlockingPool,
                _ => ExecutorMode::Inline,
            };
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
