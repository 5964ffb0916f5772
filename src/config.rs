//! Configuration
//!
//! Loaded from a TOML file, then overridden by environment variables.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | FEEDREAPER_CONF | feedreaper.toml | Config file path (missing file = defaults) |
//! | FEEDREAPER_DB | feedreaper.db | Store directory |
//! | FEEDREAPER_POLL_INTERVAL_MS | 300000 | Poll interval (minimum 60000) |
//! | FEEDREAPER_BATCH_LIMIT | 10 | Feeds dispatched per poll pass |
//! | FEEDREAPER_FETCH_WORKERS | 10 | Concurrent fetch workers |
//! | FEEDREAPER_MAX_BODY_BYTES | 16777216 | Largest response body accepted |
//! | FEEDREAPER_LOG_LEVEL | info | Default log level (RUST_LOG wins) |
//! | FEEDREAPER_LOG_JSON | false | JSON log lines |

use crate::store::StoreOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Environment variable naming the config file
pub const CONFIG_ENV: &str = "FEEDREAPER_CONF";
pub const DEFAULT_CONFIG_FILE: &str = "feedreaper.toml";

/// Polling more often than this is never useful and hammers publishers.
pub const POLL_INTERVAL_MIN: Duration = Duration::from_secs(60);

/// Error type for configuration loading
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read config: {}", e),
            ConfigError::Parse(e) => write!(f, "cannot parse config: {}", e),
            ConfigError::Invalid(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub poll: PollConfig,
    pub fetch: FetchConfig,
    pub reaper: ReaperConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Store directory (journal + snapshot)
    pub location: PathBuf,
    #[serde(with = "duration_millis", rename = "lock_timeout_ms")]
    pub lock_timeout: Duration,
    pub max_journal_file_size: usize,
    /// Commits between automatic checkpoints (0 disables)
    pub checkpoint_every: u64,
    pub sync_on_commit: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let store = StoreOptions::default();
        DatabaseConfig {
            location: PathBuf::from("feedreaper.db"),
            lock_timeout: store.lock_timeout,
            max_journal_file_size: store.max_journal_file_size,
            checkpoint_every: store.checkpoint_every,
            sync_on_commit: store.sync_on_commit,
        }
    }
}

impl DatabaseConfig {
    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: self.lock_timeout,
            max_journal_file_size: self.max_journal_file_size,
            checkpoint_every: self.checkpoint_every,
            sync_on_commit: self.sync_on_commit,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    #[serde(with = "duration_millis", rename = "interval_ms")]
    pub interval: Duration,
    /// Maximum feeds handed to the fetch stage per pass
    pub batch_limit: usize,
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(300),
            batch_limit: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub workers: usize,
    #[serde(with = "duration_millis", rename = "timeout_ms")]
    pub timeout: Duration,
    pub user_agent: String,
    /// Capacity of the poller → fetch channel
    pub queue_depth: usize,
    /// Largest response body accepted, before and after gzip inflation
    pub max_body_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            workers: 10,
            timeout: Duration::from_secs(20),
            user_agent: format!("feedreaper/{}", env!("CARGO_PKG_VERSION")),
            queue_depth: 10,
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperConfig {
    /// Capacity of the fetch → reaper channel
    pub queue_depth: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        ReaperConfig { queue_depth: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Config {
    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(text)?;
        config.normalize()?;
        Ok(config)
    }

    /// Read a config file. A missing file yields defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Load the file named by `FEEDREAPER_CONF` (or the default name), then
    /// apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let mut config = Self::load(path)?;
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the environment in production).
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup("FEEDREAPER_DB") {
            self.database.location = PathBuf::from(db);
        }
        if let Some(ms) = lookup("FEEDREAPER_POLL_INTERVAL_MS") {
            self.poll.interval = Duration::from_millis(parse_number(&ms, "FEEDREAPER_POLL_INTERVAL_MS")?);
        }
        if let Some(n) = lookup("FEEDREAPER_BATCH_LIMIT") {
            self.poll.batch_limit = parse_number(&n, "FEEDREAPER_BATCH_LIMIT")? as usize;
        }
        if let Some(n) = lookup("FEEDREAPER_FETCH_WORKERS") {
            self.fetch.workers = parse_number(&n, "FEEDREAPER_FETCH_WORKERS")? as usize;
        }
        if let Some(n) = lookup("FEEDREAPER_MAX_BODY_BYTES") {
            self.fetch.max_body_bytes = parse_number(&n, "FEEDREAPER_MAX_BODY_BYTES")? as usize;
        }
        if let Some(level) = lookup("FEEDREAPER_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("FEEDREAPER_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes");
        }
        self.normalize()
    }

    /// Clamp and validate values.
    fn normalize(&mut self) -> Result<(), ConfigError> {
        if self.poll.interval < POLL_INTERVAL_MIN {
            warn!(
                configured = ?self.poll.interval,
                minimum = ?POLL_INTERVAL_MIN,
                "poll interval below minimum, clamping"
            );
            self.poll.interval = POLL_INTERVAL_MIN;
        }
        if self.poll.batch_limit == 0 {
            return Err(ConfigError::Invalid("poll.batch_limit must be > 0".to_string()));
        }
        if self.fetch.workers == 0 {
            return Err(ConfigError::Invalid("fetch.workers must be > 0".to_string()));
        }
        if self.fetch.max_body_bytes == 0 {
            return Err(ConfigError::Invalid("fetch.max_body_bytes must be > 0".to_string()));
        }
        self.fetch.queue_depth = self.fetch.queue_depth.max(1);
        self.reaper.queue_depth = self.reaper.queue_depth.max(1);
        Ok(())
    }

    /// Configuration for tests
    pub fn test() -> Self {
        Config {
            database: DatabaseConfig {
                location: PathBuf::from("/tmp/feedreaper-test"),
                lock_timeout: Duration::from_secs(2),
                max_journal_file_size: 64 * 1024,
                checkpoint_every: 50,
                sync_on_commit: true,
            },
            poll: PollConfig {
                interval: POLL_INTERVAL_MIN,
                batch_limit: 10,
            },
            fetch: FetchConfig {
                workers: 4,
                timeout: Duration::from_secs(5),
                queue_depth: 4,
                ..FetchConfig::default()
            },
            reaper: ReaperConfig { queue_depth: 4 },
            logging: LoggingConfig::default(),
        }
    }
}

fn parse_number(raw: &str, name: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(format!("{} must be a number, got {:?}", name, raw)))
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
