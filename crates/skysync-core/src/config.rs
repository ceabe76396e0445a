//! Configuration module for SkySync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounds accepted by the remote long-poll, in seconds.
pub const LONGPOLL_TIMEOUT_MIN: u64 = 30;
pub const LONGPOLL_TIMEOUT_MAX: u64 = 480;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for SkySync.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

/// Synchronization settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Local folder mirrored with the remote root.
    pub root: PathBuf,
    /// Identifier the sync lock is keyed on.
    pub config_name: String,
    /// Days between forced full reconciliations.
    pub reindex_interval_days: u32,
    /// Remote long-poll timeout in seconds, clamped to 30..=480.
    pub longpoll_timeout: u64,
    /// Quiet period in milliseconds that closes a batch of local events.
    pub local_event_delay_ms: u64,
    pub max_parallel_uploads: usize,
    pub max_parallel_downloads: usize,
    /// Seconds between reachability probes.
    pub connection_check_interval: u64,
    /// Use snapshot polling instead of native notifications.
    pub use_polling_watcher: bool,
    /// Seconds between snapshots when polling.
    pub polling_interval: u64,
    /// Bounded retries for cursor invalidation and transient server errors.
    pub max_retries: u32,
    /// Finished sync events kept for status queries.
    pub history_limit: usize,
}

/// Sync index and hash cache locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub index_path: PathBuf,
    pub hash_cache_path: PathBuf,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Try to load from `path`; fall back to [`Config::default`] on any error.
    pub fn load_or_default(path: &Path) -> Self {
        Self::load(path).unwrap_or_default()
    }

    /// Platform-appropriate default path for the configuration file.
    ///
    /// Typically `$XDG_CONFIG_HOME/skysync/config.yaml` on Linux.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("skysync")
            .join("config.yaml")
    }
}

impl SyncConfig {
    /// Long-poll timeout clamped to the range the remote accepts.
    pub fn longpoll_timeout(&self) -> Duration {
        Duration::from_secs(
            self.longpoll_timeout
                .clamp(LONGPOLL_TIMEOUT_MIN, LONGPOLL_TIMEOUT_MAX),
        )
    }

    pub fn local_event_delay(&self) -> Duration {
        Duration::from_millis(self.local_event_delay_ms)
    }

    pub fn reindex_interval(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.reindex_interval_days))
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            root: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("~"))
                .join("SkySync"),
            config_name: "default".to_string(),
            reindex_interval_days: 14,
            longpoll_timeout: LONGPOLL_TIMEOUT_MIN,
            local_event_delay_ms: 500,
            max_parallel_uploads: 6,
            max_parallel_downloads: 6,
            connection_check_interval: 10,
            use_polling_watcher: false,
            polling_interval: 5,
            max_retries: 3,
            history_limit: 1000,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("~/.local/share"))
            .join("skysync");
        Self {
            index_path: data_dir.join("index.db"),
            hash_cache_path: data_dir.join("hash_cache.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.polling_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Valid values for `logging.level`.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

fn positive(errors: &mut Vec<ValidationError>, field: &str, value: u64) {
    if value == 0 {
        errors.push(ValidationError {
            field: field.into(),
            message: "must be greater than 0".into(),
        });
    }
}

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid. An out-of-range
    /// `sync.longpoll_timeout` is not an error; it is clamped on use.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- sync ---
        if !self.sync.root.is_absolute() {
            errors.push(ValidationError {
                field: "sync.root".into(),
                message: format!("must be an absolute path: {}", self.sync.root.display()),
            });
        }
        if self.sync.config_name.trim().is_empty() {
            errors.push(ValidationError {
                field: "sync.config_name".into(),
                message: "must not be empty".into(),
            });
        }
        positive(
            &mut errors,
            "sync.reindex_interval_days",
            u64::from(self.sync.reindex_interval_days),
        );
        positive(
            &mut errors,
            "sync.max_parallel_uploads",
            self.sync.max_parallel_uploads as u64,
        );
        positive(
            &mut errors,
            "sync.max_parallel_downloads",
            self.sync.max_parallel_downloads as u64,
        );
        positive(
            &mut errors,
            "sync.connection_check_interval",
            self.sync.connection_check_interval,
        );
        positive(&mut errors, "sync.history_limit", self.sync.history_limit as u64);
        if self.sync.use_polling_watcher {
            positive(&mut errors, "sync.polling_interval", self.sync.polling_interval);
        }

        // --- database ---
        if self.database.index_path == self.database.hash_cache_path {
            errors.push(ValidationError {
                field: "database.hash_cache_path".into(),
                message: "must differ from database.index_path".into(),
            });
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use skysync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .sync_root(PathBuf::from("/home/user/SkySync"))
///     .longpoll_timeout(120)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- sync ---

    pub fn sync_root(mut self, root: PathBuf) -> Self {
        self.config.sync.root = root;
        self
    }

    pub fn config_name(mut self, name: impl Into<String>) -> Self {
        self.config.sync.config_name = name.into();
        self
    }

    pub fn reindex_interval_days(mut self, days: u32) -> Self {
        self.config.sync.reindex_interval_days = days;
        self
    }

    pub fn longpoll_timeout(mut self, seconds: u64) -> Self {
        self.config.sync.longpoll_timeout = seconds;
        self
    }

    pub fn local_event_delay_ms(mut self, ms: u64) -> Self {
        self.config.sync.local_event_delay_ms = ms;
        self
    }

    pub fn max_parallel_uploads(mut self, n: usize) -> Self {
        self.config.sync.max_parallel_uploads = n;
        self
    }

    pub fn max_parallel_downloads(mut self, n: usize) -> Self {
        self.config.sync.max_parallel_downloads = n;
        self
    }

    pub fn connection_check_interval(mut self, seconds: u64) -> Self {
        self.config.sync.connection_check_interval = seconds;
        self
    }

    pub fn use_polling_watcher(mut self, enabled: bool) -> Self {
        self.config.sync.use_polling_watcher = enabled;
        self
    }

    pub fn polling_interval(mut self, seconds: u64) -> Self {
        self.config.sync.polling_interval = seconds;
        self
    }

    pub fn max_retries(mut self, n: u32) -> Self {
        self.config.sync.max_retries = n;
        self
    }

    pub fn history_limit(mut self, n: usize) -> Self {
        self.config.sync.history_limit = n;
        self
    }

    // --- database ---

    pub fn index_path(mut self, path: PathBuf) -> Self {
        self.config.database.index_path = path;
        self
    }

    pub fn hash_cache_path(mut self, path: PathBuf) -> Self {
        self.config.database.hash_cache_path = path;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    pub fn logging_json(mut self, json: bool) -> Self {
        self.config.logging.json = json;
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
