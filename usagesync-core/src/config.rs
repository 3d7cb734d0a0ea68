//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/usagesync/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/usagesync/` (~/.config/usagesync/)
//! - Data: `$XDG_DATA_HOME/usagesync/` (~/.local/share/usagesync/)
//! - State/Logs: `$XDG_STATE_HOME/usagesync/` (~/.local/state/usagesync/)

use crate::error::{Error, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
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
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Counter service connection
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Debounce, coalescing and retry knobs
    #[serde(default)]
    pub tracking: TrackingConfig,

    /// Classification rules; the built-in rule set is used when absent
    #[serde(default)]
    pub rules: Option<RulesConfig>,
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

/// Counter service configuration
///
/// `run` and `flush` need a ready collector. `status`, `classify` and
/// `clear` only touch local state and work without one.
#[derive(Debug, Deserialize, Clone)]
pub struct CollectorConfig {
    /// Enable/disable pushing to the counter service
    #[serde(default)]
    pub enabled: bool,

    /// Counter service base URL (e.g., `http://127.0.0.1:9000`)
    pub server_url: Option<String>,

    /// Shared secret sent as `X-API-KEY`
    pub api_key: Option<String>,

    /// HTTP request timeout in seconds
    #[serde(default = "default_collector_timeout")]
    pub timeout_secs: u64,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: None,
            api_key: None,
            timeout_secs: default_collector_timeout(),
        }
    }
}

fn default_collector_timeout() -> u64 {
    10
}

impl CollectorConfig {
    /// Check if the counter service is enabled and has an address
    pub fn is_ready(&self) -> bool {
        self.enabled && self.server_url.is_some()
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }

        if self.server_url.is_none() {
            return Err(Error::Config(
                "collector.server_url is required when collector is enabled".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(Error::Config(
                "collector.timeout_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Request timeout as a duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Tracking pipeline configuration
#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    /// Window within which repeat observations of one (scope, host, path) collapse
    #[serde(default = "default_debounce_window_ms")]
    pub debounce_window_ms: u64,

    /// Quiescence delay before a burst of increments is flushed
    #[serde(default = "default_coalesce_ms")]
    pub coalesce_ms: u64,

    /// Consecutive sequence conflicts tolerated before a flush is abandoned
    #[serde(default = "default_max_conflict_retries")]
    pub max_conflict_retries: u32,

    /// Number of classification decisions kept for inspection
    #[serde(default = "default_debug_capacity")]
    pub debug_capacity: usize,

    /// Bound on queued commands to the tracking service
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: default_debounce_window_ms(),
            coalesce_ms: default_coalesce_ms(),
            max_conflict_retries: default_max_conflict_retries(),
            debug_capacity: default_debug_capacity(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_debounce_window_ms() -> u64 {
    1500
}

fn default_coalesce_ms() -> u64 {
    250
}

fn default_max_conflict_retries() -> u32 {
    5
}

fn default_debug_capacity() -> usize {
    200
}

fn default_channel_capacity() -> usize {
    1024
}

impl TrackingConfig {
    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.debug_capacity == 0 {
            return Err(Error::Config(
                "tracking.debug_capacity must be greater than 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(Error::Config(
                "tracking.channel_capacity must be greater than 0".to_string(),
            ));
        }
        if self.max_conflict_retries == 0 {
            return Err(Error::Config(
                "tracking.max_conflict_retries must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce_window(&self) -> Duration {
        Duration::from_millis(self.debounce_window_ms)
    }

    pub fn coalesce_delay(&self) -> Duration {
        Duration::from_millis(self.coalesce_ms)
    }
}

/// Host-scoped allow/deny rule tables
///
/// Keys are host patterns (`chatgpt.com` or `*.chatgpt.com`), values are
/// regular expressions tested against the request path and path+query.
#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    /// HTTP methods eligible for counting
    #[serde(default = "default_methods")]
    pub methods: Vec<String>,

    /// Paths that count as a user send
    #[serde(default)]
    pub allow: BTreeMap<String, Vec<String>>,

    /// Paths that never count, evaluated before `allow`
    #[serde(default)]
    pub deny: BTreeMap<String, Vec<String>>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            methods: default_methods(),
            allow: BTreeMap::new(),
            deny: BTreeMap::new(),
        }
    }
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
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
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.collector.validate()?;
        config.tracking.validate()?;

        Ok(config)
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/usagesync/config.toml` (~/.config/usagesync/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("usagesync").join("config.toml")
    }

    /// Returns the data directory path (for the state store)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("usagesync")
    }

    /// Returns the state directory path (for logs)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("usagesync")
    }

    /// Returns the key-value store file path
    ///
    /// `$XDG_DATA_HOME/usagesync/state.db` (~/.local/share/usagesync/state.db)
    pub fn store_path() -> PathBuf {
        Self::data_dir().join("state.db")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/usagesync/usagesync.log` (~/.local/state/usagesync/usagesync.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("usagesync.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
