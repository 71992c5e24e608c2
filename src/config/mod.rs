//! Configuration for telemcache
//!
//! Configuration is read from a TOML or JSON file, chosen by extension. The
//! default file lives in the platform config directory under
//! `dev.telemcache`:
//!
//! - **Linux**: `~/.config/dev.telemcache/config.toml`
//! - **macOS**: `~/Library/Application Support/dev.telemcache/config.toml`
//! - **Windows**: `%APPDATA%\dev.telemcache\config.toml`
//!
//! # Example
//!
//! ```toml
//! [cache]
//! dynamic_capacity = 4096
//! static_budget_bytes = 67108864
//!
//! [stream]
//! pump_interval_ms = 16
//!
//! [logging]
//! filter = "info,telemcache=debug"
//! ```

use crate::cache::ChannelOptions;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application identifier for config directories
pub const APP_ID: &str = "dev.telemcache";

/// Config filename
pub const CONFIG_FILE: &str = "config.toml";

/// Default samples per sealed live segment
pub const DEFAULT_DYNAMIC_CAPACITY: usize = 4096;

/// Default per-channel static cache budget (64 MiB)
pub const DEFAULT_STATIC_BUDGET_BYTES: u64 = 64 * 1024 * 1024;

/// Default log filter
pub const DEFAULT_LOG_FILTER: &str = "info,telemcache=debug";

/// Directory holding the config file
pub fn config_dir() -> Option<PathBuf> {
    dirs_next::config_dir().map(|p| p.join(APP_ID))
}

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Samples per sealed live segment
    #[serde(default = "default_dynamic_capacity")]
    pub dynamic_capacity: usize,

    /// Byte budget of each channel's static cache; `None` keeps everything
    #[serde(default = "default_static_budget")]
    pub static_budget_bytes: Option<u64>,

    /// Copy backfilled data out of shared fetch buffers before caching it
    #[serde(default = "default_true")]
    pub compact_static_writes: bool,
}

fn default_dynamic_capacity() -> usize {
    DEFAULT_DYNAMIC_CAPACITY
}

fn default_static_budget() -> Option<u64> {
    Some(DEFAULT_STATIC_BUDGET_BYTES)
}

fn default_true() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dynamic_capacity: DEFAULT_DYNAMIC_CAPACITY,
            static_budget_bytes: Some(DEFAULT_STATIC_BUDGET_BYTES),
            compact_static_writes: true,
        }
    }
}

impl CacheConfig {
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            dynamic_capacity: self.dynamic_capacity,
            static_budget_bytes: self
                .static_budget_bytes
                .map(|b| usize::try_from(b).unwrap_or(usize::MAX)),
            compact_static_writes: self.compact_static_writes,
        }
    }
}

/// Live stream settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Frames the transport may queue before the multiplexer drains them
    #[serde(default = "default_frame_buffer")]
    pub frame_buffer: usize,

    /// How often queued frames are dispatched to listeners
    #[serde(default = "default_pump_interval")]
    pub pump_interval_ms: u64,
}

fn default_frame_buffer() -> usize {
    1024
}

fn default_pump_interval() -> u64 {
    16
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            frame_buffer: default_frame_buffer(),
            pump_interval_ms: default_pump_interval(),
        }
    }
}

impl StreamConfig {
    pub fn pump_interval(&self) -> Duration {
        Duration::from_millis(self.pump_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directives, overridden by `RUST_LOG`
    #[serde(default = "default_filter")]
    pub filter: String,

    /// Directory for daily rolling log files; none logs to stderr only
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            log_dir: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub stream: StreamConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Format {
    Toml,
    Json,
}

impl Format {
    fn of(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
            _ => Format::Toml,
        }
    }
}

impl Config {
    /// Path of the default config file
    pub fn default_path() -> Option<PathBuf> {
        config_dir().map(|p| p.join(CONFIG_FILE))
    }

    /// Load and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&content, Format::of(path))
            .map_err(|e| e.with_context(path.display().to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str, format: Format) -> Result<Self> {
        match format {
            Format::Toml => toml::from_str(content)
                .map_err(|e| CacheError::Config(format!("Failed to parse TOML: {}", e))),
            Format::Json => serde_json::from_str(content)
                .map_err(|e| CacheError::Config(format!("Failed to parse JSON: {}", e))),
        }
    }

    /// Load from `path`, or the default location when `None`. Falls back to
    /// defaults on any error.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) if p.exists() => p,
                _ => return Self::default(),
            },
        };
        Self::load(&path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    /// Write the config, creating parent directories as needed
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    CacheError::Config(format!("Failed to create config directory: {}", e))
                })?;
            }
        }
        let content = match Format::of(path) {
            Format::Toml => toml::to_string_pretty(self)
                .map_err(|e| CacheError::Config(format!("Failed to serialize config: {}", e)))?,
            Format::Json => serde_json::to_string_pretty(self)
                .map_err(|e| CacheError::Config(format!("Failed to serialize config: {}", e)))?,
        };
        std::fs::write(path, content)
            .map_err(|e| CacheError::Config(format!("Failed to write config: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.dynamic_capacity == 0 {
            return Err(CacheError::Config(
                "cache.dynamic_capacity must be greater than zero".to_string(),
            ));
        }
        if self.cache.static_budget_bytes == Some(0) {
            return Err(CacheError::Config(
                "cache.static_budget_bytes must be greater than zero"
                    .to_string(),
            ));
        }
        if self.stream.frame_buffer == 0 {
            return Err(CacheError::Config(
                "stream.frame_buffer must be greater than zero".to_string(),
            ));
        }
        if self.stream.pump_interval_ms == 0 {
            return Err(CacheError::Config(
                "stream.pump_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
