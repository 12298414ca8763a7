//! Configuration management for stackd
//!
//! Daemon configuration is loaded from `~/.stackd/config.json` with
//! environment variable overrides. Topology files are handled by
//! [`crate::topology`]; [`validate`] checks their keys.

mod types;
pub mod validate;

pub use types::*;

use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};

impl Config {
    /// Returns the stackd configuration directory path (~/.stackd)
    pub fn dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".stackd")
    }

    /// Returns the path to the config file (~/.stackd/config.json)
    pub fn path() -> PathBuf {
        Self::dir().join("config.json")
    }

    /// Load configuration from the default path with environment overrides.
    ///
    /// If the config file doesn't exist, returns default configuration.
    /// Environment variables can override config values using the pattern:
    /// `STACKD_SECTION_KEY`
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::path())
    }

    /// Load configuration from a specific path with environment overrides.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            Config::default()
        };

        config.apply_env_overrides();
        config.check()?;

        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables follow the pattern: STACKD_SECTION_KEY.
    /// Values that fail to parse are ignored.
    fn apply_env_overrides(&mut self) {
        // Logging
        if let Ok(val) = std::env::var("STACKD_LOGGING_LEVEL") {
            self.logging.level = val;
        }
        if let Ok(val) = std::env::var("STACKD_LOGGING_FORMAT") {
            if let Ok(v) = val.parse() {
                self.logging.format = v;
            }
        }
        if let Ok(val) = std::env::var("STACKD_LOGGING_FILE") {
            self.logging.file = Some(val);
        }

        // Sink
        if let Ok(val) = std::env::var("STACKD_SINK_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.sink.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("STACKD_SINK_OVERFLOW") {
            match val.as_str() {
                "drop_oldest" => self.sink.overflow = crate::sink::OverflowPolicy::DropOldest,
                "drop_newest" => self.sink.overflow = crate::sink::OverflowPolicy::DropNewest,
                _ => {}
            }
        }
        if let Ok(val) = std::env::var("STACKD_SINK_MAX_LINE_BYTES") {
            if let Ok(v) = val.parse() {
                self.sink.max_line_bytes = v;
            }
        }
        if let Ok(val) = std::env::var("STACKD_SINK_RETRY_BACKOFF_MS") {
            if let Ok(v) = val.parse() {
                self.sink.retry_backoff_ms = v;
            }
        }

        // Health
        if let Ok(val) = std::env::var("STACKD_HEALTH_HISTORY_CAPACITY") {
            if let Ok(v) = val.parse() {
                self.health.history_capacity = v;
            }
        }

        // Control server
        if let Ok(val) = std::env::var("STACKD_CONTROL_ENABLED") {
            if let Ok(v) = val.parse() {
                self.control.enabled = v;
            }
        }
        if let Ok(val) = std::env::var("STACKD_CONTROL_HOST") {
            self.control.host = val;
        }
        if let Ok(val) = std::env::var("STACKD_CONTROL_PORT") {
            if let Ok(v) = val.parse() {
                self.control.port = v;
            }
        }
    }

    /// Reject values no component can work with.
    pub fn check(&self) -> Result<()> {
        if self.sink.buffer_size == 0 {
            return Err(StackError::Config("sink.buffer_size must be > 0".into()));
        }
        if self.sink.max_line_bytes == 0 {
            return Err(StackError::Config("sink.max_line_bytes must be > 0".into()));
        }
        if self.sink.delivery_timeout_ms == 0 {
            return Err(StackError::Config(
                "sink.delivery_timeout_ms must be > 0".into(),
            ));
        }
        if self.health.history_capacity == 0 {
            return Err(StackError::Config(
                "health.history_capacity must be > 0".into(),
            ));
        }
        if self.control.host.trim().is_empty() {
            return Err(StackError::Config("control.host must not be empty".into()));
        }
        Ok(())
    }

    /// Save configuration to a specific path
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
