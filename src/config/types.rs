//! Configuration type definitions for stackd
//!
//! Daemon-level settings only. Everything that describes a particular stack
//! (services, collectors, restart policy) lives in the topology file.
//! All types implement serde traits for JSON serialization and have sensible defaults.

use serde::{Deserialize, Serialize};

use crate::sink::OverflowPolicy;

/// Main configuration struct for stackd
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Diagnostic logging of the coordinator itself
    pub logging: LoggingConfig,
    /// Log fan-out buffering and delivery
    pub sink: SinkConfig,
    /// Health history retention
    pub health: HealthConfig,
    /// Local control server
    pub control: ControlConfig,
}

// ============================================================================
// Logging Configuration
// ============================================================================

/// Output format of the coordinator's own diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Component,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "component" => Ok(LogFormat::Component),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
    /// Append to this file instead of stderr.
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Component,
            file: None,
        }
    }
}

// ============================================================================
// Sink Configuration
// ============================================================================

/// Log fan-out settings, applied to every collector lane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Records queued per collector before the overflow policy applies.
    pub buffer_size: usize,
    pub overflow: OverflowPolicy,
    /// Upper bound for delivering a single record.
    pub delivery_timeout_ms: u64,
    /// How long a failing collector is skipped before the next attempt.
    pub retry_backoff_ms: u64,
    pub connect_timeout_ms: u64,
    /// Longest line turned into a single record; longer output is split.
    pub max_line_bytes: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            buffer_size: 1024,
            overflow: OverflowPolicy::DropOldest,
            delivery_timeout_ms: 2_000,
            retry_backoff_ms: 5_000,
            connect_timeout_ms: 1_000,
            max_line_bytes: 64 * 1024,
        }
    }
}

// ============================================================================
// Health Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Probe results (and status transitions) kept per service.
    pub history_capacity: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            history_capacity: 32,
        }
    }
}

// ============================================================================
// Control Server Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 7077,
        }
    }
}

impl ControlConfig {
    /// `host:port` the control server binds to and clients connect to.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
