//! Logging initialization for stackd.
//!
//! Supports three formats:
//! - `pretty`: multi-line human-readable output
//! - `component`: compact `timestamp LEVEL target message fields` lines; use the
//!   [`log_component!`] macro to add a `component` field for per-subsystem filtering
//! - `json`: structured JSON lines for log aggregators

use std::sync::Arc;

use crate::config::{LogFormat, LoggingConfig};
use crate::error::{Result, StackError};

/// Initialize the global tracing subscriber from config.
///
/// Call this once at startup before any tracing events are emitted.
/// `RUST_LOG` takes precedence over `cfg.level`. Output goes to stderr so it
/// never mixes with records written by a `stdout` collector.
pub fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.level));

    let file = match &cfg.file {
        Some(path) => Some(Arc::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| StackError::Config(format!("cannot open log file {}: {}", path, e)))?,
        )),
        None => None,
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match (cfg.format, file) {
        (LogFormat::Json, Some(file)) => builder.json().with_writer(file).try_init(),
        (LogFormat::Json, None) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogFormat::Pretty, Some(file)) => builder.pretty().with_writer(file).try_init(),
        (LogFormat::Pretty, None) => builder.pretty().with_writer(std::io::stderr).try_init(),
        (LogFormat::Component, Some(file)) => builder
            .with_target(true)
            .compact()
            .with_ansi(false)
            .with_writer(file)
            .try_init(),
        (LogFormat::Component, None) => builder
            .with_target(true)
            .compact()
            .with_writer(std::io::stderr)
            .try_init(),
    };
    result.map_err(|e| StackError::Config(format!("logging already initialized: {}", e)))
}

/// Emit a component-tagged tracing event.
///
/// Works with any tracing level (`trace`, `debug`, `info`, `warn`, `error`).
/// The `component` field makes it easy to grep logs by subsystem:
///
/// ```
/// # use stackd::log_component;
/// log_component!(info, "coordinator", "startup complete");
/// log_component!(warn, "sink", "collector backlog", queued = 900u64, capacity = 1024u64);
/// ```
#[macro_export]
macro_rules! log_component {
    ($level:ident, $component:expr, $msg:expr) => {
        tracing::$level!(component = $component, $msg)
    };
    ($level:ident, $component:expr, $msg:expr, $($key:ident = $val:expr),+ $(,)?) => {
        tracing::$level!(component = $component, $($key = $val,)+ $msg)
    };
}

#[cfg(test)]
mod tests {
    use crate::config::{LogFormat, LoggingConfig};

    #[test]
    fn test_default_logging_config() {
        let cfg = LoggingConfig::default();
        assert_eq!(cfg.format, LogFormat::Component);
        assert_eq!(cfg.level, "info");
        assert!(cfg.file.is_none());
    }

    #[test]
    fn test_log_format_deserialize_json() {
        let cfg: LoggingConfig =
            serde_json::from_str(r#"{"format":"json","level":"debug"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Json);
        assert_eq!(cfg.level, "debug");
    }

    #[test]
    fn test_log_format_partial_config_uses_defaults() {
        let cfg: LoggingConfig = serde_json::from_str(r#"{"level":"trace"}"#).unwrap();
        assert_eq!(cfg.format, LogFormat::Component);
        assert!(cfg.file.is_none());
        assert_eq!(cfg.level, "trace");
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("PRETTY".parse::<LogFormat>(), Ok(LogFormat::Pretty));
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_unwritable_log_file_is_config_error() {
        let cfg = LoggingConfig {
            file: Some("/nonexistent/dir/stackd.log".to_string()),
            ..LoggingConfig::default()
        };
        let err = super::init_logging(&cfg).unwrap_err();
        assert!(err.to_string().contains("cannot open log file"));
    }
}
