//! Error types for stackd
//!
//! This module defines all error types used throughout the coordinator.
//! Uses `thiserror` for ergonomic error handling with automatic `Display` and
//! `Error` trait implementations.
//!
//! Only [`LoadError`] is fatal to the whole process. Every other error is
//! contained to the service (or collector) it came from.

use thiserror::Error;

// ============================================================================
// Topology Load Errors
// ============================================================================

/// Validation failure while loading a topology. Aborts before any service starts.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// The source is not valid YAML/JSON or does not match the expected shape.
    #[error("Malformed topology: {0}")]
    Parse(String),

    /// A `dependsOn` entry names a service that is not declared.
    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    /// Two services share the same name.
    #[error("Duplicate service name '{0}'")]
    DuplicateName(String),

    /// Two services publish the same host port.
    #[error("Host port {port} is published by both '{first}' and '{second}'")]
    DuplicatePort {
        port: u16,
        first: String,
        second: String,
    },

    /// A health check is missing required values or cannot be parsed.
    #[error("Invalid health check for '{service}': {reason}")]
    InvalidProbeSpec { service: String, reason: String },

    /// A service entry is malformed (empty start action, bad port mapping, ...).
    #[error("Invalid service '{service}': {reason}")]
    InvalidService { service: String, reason: String },

    /// The `coordinator` policy block is missing or out of range.
    #[error("Invalid coordinator policy: {0}")]
    InvalidPolicy(String),

    /// The dependency graph contains a cycle through the listed services.
    #[error("Cyclic dependency between: {}", .0.join(", "))]
    CyclicDependency(Vec<String>),
}

// ============================================================================
// Run-time Service Errors
// ============================================================================

/// A single probe invocation failed. Counted toward the failure budget, never propagated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    /// The probe did not complete within its timeout.
    #[error("probe timed out after {0}ms")]
    Timeout(u64),
    /// The probe ran and reported an unhealthy result.
    #[error("probe failed: {0}")]
    Failed(String),
    /// The probe could not be executed at all.
    #[error("probe could not run: {0}")]
    Exec(String),
}

/// Starting a service failed. Drives the service to `Failed`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    #[error("failed to spawn '{service}': {reason}")]
    Spawn { service: String, reason: String },
    #[error("'{0}' is already running")]
    AlreadyRunning(String),
    #[error("start of '{0}' timed out")]
    Timeout(String),
}

/// Stopping a service failed. Logged and ignored; shutdown continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    #[error("failed to signal '{service}': {reason}")]
    Signal { service: String, reason: String },
    #[error("failed to kill '{service}': {reason}")]
    Kill { service: String, reason: String },
    #[error("stop of '{0}' timed out")]
    Timeout(String),
}

/// A log record could not be handed to a collector. Always recovered by dropping it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("collector '{0}' unreachable: {1}")]
    Unreachable(String, String),
    #[error("collector '{0}' write failed: {1}")]
    Write(String, String),
    #[error("collector '{0}' timed out")]
    Timeout(String),
}

// ============================================================================
// Primary Error Type
// ============================================================================

/// The primary error type for stackd operations.
#[derive(Error, Debug)]
pub enum StackError {
    /// Configuration-related errors (invalid daemon config, bad overrides, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Topology could not be loaded.
    #[error("Topology error: {0}")]
    Load(#[from] LoadError),

    #[error("Start error: {0}")]
    Start(#[from] StartError),

    #[error("Stop error: {0}")]
    Stop(#[from] StopError),

    /// The requested service is not part of the topology.
    #[error("Not found: {0}")]
    NotFound(String),

    /// An operation is not allowed in the service's current phase.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The coordinator's control task has exited.
    #[error("Coordinator is not running")]
    ControlClosed,

    /// Standard I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A specialized `Result` type for stackd operations.
pub type Result<T> = std::result::Result<T, StackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StackError::Config("bad port".to_string());
        assert_eq!(err.to_string(), "Configuration error: bad port");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: StackError = io_err.into();
        assert!(matches!(err, StackError::Io(_)));
    }

    #[test]
    fn test_load_error_into_stack_error() {
        let err: StackError = LoadError::DuplicateName("db".into()).into();
        assert!(matches!(err, StackError::Load(LoadError::DuplicateName(_))));
        assert_eq!(err.to_string(), "Topology error: Duplicate service name 'db'");
    }

    #[test]
    fn test_cyclic_dependency_lists_members() {
        let err = LoadError::CyclicDependency(vec!["a".into(), "b".into()]);
        assert_eq!(err.to_string(), "Cyclic dependency between: a, b");
    }

    #[test]
    fn test_unknown_dependency_display() {
        let err = LoadError::UnknownDependency {
            service: "api".into(),
            dependency: "dbx".into(),
        };
        assert!(err.to_string().contains("'api' depends on unknown service 'dbx'"));
    }

    #[test]
    fn test_probe_error_display() {
        assert_eq!(
            ProbeError::Timeout(1500).to_string(),
            "probe timed out after 1500ms"
        );
        assert!(ProbeError::Failed("exit 1".into())
            .to_string()
            .contains("exit 1"));
    }

    #[test]
    fn test_start_error_into_stack_error() {
        let err: StackError = StartError::AlreadyRunning("db".into()).into();
        assert_eq!(err.to_string(), "Start error: 'db' is already running");
    }
}
