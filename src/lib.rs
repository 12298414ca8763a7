//! stackd - Local service-lifecycle coordinator
//!
//! Reads a declarative topology of services, starts them in dependency order
//! once their dependencies report healthy, keeps probing them, restarts
//! failing ones within a budget and fans their output out to log collectors.

pub mod config;
pub mod control;
pub mod coordinator;
pub mod error;
pub mod graph;
pub mod health;
pub mod runtime;
pub mod sink;
pub mod topology;
pub mod utils;

pub use config::Config;
pub use coordinator::{
    Coordinator, CoordinatorHandle, Phase, PhaseTransition, ServiceDetail, ServiceSnapshot,
};
pub use error::{LoadError, Result, StackError};
pub use graph::DependencyGraph;
pub use health::{HealthResult, HealthStatus, Probe, SystemProbe};
pub use runtime::{ProcessRuntime, ServiceRuntime, StartedService};
pub use sink::{LogRecord, LogSink, LogStream};
pub use topology::{CoordinatorPolicy, ServiceSpec, Topology};
