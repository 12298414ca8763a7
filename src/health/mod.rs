//! Health Prober
//!
//! Periodically checks each started service and turns raw probe outcomes
//! into a Healthy / Unhealthy / Unknown status.
//!
//! - [`probe()`] runs one check, bounded by the probe's timeout
//! - [`HealthTracker`] applies the `retries` threshold and keeps a bounded history
//! - [`spawn_probe_loop`] drives one service on its own interval and reports
//!   results to the coordinator's control task

pub mod probe;
pub mod task;
pub mod tracker;

pub use probe::{probe, Probe, SystemProbe};
pub use task::{spawn_probe_loop, ProbeReport};
pub use tracker::{HealthResult, HealthStatus, HealthTracker, StatusTransition};
