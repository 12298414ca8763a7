//! Per-service lifecycle state, owned by the control task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::health::{HealthResult, HealthStatus, HealthTracker, StatusTransition};
use crate::topology::ServiceSpec;

/// Lifecycle phase of a managed service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Waiting for dependencies (or for a restart to be scheduled).
    Pending,
    /// Start action issued; waiting for the first healthy probe.
    Starting,
    Healthy,
    Unhealthy,
    Stopping,
    Stopped,
    Failed,
}

impl Phase {
    /// Terminal phases for a shutdown. A Failed service may still be revived
    /// by a manual restart while the coordinator is running.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Stopped | Phase::Failed)
    }

    /// Whether `self -> next` is a legal edge of the lifecycle.
    pub fn can_transition_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Stopped)
                | (Starting, Healthy)
                | (Starting, Failed)
                | (Starting, Stopping)
                | (Healthy, Unhealthy)
                | (Healthy, Stopping)
                | (Unhealthy, Healthy)
                | (Unhealthy, Stopping)
                | (Unhealthy, Failed)
                | (Stopping, Stopped)
                | (Stopping, Pending)
                | (Failed, Pending)
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Starting => "starting",
            Phase::Healthy => "healthy",
            Phase::Unhealthy => "unhealthy",
            Phase::Stopping => "stopping",
            Phase::Stopped => "stopped",
            Phase::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// A phase change, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseTransition {
    pub service: String,
    pub from: Phase,
    pub to: Phase,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Mutable record for one service. Only the control task touches it.
#[derive(Debug)]
pub struct ServiceState {
    pub phase: Phase,
    /// `None` for services without a health check.
    pub health: Option<HealthTracker>,
    pub last_probe_at: Option<DateTime<Utc>>,
    /// Consecutive automatic restarts that have not yet reached Healthy.
    pub restart_attempts: u32,
    /// Restarts over the whole run, automatic and manual.
    pub restarts: u32,
    pub pid: Option<u32>,
    /// Bumped on every start; results from older starts are ignored.
    pub generation: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,

    pub(crate) start_in_flight: bool,
    pub(crate) stop_in_flight: bool,
    /// A started process may still exist and must be stopped.
    pub(crate) process_live: bool,
    /// The stop in flight is the first half of a restart.
    pub(crate) restart_requested: bool,
    pub(crate) probe_cancel: Option<watch::Sender<bool>>,
}

impl ServiceState {
    pub fn new(spec: &ServiceSpec, history_capacity: usize) -> Self {
        Self {
            phase: Phase::Pending,
            health: spec
                .health_check
                .as_ref()
                .map(|c| HealthTracker::new(c.retries, history_capacity)),
            last_probe_at: None,
            restart_attempts: 0,
            restarts: 0,
            pid: None,
            generation: 0,
            started_at: None,
            last_error: None,
            start_in_flight: false,
            stop_in_flight: false,
            process_live: false,
            restart_requested: false,
            probe_cancel: None,
        }
    }

    /// Tracked health; services without a check mirror their phase.
    pub fn health_status(&self) -> HealthStatus {
        match &self.health {
            Some(tracker) => tracker.status(),
            None if self.phase == Phase::Healthy => HealthStatus::Healthy,
            None => HealthStatus::Unknown,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.health
            .as_ref()
            .map(HealthTracker::consecutive_failures)
            .unwrap_or(0)
    }

    /// A start or stop action is running in the background.
    pub(crate) fn is_busy(&self) -> bool {
        self.start_in_flight || self.stop_in_flight
    }

    /// Nothing left to do for this service during shutdown.
    pub(crate) fn is_settled(&self) -> bool {
        self.phase.is_terminal() && !self.is_busy()
    }

    pub(crate) fn cancel_probes(&mut self) {
        if let Some(cancel) = self.probe_cancel.take() {
            let _ = cancel.send(true);
        }
    }
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub phase: Phase,
    pub health: HealthStatus,
    pub consecutive_failures: u32,
    pub restart_attempts: u32,
    pub restarts: u32,
    pub pid: Option<u32>,
    pub last_probe_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub dependencies: Vec<String>,
    /// For a Pending service: direct dependencies that are not Healthy yet.
    #[serde(default)]
    pub waiting_on: Vec<String>,
    /// For a service that has not started: the Failed service that holds it back.
    pub blocked_by: Option<String>,
}

impl ServiceSnapshot {
    /// Held back by a Failed dependency.
    pub fn is_frozen(&self) -> bool {
        self.blocked_by.is_some()
    }
}

/// Snapshot plus health history, for single-service queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub snapshot: ServiceSnapshot,
    pub history: Vec<HealthResult>,
    pub health_transitions: Vec<StatusTransition>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::{HealthProbeSpec, ProbeKind};
    use std::time::Duration;

    #[test]
    fn test_lifecycle_edges() {
        use Phase::*;
        assert!(Pending.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Healthy));
        assert!(Healthy.can_transition_to(Unhealthy));
        assert!(Unhealthy.can_transition_to(Healthy));
        assert!(Unhealthy.can_transition_to(Failed));
        assert!(Stopping.can_transition_to(Stopped));

        assert!(!Pending.can_transition_to(Healthy));
        assert!(!Stopped.can_transition_to(Starting));
        assert!(!Failed.can_transition_to(Starting));
        assert!(!Healthy.can_transition_to(Failed));
    }

    #[test]
    fn test_terminal_phases() {
        assert!(Phase::Stopped.is_terminal());
        assert!(Phase::Failed.is_terminal());
        assert!(!Phase::Pending.is_terminal());
        assert!(!Phase::Stopping.is_terminal());
    }

    #[test]
    fn test_health_status_without_check() {
        let spec = ServiceSpec::new("worker", "true");
        let mut state = ServiceState::new(&spec, 4);
        assert!(state.health.is_none());
        assert_eq!(state.health_status(), HealthStatus::Unknown);
        state.phase = Phase::Healthy;
        assert_eq!(state.health_status(), HealthStatus::Healthy);
    }

    #[test]
    fn test_tracker_uses_probe_retries() {
        let spec = ServiceSpec::new("db", "true").with_health_check(HealthProbeSpec {
            kind: ProbeKind::Command("true".into()),
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(1),
            retries: 2,
        });
        let mut state = ServiceState::new(&spec, 4);
        let tracker = state.health.as_mut().unwrap();
        tracker.record(HealthResult::unhealthy(Duration::ZERO, "x"));
        assert_eq!(tracker.status(), HealthStatus::Unknown);
        tracker.record(HealthResult::unhealthy(Duration::ZERO, "x"));
        assert_eq!(state.health_status(), HealthStatus::Unhealthy);
        assert_eq!(state.consecutive_failures(), 2);
    }

    #[test]
    fn test_settled() {
        let spec = ServiceSpec::new("db", "true");
        let mut state = ServiceState::new(&spec, 4);
        assert!(!state.is_settled());
        state.phase = Phase::Failed;
        assert!(state.is_settled());
        state.stop_in_flight = true;
        assert!(!state.is_settled());
    }

    #[test]
    fn test_phase_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Phase::Unhealthy).unwrap(), "\"unhealthy\"");
    }
}
