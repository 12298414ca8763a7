//! Tri-state health tracking with a bounded result history.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health as seen by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    /// No verdict yet (freshly started or restarted).
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// Outcome of a single probe invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResult {
    /// `Healthy` or `Unhealthy`; a single probe never yields `Unknown`.
    pub status: HealthStatus,
    #[serde(rename = "latency_ms", with = "millis")]
    pub latency: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl HealthResult {
    pub fn healthy(latency: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency,
            diagnostic: None,
            timestamp: Utc::now(),
        }
    }

    pub fn unhealthy(latency: Duration, diagnostic: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency,
            diagnostic: Some(diagnostic.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// A change of tracked status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusTransition {
    pub from: HealthStatus,
    pub to: HealthStatus,
    pub at: DateTime<Utc>,
}

/// Folds probe results into a status.
///
/// `retries` consecutive failures flip Healthy/Unknown to Unhealthy; one
/// success flips Unhealthy/Unknown to Healthy. History and transitions are
/// rings bounded by `capacity`.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    retries: u32,
    consecutive_failures: u32,
    capacity: usize,
    history: VecDeque<HealthResult>,
    transitions: VecDeque<StatusTransition>,
}

impl HealthTracker {
    pub fn new(retries: u32, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            status: HealthStatus::Unknown,
            retries: retries.max(1),
            consecutive_failures: 0,
            capacity,
            history: VecDeque::with_capacity(capacity),
            transitions: VecDeque::new(),
        }
    }

    /// Record a probe result. Returns the transition it caused, if any.
    pub fn record(&mut self, result: HealthResult) -> Option<StatusTransition> {
        let at = result.timestamp;
        let next = if result.is_healthy() {
            self.consecutive_failures = 0;
            HealthStatus::Healthy
        } else {
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            if self.consecutive_failures >= self.retries {
                HealthStatus::Unhealthy
            } else {
                self.status
            }
        };

        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(result);

        if next == self.status {
            return None;
        }
        let transition = StatusTransition {
            from: self.status,
            to: next,
            at,
        };
        self.status = next;
        if self.transitions.len() == self.capacity {
            self.transitions.pop_front();
        }
        self.transitions.push_back(transition.clone());
        Some(transition)
    }

    /// Forget the current verdict (used when the service is restarted).
    /// History is kept.
    pub fn reset(&mut self) {
        self.status = HealthStatus::Unknown;
        self.consecutive_failures = 0;
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HealthResult> {
        self.history.iter()
    }

    pub fn last(&self) -> Option<&HealthResult> {
        self.history.back()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &StatusTransition> {
        self.transitions.iter()
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
