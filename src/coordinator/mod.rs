//! Lifecycle Coordinator
//!
//! Owns every [`ServiceState`] inside a single control task. Start/stop
//! actions, probe loops and grace timers run as separate tasks and report
//! back over channels; only the control task changes phases.
//!
//! ```text
//! Pending ─▶ Starting ─▶ Healthy ⇄ Unhealthy ─▶ Stopping ─▶ Stopped
//!               │                     │            │
//!               └──────▶ Failed ◀─────┘            └─▶ Pending (restart)
//! ```
//!
//! A Failed service's dependents stay Pending for the rest of the run unless
//! the Failed service is restarted by hand.

pub mod handle;
pub mod state;

pub use handle::CoordinatorHandle;
pub use state::{Phase, PhaseTransition, ServiceDetail, ServiceSnapshot, ServiceState};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::HealthConfig;
use crate::error::{StackError, StartError, StopError};
use crate::graph::DependencyGraph;
use crate::health::{spawn_probe_loop, HealthStatus, Probe, ProbeReport};
use crate::runtime::{ServiceRuntime, StartedService};
use crate::sink::LogSink;
use crate::topology::{CoordinatorPolicy, ServiceSpec, Topology};

use handle::Command;

/// Extra time a stop action gets beyond `stop_grace` for the forced kill.
const STOP_SLACK: Duration = Duration::from_secs(5);
const TRANSITION_BUFFER: usize = 256;
const PROBE_BUFFER: usize = 256;

/// Results of background actions, delivered to the control task.
enum Event {
    Started {
        service: usize,
        generation: u64,
        result: Result<StartedService, StartError>,
    },
    Stopped {
        service: usize,
        result: Result<(), StopError>,
    },
    GraceExpired {
        service: usize,
        generation: u64,
    },
}

/// A configured, not yet running coordinator.
pub struct Coordinator {
    graph: DependencyGraph,
    policy: CoordinatorPolicy,
    runtime: Arc<dyn ServiceRuntime>,
    prober: Arc<dyn Probe>,
    sink: LogSink,
    history_capacity: usize,
    transitions: broadcast::Sender<PhaseTransition>,
}

impl Coordinator {
    pub fn new(
        topology: Topology,
        runtime: Arc<dyn ServiceRuntime>,
        prober: Arc<dyn Probe>,
        sink: LogSink,
        health: &HealthConfig,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_BUFFER);
        Self {
            graph: topology.graph,
            policy: topology.policy,
            runtime,
            prober,
            sink,
            history_capacity: health.history_capacity,
            transitions,
        }
    }

    /// Subscribe before [`spawn`](Self::spawn) to observe the very first transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseTransition> {
        self.transitions.subscribe()
    }

    /// Start the control task. Services begin starting immediately.
    ///
    /// The join handle resolves to the final state of every service, in
    /// start order, once shutdown has settled.
    pub fn spawn(self) -> (CoordinatorHandle, JoinHandle<Vec<ServiceSnapshot>>) {
        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (done_tx, done_rx) = watch::channel(false);
        let handle = CoordinatorHandle {
            commands: commands_tx,
            transitions: self.transitions.clone(),
            sink: self.sink.clone(),
            done: done_rx,
        };
        let control = ControlLoop::new(self, commands_rx);
        let join = tokio::spawn(async move {
            let final_state = control.run().await;
            let _ = done_tx.send(true);
            final_state
        });
        (handle, join)
    }
}

struct ControlLoop {
    graph: DependencyGraph,
    specs: Vec<Arc<ServiceSpec>>,
    index: HashMap<String, usize>,
    /// Topological order as indices into `specs`.
    order: Vec<usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    states: Vec<ServiceState>,

    policy: CoordinatorPolicy,
    runtime: Arc<dyn ServiceRuntime>,
    prober: Arc<dyn Probe>,
    sink: LogSink,
    transitions: broadcast::Sender<PhaseTransition>,

    commands: mpsc::Receiver<Command>,
    commands_open: bool,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
    probes_tx: mpsc::Sender<ProbeReport>,
    probes_rx: mpsc::Receiver<ProbeReport>,

    shutting_down: bool,
}

impl ControlLoop {
    fn new(coordinator: Coordinator, commands: mpsc::Receiver<Command>) -> Self {
        let Coordinator {
            graph,
            policy,
            runtime,
            prober,
            sink,
            history_capacity,
            transitions,
        } = coordinator;

        let specs: Vec<Arc<ServiceSpec>> = graph.services().to_vec();
        let index: HashMap<String, usize> = specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        let lookup = |names: Vec<&str>| -> Vec<usize> {
            names.into_iter().filter_map(|n| index.get(n).copied()).collect()
        };
        let order = lookup(
            graph
                .topological_order()
                .iter()
                .map(|s| s.name.as_str())
                .collect(),
        );
        let dependencies = specs.iter().map(|s| lookup(graph.dependencies(&s.name))).collect();
        let dependents = specs.iter().map(|s| lookup(graph.dependents(&s.name))).collect();
        let states = specs
            .iter()
            .map(|s| ServiceState::new(s, history_capacity))
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (probes_tx, probes_rx) = mpsc::channel(PROBE_BUFFER);

        Self {
            graph,
            specs,
            index,
            order,
            dependencies,
            dependents,
            states,
            policy,
            runtime,
            prober,
            sink,
            transitions,
            commands,
            commands_open: true,
            events_tx,
            events_rx,
            probes_tx,
            probes_rx,
            shutting_down: false,
        }
    }

    async fn run(mut self) -> Vec<ServiceSnapshot> {
        crate::log_component!(info, "coordinator", "Coordinator started", services = self.specs.len());
        self.schedule();

        loop {
            if self.shutting_down && self.states.iter().all(ServiceState::is_settled) {
                break;
            }
            tokio::select! {
                cmd = self.commands.recv(), if self.commands_open => match cmd {
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        debug!("All coordinator handles dropped");
                        self.commands_open = false;
                        self.begin_shutdown();
                    }
                },
                Some(report) = self.probes_rx.recv() => self.on_probe(report),
                Some(event) = self.events_rx.recv() => self.on_event(event),
            }
            if self.shutting_down {
                self.advance_shutdown();
            } else {
                self.schedule();
            }
        }

        self.sink.shutdown().await;
        crate::log_component!(info, "coordinator", "Coordinator stopped");
        self.order.iter().map(|&i| self.snapshot(i)).collect()
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Status(reply) => {
                let snapshots = self.order.iter().map(|&i| self.snapshot(i)).collect();
                let _ = reply.send(snapshots);
            }
            Command::Service(name, reply) => {
                let detail = self.index.get(&name).map(|&i| self.detail(i));
                let _ = reply.send(detail);
            }
            Command::Restart(name, reply) => {
                let _ = reply.send(self.manual_restart(&name));
            }
            Command::Shutdown(reply) => {
                self.begin_shutdown();
                let _ = reply.send(());
            }
        }
    }

    fn manual_restart(&mut self, name: &str) -> crate::error::Result<()> {
        let Some(&idx) = self.index.get(name) else {
            return Err(StackError::NotFound(format!("service '{}'", name)));
        };
        if self.shutting_down {
            return Err(StackError::InvalidState(
                "coordinator is shutting down".to_string(),
            ));
        }
        let state = &mut self.states[idx];
        match state.phase {
            Phase::Healthy | Phase::Unhealthy | Phase::Starting if !state.is_busy() => {
                state.restart_attempts = 0;
                state.restarts += 1;
                self.begin_restart(idx, "manual restart".to_string());
                Ok(())
            }
            Phase::Failed if !state.is_busy() => {
                state.restart_attempts = 0;
                state.last_error = None;
                self.set_phase(idx, Phase::Pending, Some("manual restart".to_string()));
                Ok(())
            }
            phase => Err(StackError::InvalidState(format!(
                "'{}' is {}{} and cannot be restarted now",
                name,
                phase,
                if state.is_busy() { " (action in progress)" } else { "" }
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Startup
    // ------------------------------------------------------------------

    /// Start every Pending service whose dependencies are all Healthy.
    fn schedule(&mut self) {
        for pos in 0..self.order.len() {
            let idx = self.order[pos];
            let state = &self.states[idx];
            if state.phase != Phase::Pending || state.is_busy() {
                continue;
            }
            let ready = self.dependencies[idx]
                .iter()
                .all(|&d| self.states[d].phase == Phase::Healthy);
            if ready {
                self.begin_start(idx);
            }
        }
    }

    fn begin_start(&mut self, idx: usize) {
        let spec = Arc::clone(&self.specs[idx]);
        let state = &mut self.states[idx];
        state.generation += 1;
        state.start_in_flight = true;
        if let Some(tracker) = state.health.as_mut() {
            tracker.reset();
        }
        let generation = state.generation;
        self.set_phase(idx, Phase::Starting, None);

        let runtime = Arc::clone(&self.runtime);
        let events = self.events_tx.clone();
        let grace = self.policy.startup_grace;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(grace, runtime.start(&spec)).await {
                Ok(result) => result,
                Err(_) => Err(StartError::Timeout(spec.name.clone())),
            };
            let _ = events.send(Event::Started {
                service: idx,
                generation,
                result,
            });
        });
    }

    fn on_started(&mut self, idx: usize, generation: u64, result: Result<StartedService, StartError>) {
        let spec = Arc::clone(&self.specs[idx]);
        let state = &mut self.states[idx];
        if generation != state.generation {
            debug!(service = %spec.name, generation, "Ignoring stale start result");
            return;
        }
        state.start_in_flight = false;

        let started = match result {
            Ok(started) => started,
            Err(e) => {
                self.fail(idx, e.to_string());
                return;
            }
        };

        state.process_live = true;
        state.pid = started.pid;
        state.started_at = Some(Utc::now());
        for (stream, reader) in started.outputs {
            self.sink.attach(&spec.name, &spec.log_tag, stream, reader);
        }
        if self.shutting_down {
            // advance_shutdown stops it once its dependents are settled.
            return;
        }

        let Some(check) = spec.health_check.clone() else {
            self.mark_healthy(idx, Some("started; no health check".to_string()));
            return;
        };

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.states[idx].probe_cancel = Some(cancel_tx);
        spawn_probe_loop(
            Arc::clone(&spec),
            check,
            Arc::clone(&self.prober),
            generation,
            self.probes_tx.clone(),
            cancel_rx,
        );

        let events = self.events_tx.clone();
        let grace = self.policy.startup_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let _ = events.send(Event::GraceExpired {
                service: idx,
                generation,
            });
        });
    }

    fn on_grace_expired(&mut self, idx: usize, generation: u64) {
        let state = &self.states[idx];
        if self.shutting_down
            || generation != state.generation
            || state.phase != Phase::Starting
            || state.is_busy()
        {
            return;
        }
        let reason = format!(
            "not healthy within startup grace of {}ms",
            self.policy.startup_grace.as_millis()
        );
        if state.restart_attempts > 0 {
            self.restart_or_fail(idx, reason);
        } else {
            self.fail(idx, reason);
        }
    }

    fn mark_healthy(&mut self, idx: usize, reason: Option<String>) {
        let state = &mut self.states[idx];
        state.restart_attempts = 0;
        state.last_error = None;
        self.set_phase(idx, Phase::Healthy, reason);
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    fn on_probe(&mut self, report: ProbeReport) {
        let Some(&idx) = self.index.get(&report.service) else {
            return;
        };
        let state = &mut self.states[idx];
        if report.generation != state.generation || state.probe_cancel.is_none() {
            return;
        }
        state.last_probe_at = Some(report.result.timestamp);
        let diagnostic = report.result.diagnostic.clone();
        let Some(tracker) = state.health.as_mut() else {
            return;
        };
        if let Some(t) = tracker.record(report.result) {
            debug!(service = %report.service, from = %t.from, to = %t.to, "Health status changed");
        }
        let status = tracker.status();
        let failures = tracker.consecutive_failures();

        match (state.phase, status) {
            (Phase::Starting, HealthStatus::Healthy) | (Phase::Unhealthy, HealthStatus::Healthy) => {
                self.mark_healthy(idx, None);
            }
            (Phase::Healthy, HealthStatus::Unhealthy) => {
                self.set_phase(idx, Phase::Unhealthy, diagnostic);
            }
            _ => {}
        }

        if self.states[idx].phase == Phase::Unhealthy && failures > self.policy.failure_budget {
            self.restart_or_fail(idx, format!("{} consecutive probe failures", failures));
        }
    }

    // ------------------------------------------------------------------
    // Restart and failure
    // ------------------------------------------------------------------

    fn restart_or_fail(&mut self, idx: usize, reason: String) {
        let max = self.policy.max_restarts;
        let state = &mut self.states[idx];
        if state.restart_attempts < max {
            state.restart_attempts += 1;
            state.restarts += 1;
            info!(
                service = %self.specs[idx].name,
                attempt = state.restart_attempts,
                max_restarts = max,
                reason = %reason,
                "Restarting service"
            );
            self.begin_restart(idx, reason);
        } else {
            self.fail(idx, format!("{}; restart budget exhausted", reason));
        }
    }

    /// First half of a restart: stop, then re-enter Pending.
    fn begin_restart(&mut self, idx: usize, reason: String) {
        self.states[idx].restart_requested = true;
        self.set_phase(idx, Phase::Stopping, Some(reason));
        self.spawn_stop(idx);
    }

    fn fail(&mut self, idx: usize, reason: String) {
        let state = &mut self.states[idx];
        state.cancel_probes();
        state.last_error = Some(reason.clone());
        let needs_stop = state.process_live && !state.stop_in_flight;
        self.set_phase(idx, Phase::Failed, Some(reason));

        let name = &self.specs[idx].name;
        let frozen: Vec<&str> = self
            .graph
            .transitive_dependents(name)
            .into_iter()
            .filter(|d| {
                self.index
                    .get(*d)
                    .is_some_and(|&i| self.states[i].phase == Phase::Pending)
            })
            .collect();
        if !frozen.is_empty() {
            warn!(service = %name, frozen = ?frozen, "Dependents held in Pending");
        }

        // Clean up whatever process is left; the phase stays Failed.
        if needs_stop {
            self.spawn_stop(idx);
        }
    }

    // ------------------------------------------------------------------
    // Stopping
    // ------------------------------------------------------------------

    fn spawn_stop(&mut self, idx: usize) {
        let spec = Arc::clone(&self.specs[idx]);
        let state = &mut self.states[idx];
        state.cancel_probes();
        state.stop_in_flight = true;

        let runtime = Arc::clone(&self.runtime);
        let events = self.events_tx.clone();
        let grace = self.policy.stop_grace;
        tokio::spawn(async move {
            let result = match tokio::time::timeout(grace + STOP_SLACK, runtime.stop(&spec, grace)).await {
                Ok(result) => result,
                Err(_) => Err(StopError::Timeout(spec.name.clone())),
            };
            let _ = events.send(Event::Stopped {
                service: idx,
                result,
            });
        });
    }

    fn on_stopped(&mut self, idx: usize, result: Result<(), StopError>) {
        let state = &mut self.states[idx];
        state.stop_in_flight = false;
        state.process_live = false;
        state.pid = None;
        if let Err(e) = result {
            warn!(service = %self.specs[idx].name, error = %e, "Stop failed; treating service as stopped");
            state.last_error = Some(e.to_string());
        }

        if state.phase != Phase::Stopping {
            // Background cleanup of a Failed service.
            return;
        }
        let restart = std::mem::take(&mut state.restart_requested);
        if restart && !self.shutting_down {
            if let Some(tracker) = state.health.as_mut() {
                tracker.reset();
            }
            self.set_phase(idx, Phase::Pending, Some("restarting".to_string()));
        } else {
            self.set_phase(idx, Phase::Stopped, None);
        }
    }

    fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("Shutdown requested");
        for state in &mut self.states {
            state.cancel_probes();
        }
        self.advance_shutdown();
    }

    /// Stop services in reverse dependency order: a service is stopped only
    /// once every dependent has settled. Unrelated branches proceed in parallel.
    fn advance_shutdown(&mut self) {
        for pos in (0..self.order.len()).rev() {
            let idx = self.order[pos];
            let state = &self.states[idx];
            if state.is_busy() {
                continue;
            }
            match state.phase {
                Phase::Pending => {
                    self.set_phase(idx, Phase::Stopped, Some("never started".to_string()));
                }
                Phase::Starting | Phase::Healthy | Phase::Unhealthy => {
                    let dependents_settled = self.dependents[idx]
                        .iter()
                        .all(|&d| self.states[d].is_settled());
                    if dependents_settled {
                        self.set_phase(idx, Phase::Stopping, Some("shutdown".to_string()));
                        self.spawn_stop(idx);
                    }
                }
                _ => {}
            }
        }
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn on_event(&mut self, event: Event) {
        match event {
            Event::Started {
                service,
                generation,
                result,
            } => self.on_started(service, generation, result),
            Event::Stopped { service, result } => self.on_stopped(service, result),
            Event::GraceExpired {
                service,
                generation,
            } => self.on_grace_expired(service, generation),
        }
    }

    fn set_phase(&mut self, idx: usize, to: Phase, reason: Option<String>) {
        let name = &self.specs[idx].name;
        let state = &mut self.states[idx];
        let from = state.phase;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(service = %name, from = %from, to = %to, "Unexpected phase transition");
        }
        state.phase = to;

        match (to, &reason) {
            (Phase::Failed, Some(r)) => error!(service = %name, phase = %to, reason = %r, "Service failed"),
            (Phase::Unhealthy, Some(r)) => warn!(service = %name, phase = %to, reason = %r, "Service unhealthy"),
            (_, Some(r)) => info!(service = %name, from = %from, phase = %to, reason = %r, "Phase changed"),
            (_, None) => info!(service = %name, from = %from, phase = %to, "Phase changed"),
        }

        let _ = self.transitions.send(PhaseTransition {
            service: name.clone(),
            from,
            to,
            at: Utc::now(),
            reason,
        });
    }

    fn snapshot(&self, idx: usize) -> ServiceSnapshot {
        let spec = &self.specs[idx];
        let state = &self.states[idx];
        let pending = state.phase == Phase::Pending;
        let never_started = pending || (state.phase == Phase::Stopped && state.started_at.is_none());
        ServiceSnapshot {
            name: spec.name.clone(),
            phase: state.phase,
            health: state.health_status(),
            consecutive_failures: state.consecutive_failures(),
            restart_attempts: state.restart_attempts,
            restarts: state.restarts,
            pid: state.pid,
            last_probe_at: state.last_probe_at,
            started_at: state.started_at,
            last_error: state.last_error.clone(),
            dependencies: self.dependencies[idx]
                .iter()
                .map(|&d| self.specs[d].name.clone())
                .collect(),
            waiting_on: if pending {
                self.dependencies[idx]
                    .iter()
                    .filter(|&&d| self.states[d].phase != Phase::Healthy)
                    .map(|&d| self.specs[d].name.clone())
                    .collect()
            } else {
                Vec::new()
            },
            blocked_by: if never_started {
                self.failed_ancestor(idx).map(|i| self.specs[i].name.clone())
            } else {
                None
            },
        }
    }

    fn detail(&self, idx: usize) -> ServiceDetail {
        let state = &self.states[idx];
        ServiceDetail {
            snapshot: self.snapshot(idx),
            history: state
                .health
                .as_ref()
                .map(|t| t.history().cloned().collect())
                .unwrap_or_default(),
            health_transitions: state
                .health
                .as_ref()
                .map(|t| t.transitions().cloned().collect())
                .unwrap_or_default(),
        }
    }

    /// Nearest Failed service among the (transitive) dependencies of `idx`.
    fn failed_ancestor(&self, idx: usize) -> Option<usize> {
        let mut seen = vec![false; self.specs.len()];
        let mut queue: VecDeque<usize> = self.dependencies[idx].iter().copied().collect();
        while let Some(i) = queue.pop_front() {
            if std::mem::replace(&mut seen[i], true) {
                continue;
            }
            if self.states[i].phase == Phase::Failed {
                return Some(i);
            }
            queue.extend(self.dependencies[i].iter().copied());
        }
        None
    }
}
