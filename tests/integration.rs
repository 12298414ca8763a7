//! Integration tests for stackd
//!
//! These tests drive the coordinator, health prober and log sink together
//! through scripted runtimes and probes, checking the ordering and failure
//! guarantees the daemon makes about the services it manages.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stackd::config::{HealthConfig, SinkConfig};
use stackd::coordinator::{Coordinator, CoordinatorHandle, Phase, PhaseTransition, ServiceSnapshot};
use stackd::error::{LoadError, ProbeError, StackError, StartError, StopError};
use stackd::health::Probe;
use stackd::runtime::{ServiceRuntime, StartedService};
use stackd::sink::LogSink;
use stackd::topology::{self, ProbeKind, ServiceSpec, Topology};
use tokio::sync::broadcast;

// ============================================================================
// Scripted collaborators
// ============================================================================

/// Runtime that records start/stop calls in order, with optional per-service
/// stop delays.
#[derive(Default)]
struct RecordingRuntime {
    calls: Mutex<Vec<String>>,
    stop_delay: HashMap<String, Duration>,
}

impl RecordingRuntime {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ServiceRuntime for RecordingRuntime {
    async fn start(&self, spec: &ServiceSpec) -> Result<StartedService, StartError> {
        self.calls.lock().unwrap().push(format!("start {}", spec.name));
        Ok(StartedService::new(None))
    }

    async fn stop(&self, spec: &ServiceSpec, _grace: Duration) -> Result<(), StopError> {
        self.calls.lock().unwrap().push(format!("stop {}", spec.name));
        if let Some(delay) = self.stop_delay.get(&spec.name) {
            tokio::time::sleep(*delay).await;
        }
        self.calls.lock().unwrap().push(format!("stopped {}", spec.name));
        Ok(())
    }
}

/// Probe driven by a per-service script of outcomes. Once a script runs out
/// the service's `fallback` outcome repeats forever.
#[derive(Default)]
struct ScriptedProbe {
    scripts: Mutex<HashMap<String, VecDeque<bool>>>,
    fallback: HashMap<String, bool>,
    latency: HashMap<String, Duration>,
}

impl ScriptedProbe {
    fn script(self, service: &str, outcomes: &[bool]) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), outcomes.iter().copied().collect());
        self
    }

    fn fallback(mut self, service: &str, healthy: bool) -> Self {
        self.fallback.insert(service.to_string(), healthy);
        self
    }

    fn latency(mut self, service: &str, latency: Duration) -> Self {
        self.latency.insert(service.to_string(), latency);
        self
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn check(&self, spec: &ServiceSpec, _kind: &ProbeKind) -> Result<(), ProbeError> {
        if let Some(latency) = self.latency.get(&spec.name) {
            tokio::time::sleep(*latency).await;
        }
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&spec.name)
            .and_then(VecDeque::pop_front);
        let healthy = next.unwrap_or_else(|| *self.fallback.get(&spec.name).unwrap_or(&true));
        if healthy {
            Ok(())
        } else {
            Err(ProbeError::Failed(format!("{} not ready", spec.name)))
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn policy(failure_budget: u32, max_restarts: u32, startup_grace_ms: u64) -> String {
    format!(
        "coordinator: {{ failureBudget: {}, maxRestarts: {}, startupGrace: {}ms, stopGrace: 100ms }}\n",
        failure_budget, max_restarts, startup_grace_ms
    )
}

fn load(yaml: &str) -> Topology {
    topology::load(yaml).unwrap()
}

fn spawn(
    topology: Topology,
    runtime: Arc<RecordingRuntime>,
    probe: ScriptedProbe,
) -> (
    CoordinatorHandle,
    broadcast::Receiver<PhaseTransition>,
    tokio::task::JoinHandle<Vec<ServiceSnapshot>>,
) {
    let coordinator = Coordinator::new(
        topology,
        runtime,
        Arc::new(probe),
        LogSink::with_collectors(Vec::new(), &SinkConfig::default()),
        &HealthConfig::default(),
    );
    let transitions = coordinator.subscribe();
    let (handle, join) = coordinator.spawn();
    (handle, transitions, join)
}

/// Collect transitions until `done` returns true for one of them.
async fn collect_until(
    rx: &mut broadcast::Receiver<PhaseTransition>,
    seen: &mut Vec<PhaseTransition>,
    done: impl Fn(&PhaseTransition) -> bool,
) {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let t = rx.recv().await.unwrap();
            let finished = done(&t);
            seen.push(t);
            if finished {
                return;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out; transitions so far: {:?}", seen));
}

/// Manual restart, retried while a background stop is still in flight.
async fn restart_when_idle(handle: &CoordinatorHandle, service: &str) {
    for _ in 0..100 {
        match handle.restart(service).await {
            Ok(()) => return,
            Err(StackError::InvalidState(_)) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => panic!("restart of {} failed: {}", service, e),
        }
    }
    panic!("{} never became restartable", service);
}

fn phases_of(seen: &[PhaseTransition], service: &str) -> Vec<Phase> {
    seen.iter()
        .filter(|t| t.service == service)
        .map(|t| t.to)
        .collect()
}

// ============================================================================
// Topology loading
// ============================================================================

#[test]
fn test_cycle_rejected_without_partial_graph() {
    let yaml = format!(
        "{}services:\n  a: {{ start: a, dependsOn: [b] }}\n  b: {{ start: b, dependsOn: [c] }}\n  c: {{ start: c, dependsOn: [a] }}\n  d: {{ start: d }}\n",
        policy(1, 1, 1000)
    );
    match topology::load(&yaml) {
        Err(LoadError::CyclicDependency(members)) => {
            assert!(members.contains(&"a".to_string()));
            assert!(!members.contains(&"d".to_string()));
        }
        other => panic!("expected cycle, got {:?}", other),
    }
}

#[test]
fn test_topological_order_respects_every_edge() {
    let yaml = format!(
        "{}services:\n  proxy: {{ start: p, dependsOn: [api] }}\n  api: {{ start: a, dependsOn: [db, cache] }}\n  cache: {{ start: c }}\n  db: {{ start: d }}\n  worker: {{ start: w, dependsOn: [db] }}\n",
        policy(1, 1, 1000)
    );
    let topology = load(&yaml);
    let order: Vec<String> = topology
        .graph
        .topological_order()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    let position = |name: &str| order.iter().position(|n| n == name).unwrap();
    for edge in topology.graph.edges() {
        assert!(
            position(&edge.dependency) < position(&edge.dependent),
            "{} must start before {}: {:?}",
            edge.dependency,
            edge.dependent,
            order
        );
    }
}

// ============================================================================
// Startup gating
// ============================================================================

#[tokio::test]
async fn test_never_starting_before_dependencies_healthy() {
    let yaml = format!(
        r#"{}services:
  db:    {{ start: d, healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 2 }} }}
  cache: {{ start: c, healthCheck: {{ probe: check, interval: 7ms, timeout: 500ms, retries: 2 }} }}
  api:   {{ start: a, dependsOn: [db, cache], healthCheck: {{ probe: check, interval: 5ms, timeout: 500ms, retries: 2 }} }}
  proxy: {{ start: p, dependsOn: [api], healthCheck: {{ probe: check, interval: 3ms, timeout: 500ms, retries: 2 }} }}
  jobs:  {{ start: j, dependsOn: [db] }}
"#,
        policy(5, 1, 5000)
    );
    let topology = load(&yaml);
    let deps: HashMap<String, Vec<String>> = topology
        .graph
        .services()
        .iter()
        .map(|s| (s.name.clone(), s.depends_on.clone()))
        .collect();

    // Uneven latencies and a few early failures shuffle completion order.
    let probe = ScriptedProbe::default()
        .latency("db", Duration::from_millis(37))
        .latency("cache", Duration::from_millis(3))
        .latency("api", Duration::from_millis(19))
        .latency("proxy", Duration::from_millis(11))
        .script("db", &[false, true])
        .script("cache", &[false, false, true])
        .script("api", &[true]);

    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, _join) = spawn(topology, runtime, probe);
    let mut seen = Vec::new();
    let mut healthy: HashSet<String> = HashSet::new();

    tokio::time::timeout(Duration::from_secs(10), async {
        while healthy.len() < 5 {
            let t = rx.recv().await.unwrap();
            if t.to == Phase::Starting {
                for dep in &deps[&t.service] {
                    assert!(
                        healthy.contains(dep),
                        "{} started while {} was not healthy",
                        t.service,
                        dep
                    );
                }
            }
            if t.to == Phase::Healthy {
                healthy.insert(t.service.clone());
            } else {
                healthy.remove(&t.service);
            }
            seen.push(t);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("stack never became healthy: {:?}", seen));

    let status = handle.status().await.unwrap();
    assert!(status.iter().all(|s| s.phase == Phase::Healthy));
}

/// Drive `services` with seeded latencies, intervals and early-failure
/// scripts, asserting that nothing enters Starting before every dependency
/// is Healthy.
async fn assert_gated_startup(services: &[(&str, &[&str])], seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut yaml = policy(20, 1, 5000);
    yaml.push_str("services:\n");
    let mut probe = ScriptedProbe::default();
    for (name, deps) in services {
        let interval = rng.gen_range(2..12);
        yaml.push_str(&format!(
            "  {}: {{ start: {}, dependsOn: [{}], healthCheck: {{ probe: check, interval: {}ms, timeout: 500ms, retries: 2 }} }}\n",
            name,
            name,
            deps.join(", "),
            interval
        ));
        let script: Vec<bool> = (0..rng.gen_range(0..4)).map(|_| rng.gen_bool(0.5)).collect();
        probe = probe
            .latency(name, Duration::from_millis(rng.gen_range(0..25)))
            .script(name, &script);
    }
    let deps: HashMap<&str, &[&str]> = services.iter().copied().collect();

    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, join) = spawn(load(&yaml), runtime, probe);
    let mut seen = Vec::new();
    let mut healthy: HashSet<String> = HashSet::new();

    tokio::time::timeout(Duration::from_secs(10), async {
        while healthy.len() < services.len() {
            let t = rx.recv().await.unwrap();
            if t.to == Phase::Starting {
                for dep in deps[t.service.as_str()] {
                    assert!(
                        healthy.contains(*dep),
                        "seed {}: {} started while {} was not healthy",
                        seed,
                        t.service,
                        dep
                    );
                }
            }
            if t.to == Phase::Healthy {
                healthy.insert(t.service.clone());
            } else {
                healthy.remove(&t.service);
            }
            seen.push(t);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("seed {}: stack never became healthy: {:?}", seed, seen));

    handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), join)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_gating_holds_under_seeded_latencies() {
    let reference: &[(&str, &[&str])] = &[
        ("db", &[]),
        ("cache", &[]),
        ("api", &["db", "cache"]),
        ("proxy", &["api"]),
        ("jobs", &["db"]),
    ];
    let diamond: &[(&str, &[&str])] = &[
        ("base", &[]),
        ("left", &["base"]),
        ("right", &["base"]),
        ("top", &["left", "right"]),
        ("edge", &["top", "base"]),
    ];
    let chain: &[(&str, &[&str])] = &[
        ("s1", &[]),
        ("s2", &["s1"]),
        ("s3", &["s2"]),
        ("s4", &["s3"]),
        ("s5", &["s4"]),
        ("s6", &["s5"]),
    ];
    for seed in 0..8 {
        for services in [reference, diamond, chain] {
            assert_gated_startup(services, seed).await;
        }
    }
}

// ============================================================================
// Health transitions
// ============================================================================

#[tokio::test]
async fn test_unhealthy_after_retries_and_single_success_recovers() {
    let yaml = format!(
        "{}services:\n  db: {{ start: d, healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 3 }} }}\n",
        policy(10, 1, 5000)
    );
    // healthy, then two failures (not enough), success, three failures, success
    let probe = ScriptedProbe::default().script(
        "db",
        &[true, false, false, true, false, false, false, true],
    );
    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, _join) = spawn(load(&yaml), runtime, probe);

    let mut seen = Vec::new();
    let mut healthy_seen = 0;
    tokio::time::timeout(Duration::from_secs(10), async {
        while healthy_seen < 2 {
            let t = rx.recv().await.unwrap();
            if t.to == Phase::Healthy {
                healthy_seen += 1;
            }
            seen.push(t);
        }
    })
    .await
    .unwrap_or_else(|_| panic!("db never recovered: {:?}", seen));

    assert_eq!(
        phases_of(&seen, "db"),
        vec![Phase::Starting, Phase::Healthy, Phase::Unhealthy, Phase::Healthy]
    );

    let detail = handle.service("db").await.unwrap();
    let flips: Vec<String> = detail
        .health_transitions
        .iter()
        .map(|t| format!("{}->{}", t.from, t.to))
        .collect();
    assert_eq!(
        flips,
        vec!["unknown->healthy", "healthy->unhealthy", "unhealthy->healthy"]
    );
    assert!(detail.history.len() >= 8);
    assert_eq!(detail.snapshot.restarts, 0);
}

// ============================================================================
// Restart budget and the Failed freeze
// ============================================================================

#[tokio::test]
async fn test_restart_then_fail_when_budget_exhausted() {
    let yaml = format!(
        r#"{}services:
  db:  {{ start: d, healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 1 }} }}
  api: {{ start: a, dependsOn: [db], healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 1 }} }}
"#,
        policy(1, 1, 300)
    );
    // db goes healthy once, then keeps failing: first through the failure
    // budget (restart), then through the startup grace of the restart.
    let probe = ScriptedProbe::default()
        .script("db", &[true])
        .fallback("db", false)
        .fallback("api", false);
    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, _join) = spawn(load(&yaml), runtime.clone(), probe);

    let mut seen = Vec::new();
    collect_until(&mut rx, &mut seen, |t| t.service == "db" && t.to == Phase::Failed).await;

    assert_eq!(
        phases_of(&seen, "db"),
        vec![
            Phase::Starting,
            Phase::Healthy,
            Phase::Unhealthy,
            Phase::Stopping,
            Phase::Pending,
            Phase::Starting,
            Phase::Failed,
        ]
    );

    let db = handle.service("db").await.unwrap().snapshot;
    assert_eq!(db.restarts, 1);
    assert!(db.last_error.unwrap().contains("restart budget exhausted"));

    let calls = runtime.calls();
    assert_eq!(calls.iter().filter(|c| *c == "start db").count(), 2);
}

#[tokio::test]
async fn test_failed_service_freezes_transitive_dependents() {
    let yaml = format!(
        r#"{}services:
  db:    {{ start: d, healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 1 }} }}
  api:   {{ start: a, dependsOn: [db] }}
  proxy: {{ start: p, dependsOn: [api] }}
  side:  {{ start: s }}
"#,
        policy(1, 3, 150)
    );
    let probe = ScriptedProbe::default().fallback("db", false);
    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, join) = spawn(load(&yaml), runtime.clone(), probe);

    let mut seen = Vec::new();
    collect_until(&mut rx, &mut seen, |t| t.service == "db" && t.to == Phase::Failed).await;

    // Keep running well past the grace period; nothing may start.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while let Ok(t) = rx.try_recv() {
        seen.push(t);
    }
    assert!(phases_of(&seen, "api").is_empty());
    assert!(phases_of(&seen, "proxy").is_empty());
    assert_eq!(phases_of(&seen, "side"), vec![Phase::Starting, Phase::Healthy]);

    let status = handle.status().await.unwrap();
    let by_name: HashMap<&str, _> = status.iter().map(|s| (s.name.as_str(), s)).collect();
    assert_eq!(by_name["db"].phase, Phase::Failed);
    assert_eq!(by_name["api"].phase, Phase::Pending);
    assert_eq!(by_name["api"].blocked_by.as_deref(), Some("db"));
    assert_eq!(by_name["proxy"].blocked_by.as_deref(), Some("db"));
    assert!(by_name["side"].blocked_by.is_none());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
    let calls = runtime.calls();
    assert!(!calls.iter().any(|c| c.ends_with(" api") || c.ends_with(" proxy")));
}

#[tokio::test]
async fn test_manual_restart_revives_failed_service() {
    let yaml = format!(
        r#"{}services:
  db:  {{ start: d, healthCheck: {{ probe: check, interval: 10ms, timeout: 500ms, retries: 1 }} }}
  api: {{ start: a, dependsOn: [db] }}
"#,
        policy(1, 0, 150)
    );
    // Enough failures to outlast the first grace period, then healthy.
    let probe = ScriptedProbe::default().script("db", &[false; 40]);
    let runtime = Arc::new(RecordingRuntime::default());
    let (handle, mut rx, _join) = spawn(load(&yaml), runtime, probe);

    let mut seen = Vec::new();
    collect_until(&mut rx, &mut seen, |t| t.service == "db" && t.to == Phase::Failed).await;
    assert!(matches!(
        handle.restart("nope").await,
        Err(StackError::NotFound(_))
    ));

    // Each revived start burns part of the scripted failures until one succeeds.
    for _ in 0..10 {
        restart_when_idle(&handle, "db").await;
        collect_until(&mut rx, &mut seen, |t| {
            t.service == "db" && matches!(t.to, Phase::Failed | Phase::Healthy)
        })
        .await;
        if handle.service("db").await.unwrap().snapshot.phase == Phase::Healthy {
            break;
        }
    }
    collect_until(&mut rx, &mut seen, |t| t.service == "api" && t.to == Phase::Healthy).await;
    assert_eq!(
        handle.service("db").await.unwrap().snapshot.phase,
        Phase::Healthy
    );
}

// ============================================================================
// Shutdown ordering
// ============================================================================

#[tokio::test]
async fn test_shutdown_waits_for_dependents() {
    let yaml = format!(
        r#"{}services:
  b: {{ start: b }}
  a: {{ start: a, dependsOn: [b] }}
  other: {{ start: o }}
"#,
        policy(1, 1, 1000)
    );
    let runtime = Arc::new(RecordingRuntime {
        stop_delay: [("a".to_string(), Duration::from_millis(150))]
            .into_iter()
            .collect(),
        ..Default::default()
    });
    let (handle, mut rx, join) = spawn(load(&yaml), runtime.clone(), ScriptedProbe::default());

    let mut seen = Vec::new();
    let mut healthy = 0;
    tokio::time::timeout(Duration::from_secs(5), async {
        while healthy < 3 {
            let t = rx.recv().await.unwrap();
            if t.to == Phase::Healthy {
                healthy += 1;
            }
            seen.push(t);
        }
    })
    .await
    .unwrap();

    handle.shutdown().await.unwrap();
    join.await.unwrap();

    let calls = runtime.calls();
    let position = |c: &str| calls.iter().position(|x| x == c).unwrap();
    assert!(position("stopped a") < position("stop b"));
    // The unrelated branch does not wait for a's slow stop.
    assert!(position("stop other") < position("stopped a"));

    let status = handle.status().await;
    assert!(matches!(status, Err(StackError::ControlClosed)));
}
