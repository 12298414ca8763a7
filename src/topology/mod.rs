//! Topology loader — the only component that reads the declarative format.
//!
//! A topology file maps service names to their start action, dependencies,
//! health check, ports, environment and log tag, plus a list of collector
//! targets and the coordinator's restart/grace policy:
//!
//! ```yaml
//! coordinator:
//!   failureBudget: 3
//!   maxRestarts: 2
//!   startupGrace: 30s
//!   stopGrace: 10s
//! collectors:
//!   - { address: "127.0.0.1:5170", transport: tcp, tagPrefix: "stack." }
//! services:
//!   db:
//!     start: "postgres -D /var/lib/postgresql/data"
//!     healthCheck: { probe: "pg_isready", interval: 5s, timeout: 3s, retries: 5 }
//!   api:
//!     start: "./auth-api"
//!     dependsOn: [db]
//! ```
//!
//! Loading is all-or-nothing: any validation failure returns a [`LoadError`]
//! and no partial topology.

pub mod types;

pub use types::*;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use tracing::debug;

use crate::error::LoadError;
use crate::graph::DependencyGraph;

/// A fully validated topology.
#[derive(Debug, Clone)]
pub struct Topology {
    pub graph: DependencyGraph,
    pub collectors: Vec<CollectorTarget>,
    pub policy: CoordinatorPolicy,
}

/// Parse and validate a topology document (YAML, or JSON as a YAML subset).
pub fn load(source: &str) -> Result<Topology, LoadError> {
    let raw: RawTopology =
        serde_yaml::from_str(source).map_err(|e| LoadError::Parse(e.to_string()))?;

    let policy = raw
        .coordinator
        .ok_or_else(|| LoadError::InvalidPolicy("missing 'coordinator' block".into()))?
        .validate()?;

    let collectors = raw
        .collectors
        .into_iter()
        .map(RawCollector::validate)
        .collect::<Result<Vec<_>, _>>()?;

    let mut specs = Vec::with_capacity(raw.services.0.len());
    for (name, entry) in raw.services.0 {
        specs.push(entry.into_spec(name)?);
    }
    check_port_conflicts(&specs)?;

    let graph = DependencyGraph::build(specs)?;
    debug!(
        services = graph.len(),
        collectors = collectors.len(),
        "Topology loaded"
    );
    Ok(Topology {
        graph,
        collectors,
        policy,
    })
}

/// Read a topology file and [`load`] it.
pub fn load_file(path: &Path) -> Result<Topology, LoadError> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| LoadError::Parse(format!("cannot read {}: {}", path.display(), e)))?;
    load(&source)
}

fn check_port_conflicts(specs: &[ServiceSpec]) -> Result<(), LoadError> {
    let mut owners: HashMap<(u16, PortProtocol), &str> = HashMap::new();
    for spec in specs {
        for port in &spec.ports {
            if let Some(first) = owners.insert((port.host, port.protocol), &spec.name) {
                return Err(LoadError::DuplicatePort {
                    port: port.host,
                    first: first.to_string(),
                    second: spec.name.clone(),
                });
            }
        }
    }
    Ok(())
}

// ============================================================================
// Raw (declarative) shapes
// ============================================================================

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTopology {
    coordinator: Option<RawPolicy>,
    #[serde(default)]
    collectors: Vec<RawCollector>,
    services: ServiceEntries,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawPolicy {
    failure_budget: Option<u32>,
    max_restarts: Option<u32>,
    startup_grace: Option<RawDuration>,
    stop_grace: Option<RawDuration>,
}

impl RawPolicy {
    fn validate(self) -> Result<CoordinatorPolicy, LoadError> {
        let missing = |field: &str| LoadError::InvalidPolicy(format!("'{}' is required", field));
        let failure_budget = self.failure_budget.ok_or_else(|| missing("failureBudget"))?;
        let max_restarts = self.max_restarts.ok_or_else(|| missing("maxRestarts"))?;
        let startup_grace = self
            .startup_grace
            .ok_or_else(|| missing("startupGrace"))?
            .resolve()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| LoadError::InvalidPolicy("'startupGrace' must be > 0".into()))?;
        let stop_grace = self
            .stop_grace
            .ok_or_else(|| missing("stopGrace"))?
            .resolve()
            .filter(|d| !d.is_zero())
            .ok_or_else(|| LoadError::InvalidPolicy("'stopGrace' must be > 0".into()))?;
        Ok(CoordinatorPolicy {
            failure_budget,
            max_restarts,
            startup_grace,
            stop_grace,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawCollector {
    #[serde(default)]
    address: String,
    transport: Transport,
    #[serde(default)]
    tag_prefix: String,
}

impl RawCollector {
    fn validate(self) -> Result<CollectorTarget, LoadError> {
        if self.transport != Transport::Stdout && self.address.rsplit_once(':').is_none() {
            return Err(LoadError::Parse(format!(
                "collector address '{}' must be host:port",
                self.address
            )));
        }
        Ok(CollectorTarget {
            address: self.address,
            transport: self.transport,
            tag_prefix: self.tag_prefix,
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawService {
    /// Only used by the list form of `services`.
    name: Option<String>,
    start: RawStart,
    #[serde(default)]
    depends_on: Vec<String>,
    health_check: Option<RawHealthCheck>,
    #[serde(default)]
    ports: Vec<RawPort>,
    #[serde(default)]
    env: BTreeMap<String, RawScalar>,
    log_tag: Option<String>,
}

impl RawService {
    fn into_spec(self, name: String) -> Result<ServiceSpec, LoadError> {
        let invalid = |reason: String| LoadError::InvalidService {
            service: name.clone(),
            reason,
        };
        if name.trim().is_empty() {
            return Err(invalid("service name must not be empty".into()));
        }

        let start = match self.start {
            RawStart::Command(cmd) if !cmd.trim().is_empty() => StartAction::Command(cmd),
            RawStart::Image { image } if !image.trim().is_empty() => StartAction::Image(image),
            _ => return Err(invalid("start action must not be empty".into())),
        };

        let ports = self
            .ports
            .iter()
            .map(|p| {
                let text = p.to_string();
                PortMapping::parse(&text).ok_or_else(|| invalid(format!("bad port '{}'", text)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let health_check = self
            .health_check
            .map(|hc| hc.validate(&name))
            .transpose()?;

        let env = self
            .env
            .into_iter()
            .map(|(k, v)| (k, v.to_string()))
            .collect();

        Ok(ServiceSpec {
            log_tag: self.log_tag.unwrap_or_else(|| name.clone()),
            name,
            start,
            ports,
            env,
            health_check,
            depends_on: self.depends_on,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStart {
    Command(String),
    Image { image: String },
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawHealthCheck {
    probe: String,
    interval: Option<RawDuration>,
    timeout: Option<RawDuration>,
    retries: Option<u32>,
}

/// Defaults mirror the common compose healthcheck defaults.
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_PROBE_RETRIES: u32 = 3;

impl RawHealthCheck {
    fn validate(self, service: &str) -> Result<HealthProbeSpec, LoadError> {
        let invalid = |reason: &str| LoadError::InvalidProbeSpec {
            service: service.to_string(),
            reason: reason.to_string(),
        };
        let kind = ProbeKind::parse(&self.probe).ok_or_else(|| invalid("unusable probe target"))?;
        let interval = match self.interval {
            Some(raw) => raw.resolve().ok_or_else(|| invalid("bad interval"))?,
            None => DEFAULT_PROBE_INTERVAL,
        };
        let timeout = match self.timeout {
            Some(raw) => raw.resolve().ok_or_else(|| invalid("bad timeout"))?,
            None => DEFAULT_PROBE_TIMEOUT,
        };
        let retries = self.retries.unwrap_or(DEFAULT_PROBE_RETRIES);
        if interval.is_zero() {
            return Err(invalid("interval must be > 0"));
        }
        if timeout.is_zero() {
            return Err(invalid("timeout must be > 0"));
        }
        if retries == 0 {
            return Err(invalid("retries must be >= 1"));
        }
        Ok(HealthProbeSpec {
            kind,
            interval,
            timeout,
            retries,
        })
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Secs(u64),
    Text(String),
}

impl RawDuration {
    fn resolve(&self) -> Option<Duration> {
        match self {
            RawDuration::Secs(s) => Some(Duration::from_secs(*s)),
            RawDuration::Text(t) => parse_duration(t),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(u16),
    Text(String),
}

impl fmt::Display for RawPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawPort::Number(n) => write!(f, "{}", n),
            RawPort::Text(t) => write!(f, "{}", t),
        }
    }
}

/// Environment values may be written as bare YAML scalars (`PORT: 5432`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawScalar {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for RawScalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawScalar::Bool(b) => write!(f, "{}", b),
            RawScalar::Int(i) => write!(f, "{}", i),
            RawScalar::Float(x) => write!(f, "{}", x),
            RawScalar::Text(t) => write!(f, "{}", t),
        }
    }
}

/// `services` in declaration order, accepting either a mapping keyed by name
/// or a list of entries with a `name` field. Duplicate keys are kept so the
/// graph can report them as [`LoadError::DuplicateName`].
struct ServiceEntries(Vec<(String, RawService)>);

impl<'de> Deserialize<'de> for ServiceEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServiceEntries;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a mapping of service name to service, or a list of services")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some((name, service)) = map.next_entry::<String, RawService>()? {
                    if let Some(inner) = &service.name {
                        if inner != &name {
                            return Err(de::Error::custom(format!(
                                "service '{}' declares a different name '{}'",
                                name, inner
                            )));
                        }
                    }
                    entries.push((name, service));
                }
                Ok(ServiceEntries(entries))
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(service) = seq.next_element::<RawService>()? {
                    let name = service
                        .name
                        .clone()
                        .ok_or_else(|| de::Error::missing_field("name"))?;
                    entries.push((name, service));
                }
                Ok(ServiceEntries(entries))
            }
        }

        deserializer.deserialize_any(EntriesVisitor)
    }
}
