//! Topology core types.
//!
//! Everything here is immutable once the loader has produced it. Specs are
//! shared between the coordinator, probe tasks and log drains as
//! `Arc<ServiceSpec>`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// How a service is launched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StartAction {
    /// A shell command run through `sh -c`.
    Command(String),
    /// A container image run through `docker run`.
    Image(String),
}

impl fmt::Display for StartAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartAction::Command(cmd) => write!(f, "{}", cmd),
            StartAction::Image(image) => write!(f, "image {}", image),
        }
    }
}

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortProtocol {
    Tcp,
    Udp,
}

/// A published port, `host:container[/proto]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Optional bind address (`127.0.0.1:8080:80`).
    pub bind: Option<String>,
    pub host: u16,
    pub container: u16,
    pub protocol: PortProtocol,
}

impl PortMapping {
    /// Parse compose-style port strings: `8080`, `8080:80`, `127.0.0.1:8080:80`, `53:53/udp`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        let (ports, protocol) = match raw.rsplit_once('/') {
            Some((p, "tcp")) => (p, PortProtocol::Tcp),
            Some((p, "udp")) => (p, PortProtocol::Udp),
            Some(_) => return None,
            None => (raw, PortProtocol::Tcp),
        };
        let parts: Vec<&str> = ports.split(':').collect();
        let (bind, host, container) = match parts.as_slice() {
            [single] => (None, *single, *single),
            [host, container] => (None, *host, *container),
            [bind, host, container] => (Some(bind.to_string()), *host, *container),
            _ => return None,
        };
        Some(Self {
            bind,
            host: host.parse().ok().filter(|p| *p != 0)?,
            container: container.parse().ok().filter(|p| *p != 0)?,
            protocol,
        })
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(bind) = &self.bind {
            write!(f, "{}:", bind)?;
        }
        write!(f, "{}:{}", self.host, self.container)?;
        if self.protocol == PortProtocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

/// What a health probe does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum ProbeKind {
    /// Run a command and check exit code 0.
    Command(String),
    /// Check that `host:port` accepts TCP connections.
    Tcp(String),
    /// HTTP GET, expect 2xx.
    Http(String),
}

impl ProbeKind {
    /// Classify a declared probe string.
    ///
    /// `tcp://host:port` and `http(s)://...` select network probes; anything
    /// else is a command.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(addr) = raw.strip_prefix("tcp://") {
            let (host, port) = addr.rsplit_once(':')?;
            if host.is_empty() || port.parse::<u16>().ok().filter(|p| *p != 0).is_none() {
                return None;
            }
            return Some(ProbeKind::Tcp(addr.to_string()));
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Some(ProbeKind::Http(raw.to_string()));
        }
        Some(ProbeKind::Command(raw.to_string()))
    }
}

/// A service's health-check declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthProbeSpec {
    pub kind: ProbeKind,
    /// Time between the end of one probe and the start of the next.
    pub interval: Duration,
    /// A probe running longer than this counts as a failure.
    pub timeout: Duration,
    /// Consecutive failures before the service is reported Unhealthy.
    pub retries: u32,
}

/// Immutable descriptor of one managed service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Unique key within the topology.
    pub name: String,
    pub start: StartAction,
    pub ports: Vec<PortMapping>,
    pub env: BTreeMap<String, String>,
    pub health_check: Option<HealthProbeSpec>,
    /// Services that must be Healthy before this one starts, in declaration order.
    pub depends_on: Vec<String>,
    /// Tag attached to every log record; defaults to the service name.
    pub log_tag: String,
}

impl ServiceSpec {
    /// Minimal spec with a shell command and no health check.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            log_tag: name.clone(),
            name,
            start: StartAction::Command(command.into()),
            ports: Vec::new(),
            env: BTreeMap::new(),
            health_check: None,
            depends_on: Vec::new(),
        }
    }

    /// Builder-style dependency list.
    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    /// Builder-style health check.
    pub fn with_health_check(mut self, check: HealthProbeSpec) -> Self {
        self.health_check = Some(check);
        self
    }
}

/// Wire format used for a collector target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Newline-delimited JSON over a TCP connection.
    Tcp,
    /// One JSON document per UDP datagram.
    Udp,
    /// JSON lines on the coordinator's own stdout.
    Stdout,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
            Transport::Stdout => "stdout",
        };
        write!(f, "{}", s)
    }
}

/// A downstream log collector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorTarget {
    /// `host:port`; ignored for `stdout`.
    pub address: String,
    pub transport: Transport,
    /// Prepended to every record's tag for this target only.
    pub tag_prefix: String,
}

impl CollectorTarget {
    /// Display name used in logs and stats, e.g. `tcp://127.0.0.1:5170`.
    pub fn label(&self) -> String {
        match self.transport {
            Transport::Stdout => "stdout".to_string(),
            t => format!("{}://{}", t, self.address),
        }
    }
}

/// Restart budget and grace periods. Required in every topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorPolicy {
    /// Consecutive probe failures tolerated while Unhealthy before a restart.
    pub failure_budget: u32,
    /// Consecutive restart attempts before the service is marked Failed.
    pub max_restarts: u32,
    /// How long a started service may take to first report Healthy.
    pub startup_grace: Duration,
    /// How long a stopping service may take before it is killed.
    pub stop_grace: Duration,
}

/// Parse a duration like `500ms`, `10s`, `5m`, `1h`, a compound such as
/// `1m30s` or `1h5m`, or a bare number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let s = raw.trim().to_lowercase();
    if s.is_empty() {
        return None;
    }
    if s.chars().all(|c| c.is_ascii_digit()) {
        return s.parse().ok().map(Duration::from_secs);
    }

    let mut total = Duration::ZERO;
    let mut chars = s.chars().peekable();
    while chars.peek().is_some() {
        let mut digits = String::new();
        while let Some(c) = chars.next_if(char::is_ascii_digit) {
            digits.push(c);
        }
        let mut unit = String::new();
        while let Some(c) = chars.next_if(char::is_ascii_alphabetic) {
            unit.push(c);
        }
        let n: u64 = digits.parse().ok()?;
        let part = match unit.as_str() {
            "ms" => Duration::from_millis(n),
            "s" => Duration::from_secs(n),
            "m" => Duration::from_secs(n.checked_mul(60)?),
            "h" => Duration::from_secs(n.checked_mul(3600)?),
            _ => return None,
        };
        total = total.checked_add(part)?;
    }
    Some(total)
}
