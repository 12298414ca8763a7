//! Single-shot health probes.
//!
//! [`Probe`] is the seam the coordinator probes through; [`SystemProbe`] is
//! the real implementation (commands, TCP connects, HTTP GETs) and tests
//! substitute scripted ones.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProbeError;
use crate::runtime::container_name;
use crate::topology::{HealthProbeSpec, ProbeKind, ServiceSpec, StartAction};

use super::tracker::HealthResult;

/// Longest diagnostic kept from a failing command's output.
const MAX_DIAGNOSTIC_CHARS: usize = 200;

/// Runs one health check against a service.
#[async_trait]
pub trait Probe: Send + Sync {
    /// Check once. `Ok(())` means healthy.
    ///
    /// Implementations need not enforce the probe timeout; [`probe`] does.
    async fn check(&self, service: &ServiceSpec, kind: &ProbeKind) -> Result<(), ProbeError>;
}

/// Run one probe bounded by `check.timeout` and time it.
pub async fn probe(service: &ServiceSpec, check: &HealthProbeSpec, prober: &dyn Probe) -> HealthResult {
    let started = Instant::now();
    let outcome = match tokio::time::timeout(check.timeout, prober.check(service, &check.kind)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(check.timeout.as_millis() as u64)),
    };
    let latency = started.elapsed();
    match outcome {
        Ok(()) => HealthResult::healthy(latency),
        Err(e) => {
            debug!(service = %service.name, error = %e, "Probe failed");
            HealthResult::unhealthy(latency, e.to_string())
        }
    }
}

/// Probes real processes and sockets.
pub struct SystemProbe {
    client: reqwest::Client,
}

impl SystemProbe {
    pub fn new() -> Self {
        // Per-request timeouts come from the probe spec; this only caps connects.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    async fn check_command(&self, service: &ServiceSpec, command: &str) -> Result<(), ProbeError> {
        let mut cmd = match &service.start {
            // Image services are probed inside their container.
            StartAction::Image(_) => {
                let mut cmd = tokio::process::Command::new("docker");
                cmd.args(["exec", &container_name(&service.name), "sh", "-c", command]);
                cmd
            }
            StartAction::Command(_) => {
                let mut cmd = tokio::process::Command::new("sh");
                cmd.arg("-c").arg(command).envs(&service.env);
                cmd
            }
        };
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| ProbeError::Exec(format!("{}: {}", command, e)))?;
        if output.status.success() {
            return Ok(());
        }
        let text = if output.stderr.is_empty() {
            String::from_utf8_lossy(&output.stdout).into_owned()
        } else {
            String::from_utf8_lossy(&output.stderr).into_owned()
        };
        let last_line = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        Err(ProbeError::Failed(format!(
            "exit {}{}{}",
            code,
            if last_line.is_empty() { "" } else { ": " },
            truncate(last_line.trim(), MAX_DIAGNOSTIC_CHARS)
        )))
    }

    async fn check_tcp(&self, address: &str) -> Result<(), ProbeError> {
        tokio::net::TcpStream::connect(address)
            .await
            .map(|_| ())
            .map_err(|e| ProbeError::Failed(format!("connect {}: {}", address, e)))
    }

    async fn check_http(&self, url: &str) -> Result<(), ProbeError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProbeError::Failed(format!("GET {}: {}", url, e)))?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ProbeError::Failed(format!("GET {}: HTTP {}", url, resp.status())))
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for SystemProbe {
    async fn check(&self, service: &ServiceSpec, kind: &ProbeKind) -> Result<(), ProbeError> {
        match kind {
            ProbeKind::Command(command) => self.check_command(service, command).await,
            ProbeKind::Tcp(address) => self.check_tcp(address).await,
            ProbeKind::Http(url) => self.check_http(url).await,
        }
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    let mut chars = s.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}
