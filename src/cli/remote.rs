//! Commands that talk to a running coordinator's control server.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde_json::Value;

use stackd::config::Config;
use stackd::coordinator::ServiceSnapshot;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    fn new(config: &Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .with_context(|| "Failed to build HTTP client")?;
        Ok(Self {
            base: format!("http://{}", config.control.address()),
            http,
        })
    }

    async fn send(&self, method: reqwest::Method, path: &str) -> Result<Value> {
        let url = format!("{}{}", self.base, path);
        let response = self
            .http
            .request(method, &url)
            .send()
            .await
            .with_context(|| format!("No coordinator reachable at {} (is `stackd up` running?)", self.base))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .with_context(|| format!("Invalid response from {}", url))?;
        if !status.is_success() {
            let message = body["error"].as_str().unwrap_or("unknown error");
            bail!("{} ({})", message, status);
        }
        Ok(body)
    }
}

/// Print every service of the running stack.
pub(crate) async fn cmd_status(config: &Config, json: bool) -> Result<()> {
    let client = ControlClient::new(config)?;
    let body = client.send(reqwest::Method::GET, "/services").await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    let services: Vec<ServiceSnapshot> =
        serde_json::from_value(body).with_context(|| "Unexpected /services payload")?;
    if services.is_empty() {
        println!("No services.");
        return Ok(());
    }

    println!(
        "{:<20} {:<10} {:<10} {:>8} {:>8}  NOTE",
        "SERVICE", "PHASE", "HEALTH", "FAILS", "RESTARTS"
    );
    for s in &services {
        println!(
            "{:<20} {:<10} {:<10} {:>8} {:>8}  {}",
            s.name,
            s.phase.to_string(),
            s.health.to_string(),
            s.consecutive_failures,
            s.restarts,
            note(s)
        );
    }
    Ok(())
}

pub(crate) fn note(s: &ServiceSnapshot) -> String {
    if let Some(blocker) = &s.blocked_by {
        return format!("blocked by failed '{}'", blocker);
    }
    if !s.waiting_on.is_empty() {
        return format!("waiting on {}", s.waiting_on.join(", "));
    }
    s.last_error.clone().unwrap_or_default()
}

pub(crate) async fn cmd_restart(config: &Config, service: &str) -> Result<()> {
    let client = ControlClient::new(config)?;
    client
        .send(reqwest::Method::POST, &format!("/services/{}/restart", service))
        .await
        .with_context(|| format!("Failed to restart '{}'", service))?;
    println!("Restart of '{}' requested.", service);
    Ok(())
}

pub(crate) async fn cmd_down(config: &Config) -> Result<()> {
    let client = ControlClient::new(config)?;
    client.send(reqwest::Method::POST, "/shutdown").await?;
    println!("Shutdown requested.");
    Ok(())
}
