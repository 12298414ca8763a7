//! Per-service probe loop.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::topology::{HealthProbeSpec, ServiceSpec};

use super::probe::{probe, Probe};
use super::tracker::HealthResult;

/// A probe result tagged with the start generation it belongs to.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub service: String,
    pub generation: u64,
    pub result: HealthResult,
}

/// Spawn the probe loop for one started service.
///
/// Probes once immediately, then waits `interval` after each probe finishes,
/// so a slow probe only delays its own service. The loop stops when `cancel`
/// flips to `true` (checked between probes; an in-flight probe is allowed to
/// finish) or when the report channel closes.
pub fn spawn_probe_loop(
    service: Arc<ServiceSpec>,
    check: HealthProbeSpec,
    prober: Arc<dyn Probe>,
    generation: u64,
    reports: mpsc::Sender<ProbeReport>,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(service = %service.name, generation, "Probe loop started");
        loop {
            if *cancel.borrow() {
                break;
            }
            let result = probe(&service, &check, prober.as_ref()).await;
            let report = ProbeReport {
                service: service.name.clone(),
                generation,
                result,
            };
            if reports.send(report).await.is_err() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(check.interval) => {}
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }
        debug!(service = %service.name, generation, "Probe loop stopped");
    })
}
