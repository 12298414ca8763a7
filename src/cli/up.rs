//! `stackd up` — run a topology in the foreground.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use stackd::config::Config;
use stackd::control::start_control_server;
use stackd::coordinator::{Coordinator, CoordinatorHandle, Phase, ServiceSnapshot};
use stackd::health::SystemProbe;
use stackd::runtime::ProcessRuntime;
use stackd::sink::LogSink;
use stackd::topology;

use super::remote::note;

pub(crate) async fn cmd_up(file: &Path, config: Config) -> Result<()> {
    let topology = topology::load_file(file)
        .with_context(|| format!("Failed to load topology {}", file.display()))?;

    let order: Vec<String> = topology
        .graph
        .topological_order()
        .iter()
        .map(|s| s.name.clone())
        .collect();
    info!(
        services = order.len(),
        collectors = topology.collectors.len(),
        order = ?order,
        "Starting stack"
    );

    let sink = LogSink::new(&topology.collectors, &config.sink);
    let coordinator = Coordinator::new(
        topology,
        Arc::new(ProcessRuntime::new()),
        Arc::new(SystemProbe::new()),
        sink,
        &config.health,
    );
    let (handle, join) = coordinator.spawn();

    let server = if config.control.enabled {
        let addr = config.control.address();
        let (_, task) = start_control_server(&addr, handle.clone())
            .await
            .with_context(|| format!("Failed to bind control server on {}", addr))?;
        Some(task)
    } else {
        None
    };

    eprintln!("stackd is running. Press Ctrl+C to stop.");

    tokio::select! {
        _ = wait_for_signal() => {
            eprintln!();
            eprintln!("Shutting down...");
            if let Err(e) = handle.shutdown().await {
                warn!(error = %e, "Shutdown request failed");
            }
        }
        _ = handle.stopped() => {
            info!("Shutdown requested through the control server");
        }
    }

    let final_state = join.await.with_context(|| "Coordinator task panicked")?;
    if let Some(server) = server {
        server.abort();
    }
    report_final_state(&handle, &final_state);
    Ok(())
}

fn report_final_state(handle: &CoordinatorHandle, services: &[ServiceSnapshot]) {
    for s in services {
        match s.phase {
            Phase::Failed => warn!(service = %s.name, note = %note(s), "Service ended failed"),
            _ if s.is_frozen() => warn!(service = %s.name, note = %note(s), "Service never started"),
            phase => info!(service = %s.name, phase = %phase, "Service final state"),
        }
    }
    for line in summary_lines(services) {
        eprintln!("{}", line);
    }
    for stats in handle.sink_stats() {
        info!(
            collector = %stats.collector,
            delivered = stats.delivered,
            dropped = stats.dropped,
            failed = stats.failed,
            "Collector totals"
        );
    }
}

/// One line per service for the exit report.
fn summary_lines(services: &[ServiceSnapshot]) -> Vec<String> {
    let failed = services.iter().filter(|s| s.phase == Phase::Failed).count();
    let frozen = services.iter().filter(|s| s.is_frozen()).count();
    let mut lines = vec![format!(
        "Final state: {} services, {} failed, {} never started",
        services.len(),
        failed,
        frozen
    )];
    for s in services {
        let note = note(s);
        let note = if s.is_frozen() {
            format!("never started, {}", note)
        } else {
            note
        };
        lines.push(format!("  {:<20} {:<10} {}", s.name, s.phase.to_string(), note).trim_end().to_string());
    }
    lines
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM; only Ctrl+C will stop the stack");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
