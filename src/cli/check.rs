//! `stackd check` — validate a topology without starting anything.

use std::path::Path;

use anyhow::{bail, Context, Result};

use stackd::config::validate::{validate_topology, DiagnosticLevel};
use stackd::topology::{self, ProbeKind};

pub(crate) fn cmd_check(file: &Path) -> Result<()> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;

    println!("Checking {}", file.display());
    println!();

    // Key-level diagnostics first; the loader would only report the first one.
    if let Ok(raw) = serde_yaml::from_str::<serde_yaml::Value>(&source) {
        let diagnostics = validate_topology(&raw);
        for d in &diagnostics {
            println!("  {}", d);
        }
        if diagnostics.iter().any(|d| d.level == DiagnosticLevel::Error) {
            println!();
            bail!("Topology has unknown fields");
        }
        println!();
    }

    let topology = topology::load(&source).with_context(|| "Topology is invalid")?;

    println!("Start order:");
    for (i, spec) in topology.graph.topological_order().iter().enumerate() {
        let probe = match spec.health_check.as_ref().map(|c| &c.kind) {
            Some(ProbeKind::Command(cmd)) => format!("command `{}`", cmd),
            Some(ProbeKind::Tcp(addr)) => format!("tcp {}", addr),
            Some(ProbeKind::Http(url)) => format!("http {}", url),
            None => "none".to_string(),
        };
        println!("  {:>2}. {}", i + 1, spec.name);
        println!("      start:      {}", spec.start);
        println!("      health:     {}", probe);
        if !spec.ports.is_empty() {
            let ports: Vec<String> = spec.ports.iter().map(|p| p.to_string()).collect();
            println!("      ports:      {}", ports.join(", "));
        }
        if !spec.depends_on.is_empty() {
            println!("      depends on: {}", spec.depends_on.join(", "));
        }
    }

    println!();
    println!("Collectors:");
    if topology.collectors.is_empty() {
        println!("  (none)");
    }
    for target in &topology.collectors {
        println!("  {}", target.label());
    }

    let p = &topology.policy;
    println!();
    println!(
        "Policy: failure budget {}, max restarts {}, startup grace {}s, stop grace {}s",
        p.failure_budget,
        p.max_restarts,
        p.startup_grace.as_secs_f64(),
        p.stop_grace.as_secs_f64()
    );
    println!();
    println!("[OK] {} services", topology.graph.len());
    Ok(())
}
