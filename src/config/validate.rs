//! Topology validation with unknown field detection.
//!
//! The loader rejects unknown keys outright; this pass runs first (from
//! `stackd check`) and explains them with "did you mean" hints.

use serde_yaml::Value;
use std::collections::HashSet;

/// Known top-level topology keys.
const KNOWN_TOP_LEVEL: &[&str] = &["coordinator", "collectors", "services"];

const KNOWN_COORDINATOR: &[&str] = &["failureBudget", "maxRestarts", "startupGrace", "stopGrace"];

const KNOWN_COLLECTOR: &[&str] = &["address", "transport", "tagPrefix"];

const KNOWN_SERVICE: &[&str] = &[
    "name",
    "start",
    "dependsOn",
    "healthCheck",
    "ports",
    "env",
    "logTag",
];

const KNOWN_HEALTH_CHECK: &[&str] = &["probe", "interval", "timeout", "retries"];

/// A validation diagnostic.
#[derive(Debug)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub path: String,
    pub message: String,
}

#[derive(Debug, PartialEq)]
pub enum DiagnosticLevel {
    Ok,
    Warn,
    Error,
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix = match self.level {
            DiagnosticLevel::Ok => "[OK]",
            DiagnosticLevel::Warn => "[WARN]",
            DiagnosticLevel::Error => "[ERROR]",
        };
        if self.path.is_empty() {
            write!(f, "{} {}", prefix, self.message)
        } else {
            write!(f, "{} {}: {}", prefix, self.path, self.message)
        }
    }
}

/// Simple Levenshtein distance for "did you mean?" suggestions.
pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut matrix = vec![vec![0usize; b.len() + 1]; a.len() + 1];

    for (i, row) in matrix.iter_mut().enumerate() {
        row[0] = i;
    }
    for (j, val) in matrix[0].iter_mut().enumerate() {
        *val = j;
    }

    for (i, ca) in a.iter().enumerate() {
        for (j, cb) in b.iter().enumerate() {
            let cost = if ca == cb { 0 } else { 1 };
            matrix[i + 1][j + 1] = std::cmp::min(
                std::cmp::min(matrix[i][j + 1] + 1, matrix[i + 1][j] + 1),
                matrix[i][j] + cost,
            );
        }
    }
    matrix[a.len()][b.len()]
}

/// Suggest the closest known field name (if distance <= 3).
pub fn suggest_field(unknown: &str, known: &[&str]) -> Option<String> {
    known
        .iter()
        .map(|k| (k, levenshtein(unknown, k)))
        .filter(|(_, d)| *d <= 3)
        .min_by_key(|(_, d)| *d)
        .map(|(k, _)| format!("did you mean '{}'?", k))
}

/// Validate a parsed topology document against known key names.
///
/// Returns `Error` diagnostics for unknown keys and a final `Ok` line when
/// every key was recognized. Shape errors are left to the loader.
pub fn validate_topology(raw: &Value) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    let Some(top) = raw.as_mapping() else {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Error,
            path: String::new(),
            message: "Topology must be a mapping".to_string(),
        });
        return diagnostics;
    };

    let before = diagnostics.len();
    check_keys(top, "", KNOWN_TOP_LEVEL, &mut diagnostics);

    if let Some(policy) = top.get("coordinator").and_then(Value::as_mapping) {
        check_keys(policy, "coordinator", KNOWN_COORDINATOR, &mut diagnostics);
    }

    if let Some(collectors) = top.get("collectors").and_then(Value::as_sequence) {
        for (i, c) in collectors.iter().enumerate() {
            if let Some(c) = c.as_mapping() {
                check_keys(c, &format!("collectors[{}]", i), KNOWN_COLLECTOR, &mut diagnostics);
            }
        }
    }

    for (path, service) in service_entries(top.get("services")) {
        check_keys(service, &path, KNOWN_SERVICE, &mut diagnostics);
        if let Some(hc) = service.get("healthCheck").and_then(Value::as_mapping) {
            check_keys(hc, &format!("{}.healthCheck", path), KNOWN_HEALTH_CHECK, &mut diagnostics);
        }
    }

    if diagnostics.len() == before {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Ok,
            path: String::new(),
            message: "All fields recognized".to_string(),
        });
    }

    if top.get("collectors").is_none() {
        diagnostics.push(Diagnostic {
            level: DiagnosticLevel::Warn,
            path: "collectors".to_string(),
            message: "No collectors configured; service output will be discarded".to_string(),
        });
    }

    diagnostics
}

/// Services in either map or list form, paired with a display path.
fn service_entries(services: Option<&Value>) -> Vec<(String, &serde_yaml::Mapping)> {
    match services {
        Some(Value::Mapping(map)) => map
            .iter()
            .filter_map(|(k, v)| {
                let name = k.as_str().unwrap_or("?");
                v.as_mapping().map(|m| (format!("services.{}", name), m))
            })
            .collect(),
        Some(Value::Sequence(seq)) => seq
            .iter()
            .enumerate()
            .filter_map(|(i, v)| v.as_mapping().map(|m| (format!("services[{}]", i), m)))
            .collect(),
        _ => Vec::new(),
    }
}

fn check_keys(map: &serde_yaml::Mapping, path: &str, known: &[&str], out: &mut Vec<Diagnostic>) {
    let known_set: HashSet<&str> = known.iter().copied().collect();
    for key in map.keys() {
        let Some(key) = key.as_str() else {
            continue;
        };
        if known_set.contains(key) {
            continue;
        }
        let message = match suggest_field(key, known) {
            Some(suggestion) => format!("Unknown field '{}', {}", key, suggestion),
            None => format!("Unknown field '{}'", key),
        };
        out.push(Diagnostic {
            level: DiagnosticLevel::Error,
            path: if path.is_empty() {
                key.to_string()
            } else {
                format!("{}.{}", path, key)
            },
            message,
        });
    }
}
