//! Process-backed runtime: shell commands and `docker run` containers.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{StartError, StopError};
use crate::sink::LogStream;
use crate::topology::{ServiceSpec, StartAction};

use super::{ServiceRuntime, StartedService};

/// Name given to the container of an image-backed service.
pub fn container_name(service: &str) -> String {
    format!("stackd-{}", service)
}

/// A managed child process.
struct ManagedProcess {
    pid: Option<u32>,
    child: Child,
}

/// Runs services as child processes of the coordinator.
pub struct ProcessRuntime {
    /// Running processes keyed by service name.
    processes: RwLock<HashMap<String, ManagedProcess>>,
    docker: String,
}

impl ProcessRuntime {
    pub fn new() -> Self {
        Self::with_docker("docker")
    }

    /// Use a different container CLI (`podman`, a wrapper script, ...).
    pub fn with_docker(docker: impl Into<String>) -> Self {
        Self {
            processes: RwLock::new(HashMap::new()),
            docker: docker.into(),
        }
    }

    pub async fn is_running(&self, name: &str) -> bool {
        let mut processes = self.processes.write().await;
        match processes.get_mut(name) {
            Some(p) => p.child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the command that launches a service.
fn build_start_command(spec: &ServiceSpec, docker: &str) -> Command {
    let mut cmd = match &spec.start {
        StartAction::Command(command) => {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command).envs(&spec.env);
            cmd
        }
        StartAction::Image(image) => {
            let mut cmd = Command::new(docker);
            let mut args = vec![
                "run".to_string(),
                "--rm".to_string(),
                "--name".to_string(),
                container_name(&spec.name),
            ];
            for p in &spec.ports {
                args.push("-p".to_string());
                args.push(p.to_string());
            }
            for (k, v) in &spec.env {
                args.push("-e".to_string());
                args.push(format!("{}={}", k, v));
            }
            args.push(image.clone());
            cmd.args(&args);
            cmd
        }
    };
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

/// Ask the process to exit on its own (SIGTERM).
#[cfg(unix)]
fn request_exit(pid: Option<u32>) -> std::io::Result<()> {
    let Some(pid) = pid else {
        return Ok(());
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_exit(_pid: Option<u32>) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "graceful stop is not supported on this platform",
    ))
}

#[async_trait]
impl ServiceRuntime for ProcessRuntime {
    async fn start(&self, spec: &ServiceSpec) -> Result<StartedService, StartError> {
        let mut processes = self.processes.write().await;
        if let Some(existing) = processes.get_mut(&spec.name) {
            if existing.child.try_wait().ok().flatten().is_none() {
                return Err(StartError::AlreadyRunning(spec.name.clone()));
            }
        }

        let mut child = build_start_command(spec, &self.docker)
            .spawn()
            .map_err(|e| StartError::Spawn {
                service: spec.name.clone(),
                reason: e.to_string(),
            })?;
        let pid = child.id();

        let mut started = StartedService::new(pid);
        if let Some(stdout) = child.stdout.take() {
            started = started.with_output(LogStream::Stdout, stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            started = started.with_output(LogStream::Stderr, stderr);
        }

        processes.insert(spec.name.clone(), ManagedProcess { pid, child });
        info!(service = %spec.name, pid = ?pid, start = %spec.start, "Service process spawned");
        Ok(started)
    }

    async fn stop(&self, spec: &ServiceSpec, grace: Duration) -> Result<(), StopError> {
        let Some(mut process) = self.processes.write().await.remove(&spec.name) else {
            debug!(service = %spec.name, "Stop requested but no process is running");
            return Ok(());
        };
        if process.child.try_wait().ok().flatten().is_some() {
            debug!(service = %spec.name, "Process already exited");
            return Ok(());
        }

        if let Err(e) = request_exit(process.pid) {
            warn!(service = %spec.name, error = %e, "Graceful stop failed; killing");
            return process.child.kill().await.map_err(|e| StopError::Kill {
                service: spec.name.clone(),
                reason: e.to_string(),
            });
        }

        match tokio::time::timeout(grace, process.child.wait()).await {
            Ok(Ok(status)) => {
                info!(service = %spec.name, status = %status, "Service process exited");
                Ok(())
            }
            Ok(Err(e)) => Err(StopError::Signal {
                service: spec.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => {
                warn!(service = %spec.name, grace_ms = grace.as_millis() as u64, "Stop grace expired; killing");
                process.child.kill().await.map_err(|e| StopError::Kill {
                    service: spec.name.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}
