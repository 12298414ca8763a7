//! Service runtime seam.
//!
//! The coordinator starts and stops services only through [`ServiceRuntime`].
//! [`ProcessRuntime`] runs real processes (shell commands or `docker run`);
//! tests plug in scripted runtimes.

pub mod process;

pub use process::{container_name, ProcessRuntime};

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::{StartError, StopError};
use crate::sink::LogStream;
use crate::topology::ServiceSpec;

/// A readable output stream of a started service.
pub type OutputStream = Box<dyn AsyncRead + Send + Unpin>;

/// What a successful start hands back to the coordinator.
pub struct StartedService {
    pub pid: Option<u32>,
    /// Output streams to be tapped by the log sink.
    pub outputs: Vec<(LogStream, OutputStream)>,
}

impl StartedService {
    pub fn new(pid: Option<u32>) -> Self {
        Self {
            pid,
            outputs: Vec::new(),
        }
    }

    pub fn with_output(mut self, stream: LogStream, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.outputs.push((stream, Box::new(reader)));
        self
    }
}

impl std::fmt::Debug for StartedService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StartedService")
            .field("pid", &self.pid)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

/// Start/stop control surface for managed services.
#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Launch the service. Returns once the process exists, not once it is healthy.
    async fn start(&self, spec: &ServiceSpec) -> Result<StartedService, StartError>;

    /// Ask the service to stop, forcing termination after `grace`.
    /// Stopping a service that is not running is a no-op.
    async fn stop(&self, spec: &ServiceSpec, grace: Duration) -> Result<(), StopError>;
}
