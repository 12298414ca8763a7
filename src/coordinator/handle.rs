//! Client side of the control task.

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{Result, StackError};
use crate::sink::{CollectorStats, LogSink};

use super::state::{PhaseTransition, ServiceDetail, ServiceSnapshot};

/// Requests served by the control task.
pub(crate) enum Command {
    Status(oneshot::Sender<Vec<ServiceSnapshot>>),
    Service(String, oneshot::Sender<Option<ServiceDetail>>),
    Restart(String, oneshot::Sender<Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable handle to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) transitions: broadcast::Sender<PhaseTransition>,
    pub(crate) sink: LogSink,
    pub(crate) done: watch::Receiver<bool>,
}

impl CoordinatorHandle {
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| StackError::ControlClosed)?;
        rx.await.map_err(|_| StackError::ControlClosed)
    }

    /// Every service, in startup order.
    pub async fn status(&self) -> Result<Vec<ServiceSnapshot>> {
        self.request(Command::Status).await
    }

    /// One service with its health history.
    pub async fn service(&self, name: &str) -> Result<ServiceDetail> {
        self.request(|tx| Command::Service(name.to_string(), tx))
            .await?
            .ok_or_else(|| StackError::NotFound(format!("service '{}'", name)))
    }

    /// Stop-then-start a running service, or put a Failed one back in Pending.
    pub async fn restart(&self, name: &str) -> Result<()> {
        self.request(|tx| Command::Restart(name.to_string(), tx))
            .await?
    }

    /// Begin an orderly shutdown. Returns once the request is accepted;
    /// use [`stopped`](Self::stopped) to wait for completion.
    pub async fn shutdown(&self) -> Result<()> {
        self.request(Command::Shutdown).await
    }

    /// Wait until the control task has exited.
    pub async fn stopped(&self) {
        let mut done = self.done.clone();
        let _ = done.wait_for(|finished| *finished).await;
    }

    pub fn is_running(&self) -> bool {
        !*self.done.borrow()
    }

    /// Receive every phase change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PhaseTransition> {
        self.transitions.subscribe()
    }

    /// Per-collector delivery counters.
    pub fn sink_stats(&self) -> Vec<CollectorStats> {
        self.sink.stats()
    }
}
