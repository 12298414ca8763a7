//! Collector transports.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;

use crate::error::DeliveryError;
use crate::topology::{CollectorTarget, Transport};

/// A downstream destination for rendered log lines.
///
/// Each collector is driven by exactly one delivery worker, so `deliver` is
/// never called concurrently for the same collector.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Human-readable label used in logs and stats.
    fn name(&self) -> &str;

    /// Deliver one rendered JSON line (without trailing newline).
    async fn deliver(&self, line: &str) -> Result<(), DeliveryError>;
}

/// Build the collector for a topology target.
pub fn build_collector(target: &CollectorTarget, connect_timeout: Duration) -> Arc<dyn Collector> {
    match target.transport {
        Transport::Tcp => Arc::new(TcpCollector::new(target.label(), &target.address, connect_timeout)),
        Transport::Udp => Arc::new(UdpCollector::new(target.label(), &target.address)),
        Transport::Stdout => Arc::new(StdoutCollector),
    }
}

// ============================================================================
// TCP
// ============================================================================

/// Newline-delimited JSON over a lazily (re)connected TCP stream.
pub struct TcpCollector {
    name: String,
    address: String,
    connect_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpCollector {
    pub fn new(name: impl Into<String>, address: &str, connect_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            address: address.to_string(),
            connect_timeout,
            stream: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Collector for TcpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| DeliveryError::Timeout(self.name.clone()))?
                .map_err(|e| DeliveryError::Unreachable(self.name.clone(), e.to_string()))?;
            stream.set_nodelay(true).ok();
            *guard = Some(stream);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(DeliveryError::Unreachable(self.name.clone(), "not connected".into()));
        };

        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        if let Err(e) = stream.write_all(&buf).await {
            // Reconnect on the next record.
            *guard = None;
            return Err(DeliveryError::Write(self.name.clone(), e.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// UDP
// ============================================================================

/// One JSON document per datagram.
pub struct UdpCollector {
    name: String,
    address: String,
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpCollector {
    pub fn new(name: impl Into<String>, address: &str) -> Self {
        Self {
            name: name.into(),
            address: address.to_string(),
            socket: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Collector for UdpCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        let mut guard = self.socket.lock().await;
        if guard.is_none() {
            let bind = if self.address.starts_with('[') { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind)
                .await
                .map_err(|e| DeliveryError::Unreachable(self.name.clone(), e.to_string()))?;
            socket
                .connect(&self.address)
                .await
                .map_err(|e| DeliveryError::Unreachable(self.name.clone(), e.to_string()))?;
            *guard = Some(socket);
        }
        let Some(socket) = guard.as_ref() else {
            return Err(DeliveryError::Unreachable(self.name.clone(), "no socket".into()));
        };
        if let Err(e) = socket.send(line.as_bytes()).await {
            *guard = None;
            return Err(DeliveryError::Write(self.name.clone(), e.to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// Stdout
// ============================================================================

/// JSON lines on the coordinator's own stdout.
pub struct StdoutCollector;

#[async_trait]
impl Collector for StdoutCollector {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn deliver(&self, line: &str) -> Result<(), DeliveryError> {
        let mut out = tokio::io::stdout();
        let mut buf = Vec::with_capacity(line.len() + 1);
        buf.extend_from_slice(line.as_bytes());
        buf.push(b'\n');
        out.write_all(&buf)
            .await
            .map_err(|e| DeliveryError::Write("stdout".into(), e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| DeliveryError::Write("stdout".into(), e.to_string()))
    }
}
