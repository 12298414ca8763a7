//! Log Fan-out Sink
//!
//! Taps every running service's stdout/stderr, turns each line into a
//! [`LogRecord`] and fans it out to every configured collector.
//!
//! ```text
//! drain task (per stream) ──push──▶ Lane (per collector) ──pop──▶ delivery worker ──▶ Collector
//! ```
//!
//! Pushing into a lane never awaits, so a slow or dead collector can only
//! cost records (counted), never block a service.

pub mod collector;
pub mod lane;
pub mod record;

pub use collector::{build_collector, Collector, StdoutCollector, TcpCollector, UdpCollector};
pub use lane::{Lane, OverflowPolicy};
pub use record::{LogRecord, LogStream};

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::error::DeliveryError;
use crate::topology::CollectorTarget;

/// How long shutdown waits for drain tasks to reach EOF on their own.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Per-collector counters, as reported by [`LogSink::stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectorStats {
    pub collector: String,
    pub queued: usize,
    pub accepted: u64,
    pub delivered: u64,
    /// Lost to lane overflow.
    pub dropped: u64,
    /// Lost to delivery errors or backoff.
    pub failed: u64,
}

struct Output {
    name: String,
    lane: Arc<Lane>,
}

struct SinkInner {
    outputs: Vec<Output>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    drains: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    max_line_bytes: usize,
}

/// Fan-out of service output to collectors. Cheap to clone.
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    /// Build collectors for `targets` and start one delivery worker each.
    pub fn new(targets: &[CollectorTarget], config: &SinkConfig) -> Self {
        let collectors = targets
            .iter()
            .map(|t| {
                (
                    build_collector(t, Duration::from_millis(config.connect_timeout_ms)),
                    t.tag_prefix.clone(),
                )
            })
            .collect();
        Self::with_collectors(collectors, config)
    }

    /// Start workers for already-built collectors, each with its tag prefix.
    pub fn with_collectors(collectors: Vec<(Arc<dyn Collector>, String)>, config: &SinkConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let mut outputs = Vec::with_capacity(collectors.len());
        let mut workers = Vec::with_capacity(collectors.len());

        for (collector, prefix) in collectors {
            let lane = Arc::new(Lane::new(config.buffer_size, config.overflow));
            outputs.push(Output {
                name: collector.name().to_string(),
                lane: Arc::clone(&lane),
            });
            workers.push(tokio::spawn(deliver_loop(
                collector,
                lane,
                prefix,
                Duration::from_millis(config.delivery_timeout_ms),
                Duration::from_millis(config.retry_backoff_ms),
            )));
        }
        info!(collectors = outputs.len(), buffer = config.buffer_size, "Log sink started");

        Self {
            inner: Arc::new(SinkInner {
                outputs,
                workers: Mutex::new(workers),
                drains: Mutex::new(Vec::new()),
                shutdown,
                max_line_bytes: config.max_line_bytes.max(1),
            }),
        }
    }

    /// Hand a record to every collector lane. Never awaits.
    pub fn publish(&self, record: LogRecord) {
        for output in &self.inner.outputs {
            output.lane.push(record.clone());
        }
    }

    fn publish_line(&self, service: &str, tag: &str, stream: LogStream, bytes: &[u8]) {
        let text = String::from_utf8_lossy(bytes);
        let line = text.trim_end_matches(['\n', '\r']);
        if !line.is_empty() {
            self.publish(LogRecord::new(service, tag, stream, line));
        }
    }

    /// Spawn a drain task reading `reader` line by line until EOF or shutdown.
    pub fn attach<R>(&self, service: &str, tag: &str, stream: LogStream, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let sink = self.clone();
        let service = service.to_string();
        let tag = tag.to_string();
        let mut shutdown = self.inner.shutdown.subscribe();

        let handle = tokio::spawn(async move {
            if *shutdown.borrow() {
                return;
            }
            let max = sink.inner.max_line_bytes;
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            let mut split_lines: u64 = 0;
            loop {
                let read = tokio::select! {
                    r = read_line_bounded(&mut reader, &mut buf, max) => r,
                    _ = shutdown.changed() => break,
                };
                match read {
                    Ok(Line::Eof) => break,
                    Ok(Line::Complete) => {
                        sink.publish_line(&service, &tag, stream, &buf);
                        buf.clear();
                    }
                    Ok(Line::Split) => {
                        // Keep an incomplete UTF-8 sequence for the next chunk.
                        let carry = match std::str::from_utf8(&buf) {
                            Err(e) if e.error_len().is_none() && e.valid_up_to() > 0 => buf.split_off(e.valid_up_to()),
                            _ => Vec::new(),
                        };
                        sink.publish_line(&service, &tag, stream, &buf);
                        buf = carry;
                        split_lines += 1;
                        if split_lines == 1 {
                            warn!(
                                service = %service,
                                stream = %stream,
                                max_line_bytes = max,
                                "Output line exceeds limit; splitting into several records"
                            );
                        }
                    }
                    Err(e) => {
                        debug!(service = %service, stream = %stream, error = %e, "Output read failed");
                        break;
                    }
                }
            }
            debug!(service = %service, stream = %stream, split_lines, "Output drain finished");
        });

        let mut drains = self.inner.drains.lock().unwrap_or_else(PoisonError::into_inner);
        drains.retain(|h| !h.is_finished());
        drains.push(handle);
    }

    /// Current per-collector counters.
    pub fn stats(&self) -> Vec<CollectorStats> {
        self.inner
            .outputs
            .iter()
            .map(|o| CollectorStats {
                collector: o.name.clone(),
                queued: o.lane.len(),
                accepted: o.lane.counters.accepted.load(Ordering::Relaxed),
                delivered: o.lane.counters.delivered.load(Ordering::Relaxed),
                dropped: o.lane.counters.dropped.load(Ordering::Relaxed),
                failed: o.lane.counters.failed.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Stop draining, flush what is queued and stop the delivery workers.
    pub async fn shutdown(&self) {
        let drains: Vec<_> = std::mem::take(
            &mut *self.inner.drains.lock().unwrap_or_else(PoisonError::into_inner),
        );
        if tokio::time::timeout(DRAIN_GRACE, futures::future::join_all(drains))
            .await
            .is_err()
        {
            debug!("Output drains still open at shutdown; cancelling");
        }
        let _ = self.inner.shutdown.send(true);

        for output in &self.inner.outputs {
            output.lane.close();
        }
        let workers: Vec<_> = std::mem::take(
            &mut *self.inner.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        futures::future::join_all(workers).await;
        info!("Log sink stopped");
    }
}

/// Outcome of one [`read_line_bounded`] call.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    /// `buf` holds a full line, or the unterminated tail at EOF.
    Complete,
    /// `buf` reached the limit before a newline.
    Split,
    Eof,
}

/// Append bytes up to and including the next newline, stopping once `buf`
/// holds `max` bytes.
async fn read_line_bounded<R>(reader: &mut R, buf: &mut Vec<u8>, max: usize) -> std::io::Result<Line>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() { Line::Eof } else { Line::Complete });
        }
        let room = max.saturating_sub(buf.len());
        match available.iter().position(|&b| b == b'\n') {
            Some(i) if i < room => {
                buf.extend_from_slice(&available[..=i]);
                reader.consume(i + 1);
                return Ok(Line::Complete);
            }
            _ => {
                let take = available.len().min(room);
                buf.extend_from_slice(&available[..take]);
                reader.consume(take);
                if buf.len() >= max {
                    return Ok(Line::Split);
                }
            }
        }
    }
}

async fn deliver_loop(
    collector: Arc<dyn Collector>,
    lane: Arc<Lane>,
    prefix: String,
    delivery_timeout: Duration,
    backoff: Duration,
) {
    let mut backoff_until: Option<Instant> = None;
    while let Some(record) = lane.pop().await {
        if let Some(until) = backoff_until {
            if Instant::now() < until {
                lane.counters.failed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
        }
        let line = record.to_json_line(&prefix);
        let result = match tokio::time::timeout(delivery_timeout, collector.deliver(&line)).await {
            Ok(r) => r,
            Err(_) => Err(DeliveryError::Timeout(collector.name().to_string())),
        };
        match result {
            Ok(()) => {
                lane.counters.delivered.fetch_add(1, Ordering::Relaxed);
                if backoff_until.take().is_some() {
                    info!(collector = collector.name(), "Collector reachable again");
                }
            }
            Err(e) => {
                lane.counters.failed.fetch_add(1, Ordering::Relaxed);
                if backoff_until.is_none() {
                    warn!(
                        collector = collector.name(),
                        error = %e,
                        "Collector delivery failed; dropping records while backing off"
                    );
                } else {
                    debug!(collector = collector.name(), error = %e, "Collector still failing");
                }
                backoff_until = Some(Instant::now() + backoff);
            }
        }
    }
    debug!(collector = collector.name(), "Delivery worker stopped");
}
