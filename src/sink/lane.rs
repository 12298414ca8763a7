//! Bounded per-collector queue.
//!
//! Producers (drain tasks) push without awaiting; the single delivery worker
//! for the collector pops. When full, the overflow policy decides which
//! record is lost.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::record::LogRecord;

/// What to drop when a lane is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the oldest queued record to make room.
    #[default]
    DropOldest,
    /// Discard the incoming record.
    DropNewest,
}

/// Counters for one lane.
#[derive(Debug, Default)]
pub struct LaneCounters {
    pub accepted: AtomicU64,
    pub dropped: AtomicU64,
    pub delivered: AtomicU64,
    pub failed: AtomicU64,
}

/// # Example
/// ```
/// use stackd::sink::{Lane, LogRecord, LogStream, OverflowPolicy};
/// # tokio_test::block_on(async {
/// let lane = Lane::new(1, OverflowPolicy::DropOldest);
/// lane.push(LogRecord::new("db", "db", LogStream::Stdout, "first"));
/// lane.push(LogRecord::new("db", "db", LogStream::Stdout, "second"));
/// lane.close();
/// assert_eq!(lane.pop().await.unwrap().payload, "second");
/// assert!(lane.pop().await.is_none());
/// # });
/// ```
pub struct Lane {
    queue: Mutex<VecDeque<LogRecord>>,
    capacity: usize,
    policy: OverflowPolicy,
    notify: Notify,
    closed: AtomicBool,
    pub counters: LaneCounters,
}

impl Lane {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            counters: LaneCounters::default(),
        }
    }

    /// Enqueue without blocking. Returns `false` if a record was dropped.
    pub fn push(&self, record: LogRecord) -> bool {
        if self.closed.load(Ordering::Acquire) {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let lossless = {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            if queue.len() < self.capacity {
                queue.push_back(record);
                true
            } else {
                match self.policy {
                    OverflowPolicy::DropOldest => {
                        queue.pop_front();
                        queue.push_back(record);
                    }
                    OverflowPolicy::DropNewest => {}
                }
                false
            }
        };
        if lossless || self.policy == OverflowPolicy::DropOldest {
            self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        }
        if !lossless {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        lossless
    }

    /// Next record, or `None` once the lane is closed and drained.
    pub async fn pop(&self) -> Option<LogRecord> {
        loop {
            let notified = self.notify.notified();
            let next = self
                .queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            if next.is_some() {
                return next;
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            notified.await;
        }
    }

    /// Stop accepting records. Queued records are still handed out by `pop`.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::record::LogStream;
    use std::time::Duration;

    fn rec(n: usize) -> LogRecord {
        LogRecord::new("svc", "svc", LogStream::Stdout, n.to_string())
    }

    async fn drain(lane: &Lane) -> Vec<String> {
        lane.close();
        let mut out = Vec::new();
        while let Some(r) = lane.pop().await {
            out.push(r.payload);
        }
        out
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_latest() {
        let lane = Lane::new(3, OverflowPolicy::DropOldest);
        for i in 0..5 {
            lane.push(rec(i));
        }
        assert_eq!(drain(&lane).await, vec!["2", "3", "4"]);
        assert_eq!(lane.counters.dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_drop_newest_keeps_earliest() {
        let lane = Lane::new(3, OverflowPolicy::DropNewest);
        for i in 0..5 {
            lane.push(rec(i));
        }
        assert_eq!(drain(&lane).await, vec!["0", "1", "2"]);
        assert_eq!(lane.counters.accepted.load(Ordering::Relaxed), 3);
        assert_eq!(lane.counters.dropped.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let lane = std::sync::Arc::new(Lane::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let lane = lane.clone();
            tokio::spawn(async move { lane.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        lane.push(rec(9));
        let got = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.unwrap().payload, "9");
    }

    #[tokio::test]
    async fn test_closed_lane_rejects_pushes() {
        let lane = Lane::new(4, OverflowPolicy::DropOldest);
        lane.close();
        assert!(!lane.push(rec(1)));
        assert!(lane.pop().await.is_none());
    }

    #[test]
    fn test_push_never_blocks_when_full() {
        let lane = Lane::new(1, OverflowPolicy::DropNewest);
        for i in 0..10_000 {
            lane.push(rec(i));
        }
        assert_eq!(lane.len(), 1);
    }
}
