// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Central bounded FIFO between watchers and the batcher.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::warn;

use crate::record::LogRecord;

/// Capacity used when `QUEUE_SIZE` is not configured.
pub const DEFAULT_CAPACITY: usize = 5000;

/// Number of threshold warning buckets (20/40/60/80%).
const WARN_BUCKETS: usize = 5;

/// Outcome of a non-blocking `offer`. A rejected record is handed back so the
/// caller can dispatch on its overflow policy.
#[derive(Debug)]
pub enum Admission {
    Accepted,
    Rejected(LogRecord),
}

/// Observable queue counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub capacity: usize,
    pub last_warn_bucket: u8,
}

#[derive(Debug)]
struct Inner {
    records: VecDeque<LogRecord>,
    last_warn_bucket: u8,
}

/// Many-producer many-consumer FIFO with non-blocking admission.
///
/// In bounded mode an over-capacity `offer` is rejected and the caller applies
/// the record's overflow policy. In legacy mode (no `QUEUE_SIZE` configured)
/// reaching capacity clears the queue wholesale, dropping records regardless
/// of their policy; kept for compatibility with existing deployments.
#[derive(Debug)]
pub struct BoundedQueue {
    inner: Mutex<Inner>,
    notify: Notify,
    capacity: usize,
    legacy: bool,
}

impl BoundedQueue {
    pub fn bounded(capacity: usize) -> Self {
        Self::new(capacity.max(1), false)
    }

    pub fn legacy() -> Self {
        Self::new(DEFAULT_CAPACITY, true)
    }

    fn new(capacity: usize, legacy: bool) -> Self {
        Self {
            inner: Mutex::new(Inner {
                records: VecDeque::new(),
                last_warn_bucket: 0,
            }),
            notify: Notify::new(),
            capacity,
            legacy,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Non-blocking admission.
    pub fn offer(&self, record: LogRecord) -> Admission {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.records.len() >= self.capacity {
            if self.legacy {
                let dropped = inner.records.len();
                inner.records.clear();
                inner.last_warn_bucket = 0;
                warn!(dropped, capacity = self.capacity, "queue cleared");
            } else {
                return Admission::Rejected(record);
            }
        }
        inner.records.push_back(record);
        self.warn_on_crossings(&mut inner);
        drop(inner);
        self.notify.notify_one();
        Admission::Accepted
    }

    /// Pops the oldest record, waiting up to `timeout` when the queue is empty
    /// so periodic flushes and shutdown stay observable.
    pub async fn pop(&self, timeout: Duration) -> Option<LogRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().expect("lock poisoned");
                if let Some(record) = inner.records.pop_front() {
                    self.decay_warn_bucket(&mut inner);
                    return Some(record);
                }
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return None;
            }
        }
    }

    /// Pops without waiting; used while draining at shutdown.
    pub fn try_pop(&self) -> Option<LogRecord> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        let record = inner.records.pop_front()?;
        self.decay_warn_bucket(&mut inner);
        Some(record)
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("lock poisoned");
        QueueStats {
            depth: inner.records.len(),
            capacity: self.capacity,
            last_warn_bucket: inner.last_warn_bucket,
        }
    }

    /// Fires exactly one warning per upward 20% crossing.
    fn warn_on_crossings(&self, inner: &mut Inner) {
        let bucket = (inner.records.len() * WARN_BUCKETS / self.capacity).min(WARN_BUCKETS - 1) as u8;
        while inner.last_warn_bucket < bucket {
            inner.last_warn_bucket += 1;
            warn!(
                depth = inner.records.len(),
                capacity = self.capacity,
                "queue {}% full",
                inner.last_warn_bucket as usize * 100 / WARN_BUCKETS
            );
        }
    }

    /// Re-arms a warning level once depth drops back under its boundary.
    fn decay_warn_bucket(&self, inner: &mut Inner) {
        if inner.last_warn_bucket == 0 {
            return;
        }
        let boundary = inner.last_warn_bucket as usize * self.capacity / WARN_BUCKETS;
        if inner.records.len() < boundary {
            inner.last_warn_bucket -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{OverflowPolicy, SourceId};
    use std::collections::BTreeMap;

    fn record(n: usize) -> LogRecord {
        LogRecord {
            text: format!("line {n}"),
            timestamp_ns: n as i64,
            labels: BTreeMap::new(),
            source_id: SourceId::new("svc", "cat", "/tmp/a.log"),
            overflow_policy: OverflowPolicy::Drop,
            wal_seq: None,
        }
    }

    #[tokio::test]
    async fn accepts_until_capacity_then_rejects() {
        let queue = BoundedQueue::bounded(3);
        for n in 0..3 {
            assert!(matches!(queue.offer(record(n)), Admission::Accepted));
        }
        match queue.offer(record(3)) {
            Admission::Rejected(rejected) => assert_eq!(rejected.text, "line 3"),
            Admission::Accepted => panic!("expected rejection at capacity"),
        }
        assert_eq!(queue.stats().depth, 3);
    }

    #[tokio::test]
    async fn preserves_fifo_order() {
        let queue = BoundedQueue::bounded(10);
        for n in 0..5 {
            queue.offer(record(n));
        }
        for n in 0..5 {
            let popped = queue.pop(Duration::from_millis(10)).await.unwrap();
            assert_eq!(popped.text, format!("line {n}"));
        }
    }

    #[tokio::test]
    async fn pop_times_out_when_empty() {
        let queue = BoundedQueue::bounded(10);
        assert!(queue.pop(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn warns_once_per_upward_crossing() {
        let queue = BoundedQueue::bounded(10);
        for n in 0..2 {
            queue.offer(record(n));
        }
        assert_eq!(queue.stats().last_warn_bucket, 1); // crossed 20%

        // More records within the same bucket do not re-arm the warning.
        queue.offer(record(2));
        queue.offer(record(3));
        assert_eq!(queue.stats().last_warn_bucket, 2); // crossed 40% at depth 4

        for n in 4..8 {
            queue.offer(record(n));
        }
        assert_eq!(queue.stats().last_warn_bucket, 4); // 60% and 80% crossed
    }

    #[tokio::test]
    async fn warn_bucket_decays_as_queue_drains() {
        let queue = BoundedQueue::bounded(10);
        for n in 0..8 {
            queue.offer(record(n));
        }
        assert_eq!(queue.stats().last_warn_bucket, 4);

        // Draining below 80% re-arms that warning, and so on down.
        queue.pop(Duration::from_millis(10)).await.unwrap();
        assert_eq!(queue.stats().last_warn_bucket, 3);
        for _ in 0..7 {
            queue.pop(Duration::from_millis(10)).await.unwrap();
        }
        assert_eq!(queue.stats().last_warn_bucket, 0);

        // A fresh climb warns again.
        queue.offer(record(100));
        queue.offer(record(101));
        assert_eq!(queue.stats().last_warn_bucket, 1);
    }

    #[tokio::test]
    async fn legacy_mode_clears_at_capacity() {
        let queue = BoundedQueue::legacy();
        for n in 0..DEFAULT_CAPACITY {
            assert!(matches!(queue.offer(record(n)), Admission::Accepted));
        }
        assert_eq!(queue.stats().depth, DEFAULT_CAPACITY);

        // The record that would overflow triggers the wholesale clear and is
        // then admitted normally.
        assert!(matches!(queue.offer(record(DEFAULT_CAPACITY)), Admission::Accepted));
        assert_eq!(queue.stats().depth, 1);
        assert_eq!(queue.stats().last_warn_bucket, 0);
    }
}
