// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Watcher-side admission path: enrich, rate-limit, offer, and dispatch
//! rejections on the record's overflow policy.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, error, warn};

use crate::enrich;
use crate::queue::{Admission, BoundedQueue};
use crate::rate_limit::RateLimiter;
use crate::record::{LogRecord, OverflowPolicy, SourceId, SourceSpec, JOB_LABEL};
use crate::wal::Wal;

/// Wall-clock nanoseconds since the epoch.
pub fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

/// Counters for records that never reached the queue or a backend.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub rate_limited: AtomicU64,
    pub dropped_records: AtomicU64,
    pub wal_failures: AtomicU64,
}

/// Per-source batch sizes, registered as watchers come and go so the batcher
/// can look them up for dynamically discovered files.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    sizes: Mutex<HashMap<SourceId, usize>>,
}

impl SourceRegistry {
    pub fn register(&self, source_id: SourceId, buffer_size: usize) {
        self.sizes
            .lock()
            .expect("lock poisoned")
            .insert(source_id, buffer_size.max(1));
    }

    pub fn unregister(&self, source_id: &SourceId) {
        self.sizes.lock().expect("lock poisoned").remove(source_id);
    }

    pub fn buffer_size(&self, source_id: &SourceId) -> usize {
        self.sizes
            .lock()
            .expect("lock poisoned")
            .get(source_id)
            .copied()
            .unwrap_or(1)
    }
}

/// Cheap-to-clone handle every watcher emits through.
#[derive(Clone)]
pub struct Pipeline {
    queue: Arc<BoundedQueue>,
    limiter: Arc<RateLimiter>,
    wal: Arc<Wal>,
    stats: Arc<PipelineStats>,
}

impl Pipeline {
    pub fn new(queue: Arc<BoundedQueue>, limiter: Arc<RateLimiter>, wal: Arc<Wal>) -> Self {
        Self {
            queue,
            limiter,
            wal,
            stats: Arc::new(PipelineStats::default()),
        }
    }

    pub fn queue(&self) -> &Arc<BoundedQueue> {
        &self.queue
    }

    pub fn stats(&self) -> &PipelineStats {
        &self.stats
    }

    /// Builds a record from one raw line read for `source_id` and runs the
    /// full admission path. Empty lines are skipped.
    pub async fn emit_line(&self, spec: &SourceSpec, source_id: &SourceId, raw: &str) {
        if raw.is_empty() {
            return;
        }

        let enriched = enrich::enrich(raw, now_ns());

        let mut labels = spec.labels.clone();
        labels.insert("job".to_string(), JOB_LABEL.to_string());
        labels.insert("name".to_string(), spec.service.clone());
        labels.insert("subname".to_string(), spec.category.clone());
        labels.insert("filepath".to_string(), source_id.filepath.clone());
        if let Some(level) = enriched.level {
            labels.insert("level".to_string(), level.to_string());
        }

        let record = LogRecord {
            text: enriched.text,
            timestamp_ns: enriched.timestamp_ns,
            labels,
            source_id: source_id.clone(),
            overflow_policy: spec.overflow_policy,
            wal_seq: None,
        };
        self.emit(spec.rate_limit, record).await;
    }

    /// Admission for an already-built record (journal entries).
    pub async fn emit(&self, rate_limit: Option<f64>, record: LogRecord) {
        if !self.limiter.try_acquire(&record.source_id, rate_limit) {
            self.stats.rate_limited.fetch_add(1, Ordering::Relaxed);
            self.overflow(record, "rate limit").await;
            return;
        }
        if let Admission::Rejected(record) = self.queue.offer(record) {
            self.overflow(record, "queue").await;
        }
    }

    /// Re-injects replayed WAL records ahead of live traffic. A rejected
    /// replay stays durable on disk and will be retried on the next start.
    pub async fn inject_replay(&self, records: Vec<LogRecord>) {
        for record in records {
            if let Admission::Rejected(record) = self.queue.offer(record) {
                warn!(source = %record.source_id, "queue full during wal replay, leaving segment on disk");
            }
        }
    }

    async fn overflow(&self, record: LogRecord, rejected_by: &str) {
        match record.overflow_policy {
            OverflowPolicy::Drop => {
                self.stats.dropped_records.fetch_add(1, Ordering::Relaxed);
                debug!(source = %record.source_id, rejected_by, "record dropped");
            }
            OverflowPolicy::Disk => {
                if let Err(err) = self.wal.append(&record).await {
                    self.stats.wal_failures.fetch_add(1, Ordering::Relaxed);
                    error!(source = %record.source_id, %err, "wal write failed, dropping record");
                }
            }
        }
    }
}
