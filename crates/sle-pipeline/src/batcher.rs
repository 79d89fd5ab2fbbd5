// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Accumulates queued records into per-source, size-bounded batches.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::pipeline::SourceRegistry;
use crate::queue::BoundedQueue;
use crate::record::{LogRecord, OverflowPolicy, SourceId};

/// A batch's first record waits at most this long before flushing.
const FLUSH_DEADLINE: Duration = Duration::from_secs(1);
/// Queue poll granularity; bounds how late a deadline flush can be.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ordered group of records from a single source, shipped in one request.
#[derive(Debug, Clone)]
pub struct Batch {
    pub source_id: SourceId,
    pub policy: OverflowPolicy,
    pub records: Vec<LogRecord>,
    /// WAL segments to unlink once the batch is delivered.
    pub wal_segments: Vec<u64>,
}

#[derive(Debug)]
struct Pending {
    records: Vec<LogRecord>,
    wal_segments: Vec<u64>,
    policy: OverflowPolicy,
    first_at: Instant,
}

impl Pending {
    fn into_batch(self, source_id: SourceId) -> Batch {
        Batch {
            source_id,
            policy: self.policy,
            records: self.records,
            wal_segments: self.wal_segments,
        }
    }
}

/// Service task between the queue and the exporter. With `buffer_size` of 1
/// (the default) it degenerates into a pass-through.
pub struct Batcher {
    queue: Arc<BoundedQueue>,
    registry: Arc<SourceRegistry>,
    tx: mpsc::Sender<Batch>,
    cancel: CancellationToken,
}

impl Batcher {
    pub fn new(
        queue: Arc<BoundedQueue>,
        registry: Arc<SourceRegistry>,
        tx: mpsc::Sender<Batch>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            queue,
            registry,
            tx,
            cancel,
        }
    }

    pub async fn run(self) {
        debug!("batcher started");
        let mut pending: HashMap<SourceId, Pending> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                record = self.queue.pop(POLL_INTERVAL) => {
                    if let Some(record) = record {
                        if self.push(&mut pending, record).await.is_err() {
                            return;
                        }
                    }
                    if self.flush_expired(&mut pending).await.is_err() {
                        return;
                    }
                }
            }
        }

        // Shutdown: drain whatever the watchers managed to enqueue, then
        // flush every pending batch.
        while let Some(record) = self.queue.try_pop() {
            if self.push(&mut pending, record).await.is_err() {
                return;
            }
        }
        for (source_id, entry) in pending.drain() {
            let _ = self.tx.send(entry.into_batch(source_id)).await;
        }
        debug!("batcher stopped");
    }

    /// Appends a record to its source batch, flushing at `buffer_size`.
    /// Errors only when the exporter side is gone.
    async fn push(&self, pending: &mut HashMap<SourceId, Pending>, record: LogRecord) -> Result<(), ()> {
        let source_id = record.source_id.clone();
        let entry = pending.entry(source_id.clone()).or_insert_with(|| Pending {
            records: Vec::new(),
            wal_segments: Vec::new(),
            policy: record.overflow_policy,
            first_at: Instant::now(),
        });
        if let Some(seq) = record.wal_seq {
            entry.wal_segments.push(seq);
        }
        entry.records.push(record);

        if entry.records.len() >= self.registry.buffer_size(&source_id) {
            if let Some(entry) = pending.remove(&source_id) {
                self.send(entry.into_batch(source_id)).await?;
            }
        }
        Ok(())
    }

    async fn flush_expired(&self, pending: &mut HashMap<SourceId, Pending>) -> Result<(), ()> {
        let expired: Vec<SourceId> = pending
            .iter()
            .filter(|(_, entry)| entry.first_at.elapsed() >= FLUSH_DEADLINE)
            .map(|(source_id, _)| source_id.clone())
            .collect();
        for source_id in expired {
            if let Some(entry) = pending.remove(&source_id) {
                self.send(entry.into_batch(source_id)).await?;
            }
        }
        Ok(())
    }

    async fn send(&self, batch: Batch) -> Result<(), ()> {
        self.tx.send(batch).await.map_err(|_| ())
    }
}
