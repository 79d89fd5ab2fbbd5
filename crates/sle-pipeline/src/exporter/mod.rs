// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Backend dispatch: serialize a batch once per backend kind, fan it out to
//! every endpoint concurrently, and retry transient failures per endpoint.

mod generic;
mod loki;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::batcher::Batch;
use crate::record::{BackendKind, BackendSpec, OverflowPolicy};
use crate::wal::{CommitSink, Wal};

/// Total deadline for one HTTP request.
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BASE: Duration = Duration::from_millis(100);
const RETRY_CAP: Duration = Duration::from_secs(5);
/// Retries per endpoint attempt, on top of the initial request.
const MAX_RETRIES: u32 = 4;

/// Stateless send half: one serialized payload per backend kind, POSTed to
/// all endpoints concurrently.
#[derive(Clone)]
pub struct Dispatch {
    backends: Vec<BackendSpec>,
    client: reqwest::Client,
}

impl Dispatch {
    pub fn new(backends: Vec<BackendSpec>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                error!(%err, "failed to build http client, using defaults");
                reqwest::Client::new()
            });
        Self { backends, client }
    }

    /// Delivered when at least one endpoint accepts the batch (HA semantics:
    /// any surviving backend).
    pub async fn send(&self, batch: &Batch) -> bool {
        self.send_with_retries(batch, MAX_RETRIES).await
    }

    pub async fn send_with_retries(&self, batch: &Batch, max_retries: u32) -> bool {
        let mut requests = JoinSet::new();
        for backend in &self.backends {
            let payload = match backend.kind {
                BackendKind::Loki => loki::payload(batch),
                _ => generic::payload(batch),
            };
            for endpoint in &backend.endpoints {
                let url = request_url(backend.kind, endpoint);
                let client = self.client.clone();
                let body = payload.clone();
                requests.spawn(async move { post_with_retry(client, url, body, max_retries).await });
            }
        }

        let mut delivered = false;
        while let Some(result) = requests.join_next().await {
            if matches!(result, Ok(true)) {
                delivered = true;
            }
        }
        delivered
    }
}

fn request_url(kind: BackendKind, endpoint: &str) -> String {
    match kind {
        BackendKind::Loki => format!("{}{}", endpoint.trim_end_matches('/'), loki::PUSH_PATH),
        _ => endpoint.to_string(),
    }
}

/// One endpoint attempt with exponential backoff on connection errors and
/// retryable statuses. Any other 4xx means the payload is poisoned for this
/// endpoint and is not retried.
async fn post_with_retry(
    client: reqwest::Client,
    url: String,
    body: serde_json::Value,
    max_retries: u32,
) -> bool {
    let mut backoff = RETRY_BASE;
    for attempt in 0..=max_retries {
        match client.post(&url).json(&body).send().await {
            Ok(response) if response.status().is_success() => return true,
            Ok(response) => {
                let status = response.status();
                let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
                if !retryable {
                    warn!(%url, %status, "backend rejected batch, dropping");
                    return false;
                }
                debug!(%url, %status, attempt, "backend error");
            }
            Err(err) => {
                debug!(%url, %err, attempt, "request failed");
            }
        }
        if attempt < max_retries {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(RETRY_CAP);
        }
    }
    false
}

/// Observable delivery counters.
#[derive(Debug, Default)]
pub struct ExporterStats {
    pub delivered_batches: AtomicU64,
    pub failed_batches: AtomicU64,
    pub dropped_records: AtomicU64,
}

/// Service task consuming flushed batches. Delivery commits any replayed WAL
/// segments; total failure dispatches each record on its overflow policy.
///
/// The receiver sits behind a shared mutex so the supervisor can rebuild the
/// service after a crash without losing the channel.
pub struct ExporterService {
    dispatch: Dispatch,
    commit: Arc<dyn CommitSink>,
    wal: Arc<Wal>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
    cancel: CancellationToken,
    stats: Arc<ExporterStats>,
}

impl ExporterService {
    pub fn new(
        dispatch: Dispatch,
        commit: Arc<dyn CommitSink>,
        wal: Arc<Wal>,
        rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Batch>>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            dispatch,
            commit,
            wal,
            rx,
            cancel,
            stats: Arc::new(ExporterStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ExporterStats> {
        Arc::clone(&self.stats)
    }

    /// Runs until every sender is gone, so batches flushed during shutdown
    /// still get a final delivery attempt.
    pub async fn run(self) {
        debug!("exporter started");
        let mut rx = self.rx.lock().await;
        while let Some(batch) = rx.recv().await {
            if self.cancel.is_cancelled() {
                self.handle_shutdown(batch).await;
            } else {
                self.handle(batch).await;
            }
        }
        debug!("exporter stopped");
    }

    async fn handle(&self, batch: Batch) {
        if self.dispatch.send(&batch).await {
            self.complete(&batch).await;
        } else {
            self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
            warn!(source = %batch.source_id, records = batch.records.len(),
                "batch rejected by every endpoint");
            for record in batch.records {
                // Replayed records are already durable on disk.
                if record.wal_seq.is_some() {
                    continue;
                }
                match record.overflow_policy {
                    OverflowPolicy::Disk => {
                        if let Err(err) = self.wal.append(&record).await {
                            self.stats.dropped_records.fetch_add(1, Ordering::Relaxed);
                            error!(%err, "wal write failed, dropping record");
                        }
                    }
                    OverflowPolicy::Drop => {
                        self.stats.dropped_records.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    /// Shutdown path: make Disk records durable first, then attempt one
    /// retry-less flush so a healthy backend still gets the data in time.
    async fn handle_shutdown(&self, mut batch: Batch) {
        for record in &mut batch.records {
            if record.overflow_policy == OverflowPolicy::Disk && record.wal_seq.is_none() {
                match self.wal.append(record).await {
                    Ok(seq) => {
                        record.wal_seq = Some(seq);
                        batch.wal_segments.push(seq);
                    }
                    Err(err) => error!(%err, "wal write failed during shutdown"),
                }
            }
        }
        if self.dispatch.send_with_retries(&batch, 0).await {
            self.complete(&batch).await;
        } else {
            self.stats.failed_batches.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn complete(&self, batch: &Batch) {
        self.stats.delivered_batches.fetch_add(1, Ordering::Relaxed);
        if !batch.wal_segments.is_empty() {
            self.commit.commit(&batch.source_id, &batch.wal_segments).await;
        }
        debug!(source = %batch.source_id, records = batch.records.len(), "batch delivered");
    }
}
