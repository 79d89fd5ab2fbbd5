// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Disk write-ahead log: per-source overflow store with replay on startup.
//!
//! One segment file per record keeps partial failures recoverable: a record
//! only counts as durable once its fsynced temporary file has been renamed to
//! `<seq>.rec`, and the segment is unlinked only after the exporter confirms
//! delivery.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, warn};

use crate::record::{LogRecord, SourceId};

/// Default WAL location on a production host.
pub const DEFAULT_WAL_ROOT: &str = "/var/lib/sle/buffer";

const SEGMENT_EXT: &str = "rec";
const QUARANTINE_EXT: &str = "bad";
/// Segments older than this at startup are removed unread.
const MAX_SEGMENT_AGE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum WalError {
    #[error("wal io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("wal encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Confirms delivery so durable segments can be released. The exporter
/// consumes this trait; the WAL is the production implementation, which keeps
/// the exporter/WAL relationship acyclic.
#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit(&self, source_id: &SourceId, segments: &[u64]);
}

/// Append-only segment store under `<root>/<service>/<category>/`.
#[derive(Debug)]
pub struct Wal {
    root: PathBuf,
    /// Next sequence per source directory, cached after the first scan.
    next_seq: tokio::sync::Mutex<HashMap<(String, String), u64>>,
}

impl Wal {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            next_seq: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn source_dir(&self, source_id: &SourceId) -> PathBuf {
        self.root.join(&source_id.service).join(&source_id.category)
    }

    /// Writes one record durably and returns its segment sequence number.
    pub async fn append(&self, record: &LogRecord) -> Result<u64, WalError> {
        let dir = self.source_dir(&record.source_id);
        fs::create_dir_all(&dir).await.map_err(|source| WalError::Io {
            path: dir.clone(),
            source,
        })?;

        // Sequence assignment and the write happen under one lock so segment
        // numbers are strictly increasing per source.
        let mut seqs = self.next_seq.lock().await;
        let key = (record.source_id.service.clone(), record.source_id.category.clone());
        let seq = match seqs.get(&key) {
            Some(next) => *next,
            None => scan_max_seq(&dir).await + 1,
        };

        let tmp = dir.join(format!("{seq}.{SEGMENT_EXT}.tmp"));
        let encoded = serde_json::to_vec(record)?;
        write_durably(&tmp, &encoded).await.map_err(|source| WalError::Io {
            path: tmp.clone(),
            source,
        })?;

        let segment = dir.join(format!("{seq}.{SEGMENT_EXT}"));
        fs::rename(&tmp, &segment).await.map_err(|source| WalError::Io {
            path: segment.clone(),
            source,
        })?;

        seqs.insert(key, seq + 1);
        debug!(segment = %segment.display(), "wal segment written");
        Ok(seq)
    }

    /// Startup replay: every surviving segment, in per-source sequence order,
    /// with its `wal_seq` set. Over-age segments are deleted unread, stray
    /// temporaries removed, and undecodable segments quarantined as `.bad`.
    pub async fn replay(&self) -> Vec<LogRecord> {
        let mut records = Vec::new();
        let Ok(mut services) = fs::read_dir(&self.root).await else {
            return records;
        };

        while let Ok(Some(service)) = services.next_entry().await {
            let Ok(mut categories) = fs::read_dir(service.path()).await else {
                continue;
            };
            while let Ok(Some(category)) = categories.next_entry().await {
                self.replay_dir(&category.path(), &mut records).await;
            }
        }
        records
    }

    async fn replay_dir(&self, dir: &Path, records: &mut Vec<LogRecord>) {
        let Ok(mut entries) = fs::read_dir(dir).await else {
            return;
        };

        let mut segments: Vec<(u64, PathBuf)> = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                let _ = fs::remove_file(&path).await;
                continue;
            }
            if let Some(seq) = segment_seq(&path) {
                segments.push((seq, path));
            }
        }
        segments.sort_by_key(|(seq, _)| *seq);

        for (seq, path) in segments {
            if is_over_age(&path).await {
                warn!(segment = %path.display(), "removing expired wal segment");
                let _ = fs::remove_file(&path).await;
                continue;
            }
            match fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<LogRecord>(&bytes) {
                    Ok(mut record) => {
                        record.wal_seq = Some(seq);
                        records.push(record);
                    }
                    Err(err) => {
                        warn!(segment = %path.display(), %err, "quarantining malformed wal segment");
                        let _ = fs::rename(&path, path.with_extension(QUARANTINE_EXT)).await;
                    }
                },
                Err(err) => {
                    error!(segment = %path.display(), %err, "failed to read wal segment");
                }
            }
        }
    }
}

#[async_trait]
impl CommitSink for Wal {
    /// Unlinks segments whose records were delivered.
    async fn commit(&self, source_id: &SourceId, segments: &[u64]) {
        let dir = self.source_dir(source_id);
        for seq in segments {
            let path = dir.join(format!("{seq}.{SEGMENT_EXT}"));
            if let Err(err) = fs::remove_file(&path).await {
                error!(segment = %path.display(), %err, "failed to unlink committed wal segment");
            }
        }
    }
}

async fn write_durably(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await
}

async fn scan_max_seq(dir: &Path) -> u64 {
    let mut max = 0;
    let Ok(mut entries) = fs::read_dir(dir).await else {
        return max;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Some(seq) = segment_seq(&entry.path()) {
            max = max.max(seq);
        }
    }
    max
}

fn segment_seq(path: &Path) -> Option<u64> {
    if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

async fn is_over_age(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path).await else {
        return false;
    };
    let Ok(modified) = meta.modified() else {
        return false;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age > MAX_SEGMENT_AGE)
        .unwrap_or(false)
}
