// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Tails one concrete file path, detecting rotation and truncation.

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;
use crate::record::{SourceId, SourceSpec};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const OPEN_BACKOFF_START: Duration = Duration::from_secs(1);
const OPEN_BACKOFF_CAP: Duration = Duration::from_secs(30);
const READ_CHUNK: usize = 64 * 1024;

/// `(device, inode)` of the open handle; a mismatch against the path's current
/// stat means the file was rotated out from under us.
type FileIdentity = (u64, u64);

pub struct FileWatcher {
    spec: SourceSpec,
    path: PathBuf,
    source_id: SourceId,
    pipeline: Pipeline,
    cancel: CancellationToken,
}

impl FileWatcher {
    pub fn new(spec: SourceSpec, path: PathBuf, pipeline: Pipeline, cancel: CancellationToken) -> Self {
        let source_id = spec.source_id_for(&path.to_string_lossy());
        Self {
            spec,
            path,
            source_id,
            pipeline,
            cancel,
        }
    }

    /// OPENING → READING → ROTATED → OPENING, until cancelled.
    pub async fn run(self) {
        info!(path = %self.path.display(), source = %self.source_id, "watching file");
        loop {
            let Some((file, identity, offset)) = self.open_at_end().await else {
                break;
            };
            if !self.read_loop(file, identity, offset).await {
                break;
            }
            debug!(path = %self.path.display(), "file rotated, reopening");
        }
        debug!(path = %self.path.display(), "file watcher stopped");
    }

    /// Opens the path and seeks to its end (historical content is never
    /// replayed). Missing files are retried with bounded backoff.
    async fn open_at_end(&self) -> Option<(File, FileIdentity, u64)> {
        let mut backoff = OPEN_BACKOFF_START;
        loop {
            if self.cancel.is_cancelled() {
                return None;
            }
            match self.try_open().await {
                Ok(opened) => return Some(opened),
                Err(err) => {
                    debug!(path = %self.path.display(), %err, "waiting for file");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return None,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(OPEN_BACKOFF_CAP);
        }
    }

    async fn try_open(&self) -> std::io::Result<(File, FileIdentity, u64)> {
        let mut file = File::open(&self.path).await?;
        let meta = file.metadata().await?;
        let offset = file.seek(SeekFrom::End(0)).await?;
        Ok((file, (meta.dev(), meta.ino()), offset))
    }

    /// Returns `true` when the file rotated and should be reopened, `false`
    /// on cancellation. Any partial trailing line stays buffered across
    /// reads and is discarded on rotation.
    async fn read_loop(&self, mut file: File, identity: FileIdentity, mut offset: u64) -> bool {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut partial: Vec<u8> = Vec::new();

        loop {
            if self.cancel.is_cancelled() {
                return false;
            }

            let read = match file.read(&mut chunk).await {
                Ok(read) => read,
                Err(err) => {
                    warn!(path = %self.path.display(), %err, "read failed, reopening");
                    return true;
                }
            };
            if read > 0 {
                offset += read as u64;
                partial.extend_from_slice(&chunk[..read]);
                self.drain_lines(&mut partial).await;
                continue;
            }

            // Drained; sleep, then check for rotation or truncation.
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(POLL_INTERVAL) => {}
            }
            match tokio::fs::metadata(&self.path).await {
                Err(_) => return true,
                Ok(meta) => {
                    if (meta.dev(), meta.ino()) != identity {
                        return true;
                    }
                    if meta.len() < offset {
                        debug!(path = %self.path.display(), "file truncated, seeking to start");
                        if file.seek(SeekFrom::Start(0)).await.is_err() {
                            return true;
                        }
                        offset = 0;
                        partial.clear();
                    }
                }
            }
        }
    }

    /// Emits every complete record in the buffer; the remainder carries over.
    async fn drain_lines(&self, partial: &mut Vec<u8>) {
        let delimiter = &self.spec.delimiter;
        while let Some(pos) = find_delimiter(partial, delimiter) {
            let line: Vec<u8> = partial.drain(..pos + delimiter.len()).collect();
            let text = String::from_utf8_lossy(&line[..pos]);
            self.pipeline.emit_line(&self.spec, &self.source_id, &text).await;
        }
    }
}

fn find_delimiter(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}
