// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Streams systemd journal entries as log records via `journalctl -f`.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{now_ns, Pipeline};
use crate::record::{LogRecord, OverflowPolicy, SourceId, JOB_LABEL};

const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Tails the journal from the present; no cursor is persisted across
/// restarts.
pub struct JournaldWatcher {
    labels: BTreeMap<String, String>,
    pipeline: Pipeline,
    cancel: CancellationToken,
}

impl JournaldWatcher {
    pub fn new(
        labels: BTreeMap<String, String>,
        pipeline: Pipeline,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            labels,
            pipeline,
            cancel,
        }
    }

    pub async fn run(self) {
        info!("watching systemd journal");
        let mut backoff = BACKOFF_START;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.stream().await {
                Ok(()) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    warn!("journalctl exited, restarting");
                    backoff = BACKOFF_START;
                }
                Err(err) => {
                    warn!(%err, "journal read failed");
                }
            }
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_CAP);
        }
        debug!("journal watcher stopped");
    }

    async fn stream(&self) -> std::io::Result<()> {
        let mut child = Command::new("journalctl")
            .args(["-f", "-o", "json", "--no-pager"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::Other, "journalctl stdout unavailable")
        })?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = child.start_kill();
                    break;
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if let Some(record) = parse_entry(&line, &self.labels) {
                            self.pipeline.emit(None, record).await;
                        }
                    }
                    None => break,
                }
            }
        }
        let _ = child.wait().await;
        Ok(())
    }
}

/// Builds a record from one `journalctl -o json` line. Entries without a
/// usable string `MESSAGE` are skipped; unparseable lines are debug-logged.
pub(crate) fn parse_entry(line: &str, extra_labels: &BTreeMap<String, String>) -> Option<LogRecord> {
    let entry: serde_json::Value = match serde_json::from_str(line) {
        Ok(entry) => entry,
        Err(err) => {
            debug!(%err, "skipping unparseable journal line");
            return None;
        }
    };

    let message = entry.get("MESSAGE")?.as_str()?;
    if message.is_empty() {
        return None;
    }

    // Prefer the owning unit; fall back to the syslog identifier.
    let unit = entry
        .get("_SYSTEMD_UNIT")
        .and_then(|v| v.as_str())
        .map(|u| u.trim_end_matches(".service"))
        .filter(|u| !u.is_empty())
        .or_else(|| entry.get("SYSLOG_IDENTIFIER").and_then(|v| v.as_str()))
        .unwrap_or("unknown")
        .to_string();

    let timestamp_ns = entry
        .get("__REALTIME_TIMESTAMP")
        .and_then(|v| v.as_str())
        .and_then(|us| us.parse::<i64>().ok())
        .and_then(|us| us.checked_mul(1000))
        .unwrap_or_else(now_ns);

    let subname = unit.to_uppercase();
    let filepath = format!("journald:{unit}");

    let mut labels = extra_labels.clone();
    labels.insert("job".to_string(), JOB_LABEL.to_string());
    labels.insert("name".to_string(), "journald".to_string());
    labels.insert("subname".to_string(), subname.clone());
    labels.insert("filepath".to_string(), filepath.clone());

    Some(LogRecord {
        text: message.to_string(),
        timestamp_ns,
        labels,
        source_id: SourceId::new("journald", subname, filepath),
        overflow_policy: OverflowPolicy::Drop,
        wal_seq: None,
    })
}
