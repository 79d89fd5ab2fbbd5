// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Source discovery: glob expansion, watcher reconciliation and auto-reload.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{Pipeline, SourceRegistry};
use crate::record::{SourceId, SourceSpec};
use crate::watcher::file::FileWatcher;

/// How many reconcile cycles a glob-matched path may be absent before its
/// watcher is reaped; tolerates a brief rename during rotation.
const DISAPPEARANCE_GRACE_CYCLES: u32 = 1;

/// Re-resolves the source set on each auto-reload cycle. Returning `None`
/// means the reload failed and the previous set is retained.
pub trait SourceProvider: Send + Sync {
    fn sources(&self) -> Option<Vec<SourceSpec>>;
}

struct WatcherEntry {
    source_id: SourceId,
    cancel: CancellationToken,
    missing_cycles: u32,
    handle: tokio::task::JoinHandle<()>,
}

/// Owns every file watcher: expands glob-patterned specs at startup and every
/// `auto_reload` seconds, spawns watchers for newly matched paths and reaps
/// watchers whose path stayed absent for a full grace cycle. Literal paths
/// bypass expansion but share the same reconciliation, which guarantees a
/// path is never tailed twice.
pub struct Discovery {
    sources: Vec<SourceSpec>,
    provider: Arc<dyn SourceProvider>,
    pipeline: Pipeline,
    registry: Arc<SourceRegistry>,
    auto_reload_secs: u64,
    cancel: CancellationToken,
    watchers: HashMap<PathBuf, WatcherEntry>,
    warned_patterns: HashSet<String>,
}

impl Discovery {
    pub fn new(
        sources: Vec<SourceSpec>,
        provider: Arc<dyn SourceProvider>,
        pipeline: Pipeline,
        registry: Arc<SourceRegistry>,
        auto_reload_secs: u64,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sources,
            provider,
            pipeline,
            registry,
            auto_reload_secs,
            cancel,
            watchers: HashMap::new(),
            warned_patterns: HashSet::new(),
        }
    }

    pub async fn run(mut self) {
        self.reconcile();

        if self.auto_reload_secs == 0 {
            self.cancel.cancelled().await;
            self.shutdown();
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.auto_reload_secs));
        ticker.tick().await; // discard the immediate first tick
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.provider.sources() {
                        Some(sources) => self.sources = sources,
                        None => warn!("config reload failed, retaining previous sources"),
                    }
                    self.reconcile();
                }
            }
        }
        self.shutdown();
    }

    /// Set-based reconciliation of live watchers against the current matches.
    fn reconcile(&mut self) {
        let mut desired: HashMap<PathBuf, SourceSpec> = HashMap::new();
        for spec in &self.sources {
            if spec.is_pattern() {
                let matches = expand_pattern(&spec.path);
                if matches.is_empty() && self.warned_patterns.insert(spec.path.clone()) {
                    warn!(pattern = %spec.path, "glob pattern matched no files");
                }
                for path in matches {
                    desired.entry(path).or_insert_with(|| spec.clone());
                }
            } else {
                desired
                    .entry(PathBuf::from(&spec.path))
                    .or_insert_with(|| spec.clone());
            }
        }

        for (path, spec) in &desired {
            let respawn = match self.watchers.get_mut(path) {
                // A live watcher only ends when cancelled; a finished task
                // with its path still desired means it crashed.
                Some(entry) if entry.handle.is_finished() => true,
                Some(entry) => {
                    entry.missing_cycles = 0;
                    false
                }
                None => true,
            };
            if respawn {
                if let Some(entry) = self.watchers.remove(path) {
                    warn!(path = %path.display(), "file watcher died, respawning");
                    entry.cancel.cancel();
                    self.registry.unregister(&entry.source_id);
                }
                self.spawn_watcher(path.clone(), spec.clone());
            }
        }

        let absent: Vec<PathBuf> = self
            .watchers
            .keys()
            .filter(|path| !desired.contains_key(*path))
            .cloned()
            .collect();
        for path in absent {
            let reap = match self.watchers.get_mut(&path) {
                Some(entry) => {
                    entry.missing_cycles += 1;
                    entry.missing_cycles > DISAPPEARANCE_GRACE_CYCLES
                }
                None => false,
            };
            if reap {
                if let Some(entry) = self.watchers.remove(&path) {
                    info!(path = %path.display(), "path disappeared, stopping its watcher");
                    entry.cancel.cancel();
                    self.registry.unregister(&entry.source_id);
                }
            }
        }
    }

    /// Rate limit and buffer size apply per matched file, not per pattern.
    fn spawn_watcher(&mut self, path: PathBuf, spec: SourceSpec) {
        let source_id = spec.source_id_for(&path.to_string_lossy());
        self.registry.register(source_id.clone(), spec.buffer_size);

        let cancel = self.cancel.child_token();
        let watcher = FileWatcher::new(spec, path.clone(), self.pipeline.clone(), cancel.clone());
        let handle = tokio::spawn(watcher.run());
        debug!(path = %path.display(), "spawned file watcher");

        self.watchers.insert(
            path,
            WatcherEntry {
                source_id,
                cancel,
                missing_cycles: 0,
                handle,
            },
        );
    }

    fn shutdown(&mut self) {
        for (_, entry) in self.watchers.drain() {
            entry.cancel.cancel();
        }
    }
}

fn expand_pattern(pattern: &str) -> Vec<PathBuf> {
    match glob::glob(pattern) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(err) => {
            warn!(pattern, %err, "invalid glob pattern");
            Vec::new()
        }
    }
}
