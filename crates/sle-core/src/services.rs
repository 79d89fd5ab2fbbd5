// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Supervisor: builds the pipeline, replays the WAL, spawns the watchers and
//! drives graceful shutdown.

use std::collections::VecDeque;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sle_pipeline::batcher::{Batch, Batcher};
use sle_pipeline::exporter::{Dispatch, ExporterService};
use sle_pipeline::pipeline::{Pipeline, SourceRegistry};
use sle_pipeline::queue::BoundedQueue;
use sle_pipeline::rate_limit::RateLimiter;
use sle_pipeline::record::SourceSpec;
use sle_pipeline::wal::{CommitSink, Wal, DEFAULT_WAL_ROOT};
use sle_pipeline::watcher::{Discovery, JournaldWatcher, SourceProvider};

use crate::config::{Config, ConfigLoader, DEFAULT_CONFIG_DIR};
use crate::error::AgentError;

const BATCH_CHANNEL_BUFFER_SIZE: usize = 16;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Three crashes inside the window put a worker into cool-down.
const CRASH_LIMIT: usize = 3;
const CRASH_WINDOW: Duration = Duration::from_secs(60);
const CRASH_COOLDOWN: Duration = Duration::from_secs(60);

/// Owns the lifecycle of every pipeline task.
pub struct Services {
    config_dir: PathBuf,
    wal_root: PathBuf,
}

impl Default for Services {
    fn default() -> Self {
        Self::new(DEFAULT_CONFIG_DIR, DEFAULT_WAL_ROOT)
    }
}

impl Services {
    pub fn new(config_dir: impl Into<PathBuf>, wal_root: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
            wal_root: wal_root.into(),
        }
    }

    /// Loads the configuration, runs until SIGINT/SIGTERM, then shuts down.
    pub async fn run(self) -> Result<(), AgentError> {
        let loader = ConfigLoader::new(&self.config_dir);
        let config = loader
            .load()
            .map_err(|err| AgentError::Config(format!("{err:#}")))?;

        let shutdown = CancellationToken::new();
        install_signal_handler(shutdown.clone())?;
        self.run_with(config, loader, shutdown).await
    }

    /// Runs the wired pipeline until `shutdown` fires. Split out of `run` so
    /// tests can drive the lifecycle without process signals.
    async fn run_with(
        self,
        config: Config,
        loader: ConfigLoader,
        shutdown: CancellationToken,
    ) -> Result<(), AgentError> {
        info!("starting sle");

        let queue = Arc::new(match config.queue_size {
            Some(size) => BoundedQueue::bounded(size),
            None => BoundedQueue::legacy(),
        });
        if queue.is_legacy() {
            info!(
                capacity = queue.capacity(),
                "QUEUE_SIZE not set: queue clears wholesale at capacity"
            );
        }
        let wal = Arc::new(Wal::new(&self.wal_root));
        let registry = Arc::new(SourceRegistry::default());
        let pipeline = Pipeline::new(Arc::clone(&queue), Arc::new(RateLimiter::new()), Arc::clone(&wal));

        // Replayed segments enter the queue before any watcher starts, so
        // recovered records precede fresh traffic from the same source.
        let replayed = wal.replay().await;
        if !replayed.is_empty() {
            info!(records = replayed.len(), "replaying wal segments");
            pipeline.inject_replay(replayed).await;
        }

        let (batch_tx, batch_rx) = mpsc::channel::<Batch>(BATCH_CHANNEL_BUFFER_SIZE);
        let batch_rx = Arc::new(tokio::sync::Mutex::new(batch_rx));

        let exporter_handle = {
            let dispatch = Dispatch::new(config.backends.clone());
            let commit: Arc<dyn CommitSink> = Arc::clone(&wal) as Arc<dyn CommitSink>;
            let wal = Arc::clone(&wal);
            tokio::spawn(supervise("exporter", shutdown.child_token(), move |cancel| {
                ExporterService::new(
                    dispatch.clone(),
                    Arc::clone(&commit),
                    Arc::clone(&wal),
                    Arc::clone(&batch_rx),
                    cancel,
                )
                .run()
            }))
        };

        let batcher_handle = {
            let queue = Arc::clone(&queue);
            let registry = Arc::clone(&registry);
            tokio::spawn(supervise("batcher", shutdown.child_token(), move |cancel| {
                Batcher::new(Arc::clone(&queue), Arc::clone(&registry), batch_tx.clone(), cancel)
                    .run()
            }))
        };

        let provider: Arc<dyn SourceProvider> = Arc::new(ReloadProvider { loader });
        {
            let sources = config.sources.clone();
            let auto_reload_secs = config.auto_reload_secs;
            let pipeline = pipeline.clone();
            let registry = Arc::clone(&registry);
            tokio::spawn(supervise("discovery", shutdown.child_token(), move |cancel| {
                Discovery::new(
                    sources.clone(),
                    Arc::clone(&provider),
                    pipeline.clone(),
                    Arc::clone(&registry),
                    auto_reload_secs,
                    cancel,
                )
                .run()
            }));
        }

        if config.journald {
            let labels = config.journald_labels.clone();
            let pipeline = pipeline.clone();
            tokio::spawn(supervise("journald", shutdown.child_token(), move |cancel| {
                JournaldWatcher::new(labels.clone(), pipeline.clone(), cancel).run()
            }));
        }

        info!(
            sources = config.sources.len(),
            backends = config.backends.len(),
            journald = config.journald,
            "sle running"
        );

        shutdown.cancelled().await;
        info!("shutting down");

        // The batcher flushes its pending batches and drops the sender; the
        // exporter drains the channel with one last delivery attempt each.
        let drain = async {
            let _ = batcher_handle.await;
            let _ = exporter_handle.await;
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain).await.is_err() {
            warn!("shutdown timed out, abandoning in-flight work");
        }
        info!("sle stopped");
        Ok(())
    }
}

/// Re-loads the config directory each auto-reload cycle; a failed reload
/// keeps the previous source set.
struct ReloadProvider {
    loader: ConfigLoader,
}

impl SourceProvider for ReloadProvider {
    fn sources(&self) -> Option<Vec<SourceSpec>> {
        match self.loader.load() {
            Ok(config) => Some(config.sources),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "config reload failed");
                None
            }
        }
    }
}

fn install_signal_handler(shutdown: CancellationToken) -> Result<(), AgentError> {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .map_err(|err| AgentError::Runtime(format!("failed to install signal handler: {err}")))?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = sigterm.recv() => info!("SIGTERM received"),
        }
        shutdown.cancel();
    });
    Ok(())
}

/// Restarts a crashed worker, backing off for a minute once it has crashed
/// three times within the window. Clean exits (cancellation) end the loop.
///
/// Each attempt runs under its own child token, cancelled as soon as the
/// attempt's task ends, so anything a crashed worker spawned (file watchers
/// under a crashed discovery, say) is torn down before the replacement
/// starts.
async fn supervise<F, Fut>(name: &'static str, cancel: CancellationToken, factory: F)
where
    F: Fn(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let mut crashes: VecDeque<Instant> = VecDeque::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let attempt = cancel.child_token();
        let result = tokio::spawn(factory(attempt.clone())).await;
        attempt.cancel();
        match result {
            Ok(()) => break,
            Err(err) => {
                error!(worker = name, %err, "worker crashed, restarting");
                let now = Instant::now();
                crashes.push_back(now);
                while crashes
                    .front()
                    .is_some_and(|first| now.duration_since(*first) > CRASH_WINDOW)
                {
                    crashes.pop_front();
                }
                if crashes.len() >= CRASH_LIMIT {
                    warn!(worker = name, "crash loop detected, cooling down");
                    crashes.clear();
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(CRASH_COOLDOWN) => {}
                    }
                }
            }
        }
    }
}
