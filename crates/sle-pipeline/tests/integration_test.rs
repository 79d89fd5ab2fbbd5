// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! End-to-end pipeline tests: tempfile-backed tails through the queue,
//! batcher and exporter into mockito backends.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use sle_pipeline::batcher::Batcher;
use sle_pipeline::exporter::{Dispatch, ExporterService};
use sle_pipeline::pipeline::{Pipeline, SourceRegistry};
use sle_pipeline::queue::BoundedQueue;
use sle_pipeline::rate_limit::RateLimiter;
use sle_pipeline::record::{BackendKind, BackendSpec, OverflowPolicy, SourceSpec};
use sle_pipeline::wal::{CommitSink, Wal};
use sle_pipeline::watcher::{Discovery, FileWatcher, SourceProvider};

struct Stack {
    pipeline: Pipeline,
    wal: Arc<Wal>,
    registry: Arc<SourceRegistry>,
    cancel: CancellationToken,
}

/// Wires queue → batcher → exporter against the given backends, the way the
/// supervisor does in production.
fn start_stack(wal_root: &Path, backends: Vec<BackendSpec>) -> Stack {
    let queue = Arc::new(BoundedQueue::bounded(1000));
    let wal = Arc::new(Wal::new(wal_root));
    let registry = Arc::new(SourceRegistry::default());
    let pipeline = Pipeline::new(Arc::clone(&queue), Arc::new(RateLimiter::new()), Arc::clone(&wal));
    let cancel = CancellationToken::new();

    let (batch_tx, batch_rx) = mpsc::channel(16);
    let commit: Arc<dyn CommitSink> = Arc::clone(&wal) as Arc<dyn CommitSink>;
    let exporter = ExporterService::new(
        Dispatch::new(backends),
        commit,
        Arc::clone(&wal),
        Arc::new(tokio::sync::Mutex::new(batch_rx)),
        cancel.child_token(),
    );
    tokio::spawn(exporter.run());

    let batcher = Batcher::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        batch_tx,
        cancel.child_token(),
    );
    tokio::spawn(batcher.run());

    Stack {
        pipeline,
        wal,
        registry,
        cancel,
    }
}

fn file_spec(path: &str, policy: OverflowPolicy) -> SourceSpec {
    SourceSpec {
        service: "nginx".into(),
        category: "ACCESS".into(),
        path: path.into(),
        delimiter: b"\n".to_vec(),
        labels: BTreeMap::new(),
        rate_limit: None,
        buffer_size: 1,
        overflow_policy: policy,
    }
}

fn loki_backend(url: &str) -> BackendSpec {
    BackendSpec {
        kind: BackendKind::Loki,
        endpoints: vec![url.to_string()],
    }
}

fn append(path: &Path, line: &str) {
    std::fs::OpenOptions::new()
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"))
        .expect("append line");
}

async fn wait_until_matched(mock: &mockito::Mock) {
    let poll = async {
        while !mock.matched_async().await {
            sleep(Duration::from_millis(100)).await;
        }
    };
    timeout(Duration::from_secs(10), poll)
        .await
        .expect("backend never received the expected request");
}

#[tokio::test]
async fn basic_tail_reaches_loki_with_full_label_set() {
    let log_dir = tempfile::tempdir().expect("tempdir");
    let wal_dir = tempfile::tempdir().expect("tempdir");
    let path = log_dir.path().join("a.log");
    std::fs::write(&path, "").expect("seed file");
    let path_str = path.to_string_lossy().to_string();

    let mut server = mockito::Server::new_async().await;
    let expected = serde_json::json!({
        "streams": [{
            "stream": {
                "job": "sle",
                "name": "nginx",
                "subname": "ACCESS",
                "level": "INFO",
                "filepath": path_str,
            },
            "values": [["1760660776000000000", "Complete!"]],
        }]
    });
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_body(mockito::Matcher::PartialJsonString(expected.to_string()))
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;

    let stack = start_stack(wal_dir.path(), vec![loki_backend(&server.url())]);
    let spec = file_spec(&path_str, OverflowPolicy::Drop);
    stack
        .registry
        .register(spec.source_id_for(&path_str), spec.buffer_size);
    let watcher = FileWatcher::new(spec, path.clone(), stack.pipeline.clone(), stack.cancel.child_token());
    tokio::spawn(watcher.run());
    sleep(Duration::from_millis(200)).await;

    append(&path, "2025-10-17T02:26:16+0200 INFO Complete!");

    wait_until_matched(&mock).await;
    stack.cancel.cancel();
}

#[tokio::test]
async fn backend_outage_with_disk_policy_loses_nothing() {
    let wal_dir = tempfile::tempdir().expect("tempdir");

    // The backend refuses everything at first; records spill to the WAL.
    let mut down = mockito::Server::new_async().await;
    let outage = down
        .mock("POST", "/loki/api/v1/push")
        .with_status(503)
        .expect_at_least(1)
        .create_async()
        .await;

    let stack = start_stack(wal_dir.path(), vec![loki_backend(&down.url())]);
    let spec = file_spec("/tmp/outage.log", OverflowPolicy::Disk);
    let source_id = spec.source_id_for("/tmp/outage.log");
    for n in 0..5 {
        stack
            .pipeline
            .emit_line(&spec, &source_id, &format!("line {n}"))
            .await;
    }

    // Wait for the failed delivery to land everything in the WAL.
    let spill = async {
        loop {
            let wal = Wal::new(wal_dir.path());
            if wal.replay().await.len() == 5 {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    };
    timeout(Duration::from_secs(15), spill)
        .await
        .expect("records never reached the wal");
    outage.assert_async().await;
    stack.cancel.cancel();
    sleep(Duration::from_millis(100)).await;

    // Recovery: a fresh stack replays the WAL into a healthy backend.
    let mut up = mockito::Server::new_async().await;
    let recovered = up
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;

    let stack = start_stack(wal_dir.path(), vec![loki_backend(&up.url())]);
    let replayed = stack.wal.replay().await;
    assert_eq!(replayed.len(), 5);
    let texts: Vec<_> = replayed.iter().map(|r| r.text.clone()).collect();
    assert_eq!(texts, ["line 0", "line 1", "line 2", "line 3", "line 4"]);
    stack.pipeline.inject_replay(replayed).await;

    wait_until_matched(&recovered).await;

    // Delivery commits the segments; the WAL directory drains.
    let drained = async {
        loop {
            if Wal::new(wal_dir.path()).replay().await.is_empty() {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
    };
    timeout(Duration::from_secs(10), drained)
        .await
        .expect("wal segments were never committed");
    stack.cancel.cancel();
}

#[tokio::test]
async fn ha_fan_out_delivers_while_one_endpoint_is_down() {
    let wal_dir = tempfile::tempdir().expect("tempdir");

    let mut healthy = mockito::Server::new_async().await;
    let ok = healthy
        .mock("POST", "/loki/api/v1/push")
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;
    let mut broken = mockito::Server::new_async().await;
    let bad = broken
        .mock("POST", "/loki/api/v1/push")
        .with_status(500)
        .expect_at_least(1)
        .create_async()
        .await;

    let stack = start_stack(
        wal_dir.path(),
        vec![BackendSpec {
            kind: BackendKind::Loki,
            endpoints: vec![healthy.url(), broken.url()],
        }],
    );
    let spec = file_spec("/tmp/ha.log", OverflowPolicy::Disk);
    let source_id = spec.source_id_for("/tmp/ha.log");
    stack.pipeline.emit_line(&spec, &source_id, "ha line").await;

    wait_until_matched(&ok).await;
    bad.assert_async().await;

    // One healthy endpoint is enough: nothing spills to the WAL.
    sleep(Duration::from_secs(2)).await;
    assert!(Wal::new(wal_dir.path()).replay().await.is_empty());
    stack.cancel.cancel();
}

#[tokio::test]
async fn glob_discovery_tags_new_files_with_their_path() {
    let log_dir = tempfile::tempdir().expect("tempdir");
    let wal_dir = tempfile::tempdir().expect("tempdir");
    let pattern = format!("{}/*.log", log_dir.path().display());
    std::fs::write(log_dir.path().join("a.log"), "").expect("seed a.log");

    let mut server = mockito::Server::new_async().await;
    let late_path = log_dir.path().join("b.log");
    let mock = server
        .mock("POST", "/loki/api/v1/push")
        .match_body(mockito::Matcher::PartialJsonString(
            serde_json::json!({
                "streams": [{ "stream": { "filepath": late_path.to_string_lossy(), "name": "nginx" } }]
            })
            .to_string(),
        ))
        .with_status(204)
        .expect_at_least(1)
        .create_async()
        .await;

    let stack = start_stack(wal_dir.path(), vec![loki_backend(&server.url())]);

    struct Fixed(Vec<SourceSpec>);
    impl SourceProvider for Fixed {
        fn sources(&self) -> Option<Vec<SourceSpec>> {
            Some(self.0.clone())
        }
    }

    let spec = file_spec(&pattern, OverflowPolicy::Drop);
    let discovery = Discovery::new(
        vec![spec.clone()],
        Arc::new(Fixed(vec![spec])),
        stack.pipeline.clone(),
        Arc::clone(&stack.registry),
        1,
        stack.cancel.child_token(),
    );
    tokio::spawn(discovery.run());
    sleep(Duration::from_millis(300)).await;

    // New file appears; the next reload cycle must pick it up.
    std::fs::write(&late_path, "").expect("create b.log");
    sleep(Duration::from_millis(1500)).await;
    append(&late_path, "hello");

    wait_until_matched(&mock).await;
    stack.cancel.cancel();
}
