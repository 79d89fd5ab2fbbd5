// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! In-process log pipeline for SLE: file/journal watchers feed a bounded
//! queue; the batcher groups records per source; the exporter fans batches
//! out to the configured backends with a disk WAL backing at-least-once
//! delivery for DISK-policy sources.

pub mod batcher;
pub mod enrich;
pub mod exporter;
pub mod pipeline;
pub mod queue;
pub mod rate_limit;
pub mod record;
pub mod wal;
pub mod watcher;
