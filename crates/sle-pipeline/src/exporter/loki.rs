// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Loki push-API payload: stream entries grouped by label set, nanosecond
//! timestamps rendered as decimal strings.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::batcher::Batch;
use crate::record::LogRecord;

pub(crate) const PUSH_PATH: &str = "/loki/api/v1/push";

pub(crate) fn payload(batch: &Batch) -> Value {
    // Group by full label set, preserving intra-batch order within a stream.
    let mut streams: Vec<(&BTreeMap<String, String>, Vec<Value>)> = Vec::new();
    for record in &batch.records {
        match streams.iter_mut().find(|(labels, _)| *labels == &record.labels) {
            Some((_, values)) => values.push(entry(record)),
            None => streams.push((&record.labels, vec![entry(record)])),
        }
    }

    json!({
        "streams": streams
            .into_iter()
            .map(|(stream, values)| json!({ "stream": stream, "values": values }))
            .collect::<Vec<_>>(),
    })
}

fn entry(record: &LogRecord) -> Value {
    json!([record.timestamp_ns.to_string(), record.text])
}
