// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Shared JSON body for every non-Loki backend kind.

use serde_json::{json, Value};

use crate::batcher::Batch;

pub(crate) fn payload(batch: &Batch) -> Value {
    Value::Array(
        batch
            .records
            .iter()
            .map(|record| {
                json!({
                    "timestamp": record.timestamp_ns,
                    "labels": record.labels,
                    "message": record.text,
                })
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogRecord, OverflowPolicy, SourceId};
    use std::collections::BTreeMap;

    #[test]
    fn one_object_per_record() {
        let record = LogRecord {
            text: "hello".to_string(),
            timestamp_ns: 42,
            labels: BTreeMap::from([("job".to_string(), "sle".to_string())]),
            source_id: SourceId::new("svc", "cat", "/tmp/a.log"),
            overflow_policy: OverflowPolicy::Drop,
            wal_seq: None,
        };
        let batch = Batch {
            source_id: record.source_id.clone(),
            policy: OverflowPolicy::Drop,
            records: vec![record.clone(), record],
            wal_segments: Vec::new(),
        };

        let payload = payload(&batch);
        let items = payload.as_array().expect("array body");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["timestamp"], 42);
        assert_eq!(items[0]["message"], "hello");
        assert_eq!(items[0]["labels"]["job"], "sle");
    }
}
