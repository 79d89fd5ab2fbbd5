// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Label automatically attached to every record.
pub const JOB_LABEL: &str = "sle";

/// Opaque key identifying the origin of a record.
///
/// The rate limiter, batcher and WAL are all keyed by this triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceId {
    pub service: String,
    pub category: String,
    pub filepath: String,
}

impl SourceId {
    pub fn new(
        service: impl Into<String>,
        category: impl Into<String>,
        filepath: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            category: category.into(),
            filepath: filepath.into(),
        }
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.service, self.category, self.filepath)
    }
}

/// What happens to a record the queue or rate limiter rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Discard the record and count it.
    #[default]
    Drop,
    /// Persist the record to the WAL for later delivery.
    Disk,
}

/// The unit that flows through the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// The line with any detected leading timestamp/level stripped; never empty.
    pub text: String,
    /// Source-assigned instant, nanoseconds since the Unix epoch.
    pub timestamp_ns: i64,
    /// Always contains `job`, `name`, `subname` and `filepath`; keys are unique.
    pub labels: BTreeMap<String, String>,
    pub source_id: SourceId,
    pub overflow_policy: OverflowPolicy,
    /// WAL segment this record was replayed from, so delivery can commit it.
    /// Runtime-only, never part of the persisted encoding.
    #[serde(skip)]
    pub wal_seq: Option<u64>,
}

/// Immutable descriptor for one watched file (or glob set of files).
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub service: String,
    pub category: String,
    /// Absolute path; a glob pattern when it contains `*`, `?` or `[`.
    pub path: String,
    /// Byte sequence separating records.
    pub delimiter: Vec<u8>,
    /// User-supplied labels merged into every record of this source.
    pub labels: BTreeMap<String, String>,
    /// Max records/second admitted; `None` means unlimited.
    pub rate_limit: Option<f64>,
    /// Max records per outgoing batch.
    pub buffer_size: usize,
    pub overflow_policy: OverflowPolicy,
}

impl SourceSpec {
    /// Whether `path` needs glob expansion.
    pub fn is_pattern(&self) -> bool {
        self.path.contains(['*', '?', '['])
    }

    /// The source id of one concrete file matched by this spec.
    pub fn source_id_for(&self, path: &str) -> SourceId {
        SourceId::new(&self.service, &self.category, path)
    }
}

/// Strips `..` and path separators from service/category identifiers, so they
/// are safe to use as WAL directory components.
pub fn sanitize_identifier(raw: &str) -> String {
    raw.replace("..", "").replace(['/', '\\'], "")
}

/// Log-ingestion system a batch can be shipped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Loki,
    Elasticsearch,
    OpenSearch,
    Graylog,
    VictoriaLogs,
    ClickHouse,
    FluentBit,
    Kafka,
    CloudWatch,
    Gcp,
    Azure,
}

impl BackendKind {
    /// Derives the kind from a `<KIND>_IP` configuration key.
    pub fn from_config_key(key: &str) -> Option<Self> {
        let prefix = key.strip_suffix("_IP")?;
        match prefix.to_ascii_uppercase().as_str() {
            "LOKI" => Some(Self::Loki),
            "ELASTIC" | "ELASTICSEARCH" => Some(Self::Elasticsearch),
            "OPENSEARCH" => Some(Self::OpenSearch),
            "GRAYLOG" => Some(Self::Graylog),
            "VICTORIALOGS" => Some(Self::VictoriaLogs),
            "CLICKHOUSE" => Some(Self::ClickHouse),
            "FLUENTBIT" => Some(Self::FluentBit),
            "KAFKA" => Some(Self::Kafka),
            "CLOUDWATCH" => Some(Self::CloudWatch),
            "GCP" => Some(Self::Gcp),
            "AZURE" => Some(Self::Azure),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Loki => "loki",
            Self::Elasticsearch => "elasticsearch",
            Self::OpenSearch => "opensearch",
            Self::Graylog => "graylog",
            Self::VictoriaLogs => "victorialogs",
            Self::ClickHouse => "clickhouse",
            Self::FluentBit => "fluentbit",
            Self::Kafka => "kafka",
            Self::CloudWatch => "cloudwatch",
            Self::Gcp => "gcp",
            Self::Azure => "azure",
        };
        f.write_str(name)
    }
}

/// One backend with its endpoint fan-out set.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    pub kind: BackendKind,
    /// Non-empty; a single configured URL is normalized to a one-element list.
    pub endpoints: Vec<String>,
}
