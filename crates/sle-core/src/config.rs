// Copyright 2025-Present The SLE Authors
// SPDX-License-Identifier: Apache-2.0

//! Configuration loading: every `.json`/`.yaml`/`.yml` file in the config
//! directory is merged into a single logical config.
//!
//! Top-level keys fall into three classes: global keys (recognized only in
//! `default.*`), backend keys (`<KIND>_IP`) and service keys (everything
//! else, mapping categories to source specs).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use sle_pipeline::record::{
    sanitize_identifier, BackendKind, BackendSpec, OverflowPolicy, SourceSpec,
};

pub const DEFAULT_CONFIG_DIR: &str = "/etc/sle.d";

const GLOBAL_KEYS: [&str; 4] = ["AUTO_RELOAD", "QUEUE_SIZE", "JOURNALCTL", "JOURNALCTL_LABELS"];
const KNOWN_SOURCE_FIELDS: [&str; 6] = [
    "path_file",
    "delimiter",
    "labels",
    "rate_limit",
    "buffer_size",
    "disk_buffer",
];

/// The merged logical configuration of one load cycle.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Seconds between source re-discovery cycles; 0 disables auto-reload.
    pub auto_reload_secs: u64,
    /// Queue capacity; `None` selects the legacy clear-at-5000 behavior.
    pub queue_size: Option<usize>,
    pub journald: bool,
    pub journald_labels: BTreeMap<String, String>,
    pub backends: Vec<BackendSpec>,
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Clone)]
pub struct ConfigLoader {
    dir: PathBuf,
}

impl ConfigLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn load(&self) -> Result<Config> {
        let files = self.config_files()?;
        if files.is_empty() {
            bail!("no configuration files found in {}", self.dir.display());
        }
        info!(count = files.len(), dir = %self.dir.display(), "loading configuration");

        let mut config = Config::default();
        let mut backends: Vec<BackendSpec> = Vec::new();

        // First pass: global keys from default.* only.
        for file in &files {
            if is_default_file(file) {
                let value = parse_file(file)?;
                apply_globals(&mut config, &value, file)?;
            }
        }

        // Second pass: backends and services from every file.
        for file in &files {
            let value = parse_file(file)?;
            let Some(object) = value.as_object() else {
                bail!("invalid configuration in {}: must be an object", file.display());
            };
            for (key, entry) in object {
                if GLOBAL_KEYS.contains(&key.as_str()) {
                    if !is_default_file(file) {
                        warn!(key, file = %file.display(), "global key outside default.*, ignored");
                    }
                    continue;
                }
                if key.ends_with("_IP") {
                    merge_backend(&mut backends, key, entry, file)?;
                } else {
                    parse_service(&mut config.sources, key, entry, file)?;
                }
            }
        }

        config.backends = backends;
        if config.backends.is_empty() {
            bail!("no backend configured (no *_IP key in {})", self.dir.display());
        }
        if config.sources.is_empty() && !config.journald {
            bail!("no log sources configured in {}", self.dir.display());
        }
        Ok(config)
    }

    fn config_files(&self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir).with_context(|| {
            format!("configuration directory unreadable: {}", self.dir.display())
        })?;
        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("json" | "yaml" | "yml")
                )
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

fn is_default_file(path: &Path) -> bool {
    path.file_stem().and_then(|s| s.to_str()) == Some("default")
}

/// Parses one file into JSON values; YAML goes through the same value model
/// so there is a single merge path.
fn parse_file(path: &Path) -> Result<Value> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    } else {
        let yaml: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("invalid YAML in {}", path.display()))?;
        serde_json::to_value(yaml).with_context(|| format!("invalid YAML in {}", path.display()))
    }
}

fn apply_globals(config: &mut Config, value: &Value, file: &Path) -> Result<()> {
    let Some(object) = value.as_object() else {
        bail!("invalid configuration in {}: must be an object", file.display());
    };

    if let Some(auto_reload) = object.get("AUTO_RELOAD") {
        config.auto_reload_secs = auto_reload
            .as_u64()
            .ok_or_else(|| anyhow!("AUTO_RELOAD must be a non-negative integer in {}", file.display()))?;
    }
    if let Some(queue_size) = object.get("QUEUE_SIZE") {
        let size = queue_size
            .as_u64()
            .ok_or_else(|| anyhow!("QUEUE_SIZE must be a non-negative integer in {}", file.display()))?;
        config.queue_size = Some(size as usize);
    }
    if let Some(journalctl) = object.get("JOURNALCTL") {
        config.journald = match journalctl {
            Value::Bool(enabled) => *enabled,
            Value::String(s) => matches!(s.to_ascii_lowercase().as_str(), "on" | "yes" | "true" | "1"),
            other => bail!("JOURNALCTL must be \"on\"/\"off\" in {}: got {other}", file.display()),
        };
        info!(enabled = config.journald, "journald monitoring");
    }
    if let Some(labels) = object.get("JOURNALCTL_LABELS") {
        config.journald_labels = parse_labels(labels, "JOURNALCTL_LABELS", file)?;
    }
    Ok(())
}

/// `<KIND>_IP` values are a string or a list of strings; a single URL is
/// normalized to a one-element list and scheme-less URLs get `http://`.
fn merge_backend(
    backends: &mut Vec<BackendSpec>,
    key: &str,
    entry: &Value,
    file: &Path,
) -> Result<()> {
    let kind = BackendKind::from_config_key(key)
        .ok_or_else(|| anyhow!("unknown backend kind {key} in {}", file.display()))?;

    let raw_urls: Vec<&str> = match entry {
        Value::String(url) => vec![url.as_str()],
        Value::Array(urls) => urls
            .iter()
            .map(|url| {
                url.as_str()
                    .ok_or_else(|| anyhow!("{key} entries must be strings in {}", file.display()))
            })
            .collect::<Result<_>>()?,
        _ => bail!("{key} must be a URL or list of URLs in {}", file.display()),
    };
    let endpoints: Vec<String> = raw_urls
        .into_iter()
        .filter(|url| !url.is_empty())
        .map(normalize_url)
        .collect();
    if endpoints.is_empty() {
        bail!("{key} is empty in {}", file.display());
    }

    match backends.iter_mut().find(|backend| backend.kind == kind) {
        Some(backend) => {
            for endpoint in endpoints {
                if !backend.endpoints.contains(&endpoint) {
                    backend.endpoints.push(endpoint);
                }
            }
        }
        None => backends.push(BackendSpec { kind, endpoints }),
    }
    Ok(())
}

fn normalize_url(url: &str) -> String {
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{url}")
    }
}

fn parse_service(
    sources: &mut Vec<SourceSpec>,
    service: &str,
    entry: &Value,
    file: &Path,
) -> Result<()> {
    let Some(categories) = entry.as_object() else {
        bail!("service {service} must be an object in {}", file.display());
    };
    let service_name = sanitize_identifier(service);
    if service_name.is_empty() {
        warn!(service, file = %file.display(), "service name empty after sanitization, skipped");
        return Ok(());
    }

    for (category, settings) in categories {
        let category_name = sanitize_identifier(category);
        if category_name.is_empty() {
            warn!(category, file = %file.display(), "category name empty after sanitization, skipped");
            continue;
        }
        let spec = parse_source(&service_name, &category_name, settings, file)
            .with_context(|| format!("in entry {service}.{category}"))?;
        sources.push(spec);
    }
    Ok(())
}

fn parse_source(
    service: &str,
    category: &str,
    settings: &Value,
    file: &Path,
) -> Result<SourceSpec> {
    let Some(object) = settings.as_object() else {
        bail!("entry must be an object in {}", file.display());
    };

    for key in object.keys() {
        if !KNOWN_SOURCE_FIELDS.contains(&key.as_str()) {
            warn!(key, file = %file.display(), "unknown source field, ignored");
        }
    }

    let path = object
        .get("path_file")
        .and_then(|p| p.as_str())
        .filter(|p| !p.is_empty())
        .ok_or_else(|| anyhow!("path_file is missing in {}", file.display()))?;
    if !path.starts_with('/') {
        bail!("path_file must be absolute in {}: {path}", file.display());
    }

    let delimiter = match object.get("delimiter").and_then(|d| d.as_str()) {
        Some("") => {
            warn!(file = %file.display(), "empty delimiter, using newline");
            b"\n".to_vec()
        }
        Some(delimiter) => delimiter.as_bytes().to_vec(),
        None => b"\n".to_vec(),
    };

    let labels = match object.get("labels") {
        Some(labels) => parse_labels(labels, "labels", file)?,
        None => BTreeMap::new(),
    };

    let rate_limit = match object.get("rate_limit") {
        Some(value) => {
            let rate = value
                .as_f64()
                .ok_or_else(|| anyhow!("rate_limit must be a number in {}", file.display()))?;
            if rate <= 0.0 {
                warn!(rate, file = %file.display(), "non-positive rate_limit, treating as unlimited");
                None
            } else {
                Some(rate)
            }
        }
        None => None,
    };

    let buffer_size = match object.get("buffer_size") {
        Some(value) => {
            let size = value
                .as_i64()
                .ok_or_else(|| anyhow!("buffer_size must be an integer in {}", file.display()))?;
            if size <= 0 {
                warn!(size, file = %file.display(), "non-positive buffer_size, using 1");
                1
            } else {
                size as usize
            }
        }
        None => 1,
    };

    let overflow_policy = match object.get("disk_buffer").and_then(|d| d.as_str()) {
        Some(policy) if policy.eq_ignore_ascii_case("DISK") => OverflowPolicy::Disk,
        Some(policy) if policy.eq_ignore_ascii_case("DROP") => OverflowPolicy::Drop,
        Some(policy) => {
            warn!(policy, file = %file.display(), "unknown disk_buffer value, using DROP");
            OverflowPolicy::Drop
        }
        None => OverflowPolicy::Drop,
    };

    Ok(SourceSpec {
        service: service.to_string(),
        category: category.to_string(),
        path: path.to_string(),
        delimiter,
        labels,
        rate_limit,
        buffer_size,
        overflow_policy,
    })
}

/// Label maps must be string-to-string; other scalars are rejected at parse
/// time.
fn parse_labels(value: &Value, field: &str, file: &Path) -> Result<BTreeMap<String, String>> {
    let Some(object) = value.as_object() else {
        bail!("{field} must be a map in {}", file.display());
    };
    let mut labels = BTreeMap::new();
    for (key, val) in object {
        let Some(val) = val.as_str() else {
            bail!("{field}.{key} must be a string in {}", file.display());
        };
        labels.insert(key.clone(), val.to_string());
    }
    Ok(labels)
}
