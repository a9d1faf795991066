//! Change detection for polled fragments.
//!
//! The server hashes the semantic payload behind a fragment, not the
//! rendered HTML, so volatile fields such as fetch timestamps never count
//! as a change. Clients send back the last hash they saw; an unchanged,
//! non-forced refresh answers without HTML.

use crate::cache::Source;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

/// Object keys that change on every fetch without changing what is shown.
pub const VOLATILE_KEYS: [&str; 6] = [
    "timestamp",
    "cached_at",
    "fetched_at",
    "generated_at",
    "saved_at",
    "expires_at",
];

/// Copy of `value` with every object key in `volatile` removed, at any depth.
pub fn strip_volatile(value: &Value, volatile: &[&str]) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(k, _)| !volatile.contains(&k.as_str()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let stripped: Map<String, Value> = entries
                .into_iter()
                .map(|(k, v)| (k.clone(), strip_volatile(v, volatile)))
                .collect();
            Value::Object(stripped)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| strip_volatile(item, volatile))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Stable SHA-256 hex digest of the semantic content of `value`.
pub fn content_hash(value: &Value, volatile: &[&str]) -> String {
    let canonical = strip_volatile(value, volatile);
    let mut hasher = Sha256::new();
    hasher.update(canonical.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Body of `POST /refresh`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub content_id: String,
    #[serde(default)]
    pub previous_hash: Option<String>,
    #[serde(default)]
    pub force_refresh: bool,
}

/// Reply to `POST /refresh`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshResponse {
    pub html: Option<String>,
    pub hash: String,
    pub changed: bool,
    pub source: Source,
    pub live: bool,
}

impl RefreshResponse {
    pub fn new(report: ChangeReport, source: Source, live: bool) -> Self {
        Self {
            html: report.html,
            hash: report.hash,
            changed: report.changed,
            source,
            live,
        }
    }
}

/// Hash comparison result for one refresh.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeReport {
    /// Omitted when the client already has this content
    pub html: Option<String>,
    pub hash: String,
    pub changed: bool,
}

impl ChangeReport {
    pub fn compare(html: String, hash: String, previous: Option<&str>, force: bool) -> Self {
        let changed = previous != Some(hash.as_str());
        Self {
            html: (changed || force).then_some(html),
            hash,
            changed,
        }
    }
}
