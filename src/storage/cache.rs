//! Atomic JSON cache store for provider events
//!
//! Each provider owns one cache file at `data/<provider>/events.json`. A
//! refresh run replaces the file atomically; the feed builder only ever
//! reads. Corrupt or missing caches degrade to an empty sequence with a
//! warning, malformed elements are skipped individually.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::atomic_write;
use crate::config::validate_path;
use crate::error::Result;
use crate::models::Event;

const CACHE_FILENAME: &str = "events.json";

/// Store rooted at the repository base directory.
pub struct CacheStore {
    base: PathBuf,
    pretty: bool,
}

impl CacheStore {
    pub fn new(base: PathBuf, pretty: bool) -> Self {
        Self { base, pretty }
    }

    /// Allowlist-validated path of a provider's cache file.
    pub fn cache_path(&self, provider: &str) -> Result<PathBuf> {
        let rel = Path::new("data").join(provider).join(CACHE_FILENAME);
        validate_path(&self.base, &rel, "cache path")
    }

    /// Read a provider's cached events.
    ///
    /// Missing file, empty file or a non-array payload yield an empty
    /// sequence with a warning; elements that fail to decode are skipped.
    /// Other I/O errors are surfaced.
    pub fn read(&self, provider: &str) -> Result<Vec<Event>> {
        let path = self.cache_path(provider)?;
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(provider, path = %path.display(), "cache file missing");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(crate::error::StorageError::Io {
                    path: path.display().to_string(),
                    source: e,
                }
                .into())
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(provider, error = %e, "cache contains invalid JSON, treating as empty");
                return Ok(Vec::new());
            }
        };
        let items = match value {
            serde_json::Value::Array(items) => items,
            other => {
                warn!(
                    provider,
                    found = other_kind(&other),
                    "cache does not contain a JSON array, treating as empty"
                );
                return Ok(Vec::new());
            }
        };

        let total = items.len();
        let mut events = Vec::with_capacity(total);
        for item in items {
            match serde_json::from_value::<Event>(item) {
                Ok(ev) => events.push(ev),
                Err(e) => warn!(provider, error = %e, "skipping malformed cache element"),
            }
        }
        if events.len() < total {
            warn!(
                provider,
                kept = events.len(),
                total,
                "cache contained malformed elements"
            );
        }
        Ok(events)
    }

    /// Write a provider's events atomically.
    pub fn write(&self, provider: &str, events: &[Event]) -> Result<()> {
        let path = self.cache_path(provider)?;
        let payload = if self.pretty {
            serde_json::to_vec_pretty(events)
        } else {
            serde_json::to_vec(events)
        }
        .map_err(crate::error::StorageError::Serialize)?;
        atomic_write(&path, &payload)
    }
}

fn other_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
