//! First-seen state store
//!
//! Tracks when an event identity was first admitted to any feed build, as a
//! flat JSON object `{ identity: rfc3339-utc }`. Loaded at the start of a
//! build, amended for newly admitted identities, reduced to the emitted set
//! and persisted atomically at the end. Load problems fall back to an empty
//! map; persistence problems are reported but never abort the build.

use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use tracing::warn;

use super::atomic_write;
use crate::error::Result;
use crate::models::parse_instant;

/// Identity → first admission instant.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FirstSeenMap {
    entries: HashMap<String, DateTime<Utc>>,
}

impl FirstSeenMap {
    pub fn get(&self, ident: &str) -> Option<DateTime<Utc>> {
        self.entries.get(ident).copied()
    }

    pub fn contains(&self, ident: &str) -> bool {
        self.entries.contains_key(ident)
    }

    /// Insert the identity with `now` unless it is already tracked; returns
    /// the effective first-seen instant.
    pub fn record(&mut self, ident: &str, now: DateTime<Utc>) -> DateTime<Utc> {
        *self.entries.entry(ident.to_string()).or_insert(now)
    }

    /// Keep only identities that were actually emitted.
    pub fn retain_emitted(&mut self, emitted: &HashSet<String>) {
        self.entries.retain(|k, _| emitted.contains(k));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn identities(&self) -> HashSet<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Store bound to the configured state file path.
pub struct FirstSeenStore {
    path: PathBuf,
    retention_days: i64,
}

impl FirstSeenStore {
    pub fn new(path: PathBuf, retention_days: i64) -> Self {
        Self {
            path,
            retention_days,
        }
    }

    /// Load the map; parse problems yield an empty map with a warning.
    /// Entries older than the retention window are dropped.
    pub fn load(&self, now: DateTime<Utc>) -> FirstSeenMap {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return FirstSeenMap::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state load failed, starting empty");
                return FirstSeenMap::default();
            }
        };
        let parsed: HashMap<String, String> = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "state unparseable, starting empty");
                return FirstSeenMap::default();
            }
        };

        let cutoff = (self.retention_days > 0)
            .then(|| now - Duration::days(self.retention_days));
        let mut entries = HashMap::with_capacity(parsed.len());
        for (ident, stamp) in parsed {
            let dt = match parse_instant(&stamp) {
                Ok(dt) => dt,
                Err(_) => {
                    warn!(ident = %ident, "state entry has unparseable first_seen, dropping");
                    continue;
                }
            };
            if let Some(cutoff) = cutoff {
                if dt < cutoff {
                    continue;
                }
            }
            entries.insert(ident, dt);
        }
        FirstSeenMap { entries }
    }

    /// Persist the map atomically under an exclusive lock on the state file.
    pub fn save(&self, map: &FirstSeenMap) -> Result<()> {
        let serialisable: std::collections::BTreeMap<&String, String> = map
            .entries
            .iter()
            .map(|(k, v)| (k, v.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
            .collect();
        let payload = serde_json::to_vec_pretty(&serialisable)
            .map_err(crate::error::StorageError::Serialize)?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).ok();
        }
        let lock_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        let guard = match &lock_file {
            Ok(f) => {
                if let Err(e) = f.lock_exclusive() {
                    warn!(error = %e, "state lock failed, writing without lock");
                }
                Some(f)
            }
            Err(_) => None,
        };

        let result = atomic_write(&self.path, &payload);
        if let Some(f) = guard {
            let _ = fs2::FileExt::unlock(f);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_record_keeps_earliest() {
        let mut map = FirstSeenMap::default();
        let first = map.record("a", now());
        let second = map.record("a", now() + Duration::hours(2));
        assert_eq!(first, second);
    }

    #[test]
    fn test_roundtrip_identical() {
        let dir = tempfile::tempdir().unwrap();
        let store = FirstSeenStore::new(dir.path().join("data/first_seen.json"), 60);
        let mut map = FirstSeenMap::default();
        map.record("VOR-42", now());
        map.record("wl|störung|L=U4|D=2025-06-01", now() - Duration::days(3));
        store.save(&map).unwrap();

        let loaded = store.load(now());
        assert_eq!(loaded, map);
    }

    #[test]
    fn test_missing_and_corrupt_files_start_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first_seen.json");
        let store = FirstSeenStore::new(path.clone(), 60);
        assert!(store.load(now()).is_empty());

        fs::write(&path, "not json").unwrap();
        assert!(store.load(now()).is_empty());
    }

    #[test]
    fn test_retention_purges_old_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = FirstSeenStore::new(dir.path().join("first_seen.json"), 60);
        let mut map = FirstSeenMap::default();
        map.record("fresh", now() - Duration::days(10));
        map.record("stale", now() - Duration::days(90));
        store.save(&map).unwrap();

        let loaded = store.load(now());
        assert!(loaded.contains("fresh"));
        assert!(!loaded.contains("stale"));
    }

    #[test]
    fn test_retain_emitted() {
        let mut map = FirstSeenMap::default();
        map.record("keep", now());
        map.record("drop", now());
        let emitted: HashSet<String> = ["keep".to_string()].into();
        map.retain_emitted(&emitted);
        assert!(map.contains("keep"));
        assert!(!map.contains("drop"));
        assert_eq!(map.len(), 1);
    }
}
