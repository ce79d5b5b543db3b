//! On-disk stores: provider caches, first-seen state and the daily
//! request counter
//!
//! All writes go through [`atomic_write`]: validate against the path
//! allowlist, serialise to a sibling temp file, fsync, rename over the
//! target, fsync the directory. Cross-process coordination uses `fs2`
//! advisory locks on sibling lock files.

pub mod cache;
pub mod quota;
pub mod state;

pub use cache::CacheStore;
pub use quota::DailyQuota;
pub use state::{FirstSeenMap, FirstSeenStore};

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{Result, StorageError};

fn io_err(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Write `content` to `path` atomically: temp file in the same directory,
/// fsync, rename, directory fsync. The previous file stays intact if
/// anything fails before the rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StorageError::PathOutsideAllowlist(path.display().to_string()))?;
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| io_err(parent, e))?;
    tmp.write_all(content).map_err(|e| io_err(path, e))?;
    tmp.as_file().sync_all().map_err(|e| io_err(path, e))?;
    tmp.persist(path)
        .map_err(|e| io_err(path, e.error))?;

    // Make the rename itself durable
    if let Ok(dir) = File::open(parent) {
        let _ = dir.sync_all();
    }
    Ok(())
}
