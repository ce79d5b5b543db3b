//! Cross-process daily request counter
//!
//! Guards the regional-authority request budget. The counter file holds
//! `{ "day": "YYYY-MM-DD", "count": N }` in the operator's local calendar
//! day (Europe/Vienna) and lives next to the provider cache. Every outbound
//! attempt is recorded *before* the request is made, so denials and
//! timeouts still count against the budget.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::Utc;
use chrono_tz::Europe::Vienna;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::atomic_write;
use crate::error::{Result, StorageError};

/// Default time to wait for the lock before taking over a stale one.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting on the lock.
const LOCK_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Serialize, Deserialize)]
struct CounterFile {
    day: String,
    count: u32,
}

/// Per-provider daily counter persisted under the path allowlist.
pub struct DailyQuota {
    counter_path: PathBuf,
    lock_timeout: Duration,
}

impl DailyQuota {
    pub fn new(counter_path: PathBuf) -> Self {
        Self {
            counter_path,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// The operator-local calendar day the counter is scoped to.
    pub fn today() -> String {
        Utc::now().with_timezone(&Vienna).date_naive().to_string()
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.counter_path.clone().into_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    /// Read the current count for today without incrementing.
    pub fn current(&self) -> u32 {
        match fs::read_to_string(&self.counter_path) {
            Ok(raw) => match serde_json::from_str::<CounterFile>(&raw) {
                Ok(parsed) if parsed.day == Self::today() => parsed.count,
                Ok(_) => 0,
                Err(e) => {
                    warn!(error = %e, "counter file unparseable, assuming fresh day");
                    0
                }
            },
            Err(_) => 0,
        }
    }

    /// Record one outbound attempt and return the new count for today.
    ///
    /// Protocol: exclusive lock on the sibling lock file (blocking with
    /// timeout, stale locks are taken over and removed), tolerant read,
    /// day-change reset, increment, temp-write + fsync + rename, unlock.
    pub fn increment(&self) -> Result<u32> {
        if let Some(parent) = self.counter_path.parent() {
            fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.display().to_string(),
                source: e,
            })?;
        }

        let lock_file = self.acquire_lock()?;
        let result = self.increment_locked();
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn increment_locked(&self) -> Result<u32> {
        let today = Self::today();
        let mut state = match fs::read_to_string(&self.counter_path) {
            Ok(raw) => serde_json::from_str::<CounterFile>(&raw).unwrap_or_else(|e| {
                warn!(error = %e, "counter file unparseable, starting fresh day");
                CounterFile {
                    day: today.clone(),
                    count: 0,
                }
            }),
            Err(_) => CounterFile {
                day: today.clone(),
                count: 0,
            },
        };

        if state.day != today {
            debug!(old_day = %state.day, new_day = %today, "counter day rollover");
            state.day = today;
            state.count = 0;
        }
        state.count += 1;

        let payload =
            serde_json::to_vec_pretty(&state).map_err(StorageError::Serialize)?;
        atomic_write(&self.counter_path, &payload)?;
        Ok(state.count)
    }

    fn acquire_lock(&self) -> Result<fs::File> {
        let lock_path = self.lock_path();
        let deadline = Instant::now() + self.lock_timeout;
        loop {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .open(&lock_path)
                .map_err(|e| StorageError::Io {
                    path: lock_path.display().to_string(),
                    source: e,
                })?;
            if file.try_lock_exclusive().is_ok() {
                return Ok(file);
            }
            if Instant::now() >= deadline {
                // Holder is presumed dead: take the lock over
                warn!(path = %lock_path.display(), "stale lock, taking over");
                let _ = fs::remove_file(&lock_path);
                let file = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .open(&lock_path)
                    .map_err(|e| StorageError::Io {
                        path: lock_path.display().to_string(),
                        source: e,
                    })?;
                return match file.try_lock_exclusive() {
                    Ok(()) => Ok(file),
                    Err(_) => Err(StorageError::LockTimeout(
                        lock_path.display().to_string(),
                    )
                    .into()),
                };
            }
            std::thread::sleep(LOCK_POLL);
        }
    }
}
