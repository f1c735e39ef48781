//! Cross-process mutation lock
//!
//! A lock file created with exclusive-create semantics in the snapshot
//! directory. The orchestrators and the watchdog's emergency rollback take
//! it before writing live state. Locks older than the stale horizon are
//! assumed to belong to a crashed holder and are broken.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

const LOCK_FILE: &str = ".mutation.lock";

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Who holds the lock (`apply`, `upgrade`, `watchdog`)
    pub holder: String,
    /// Holder process id
    pub pid: u32,
    /// Acquisition time
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn is_stale(&self, stale_after: Duration) -> bool {
        let age = Utc::now().signed_duration_since(self.acquired_at);
        age.to_std().map_or(false, |age| age > stale_after)
    }
}

/// Held mutation lock; released on drop
#[derive(Debug)]
pub struct MutationLock {
    path: PathBuf,
    info: LockInfo,
}

impl MutationLock {
    /// Take the lock in `dir`
    ///
    /// # Errors
    /// - `StoreError::Locked` if a live holder exists
    /// - `StoreError::Io` on filesystem failures
    pub fn acquire(dir: &Path, holder: &str, stale_after: Duration) -> Result<Self, StoreError> {
        let path = dir.join(LOCK_FILE);
        let info = LockInfo {
            holder: holder.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };

        // One retry after breaking a stale lock.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let body = serde_json::to_vec(&info)
                        .map_err(|e| StoreError::malformed("lock file", &path, e))?;
                    file.write_all(&body)
                        .and_then(|()| file.sync_all())
                        .map_err(|e| StoreError::io("write lock file", &path, e))?;
                    tracing::debug!(holder, path = %path.display(), "mutation lock acquired");
                    return Ok(Self { path, info });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let existing = read_lock(&path)?;
                    match existing {
                        Some(existing) if !existing.is_stale(stale_after) => {
                            return Err(StoreError::Locked {
                                holder: existing.holder,
                                pid: existing.pid,
                                acquired_at: existing.acquired_at,
                            });
                        }
                        Some(existing) => {
                            tracing::warn!(
                                holder = %existing.holder,
                                pid = existing.pid,
                                "breaking stale mutation lock"
                            );
                            remove_if_present(&path)?;
                        }
                        // Vanished between open and read
                        None => {}
                    }
                }
                Err(e) => return Err(StoreError::io("create lock file", &path, e)),
            }
        }

        match read_lock(&path)? {
            Some(existing) => Err(StoreError::Locked {
                holder: existing.holder,
                pid: existing.pid,
                acquired_at: existing.acquired_at,
            }),
            None => Err(StoreError::io(
                "create lock file",
                &path,
                std::io::Error::new(std::io::ErrorKind::WouldBlock, "lock contended"),
            )),
        }
    }

    /// Current non-stale holder, if any
    ///
    /// # Errors
    /// Returns `StoreError::Io` if the lock file exists but cannot be read
    pub fn holder(dir: &Path, stale_after: Duration) -> Result<Option<LockInfo>, StoreError> {
        Ok(read_lock(&dir.join(LOCK_FILE))?.filter(|info| !info.is_stale(stale_after)))
    }

    /// Lock details
    #[inline]
    #[must_use]
    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for MutationLock {
    fn drop(&mut self) {
        // Only remove the file while it still names this holder; another
        // process may have broken it as stale and taken it since.
        match read_lock(&self.path) {
            Ok(Some(current)) if current == self.info => {
                if let Err(e) = remove_if_present(&self.path) {
                    tracing::warn!(error = %e, "failed to release mutation lock");
                }
            }
            Ok(Some(current)) => tracing::warn!(
                holder = %current.holder,
                pid = current.pid,
                "mutation lock was taken over, leaving it in place"
            ),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "failed to release mutation lock"),
        }
    }
}

fn read_lock(path: &Path) -> Result<Option<LockInfo>, StoreError> {
    match fs::read(path) {
        Ok(bytes) => match serde_json::from_slice(&bytes) {
            Ok(info) => Ok(Some(info)),
            // Torn write by a crashed holder; treat as stale
            Err(_) => Ok(Some(LockInfo {
                holder: "unknown".to_string(),
                pid: 0,
                acquired_at: DateTime::<Utc>::MIN_UTC,
            })),
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io("read lock file", path, e)),
    }
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io("remove stale lock", path, e)),
    }
}
