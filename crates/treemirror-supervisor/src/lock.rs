//! Per-directory watch lock
//!
//! Prevents two watchers (manual `watch` or daemon) from running the initial
//! sync of the same directory at once. The lock file lives in a shared
//! directory and holds the owner's decimal pid. Staleness is decided by a
//! liveness probe of that pid, never by a timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::dir_key;
use crate::pidfile;
use crate::process::ProcessTable;

/// Acquisition rounds before giving up on a lock that keeps changing hands
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Age after which a lock file without a readable pid counts as abandoned
const UNREADABLE_GRACE: Duration = Duration::from_secs(2);

/// File-based mutual exclusion for one directory
pub struct WatchLock {
    path: PathBuf,
    pid: u32,
    processes: Arc<dyn ProcessTable>,
}

impl WatchLock {
    /// Lock for `dir`, owned by the current process
    ///
    /// The lock file is `<lock_dir>/treemirror-watch-<key>.lock`.
    pub fn new(lock_dir: &Path, dir: &Path, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            path: Self::lock_path(lock_dir, dir),
            pid: std::process::id(),
            processes,
        }
    }

    /// Acts on behalf of `pid` instead of the current process
    #[must_use]
    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    pub fn lock_path(lock_dir: &Path, dir: &Path) -> PathBuf {
        lock_dir.join(format!("treemirror-watch-{}.lock", dir_key(dir)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Pid recorded in the lock file, if any
    pub fn owner(&self) -> Option<u32> {
        pidfile::read_pid(&self.path)
    }

    /// Tries to take the lock
    ///
    /// Succeeds if no lock file exists, if this pid already owns it, or if
    /// the recorded owner is dead (the stale file is removed first).
    /// Contention and I/O problems both report `false`.
    pub fn acquire(&self) -> bool {
        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match pidfile::try_create(&self.path, self.pid) {
                Ok(true) => {
                    info!(lock = %self.path.display(), pid = self.pid, "Watch lock acquired");
                    return true;
                }
                Ok(false) => {}
                Err(err) => {
                    warn!(lock = %self.path.display(), error = %err, "Cannot create watch lock");
                    return false;
                }
            }

            match pidfile::read_pid(&self.path) {
                Some(owner) if owner == self.pid => return true,
                Some(owner) if self.processes.is_alive(owner) => {
                    debug!(owner, "Watch lock held by live process");
                    return false;
                }
                Some(owner) => {
                    info!(owner, "Reclaiming stale watch lock");
                    if pidfile::read_pid(&self.path) == Some(owner) {
                        let _ = pidfile::remove(&self.path);
                    }
                }
                None => {
                    if !self.unreadable_is_abandoned() {
                        return false;
                    }
                    let _ = pidfile::remove(&self.path);
                }
            }
        }
        false
    }

    /// Removes the lock file if this pid still owns it
    ///
    /// Safe to call any number of times.
    pub fn release(&self) {
        if self.owner() == Some(self.pid) {
            match pidfile::remove(&self.path) {
                Ok(_) => debug!(lock = %self.path.display(), "Watch lock released"),
                Err(err) => warn!(lock = %self.path.display(), error = %err, "Failed to release watch lock"),
            }
        }
    }

    /// True if a live process currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.owner().is_some_and(|pid| self.processes.is_alive(pid))
    }

    fn unreadable_is_abandoned(&self) -> bool {
        std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| SystemTime::now().duration_since(modified).ok())
            .is_some_and(|age| age >= UNREADABLE_GRACE)
    }
}

impl std::fmt::Debug for WatchLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchLock")
            .field("path", &self.path)
            .field("pid", &self.pid)
            .finish()
    }
}
