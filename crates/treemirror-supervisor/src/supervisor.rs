//! Hierarchy-aware daemon registry
//!
//! One detached watcher per directory, recorded as `<state_dir>/<key>.json`
//! holding `{"pid", "dir"}`. A parent directory's watcher covers all of its
//! descendants:
//!
//! - starting a daemon is a no-op if a live daemon already runs for the
//!   directory or any ancestor
//! - starting a daemon terminates live daemons of descendant directories
//!
//! The spawn critical section is guarded by `<state_dir>/<key>.lock`, an
//! atomic create-exclusive file, so concurrent callers never spawn twice.
//! Liveness always comes from probing the recorded pid.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};
use treemirror_core::domain::DaemonRecord;

use crate::process::{DaemonSpawner, ProcessTable};
use crate::{dir_key, pidfile, SupervisorError};

/// Explicit dependencies of a [`DaemonSupervisor`]
#[derive(Clone)]
pub struct SupervisorContext {
    /// Directory holding daemon records and start locks
    pub state_dir: PathBuf,
    pub processes: Arc<dyn ProcessTable>,
    pub spawner: Arc<dyn DaemonSpawner>,
}

/// Result of [`DaemonSupervisor::ensure_daemon`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// A live daemon for the directory or an ancestor already exists
    AlreadyCovered(DaemonRecord),
    /// Another process is starting a daemon for the same directory
    StartInProgress,
    /// A new daemon was spawned; `replaced` lists terminated descendants
    Started {
        pid: u32,
        replaced: Vec<DaemonRecord>,
    },
}

/// Removes the start lock when the critical section ends
struct StartLockGuard {
    path: PathBuf,
}

impl Drop for StartLockGuard {
    fn drop(&mut self) {
        if let Err(err) = pidfile::remove(&self.path) {
            warn!(lock = %self.path.display(), error = %err, "Failed to remove start lock");
        }
    }
}

/// Registry of background watchers
pub struct DaemonSupervisor {
    ctx: SupervisorContext,
}

impl DaemonSupervisor {
    pub fn new(ctx: SupervisorContext) -> Self {
        Self { ctx }
    }

    pub fn state_dir(&self) -> &Path {
        &self.ctx.state_dir
    }

    fn record_path(&self, dir: &Path) -> PathBuf {
        self.ctx.state_dir.join(format!("{}.json", dir_key(dir)))
    }

    fn start_lock_path(&self, dir: &Path) -> PathBuf {
        self.ctx.state_dir.join(format!("{}.lock", dir_key(dir)))
    }

    /// Makes sure `dir` is covered by a live daemon
    ///
    /// `dir` must already be resolved (absolute, symlinks followed); keys
    /// and hierarchy checks compare paths component by component.
    ///
    /// # Errors
    /// - `SupervisorError::Spawn` if the process could not be started; no
    ///   record is written in that case
    /// - `SupervisorError::Io` / `Record` for state file problems
    #[tracing::instrument(skip(self), fields(dir = %dir.display()))]
    pub fn ensure_daemon(&self, dir: &Path) -> Result<EnsureOutcome, SupervisorError> {
        if let Some(covering) = self.covering_daemon(dir)? {
            debug!(pid = covering.pid, covering = %covering.dir.display(), "Already covered");
            return Ok(EnsureOutcome::AlreadyCovered(covering));
        }

        fs::create_dir_all(&self.ctx.state_dir)?;
        let Some(_guard) = self.take_start_lock(dir)? else {
            info!("Daemon start already in progress");
            return Ok(EnsureOutcome::StartInProgress);
        };

        // Another caller may have finished starting between the first check and the lock
        if let Some(covering) = self.covering_daemon(dir)? {
            return Ok(EnsureOutcome::AlreadyCovered(covering));
        }

        let mut replaced = Vec::new();
        for (path, record) in self.read_records()? {
            if !record.dir.starts_with(dir) {
                continue;
            }
            if record.dir != dir && self.ctx.processes.is_alive(record.pid) {
                info!(pid = record.pid, child = %record.dir.display(), "Stopping descendant daemon");
                self.ctx.processes.terminate(record.pid);
                replaced.push(record);
            }
            pidfile::remove(&path)?;
        }

        let pid = self
            .ctx
            .spawner
            .spawn(dir)
            .map_err(SupervisorError::Spawn)?;
        self.write_record(&DaemonRecord {
            pid,
            dir: dir.to_path_buf(),
        })?;

        info!(pid, replaced = replaced.len(), "Daemon started");
        Ok(EnsureOutcome::Started { pid, replaced })
    }

    /// Stops the daemon recorded for exactly `dir`
    ///
    /// Returns true if a live daemon was signalled. A dead daemon's record is
    /// removed as garbage and reported as not stopped.
    ///
    /// # Errors
    /// Returns state file errors
    pub fn stop_daemon(&self, dir: &Path) -> Result<bool, SupervisorError> {
        let path = self.record_path(dir);
        let Some(record) = self.read_record(&path)? else {
            return Ok(false);
        };

        let stopped = self.ctx.processes.is_alive(record.pid)
            && self.ctx.processes.terminate(record.pid);
        if stopped || !self.ctx.processes.is_alive(record.pid) {
            pidfile::remove(&path)?;
        }
        if stopped {
            info!(pid = record.pid, dir = %record.dir.display(), "Daemon stopped");
        }
        Ok(stopped)
    }

    /// All recorded daemons whose process is alive, sorted by directory
    ///
    /// Dead records are skipped but not removed; see [`prune_dead`](Self::prune_dead).
    ///
    /// # Errors
    /// Returns state directory read errors
    pub fn list_daemons(&self) -> Result<Vec<DaemonRecord>, SupervisorError> {
        let mut live: Vec<DaemonRecord> = self
            .read_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| self.ctx.processes.is_alive(record.pid))
            .collect();
        live.sort_by(|a, b| a.dir.cmp(&b.dir));
        Ok(live)
    }

    /// Stops every live daemon and returns the ones that were signalled
    ///
    /// # Errors
    /// Returns state file errors
    pub fn stop_all(&self) -> Result<Vec<DaemonRecord>, SupervisorError> {
        let mut stopped = Vec::new();
        for record in self.list_daemons()? {
            if self.stop_daemon(&record.dir)? {
                stopped.push(record);
            }
        }
        Ok(stopped)
    }

    /// Deletes records of dead daemons; returns how many were removed
    ///
    /// # Errors
    /// Returns state file errors
    pub fn prune_dead(&self) -> Result<usize, SupervisorError> {
        let mut pruned = 0;
        for (path, record) in self.read_records()? {
            if !self.ctx.processes.is_alive(record.pid) && pidfile::remove(&path)? {
                debug!(pid = record.pid, dir = %record.dir.display(), "Pruned dead daemon record");
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    /// Record stored for exactly `dir`, alive or not
    ///
    /// # Errors
    /// Returns state file errors
    pub fn record_for(&self, dir: &Path) -> Result<Option<DaemonRecord>, SupervisorError> {
        self.read_record(&self.record_path(dir))
    }

    /// Removes the record for `dir` if it names `pid`
    ///
    /// Used by a daemon on shutdown so it never deletes a successor's record.
    ///
    /// # Errors
    /// Returns state file errors
    pub fn remove_record(&self, dir: &Path, pid: u32) -> Result<bool, SupervisorError> {
        let path = self.record_path(dir);
        match self.read_record(&path)? {
            Some(record) if record.pid == pid => Ok(pidfile::remove(&path)?),
            _ => Ok(false),
        }
    }

    fn covering_daemon(&self, dir: &Path) -> Result<Option<DaemonRecord>, SupervisorError> {
        Ok(self
            .read_records()?
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| dir.starts_with(&record.dir))
            .find(|record| self.ctx.processes.is_alive(record.pid)))
    }

    fn take_start_lock(&self, dir: &Path) -> Result<Option<StartLockGuard>, SupervisorError> {
        let path = self.start_lock_path(dir);
        let me = std::process::id();

        for _ in 0..2 {
            if pidfile::try_create(&path, me)? {
                return Ok(Some(StartLockGuard { path }));
            }
            match pidfile::read_pid(&path) {
                Some(owner) if !self.ctx.processes.is_alive(owner) => {
                    warn!(owner, "Removing start lock left by dead process");
                    pidfile::remove(&path)?;
                }
                _ => return Ok(None),
            }
        }
        Ok(None)
    }

    fn write_record(&self, record: &DaemonRecord) -> Result<(), SupervisorError> {
        let path = self.record_path(&record.dir);
        let json = serde_json::to_vec_pretty(record).map_err(|source| SupervisorError::Record {
            path: path.clone(),
            source,
        })?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn read_record(&self, path: &Path) -> Result<Option<DaemonRecord>, SupervisorError> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(record) => Ok(Some(record)),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Ignoring unreadable daemon record");
                Ok(None)
            }
        }
    }

    fn read_records(&self) -> Result<Vec<(PathBuf, DaemonRecord)>, SupervisorError> {
        let entries = match fs::read_dir(&self.ctx.state_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(record) = self.read_record(&path)? {
                records.push((path, record));
            }
        }
        Ok(records)
    }
}
