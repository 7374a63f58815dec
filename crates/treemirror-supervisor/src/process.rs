//! Process liveness, termination and detached spawning
//!
//! The supervisor and the watch lock only talk to the OS through the
//! [`ProcessTable`] and [`DaemonSpawner`] traits, so tests can drive them
//! with fake process tables.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::{debug, info};

use crate::dir_key;

/// Executable name of the background watcher
pub const DAEMON_PROGRAM: &str = "treemirrord";

/// Liveness probing and termination of processes by pid
pub trait ProcessTable: Send + Sync {
    /// Returns true if a process with `pid` currently exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Asks `pid` to terminate; returns true if the signal was delivered
    fn terminate(&self, pid: u32) -> bool;
}

/// Starts a detached watcher for a directory
pub trait DaemonSpawner: Send + Sync {
    /// Spawns the watcher for `dir` and returns its pid
    ///
    /// # Errors
    /// Returns the OS error if the process could not be started
    fn spawn(&self, dir: &Path) -> io::Result<u32>;
}

// ============================================================================
// SystemProcesses
// ============================================================================

/// The real OS process table
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcesses;

#[cfg(unix)]
fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}

#[cfg(unix)]
impl ProcessTable for SystemProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = to_pid_t(pid) else {
            return false;
        };
        // Signal 0 probes without delivering anything
        let rc = unsafe { libc::kill(pid, 0) };
        rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    fn terminate(&self, pid: u32) -> bool {
        let Some(pid) = to_pid_t(pid) else {
            return false;
        };
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        debug!(pid, delivered = rc == 0, "Sent SIGTERM");
        rc == 0
    }
}

#[cfg(not(unix))]
impl ProcessTable for SystemProcesses {
    fn is_alive(&self, _pid: u32) -> bool {
        false
    }

    fn terminate(&self, _pid: u32) -> bool {
        false
    }
}

// ============================================================================
// DetachedSpawner
// ============================================================================

/// Spawns `treemirrord <dir>` in its own session
///
/// The child gets a null stdin and appends stdout/stderr to
/// `<log_dir>/<dir key>.log`, so it survives its parent's exit and terminal.
#[derive(Debug, Clone)]
pub struct DetachedSpawner {
    program: PathBuf,
    log_dir: PathBuf,
    extra_args: Vec<OsString>,
}

impl DetachedSpawner {
    pub fn new(program: PathBuf, log_dir: PathBuf) -> Self {
        Self {
            program,
            log_dir,
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before the directory, e.g. `--config <path>`
    #[must_use]
    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<OsString>>) -> Self {
        self.extra_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Picks the daemon executable
    ///
    /// An explicit path wins; otherwise a `treemirrord` next to the current
    /// executable; otherwise `treemirrord` looked up on `PATH`.
    pub fn resolve_program(explicit: Option<&Path>) -> PathBuf {
        if let Some(program) = explicit {
            return program.to_path_buf();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|d| d.join(DAEMON_PROGRAM)))
            .filter(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(DAEMON_PROGRAM))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Log file receiving the output of the daemon for `dir`
    pub fn log_path(&self, dir: &Path) -> PathBuf {
        self.log_dir.join(format!("{}.log", dir_key(dir)))
    }
}

impl DaemonSpawner for DetachedSpawner {
    fn spawn(&self, dir: &Path) -> io::Result<u32> {
        fs::create_dir_all(&self.log_dir)?;
        let log_path = self.log_path(dir);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args)
            .arg(dir)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));

        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            unsafe {
                cmd.pre_exec(|| {
                    // New session: no controlling terminal, not in the parent's group
                    if libc::setsid() == -1 {
                        return Err(io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let child = cmd.spawn()?;
        let pid = child.id();
        info!(
            pid,
            dir = %dir.display(),
            program = %self.program.display(),
            log = %log_path.display(),
            "Spawned detached watcher"
        );
        Ok(pid)
    }
}
