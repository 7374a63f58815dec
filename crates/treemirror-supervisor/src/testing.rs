//! Fake process table and spawner for the unit tests of this crate

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::process::{DaemonSpawner, ProcessTable};

/// Process table backed by a set of live pids
#[derive(Default)]
pub struct FakeProcesses {
    alive: Mutex<HashSet<u32>>,
    terminated: Mutex<Vec<u32>>,
}

impl FakeProcesses {
    pub fn with_alive(pids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            alive: Mutex::new(pids.into_iter().collect()),
            terminated: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self, pid: u32) {
        self.alive.lock().unwrap().insert(pid);
    }

    pub fn kill(&self, pid: u32) {
        self.alive.lock().unwrap().remove(&pid);
    }

    pub fn terminated(&self) -> Vec<u32> {
        self.terminated.lock().unwrap().clone()
    }
}

impl ProcessTable for FakeProcesses {
    fn is_alive(&self, pid: u32) -> bool {
        self.alive.lock().unwrap().contains(&pid)
    }

    fn terminate(&self, pid: u32) -> bool {
        let was_alive = self.alive.lock().unwrap().remove(&pid);
        if was_alive {
            self.terminated.lock().unwrap().push(pid);
        }
        was_alive
    }
}

/// Spawner that registers new pids in a [`FakeProcesses`]
pub struct FakeSpawner {
    processes: Arc<FakeProcesses>,
    next_pid: AtomicU32,
    fail: AtomicBool,
    spawned: Mutex<Vec<PathBuf>>,
}

impl FakeSpawner {
    pub fn new(processes: Arc<FakeProcesses>) -> Self {
        Self {
            processes,
            next_pid: AtomicU32::new(1000),
            fail: AtomicBool::new(false),
            spawned: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn spawned(&self) -> Vec<PathBuf> {
        self.spawned.lock().unwrap().clone()
    }
}

impl DaemonSpawner for FakeSpawner {
    fn spawn(&self, dir: &Path) -> io::Result<u32> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such program"));
        }
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.processes.start(pid);
        self.spawned.lock().unwrap().push(dir.to_path_buf());
        Ok(pid)
    }
}
