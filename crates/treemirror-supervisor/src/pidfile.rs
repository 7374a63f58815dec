//! Atomic create-exclusive pid files
//!
//! The pid is first written to a private temporary file which is then
//! hard-linked to the final name. Linking fails if the name exists, so the
//! file appears atomically and never without its content. On filesystems
//! without hard links, exclusive creation is used instead.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::debug;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn temp_path(path: &Path, pid: u32) -> PathBuf {
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(format!(".{}.{pid}.{n}.tmp", std::process::id()));
    path.with_file_name(name)
}

/// Creates `path` containing `pid` unless it already exists
///
/// Returns `Ok(false)` if the file already exists.
///
/// # Errors
/// Returns I/O errors other than "already exists"
pub fn try_create(path: &Path, pid: u32) -> io::Result<bool> {
    let tmp = temp_path(path, pid);
    fs::write(&tmp, pid.to_string())?;
    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);

    match linked {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Hard link failed, using exclusive create");
            create_exclusive(path, pid)
        }
    }
}

fn create_exclusive(path: &Path, pid: u32) -> io::Result<bool> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(mut file) => {
            file.write_all(pid.to_string().as_bytes())?;
            file.sync_all()?;
            Ok(true)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reads the decimal pid stored in `path`
///
/// Returns `None` if the file is missing or does not hold a pid.
pub fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Removes `path`, tolerating a missing file; returns whether one was removed
///
/// # Errors
/// Returns I/O errors other than "not found"
pub fn remove(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
