//! treemirror supervisor - cross-process coordination of watchers
//!
//! Everything here communicates through the filesystem only: small pid
//! files, JSON daemon records and signals. Nothing is shared in memory
//! between processes.
//!
//! ## Modules
//!
//! - [`pidfile`] - atomic create-exclusive pid files
//! - [`process`] - liveness probing, termination and detached spawning
//! - [`lock`] - the per-directory [`lock::WatchLock`]
//! - [`signal`] - SIGINT/SIGTERM/SIGHUP into a cancellation token
//! - [`supervisor`] - the hierarchy-aware [`supervisor::DaemonSupervisor`]

pub mod lock;
pub mod pidfile;
pub mod process;
pub mod signal;
pub mod supervisor;

#[cfg(test)]
pub(crate) mod testing;

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Number of hex characters kept from the directory digest
const KEY_LEN: usize = 16;

/// Errors surfaced by the supervisor
///
/// Lock contention is never an error: acquisition reports "not acquired".
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The detached daemon process could not be started
    #[error("Failed to spawn daemon: {0}")]
    Spawn(std::io::Error),

    /// An I/O error on state or lock files
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A daemon record could not be encoded
    #[error("Invalid daemon record {path}: {source}")]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Stable file-name key for a resolved directory
///
/// First 16 hex characters of the BLAKE3 digest of the path bytes.
pub fn dir_key(dir: &Path) -> String {
    let digest = blake3::hash(dir.as_os_str().as_encoded_bytes());
    digest.to_hex().as_str()[..KEY_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dir_key_is_stable_and_distinct() {
        let a = dir_key(Path::new("/repo"));
        assert_eq!(a, dir_key(Path::new("/repo")));
        assert_ne!(a, dir_key(Path::new("/repo/src")));
        assert_eq!(a.len(), 16);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
