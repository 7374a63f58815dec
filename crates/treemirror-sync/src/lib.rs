//! treemirror sync - change detection and remote convergence
//!
//! Provides:
//! - Content fingerprints with a fast and a legacy digest format
//! - Ignore-aware enumeration of the local tree
//! - A per-pass snapshot of remote metadata
//! - Two-tier change detection (modify-time first, digest second)
//! - Concurrent upload/delete execution with abort-on-quota
//! - Filesystem watching and incremental sync
//!
//! ## Modules
//!
//! - [`hasher`] - BLAKE3 / SHA-256 digests
//! - [`enumerator`] - local file universe and ignore rules
//! - [`index`] - remote metadata snapshot
//! - [`detector`] - builds the [`detector::SyncPlan`]
//! - [`executor`] - applies a plan against the remote store
//! - [`watcher`] - notify-based watcher and debounce queue
//! - [`session`] - full pass plus continuous watch

pub mod detector;
pub mod enumerator;
pub mod executor;
pub mod hasher;
pub mod index;
pub mod session;
pub mod text;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testing;

use thiserror::Error;
use treemirror_core::domain::DomainError;
use treemirror_core::ports::RemoteStoreError;

/// Errors that end a sync pass or a watch session
///
/// Per-file failures never surface here; they are counted in the
/// [`executor::SyncSummary`] instead.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The remote store reported that the account's usage ceiling was reached
    #[error("Quota exceeded: {message}")]
    QuotaExceeded { message: String },

    /// The plan holds more changes than the configured ceiling
    #[error("Sync plan has {count} changes, limit is {limit}")]
    FileCountExceeded { count: usize, limit: usize },

    /// A pass-level remote store failure (e.g. the listing could not be read)
    #[error("Remote store error: {0}")]
    Store(#[from] RemoteStoreError),

    /// An I/O error outside of per-file processing
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A domain-level error propagated from treemirror-core
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// The filesystem watcher could not be set up
    #[error("Watcher error: {0}")]
    Watcher(String),
}

impl SyncError {
    /// Returns true for the pass-aborting quota condition
    pub fn is_quota(&self) -> bool {
        matches!(self, SyncError::QuotaExceeded { .. })
            || matches!(self, SyncError::Store(e) if e.is_quota())
    }
}
