//! Records describing remote files and running daemons

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::newtypes::{ExternalId, FileDigest};

/// What the remote store believes about one file
///
/// The remote store owns this data; locally it only ever lives inside a
/// per-pass metadata index and is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileRecord {
    /// Key of the file in the store
    pub external_id: ExternalId,
    /// Store-assigned object id, when the listing reports one
    pub object_id: Option<String>,
    /// Digest recorded at the last upload
    pub hash: Option<FileDigest>,
    /// Local modify-time recorded at the last upload
    pub mtime: Option<DateTime<Utc>>,
    /// Size in bytes recorded at the last upload
    pub size: Option<u64>,
}

impl RemoteFileRecord {
    /// Creates a record with no metadata attached
    #[must_use]
    pub fn bare(external_id: ExternalId) -> Self {
        Self {
            external_id,
            object_id: None,
            hash: None,
            mtime: None,
            size: None,
        }
    }
}

/// Persisted description of a background watcher
///
/// Stored as `{"pid": .., "dir": ".."}`, one file per watched directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRecord {
    /// Process id of the detached watcher
    pub pid: u32,
    /// Resolved absolute directory the watcher covers
    pub dir: PathBuf,
}
