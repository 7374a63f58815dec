//! Change detection
//!
//! [`ChangeDetector::plan`] compares the enumerated local files with the
//! remote metadata snapshot and splits them into uploads, deletes and
//! unchanged files.
//!
//! ## Two-tier check
//!
//! 1. If the remote record has a modify-time and the local modify-time is
//!    not strictly greater, the file is unchanged and its content is never
//!    read.
//! 2. Otherwise the content is read and hashed with the algorithm of the
//!    stored digest. Only an actual mismatch (or no stored digest) schedules
//!    an upload.
//!
//! Modify-times are compared at millisecond precision, the precision stored
//! in remote metadata.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use futures::stream::{self, StreamExt};
use tracing::{debug, info, warn};
use treemirror_core::config::ResolvedConfig;
use treemirror_core::domain::{DomainError, ExternalId, FileDigest};

use crate::hasher;
use crate::index::RemoteMetadataIndex;
use crate::SyncError;

/// Number of files examined concurrently while planning
const DETECT_CONCURRENCY: usize = 64;

// ============================================================================
// ContentReader
// ============================================================================

/// Reads file content during change detection
///
/// Tests substitute a counting reader to verify the fast path.
#[async_trait::async_trait]
pub trait ContentReader: Send + Sync {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>>;
}

/// Reads from the local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct FsContentReader;

#[async_trait::async_trait]
impl ContentReader for FsContentReader {
    async fn read(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(path).await
    }
}

// ============================================================================
// SyncPlan
// ============================================================================

/// A local file that needs to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedUpload {
    pub path: PathBuf,
    pub external_id: ExternalId,
    /// Digest of the content read during planning
    pub hash: FileDigest,
    /// Local modify-time, truncated to milliseconds
    pub mtime: DateTime<Utc>,
    pub size: u64,
}

/// A file that could not be examined
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Result of change detection for one pass
#[derive(Debug, Clone, Default)]
pub struct SyncPlan {
    pub to_upload: Vec<PlannedUpload>,
    pub to_delete: Vec<ExternalId>,
    pub unchanged: Vec<PathBuf>,
    /// Files that vanished or could not be read while planning
    pub failed: Vec<PlanFailure>,
    /// Zero-byte and oversize files, neither uploaded nor errors
    pub skipped: usize,
}

impl SyncPlan {
    /// Number of remote operations the plan would perform
    pub fn change_count(&self) -> usize {
        self.to_upload.len() + self.to_delete.len()
    }

    pub fn is_empty(&self) -> bool {
        self.change_count() == 0 && self.failed.is_empty()
    }

    /// Fails if the plan holds more changes than `max_file_count`
    ///
    /// # Errors
    /// Returns [`SyncError::FileCountExceeded`]
    pub fn check_limit(&self, max_file_count: usize) -> Result<(), SyncError> {
        let count = self.change_count();
        if count > max_file_count {
            return Err(SyncError::FileCountExceeded {
                count,
                limit: max_file_count,
            });
        }
        Ok(())
    }
}

// ============================================================================
// External ids
// ============================================================================

/// Remote key of `path` under `root`
///
/// Root-relative in shared mode, absolute otherwise.
///
/// # Errors
/// Returns a `DomainError` if `path` cannot be expressed as an id
pub fn external_id_for(path: &Path, root: &Path, shared_mode: bool) -> Result<ExternalId, DomainError> {
    if shared_mode {
        ExternalId::from_relative(path, root)
    } else {
        ExternalId::from_path(path)
    }
}

/// Listing prefix covering `root`, or `None` in shared mode
///
/// # Errors
/// Returns a `DomainError` if `root` is not absolute
pub fn root_prefix(root: &Path, shared_mode: bool) -> Result<Option<ExternalId>, DomainError> {
    if shared_mode {
        Ok(None)
    } else {
        ExternalId::from_path(root).map(Some)
    }
}

/// Truncates a timestamp to millisecond precision
pub fn truncate_to_millis(time: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(time.timestamp_millis())
        .single()
        .unwrap_or(time)
}

// ============================================================================
// ChangeDetector
// ============================================================================

enum Verdict {
    Upload(PlannedUpload),
    Unchanged(PathBuf),
    Skipped,
    Failed(PlanFailure),
}

/// Builds [`SyncPlan`]s
pub struct ChangeDetector {
    reader: Arc<dyn ContentReader>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(Arc::new(FsContentReader))
    }
}

impl ChangeDetector {
    pub fn new(reader: Arc<dyn ContentReader>) -> Self {
        Self { reader }
    }

    /// Computes the plan for `root`
    ///
    /// # Arguments
    /// * `root` - Absolute root being synchronized
    /// * `local_files` - Enumerated absolute paths under `root`
    /// * `index` - Remote metadata snapshot taken at the start of the pass
    /// * `config` - Resolved limits and id mode
    ///
    /// # Errors
    /// Returns `SyncError::Domain` if `root` is not a valid absolute path.
    /// Per-file problems are collected in [`SyncPlan::failed`].
    #[tracing::instrument(skip_all, fields(root = %root.display()))]
    pub async fn plan(
        &self,
        root: &Path,
        local_files: impl IntoIterator<Item = PathBuf>,
        index: &RemoteMetadataIndex,
        config: &ResolvedConfig,
    ) -> Result<SyncPlan, SyncError> {
        let prefix = root_prefix(root, config.shared_mode)?;
        let mut plan = SyncPlan::default();
        let mut seen: HashSet<ExternalId> = HashSet::new();
        let mut ids = Vec::new();

        for path in local_files {
            match external_id_for(&path, root, config.shared_mode) {
                Ok(id) => {
                    seen.insert(id.clone());
                    ids.push((path, id));
                }
                Err(err) => plan.failed.push(PlanFailure {
                    path,
                    message: err.to_string(),
                }),
            }
        }

        let verdicts: Vec<Verdict> = stream::iter(ids)
            .map(|(path, id)| self.examine(path, id, index, config))
            .buffer_unordered(DETECT_CONCURRENCY)
            .collect()
            .await;

        for verdict in verdicts {
            match verdict {
                Verdict::Upload(upload) => plan.to_upload.push(upload),
                Verdict::Unchanged(path) => plan.unchanged.push(path),
                Verdict::Skipped => plan.skipped += 1,
                Verdict::Failed(failure) => plan.failed.push(failure),
            }
        }

        for id in index.ids() {
            if seen.contains(id) {
                continue;
            }
            let under_root = prefix.as_ref().map_or(true, |p| id.is_within(p));
            if under_root {
                plan.to_delete.push(id.clone());
            }
        }

        info!(
            upload = plan.to_upload.len(),
            delete = plan.to_delete.len(),
            unchanged = plan.unchanged.len(),
            skipped = plan.skipped,
            failed = plan.failed.len(),
            "Sync plan computed"
        );
        Ok(plan)
    }

    async fn examine(
        &self,
        path: PathBuf,
        external_id: ExternalId,
        index: &RemoteMetadataIndex,
        config: &ResolvedConfig,
    ) -> Verdict {
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "File vanished before planning");
                return Verdict::Failed(PlanFailure {
                    path,
                    message: err.to_string(),
                });
            }
        };

        let size = metadata.len();
        if size == 0 {
            debug!(path = %path.display(), "Skipping empty file");
            return Verdict::Skipped;
        }
        if size > config.max_file_size {
            debug!(path = %path.display(), size, limit = config.max_file_size, "Skipping oversize file");
            return Verdict::Skipped;
        }

        let mtime = match metadata.modified() {
            Ok(t) => truncate_to_millis(DateTime::<Utc>::from(t)),
            Err(err) => {
                return Verdict::Failed(PlanFailure {
                    path,
                    message: err.to_string(),
                })
            }
        };

        let record = index.get(&external_id);

        if let Some(stored_mtime) = record.and_then(|r| r.mtime) {
            let size_changed = config.compare_size
                && record
                    .and_then(|r| r.size)
                    .is_some_and(|stored| stored != size);
            if mtime <= truncate_to_millis(stored_mtime) && !size_changed {
                return Verdict::Unchanged(path);
            }
        }

        let content = match self.reader.read(&path).await {
            Ok(c) => c,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to read file");
                return Verdict::Failed(PlanFailure {
                    path,
                    message: err.to_string(),
                });
            }
        };

        let size = content.len() as u64;
        let stored = record.and_then(|r| r.hash.clone());
        let hash = match hasher::digest_if_changed(stored, content).await {
            Ok(Some(hash)) => hash,
            Ok(None) => {
                debug!(path = %path.display(), "Modify-time advanced but content unchanged");
                return Verdict::Unchanged(path);
            }
            Err(err) => {
                return Verdict::Failed(PlanFailure {
                    path,
                    message: err.to_string(),
                })
            }
        };

        Verdict::Upload(PlannedUpload {
            hash,
            size,
            path,
            external_id,
            mtime,
        })
    }
}
