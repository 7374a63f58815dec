//! Concurrent plan execution
//!
//! [`SyncExecutor::execute`] schedules every upload and delete of a
//! [`SyncPlan`] as a task on a [`JoinSet`], with a [`Semaphore`] bounding
//! how many touch the remote store at once. Tasks are independent: each
//! targets a distinct external id, so no ordering is kept between them.
//!
//! ## Failure policy
//!
//! - Per-file failures are counted and reported through the progress
//!   callback; the pass goes on.
//! - A quota failure trips a pass-wide flag. Operations that have not
//!   started yet are counted as processed without being attempted, in-flight
//!   operations finish, then the pass returns [`SyncError::QuotaExceeded`].
//! - A streaming upload that fails for another reason is retried once as a
//!   buffered text upload, but only when the file is text-like.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use treemirror_core::config::ResolvedConfig;
use treemirror_core::domain::ExternalId;
use treemirror_core::ports::{
    IRemoteStore, RemoteStoreError, UploadBody, UploadMetadata, UploadRequest,
};

use crate::detector::{external_id_for, truncate_to_millis, PlannedUpload, SyncPlan};
use crate::{hasher, text, SyncError};

// ============================================================================
// Options, progress and summary
// ============================================================================

/// What happened to one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Uploaded { path: PathBuf },
    Deleted { external_id: ExternalId },
    /// Dry run: the upload would have happened
    WouldUpload { path: PathBuf },
    /// Dry run: the delete would have happened
    WouldDelete { external_id: ExternalId },
    /// Not attempted because the quota was exhausted
    Skipped { target: String },
    Failed { target: String, message: String },
}

/// Callback invoked once per processed file
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Knobs for one call to [`SyncExecutor::execute`]
#[derive(Clone, Default)]
pub struct ExecuteOptions {
    /// Log intended actions without touching the remote store
    pub dry_run: bool,
    pub progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for ExecuteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("dry_run", &self.dry_run)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

/// Counters reported at the end of a pass
///
/// In a dry run `uploaded` and `deleted` count the operations that would
/// have been performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub processed: usize,
    pub uploaded: usize,
    pub deleted: usize,
    pub errors: usize,
    pub total: usize,
}

/// Result of a single incremental operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Uploaded(ExternalId),
    Deleted(ExternalId),
    /// Empty, oversize, or already absent remotely
    Skipped,
}

// ============================================================================
// Pass state shared by tasks
// ============================================================================

#[derive(Default)]
struct PassState {
    processed: AtomicUsize,
    uploaded: AtomicUsize,
    deleted: AtomicUsize,
    errors: AtomicUsize,
    quota_tripped: AtomicBool,
    quota_message: OnceLock<String>,
}

impl PassState {
    fn trip_quota(&self, message: &str) {
        if !self.quota_tripped.swap(true, Ordering::SeqCst) {
            warn!(reason = message, "Quota exceeded, skipping remaining operations");
        }
        let _ = self.quota_message.set(message.to_string());
    }

    fn quota_tripped(&self) -> bool {
        self.quota_tripped.load(Ordering::SeqCst)
    }

    fn summary(&self, total: usize) -> SyncSummary {
        SyncSummary {
            processed: self.processed.load(Ordering::SeqCst),
            uploaded: self.uploaded.load(Ordering::SeqCst),
            deleted: self.deleted.load(Ordering::SeqCst),
            errors: self.errors.load(Ordering::SeqCst),
            total,
        }
    }
}

enum Operation {
    Upload(PlannedUpload),
    Delete(ExternalId),
}

impl Operation {
    fn target(&self) -> String {
        match self {
            Operation::Upload(u) => u.path.display().to_string(),
            Operation::Delete(id) => id.to_string(),
        }
    }
}

// ============================================================================
// SyncExecutor
// ============================================================================

/// Applies plans and single-file changes to the remote store
#[derive(Clone)]
pub struct SyncExecutor {
    store: Arc<dyn IRemoteStore>,
    root: PathBuf,
    config: ResolvedConfig,
    concurrency: usize,
}

impl SyncExecutor {
    /// Creates an executor for `root`
    ///
    /// # Arguments
    /// * `store` - Remote store the tree is mirrored into
    /// * `root` - Absolute root being synchronized
    /// * `config` - Resolved store id, limits and id mode
    /// * `concurrency` - Maximum simultaneous remote operations (at least 1)
    pub fn new(
        store: Arc<dyn IRemoteStore>,
        root: PathBuf,
        config: ResolvedConfig,
        concurrency: usize,
    ) -> Self {
        Self {
            store,
            root,
            config,
            concurrency: concurrency.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    /// Executes every operation of `plan`
    ///
    /// Detection failures already recorded in the plan count as processed
    /// errors.
    ///
    /// # Errors
    /// Returns [`SyncError::QuotaExceeded`] once all in-flight operations
    /// have finished if any operation reported a quota failure.
    #[tracing::instrument(skip_all, fields(root = %self.root.display(), dry_run = options.dry_run))]
    pub async fn execute(
        &self,
        plan: SyncPlan,
        options: ExecuteOptions,
    ) -> Result<SyncSummary, SyncError> {
        let total = plan.change_count() + plan.failed.len();
        let state = Arc::new(PassState::default());
        let progress = options.progress.clone();

        for failure in &plan.failed {
            state.processed.fetch_add(1, Ordering::SeqCst);
            state.errors.fetch_add(1, Ordering::SeqCst);
            report(
                &progress,
                ProgressEvent::Failed {
                    target: failure.path.display().to_string(),
                    message: failure.message.clone(),
                },
            );
        }

        let operations = plan
            .to_upload
            .into_iter()
            .map(Operation::Upload)
            .chain(plan.to_delete.into_iter().map(Operation::Delete));

        if options.dry_run {
            for op in operations {
                state.processed.fetch_add(1, Ordering::SeqCst);
                match op {
                    Operation::Upload(u) => {
                        info!(path = %u.path.display(), "Would upload");
                        state.uploaded.fetch_add(1, Ordering::SeqCst);
                        report(&progress, ProgressEvent::WouldUpload { path: u.path });
                    }
                    Operation::Delete(id) => {
                        info!(external_id = %id, "Would delete");
                        state.deleted.fetch_add(1, Ordering::SeqCst);
                        report(&progress, ProgressEvent::WouldDelete { external_id: id });
                    }
                }
            }
            return Ok(state.summary(total));
        }

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for op in operations {
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&state);
            let progress = progress.clone();
            let store = Arc::clone(&self.store);
            let store_id = self.config.store_id.clone();

            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                run_operation(store.as_ref(), &store_id, op, &state, &progress).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "Sync task failed");
                state.processed.fetch_add(1, Ordering::SeqCst);
                state.errors.fetch_add(1, Ordering::SeqCst);
            }
        }

        let summary = state.summary(total);
        info!(
            processed = summary.processed,
            uploaded = summary.uploaded,
            deleted = summary.deleted,
            errors = summary.errors,
            total = summary.total,
            "Sync pass finished"
        );

        if state.quota_tripped() {
            let message = state
                .quota_message
                .get()
                .cloned()
                .unwrap_or_else(|| "quota exceeded".to_string());
            return Err(SyncError::QuotaExceeded { message });
        }
        Ok(summary)
    }

    /// Uploads one file outside of a planned pass
    ///
    /// Empty and oversize files are skipped.
    ///
    /// # Errors
    /// Returns [`SyncError::QuotaExceeded`] on quota failures, `SyncError::Io`
    /// if the file cannot be read and `SyncError::Store` for other rejections.
    #[tracing::instrument(skip_all, fields(path = %path.display()))]
    pub async fn upload_one(&self, path: &Path) -> Result<FileOutcome, SyncError> {
        let metadata = tokio::fs::metadata(path).await?;
        let size = metadata.len();
        if size == 0 || size > self.config.max_file_size {
            debug!(size, "Skipping empty or oversize file");
            return Ok(FileOutcome::Skipped);
        }

        let content = tokio::fs::read(path).await?;
        let upload = PlannedUpload {
            path: path.to_path_buf(),
            external_id: external_id_for(path, &self.root, self.config.shared_mode)?,
            hash: hasher::hash(&content),
            mtime: truncate_to_millis(DateTime::<Utc>::from(metadata.modified()?)),
            size: content.len() as u64,
        };
        let external_id = upload.external_id.clone();

        upload_with_fallback(self.store.as_ref(), &self.config.store_id, &upload)
            .await
            .map_err(into_sync_error)?;
        info!(external_id = %external_id, "Uploaded");
        Ok(FileOutcome::Uploaded(external_id))
    }

    /// Deletes one remote file outside of a planned pass
    ///
    /// A file already absent remotely counts as skipped.
    ///
    /// # Errors
    /// Returns [`SyncError::QuotaExceeded`] on quota failures and
    /// `SyncError::Store` for other rejections.
    #[tracing::instrument(skip_all, fields(external_id = %external_id))]
    pub async fn delete_one(&self, external_id: &ExternalId) -> Result<FileOutcome, SyncError> {
        match self
            .store
            .delete_file(&self.config.store_id, external_id)
            .await
        {
            Ok(()) => {
                info!("Deleted");
                Ok(FileOutcome::Deleted(external_id.clone()))
            }
            Err(RemoteStoreError::NotFound(_)) => Ok(FileOutcome::Skipped),
            Err(err) => Err(into_sync_error(err)),
        }
    }
}

fn into_sync_error(err: RemoteStoreError) -> SyncError {
    match err {
        RemoteStoreError::QuotaExceeded(message) => SyncError::QuotaExceeded { message },
        other => SyncError::Store(other),
    }
}

fn report(progress: &Option<ProgressCallback>, event: ProgressEvent) {
    if let Some(callback) = progress {
        callback(&event);
    }
}

async fn run_operation(
    store: &dyn IRemoteStore,
    store_id: &str,
    op: Operation,
    state: &PassState,
    progress: &Option<ProgressCallback>,
) {
    state.processed.fetch_add(1, Ordering::SeqCst);

    if state.quota_tripped() {
        report(progress, ProgressEvent::Skipped { target: op.target() });
        return;
    }

    let target = op.target();
    let result = match op {
        Operation::Upload(upload) => upload_with_fallback(store, store_id, &upload)
            .await
            .map(|()| ProgressEvent::Uploaded { path: upload.path }),
        Operation::Delete(id) => store
            .delete_file(store_id, &id)
            .await
            .map(|()| ProgressEvent::Deleted { external_id: id }),
    };

    match result {
        Ok(event) => {
            match &event {
                ProgressEvent::Uploaded { .. } => state.uploaded.fetch_add(1, Ordering::SeqCst),
                _ => state.deleted.fetch_add(1, Ordering::SeqCst),
            };
            debug!(target = %target, "Operation succeeded");
            report(progress, event);
        }
        Err(RemoteStoreError::QuotaExceeded(message)) => {
            state.trip_quota(&message);
            report(progress, ProgressEvent::Skipped { target });
        }
        Err(err) => {
            state.errors.fetch_add(1, Ordering::SeqCst);
            warn!(target = %target, error = %err, "Operation failed");
            report(
                progress,
                ProgressEvent::Failed {
                    target,
                    message: err.to_string(),
                },
            );
        }
    }
}

/// Streams the file; on a non-quota failure retries as text if text-like
async fn upload_with_fallback(
    store: &dyn IRemoteStore,
    store_id: &str,
    upload: &PlannedUpload,
) -> Result<(), RemoteStoreError> {
    let metadata = UploadMetadata {
        path: upload.path.to_string_lossy().into_owned(),
        hash: upload.hash.clone(),
        mtime: upload.mtime,
        size: upload.size,
    };
    let request = UploadRequest {
        external_id: upload.external_id.clone(),
        body: UploadBody::Stream(upload.path.clone()),
        overwrite: true,
        metadata,
    };

    let stream_err = match store.upload_file(store_id, request.clone()).await {
        Ok(()) => return Ok(()),
        Err(err) if err.is_quota() => return Err(err),
        Err(err) => err,
    };

    let bytes = tokio::fs::read(&upload.path)
        .await
        .map_err(|e| RemoteStoreError::Other(format!("read failed: {e}")))?;
    if !text::is_text_like(&bytes) {
        debug!(path = %upload.path.display(), "Binary file, no text fallback");
        return Err(stream_err);
    }

    let content = String::from_utf8(bytes)
        .map_err(|e| RemoteStoreError::Other(format!("invalid utf-8: {e}")))?;
    debug!(path = %upload.path.display(), error = %stream_err, "Streaming upload failed, retrying as text");
    store
        .upload_file(
            store_id,
            UploadRequest {
                body: UploadBody::Text(content),
                ..request
            },
        )
        .await
}
