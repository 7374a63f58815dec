//! Sync passes and continuous watching for one root
//!
//! A [`WatchSession`] owns everything needed to keep one directory mirrored:
//! the enumerator (with its ignore-rule cache), the change detector and the
//! executor. [`WatchSession::run_pass`] is a one-shot sync;
//! [`WatchSession::run`] performs the initial pass and then applies debounced
//! filesystem events incrementally until cancelled.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use treemirror_core::config::{Config, ResolvedConfig};
use treemirror_core::domain::{DomainError, ExternalId};
use treemirror_core::ports::IRemoteStore;

use crate::detector::{external_id_for, root_prefix, ChangeDetector};
use crate::enumerator::{EnumeratorContext, FileEnumerator};
use crate::executor::{ExecuteOptions, FileOutcome, SyncExecutor, SyncSummary};
use crate::index::RemoteMetadataIndex;
use crate::watcher::{ChangeEvent, DebouncedChangeQueue, FileWatcher};
use crate::SyncError;

/// Upper bound on how often settled events are polled
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Settings a session reads from the configuration at start-up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub resolved: ResolvedConfig,
    pub concurrency: usize,
    pub debounce: Duration,
    pub ignore_file_name: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            resolved: config.resolved(),
            concurrency: config.sync.concurrency,
            debounce: Duration::from_millis(config.sync.debounce_ms),
            ignore_file_name: config.sync.ignore_file_name.clone(),
        }
    }
}

/// Keeps one root mirrored into the remote store
pub struct WatchSession {
    root: PathBuf,
    settings: SessionSettings,
    store: Arc<dyn IRemoteStore>,
    context: Arc<EnumeratorContext>,
    enumerator: FileEnumerator,
    detector: ChangeDetector,
    executor: SyncExecutor,
}

impl WatchSession {
    /// Creates a session for `root`
    ///
    /// # Errors
    /// Returns `SyncError::Domain` if `root` is not absolute
    pub fn new(
        store: Arc<dyn IRemoteStore>,
        root: PathBuf,
        settings: SessionSettings,
    ) -> Result<Self, SyncError> {
        if !root.is_absolute() {
            return Err(DomainError::InvalidPath(format!(
                "sync root must be absolute: {}",
                root.display()
            ))
            .into());
        }

        let context = Arc::new(EnumeratorContext::new(settings.ignore_file_name.clone()));
        let executor = SyncExecutor::new(
            Arc::clone(&store),
            root.clone(),
            settings.resolved.clone(),
            settings.concurrency,
        );

        Ok(Self {
            enumerator: FileEnumerator::new(Arc::clone(&context)),
            detector: ChangeDetector::default(),
            context,
            executor,
            store,
            root,
            settings,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Runs one complete sync pass
    ///
    /// # Errors
    /// - `SyncError::Store` if the remote listing fails
    /// - `SyncError::FileCountExceeded` before any remote mutation
    /// - `SyncError::QuotaExceeded` if the store ran out of quota
    pub async fn run_pass(&self, options: ExecuteOptions) -> Result<SyncSummary, SyncError> {
        self.pass(options).await.map(|(summary, _)| summary)
    }

    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    async fn pass(
        &self,
        options: ExecuteOptions,
    ) -> Result<(SyncSummary, HashSet<ExternalId>), SyncError> {
        let resolved = &self.settings.resolved;
        let prefix = root_prefix(&self.root, resolved.shared_mode)?;
        let index = RemoteMetadataIndex::build(
            self.store.as_ref(),
            &resolved.store_id,
            prefix.as_ref().map(ExternalId::as_str),
        )
        .await?;

        let files = self.local_files(self.root.clone()).await?;
        debug!(files = files.len(), "Enumerated local files");

        let plan = self
            .detector
            .plan(&self.root, files, &index, resolved)
            .await?;
        plan.check_limit(resolved.max_file_count)?;

        let mut known: HashSet<ExternalId> = index.ids().cloned().collect();
        known.extend(plan.to_upload.iter().map(|u| u.external_id.clone()));
        for id in &plan.to_delete {
            known.remove(id);
        }

        let summary = self.executor.execute(plan, options).await?;
        Ok((summary, known))
    }

    /// Runs the initial pass, then follows filesystem events until `cancel` fires
    ///
    /// Returns the summary of the initial pass.
    ///
    /// # Errors
    /// Any error of [`run_pass`](Self::run_pass), `SyncError::Watcher` if the
    /// watch cannot be set up, and `SyncError::QuotaExceeded` from an
    /// incremental change.
    #[tracing::instrument(skip_all, fields(root = %self.root.display()))]
    pub async fn run(&self, cancel: CancellationToken) -> Result<SyncSummary, SyncError> {
        // Watch before the initial pass so edits made during it are not missed
        let (mut watcher, mut events) =
            FileWatcher::new().map_err(|e| SyncError::Watcher(format!("{e:#}")))?;
        watcher
            .watch(&self.root)
            .map_err(|e| SyncError::Watcher(format!("{e:#}")))?;

        let (summary, mut known) = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Cancelled during initial sync");
                return Ok(SyncSummary::default());
            }
            result = self.pass(ExecuteOptions::default()) => result?,
        };
        info!(
            uploaded = summary.uploaded,
            deleted = summary.deleted,
            errors = summary.errors,
            "Initial sync complete, watching for changes"
        );

        let mut queue = DebouncedChangeQueue::new(self.settings.debounce);
        let mut ticker = tokio::time::interval(self.settings.debounce.clamp(
            Duration::from_millis(10),
            MAX_POLL_INTERVAL,
        ));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pending = queue.pending_count(), "Watch session stopping");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => queue.push(event),
                    None => {
                        warn!("File watcher channel closed");
                        break;
                    }
                },
                _ = ticker.tick() => {
                    for event in queue.poll() {
                        self.apply(event, &mut known).await?;
                    }
                }
            }
        }

        Ok(summary)
    }

    async fn local_files(&self, dir: PathBuf) -> Result<Vec<PathBuf>, SyncError> {
        let enumerator = self.enumerator.clone();
        tokio::task::spawn_blocking(move || enumerator.get_files(&dir).collect())
            .await
            .map_err(|e| SyncError::Io(std::io::Error::other(e)))
    }

    async fn apply(
        &self,
        event: ChangeEvent,
        known: &mut HashSet<ExternalId>,
    ) -> Result<(), SyncError> {
        match event {
            ChangeEvent::Renamed { old, new } => {
                self.apply_path(&old, known).await?;
                self.apply_path(&new, known).await
            }
            other => self.apply_path(other.path(), known).await,
        }
    }

    /// Brings the remote copy of `path` in line with its current local state
    async fn apply_path(
        &self,
        path: &Path,
        known: &mut HashSet<ExternalId>,
    ) -> Result<(), SyncError> {
        if path == self.root || !path.starts_with(&self.root) {
            return Ok(());
        }

        if let Some(name) = path.file_name() {
            if name == ".gitignore" || name == self.context.ignore_file_name() {
                debug!(path = %path.display(), "Ignore rules changed");
                self.context.invalidate();
            }
        }

        match tokio::fs::metadata(path).await {
            Ok(metadata) if metadata.is_dir() => {
                if self.enumerator.is_ignored(path, &self.root) {
                    return Ok(());
                }
                for file in self.local_files(path.to_path_buf()).await? {
                    self.upload(&file, known).await?;
                }
                Ok(())
            }
            Ok(_) => {
                if self.enumerator.is_ignored(path, &self.root) {
                    debug!(path = %path.display(), "Ignoring change");
                    return Ok(());
                }
                self.upload(path, known).await
            }
            Err(_) => self.remove(path, known).await,
        }
    }

    async fn upload(&self, path: &Path, known: &mut HashSet<ExternalId>) -> Result<(), SyncError> {
        match self.executor.upload_one(path).await {
            Ok(FileOutcome::Uploaded(id)) => {
                known.insert(id);
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(err) if err.is_quota() => Err(err),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Failed to upload change");
                Ok(())
            }
        }
    }

    /// Deletes the remote copies of `path` and of everything that was below it
    async fn remove(&self, path: &Path, known: &mut HashSet<ExternalId>) -> Result<(), SyncError> {
        let id = match external_id_for(path, &self.root, self.settings.resolved.shared_mode) {
            Ok(id) => id,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "No remote id for removed path");
                return Ok(());
            }
        };

        let doomed: Vec<ExternalId> = known.iter().filter(|k| k.is_within(&id)).cloned().collect();
        for external_id in doomed {
            match self.executor.delete_one(&external_id).await {
                Ok(_) => {
                    known.remove(&external_id);
                }
                Err(err) if err.is_quota() => return Err(err),
                Err(err) => warn!(external_id = %external_id, error = %err, "Failed to delete"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use treemirror_core::config::ConfigBuilder;
    use treemirror_core::ports::RemoteStoreError;

    use super::*;
    use crate::testing::MemoryStore;

    fn settings() -> SessionSettings {
        let config = ConfigBuilder::new()
            .store_id("store")
            .sync_concurrency(4)
            .sync_debounce_ms(20)
            .sync_max_file_count(100)
            .build();
        SessionSettings::from_config(&config)
    }

    fn session(store: &MemoryStore, root: &Path, settings: SessionSettings) -> WatchSession {
        WatchSession::new(Arc::new(store.clone()), root.to_path_buf(), settings).unwrap()
    }

    fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        (dir, root)
    }

    fn id(path: &Path) -> ExternalId {
        ExternalId::from_path(path).unwrap()
    }

    #[test]
    fn test_relative_root_rejected() {
        let result = WatchSession::new(
            Arc::new(MemoryStore::new()),
            PathBuf::from("relative"),
            settings(),
        );
        assert!(matches!(result, Err(SyncError::Domain(_))));
    }

    #[tokio::test]
    async fn test_run_pass_mirrors_tree_and_is_idempotent() {
        let (_dir, root) = canonical_tempdir();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join(".gitignore"), "*.tmp\n").unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn a() {}").unwrap();
        fs::write(root.join("README.md"), "# readme").unwrap();
        fs::write(root.join("scratch.tmp"), "junk").unwrap();

        let store = MemoryStore::new();
        let session = session(&store, &root, settings());

        let first = session.run_pass(ExecuteOptions::default()).await.unwrap();
        assert_eq!(first.uploaded, 2);
        assert!(store.records().contains_key(&id(&root.join("src/lib.rs"))));
        assert!(!store.records().contains_key(&id(&root.join("scratch.tmp"))));

        let second = session.run_pass(ExecuteOptions::default()).await.unwrap();
        assert_eq!(second.uploaded, 0);
        assert_eq!(second.deleted, 0);
    }

    #[tokio::test]
    async fn test_run_pass_deletes_removed_files() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();

        let store = MemoryStore::new();
        let session = session(&store, &root, settings());
        session.run_pass(ExecuteOptions::default()).await.unwrap();

        fs::remove_file(root.join("b.txt")).unwrap();
        let summary = session.run_pass(ExecuteOptions::default()).await.unwrap();
        assert_eq!(summary.deleted, 1);
        assert!(!store.records().contains_key(&id(&root.join("b.txt"))));
    }

    #[tokio::test]
    async fn test_file_count_limit_fails_before_any_mutation() {
        let (_dir, root) = canonical_tempdir();
        for i in 0..4 {
            fs::write(root.join(format!("f{i}.txt")), format!("{i}")).unwrap();
        }

        let mut limited = settings();
        limited.resolved.max_file_count = 3;
        let store = MemoryStore::new();

        let err = session(&store, &root, limited)
            .run_pass(ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::FileCountExceeded { count: 4, limit: 3 }));
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_pass() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join("a.txt"), "a").unwrap();
        let store = MemoryStore::new();
        store.fail_listing(RemoteStoreError::Other("unavailable".into()));

        let err = session(&store, &root, settings())
            .run_pass(ExecuteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Store(_)));
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test]
    async fn test_apply_path_uploads_and_deletes_directories() {
        let (_dir, root) = canonical_tempdir();
        fs::create_dir_all(root.join("pkg/inner")).unwrap();
        fs::write(root.join("pkg/a.rs"), "a").unwrap();
        fs::write(root.join("pkg/inner/b.rs"), "b").unwrap();
        fs::write(root.join("top.rs"), "top").unwrap();

        let store = MemoryStore::new();
        let session = session(&store, &root, settings());
        let mut known = HashSet::new();

        session.apply_path(&root.join("pkg"), &mut known).await.unwrap();
        assert_eq!(known.len(), 2);
        session.apply_path(&root.join("top.rs"), &mut known).await.unwrap();
        assert_eq!(store.records().len(), 3);

        fs::remove_dir_all(root.join("pkg")).unwrap();
        session.apply_path(&root.join("pkg"), &mut known).await.unwrap();
        let remaining: Vec<_> = store.records().into_keys().collect();
        assert_eq!(remaining, vec![id(&root.join("top.rs"))]);
        assert_eq!(known.len(), 1);
    }

    #[tokio::test]
    async fn test_apply_path_skips_ignored_files() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join(".treemirrorignore"), "*.secret\n").unwrap();
        fs::write(root.join("key.secret"), "hunter2").unwrap();

        let store = MemoryStore::new();
        let session = session(&store, &root, settings());
        let mut known = HashSet::new();
        session
            .apply_path(&root.join("key.secret"), &mut known)
            .await
            .unwrap();
        assert_eq!(store.attempts(), 0);
    }

    #[tokio::test]
    async fn test_apply_path_propagates_quota() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join("a.txt"), "a").unwrap();
        let store = MemoryStore::new();
        store.fail_on_attempt(1, RemoteStoreError::QuotaExceeded("quota".into()));

        let session = session(&store, &root, settings());
        let err = session
            .apply_path(&root.join("a.txt"), &mut HashSet::new())
            .await
            .unwrap_err();
        assert!(err.is_quota());
    }

    #[tokio::test]
    async fn test_run_follows_changes_until_cancelled() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join("initial.txt"), "initial").unwrap();

        let store = MemoryStore::new();
        let session = session(&store, &root, settings());
        let cancel = CancellationToken::new();
        let new_id = id(&root.join("later.txt"));

        let driver = async {
            // wait for the initial pass
            for _ in 0..200 {
                if !store.records().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            fs::write(root.join("later.txt"), "later").unwrap();
            for _ in 0..500 {
                if store.records().contains_key(&new_id) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(session.run(cancel.clone()), driver);
        let summary = result.unwrap();
        assert_eq!(summary.uploaded, 1);
        assert!(store.records().contains_key(&new_id));
    }

    #[tokio::test]
    async fn test_run_returns_quota_from_initial_pass() {
        let (_dir, root) = canonical_tempdir();
        fs::write(root.join("a.txt"), "a").unwrap();
        let store = MemoryStore::new();
        store.fail_on_attempt(1, RemoteStoreError::QuotaExceeded("usage limit".into()));

        let err = session(&store, &root, settings())
            .run(CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::QuotaExceeded { .. }));
    }
}
