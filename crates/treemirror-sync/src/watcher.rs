//! Filesystem watching and debounced change queue
//!
//! [`FileWatcher`] wraps a recursive `notify` watcher and turns raw OS events
//! into [`ChangeEvent`] values delivered over an mpsc channel.
//! [`DebouncedChangeQueue`] coalesces bursts so a path is only handed to the
//! watch session once it has been quiet for the debounce window.
//!
//! ```text
//! inotify / kqueue
//!       │
//!       ▼
//!  FileWatcher ──→ mpsc::channel ──→ DebouncedChangeQueue ──→ WatchSession
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the event channel between the OS callback and the session
const EVENT_CHANNEL_CAPACITY: usize = 4096;

// ============================================================================
// ChangeEvent
// ============================================================================

/// A filesystem change under a watched root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Created(PathBuf),
    /// Content or metadata changed
    Modified(PathBuf),
    Deleted(PathBuf),
    Renamed { old: PathBuf, new: PathBuf },
}

impl ChangeEvent {
    /// Primary path of the event (the destination for renames)
    pub fn path(&self) -> &Path {
        match self {
            ChangeEvent::Created(p) | ChangeEvent::Modified(p) | ChangeEvent::Deleted(p) => p,
            ChangeEvent::Renamed { new, .. } => new,
        }
    }
}

// ============================================================================
// FileWatcher
// ============================================================================

/// Recursive watcher over the OS-native notification mechanism
///
/// Dropping the watcher stops all watches and closes the channel.
pub struct FileWatcher {
    watcher: RecommendedWatcher,
}

impl FileWatcher {
    /// Creates a watcher and the receiver its events are delivered to
    ///
    /// # Errors
    /// Returns an error if the OS watcher cannot be created
    pub fn new() -> Result<(Self, mpsc::Receiver<ChangeEvent>)> {
        let (tx, rx) = mpsc::channel::<ChangeEvent>(EVENT_CHANNEL_CAPACITY);

        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    if let Some(change) = map_notify_event(&event) {
                        if let Err(e) = tx.blocking_send(change) {
                            warn!(error = %e, "Dropping change event, receiver closed");
                        }
                    }
                }
                Err(err) => error!(error = %err, "File watcher error"),
            },
            notify::Config::default(),
        )
        .context("Failed to create file watcher")?;

        Ok((Self { watcher }, rx))
    }

    /// Starts watching `path` and everything below it
    ///
    /// # Errors
    /// Returns an error if the path does not exist or the OS watch limit is hit
    pub fn watch(&mut self, path: &Path) -> Result<()> {
        info!(path = %path.display(), "Starting recursive watch");
        self.watcher
            .watch(path, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch path: {}", path.display()))
    }
}

/// Converts a `notify::Event` into a [`ChangeEvent`]
///
/// - `Create(*)` -> `Created`
/// - `Modify(Name(Both))` with two paths -> `Renamed`
/// - other `Modify(*)` -> `Modified` (the session checks whether the path
///   still exists, so a rename half reported as a modify is still handled)
/// - `Remove(*)` -> `Deleted`
///
/// Access events and events without paths are dropped.
fn map_notify_event(event: &notify::Event) -> Option<ChangeEvent> {
    let paths = &event.paths;

    match &event.kind {
        EventKind::Create(_) => paths.first().cloned().map(ChangeEvent::Created),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() >= 2 => {
            Some(ChangeEvent::Renamed {
                old: paths[0].clone(),
                new: paths[1].clone(),
            })
        }
        EventKind::Modify(_) => paths.first().cloned().map(ChangeEvent::Modified),
        EventKind::Remove(_) => paths.first().cloned().map(ChangeEvent::Deleted),
        _ => {
            debug!(kind = ?event.kind, "Ignoring event kind");
            None
        }
    }
}

// ============================================================================
// DebouncedChangeQueue
// ============================================================================

/// Coalesces rapid changes per path
///
/// The latest event for a path replaces earlier ones and restarts its quiet
/// period. [`poll`](Self::poll) hands out events whose quiet period elapsed.
pub struct DebouncedChangeQueue {
    pending: HashMap<PathBuf, (ChangeEvent, Instant)>,
    debounce_delay: Duration,
}

impl DebouncedChangeQueue {
    pub fn new(debounce_delay: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            debounce_delay,
        }
    }

    /// Inserts `event`, replacing any pending event for the same path
    ///
    /// A rename also settles any pending event on its source path, since the
    /// rename supersedes it. When a pending rename is superseded, its source
    /// path stays queued as a deletion so the old remote copy still goes.
    pub fn push(&mut self, event: ChangeEvent) {
        let now = Instant::now();
        if let ChangeEvent::Renamed { old, .. } = &event {
            if let Some((earlier, _)) = self.pending.remove(old) {
                self.keep_rename_source(earlier, now);
            }
        }
        if let Some((earlier, _)) = self.pending.remove(event.path()) {
            self.keep_rename_source(earlier, now);
        }
        self.pending
            .insert(event.path().to_path_buf(), (event, now));
    }

    fn keep_rename_source(&mut self, superseded: ChangeEvent, at: Instant) {
        if let ChangeEvent::Renamed { old, .. } = superseded {
            self.pending
                .entry(old.clone())
                .or_insert((ChangeEvent::Deleted(old), at));
        }
    }

    /// Removes and returns every event that has been quiet long enough
    pub fn poll(&mut self) -> Vec<ChangeEvent> {
        let now = Instant::now();
        let delay = self.debounce_delay;
        let settled_paths: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, (_, at))| now.duration_since(*at) >= delay)
            .map(|(path, _)| path.clone())
            .collect();

        let settled: Vec<ChangeEvent> = settled_paths
            .iter()
            .filter_map(|path| self.pending.remove(path).map(|(event, _)| event))
            .collect();

        if !settled.is_empty() {
            debug!(count = settled.len(), "Settled change events");
        }
        settled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
