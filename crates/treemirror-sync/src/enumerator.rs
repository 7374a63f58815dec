//! Local file universe
//!
//! [`FileEnumerator`] walks a root with the `ignore` crate, honoring
//! `.gitignore` files, the global git excludes file and the tool-specific
//! ignore file. [`FileEnumerator::is_ignored`] answers the same question for
//! a single path (used for watch events) from matchers cached on the
//! [`EnumeratorContext`], so cache lifetime is the context's lifetime.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use ignore::gitignore::{Gitignore, GitignoreBuilder};
use ignore::{Match, WalkBuilder};
use tracing::{debug, warn};

/// Directory name that is never enumerated
const GIT_DIR: &str = ".git";

/// Per-process-owner state for enumeration and ignore checks
#[derive(Debug)]
pub struct EnumeratorContext {
    /// Name of the tool-specific ignore file
    ignore_file_name: String,
    /// Whether dot-files and dot-directories are enumerated
    include_hidden: bool,
    /// Compiled per-directory matchers, keyed by directory
    matchers: Mutex<HashMap<PathBuf, Arc<Gitignore>>>,
    /// Compiled global git excludes
    global: OnceLock<Arc<Gitignore>>,
}

impl EnumeratorContext {
    /// Creates a context honoring `ignore_file_name` next to `.gitignore`
    pub fn new(ignore_file_name: impl Into<String>) -> Self {
        Self {
            ignore_file_name: ignore_file_name.into(),
            include_hidden: false,
            matchers: Mutex::new(HashMap::new()),
            global: OnceLock::new(),
        }
    }

    /// Enumerate dot-files too (`.git` stays excluded)
    #[must_use]
    pub fn with_hidden(mut self, include_hidden: bool) -> Self {
        self.include_hidden = include_hidden;
        self
    }

    /// Name of the tool-specific ignore file
    pub fn ignore_file_name(&self) -> &str {
        &self.ignore_file_name
    }

    /// Drops every cached matcher, e.g. after an ignore file changed
    pub fn invalidate(&self) {
        self.matchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn matcher_for(&self, dir: &Path) -> Arc<Gitignore> {
        let mut cache = self.matchers.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(matcher) = cache.get(dir) {
            return Arc::clone(matcher);
        }

        let mut builder = GitignoreBuilder::new(dir);
        for name in [".gitignore", self.ignore_file_name.as_str()] {
            let file = dir.join(name);
            if file.is_file() {
                if let Some(err) = builder.add(&file) {
                    warn!(path = %file.display(), error = %err, "Invalid ignore file");
                }
            }
        }
        let matcher = Arc::new(builder.build().unwrap_or_else(|err| {
            warn!(dir = %dir.display(), error = %err, "Failed to compile ignore rules");
            Gitignore::empty()
        }));
        cache.insert(dir.to_path_buf(), Arc::clone(&matcher));
        matcher
    }

    fn global_matcher(&self) -> Arc<Gitignore> {
        Arc::clone(self.global.get_or_init(|| {
            let (matcher, err) = Gitignore::global();
            if let Some(err) = err {
                debug!(error = %err, "Global git excludes not loaded");
            }
            Arc::new(matcher)
        }))
    }
}

impl Default for EnumeratorContext {
    fn default() -> Self {
        Self::new(".treemirrorignore")
    }
}

/// Produces candidate files under a root
#[derive(Debug, Clone)]
pub struct FileEnumerator {
    context: Arc<EnumeratorContext>,
}

impl FileEnumerator {
    pub fn new(context: Arc<EnumeratorContext>) -> Self {
        Self { context }
    }

    /// Lazily yields the absolute paths of all non-ignored regular files
    ///
    /// Walk errors (unreadable directories, broken entries) are logged and
    /// skipped.
    pub fn get_files(&self, root: &Path) -> impl Iterator<Item = PathBuf> {
        let mut builder = WalkBuilder::new(root);
        builder
            .hidden(!self.context.include_hidden)
            .git_ignore(true)
            .git_global(true)
            .git_exclude(true)
            .require_git(false)
            .follow_links(false)
            .add_custom_ignore_filename(&self.context.ignore_file_name)
            .filter_entry(|entry| entry.file_name() != GIT_DIR);

        builder.build().filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_some_and(|t| t.is_file()) => {
                Some(entry.into_path())
            }
            Ok(_) => None,
            Err(err) => {
                warn!(error = %err, "Skipping unreadable entry");
                None
            }
        })
    }

    /// Returns true if `path` would not be produced by [`get_files`](Self::get_files)
    ///
    /// Paths outside `root` are always ignored. The deepest ignore file that
    /// has an opinion wins, then the global excludes.
    pub fn is_ignored(&self, path: &Path, root: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return true;
        };

        let mut names = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(name) => names.push(name),
                _ => return true,
            }
        }
        if names.is_empty() {
            return false;
        }
        if names.iter().any(|n| *n == GIT_DIR) {
            return true;
        }
        if !self.context.include_hidden
            && names.iter().any(|n| n.to_string_lossy().starts_with('.'))
        {
            return true;
        }

        let is_dir = path.is_dir();

        // Directories from root down to the parent of `path`
        let mut dirs = Vec::with_capacity(names.len());
        let mut dir = root.to_path_buf();
        dirs.push(dir.clone());
        for name in &names[..names.len() - 1] {
            dir.push(name);
            dirs.push(dir.clone());
        }

        for dir in dirs.iter().rev() {
            let matcher = self.context.matcher_for(dir);
            let Ok(below) = path.strip_prefix(dir) else {
                continue;
            };
            match matcher.matched_path_or_any_parents(below, is_dir) {
                Match::Ignore(_) => return true,
                Match::Whitelist(_) => return false,
                Match::None => {}
            }
        }

        self.context
            .global_matcher()
            .matched_path_or_any_parents(relative, is_dir)
            .is_ignore()
    }
}
