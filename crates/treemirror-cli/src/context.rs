//! Shared state for command execution
//!
//! Global flags are parsed once in `main` and handed to every command as a
//! [`CliContext`], which also knows how to build the collaborators the
//! commands share.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use treemirror_core::config::Config;
use treemirror_supervisor::lock::WatchLock;
use treemirror_supervisor::process::{DetachedSpawner, SystemProcesses};
use treemirror_supervisor::supervisor::{DaemonSupervisor, SupervisorContext};

use crate::output::{get_formatter, OutputFormat, OutputFormatter};

/// Global options every command sees
#[derive(Debug, Clone)]
pub struct CliContext {
    pub format: OutputFormat,
    /// Number of `-v` flags
    pub verbose: u8,
    /// `--config`, if given
    pub config_path: Option<PathBuf>,
}

impl CliContext {
    pub fn formatter(&self) -> Box<dyn OutputFormatter> {
        get_formatter(self.format)
    }

    /// Path of the configuration file in effect
    pub fn config_file(&self) -> PathBuf {
        self.config_path.clone().unwrap_or_else(Config::default_path)
    }

    /// Loads the configuration with environment overrides applied
    ///
    /// A file named with `--config` must exist and parse; the default file
    /// is optional.
    pub fn load_config(&self) -> Result<Config> {
        let config = match &self.config_path {
            Some(path) => Config::load(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => Config::load_or_default(&Config::default_path()),
        };
        Ok(config.with_env_overrides())
    }

    /// Supervisor spawning `treemirrord` with the same configuration file
    pub fn supervisor(&self, config: &Config) -> DaemonSupervisor {
        let mut spawner = DetachedSpawner::new(
            DetachedSpawner::resolve_program(config.daemon.program.as_deref()),
            config.daemon.log_dir.clone(),
        );
        if let Some(path) = &self.config_path {
            // The daemon runs with the watched directory as its cwd
            let path = if path.is_absolute() {
                path.clone()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.clone())
            };
            spawner = spawner.with_args([OsString::from("--config"), path.into_os_string()]);
        }

        DaemonSupervisor::new(SupervisorContext {
            state_dir: config.daemon.state_dir.clone(),
            processes: Arc::new(SystemProcesses),
            spawner: Arc::new(spawner),
        })
    }

    /// The watch lock guarding `dir`
    pub fn watch_lock(&self, config: &Config, dir: &Path) -> WatchLock {
        WatchLock::new(&config.daemon.lock_dir, dir, Arc::new(SystemProcesses))
    }
}

/// Resolves a directory argument, defaulting to the current directory
///
/// The result is absolute with symlinks followed, so lock and daemon keys
/// agree no matter how the directory was named.
pub fn resolve_dir(dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match dir {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let resolved = std::fs::canonicalize(&dir)
        .with_context(|| format!("Cannot resolve directory {}", dir.display()))?;
    if !resolved.is_dir() {
        anyhow::bail!("{} is not a directory", resolved.display());
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(config_path: Option<PathBuf>) -> CliContext {
        CliContext {
            format: OutputFormat::Human,
            verbose: 0,
            config_path,
        }
    }

    #[test]
    fn test_resolve_dir_canonicalizes() {
        let tmp = tempfile::tempdir().unwrap();
        let nested = tmp.path().join("a");
        std::fs::create_dir(&nested).unwrap();

        let resolved = resolve_dir(Some(&nested.join("..").join("a"))).unwrap();
        assert_eq!(resolved, std::fs::canonicalize(&nested).unwrap());
    }

    #[test]
    fn test_resolve_dir_rejects_files_and_missing() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("f.txt");
        std::fs::write(&file, "x").unwrap();

        assert!(resolve_dir(Some(&file)).is_err());
        assert!(resolve_dir(Some(&tmp.path().join("missing"))).is_err());
    }

    #[test]
    fn test_explicit_config_must_load() {
        let err = ctx(Some(PathBuf::from("/nonexistent/config.yaml")))
            .load_config()
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/config.yaml"));
    }

    #[test]
    fn test_config_file_prefers_explicit_path() {
        assert_eq!(
            ctx(Some(PathBuf::from("/etc/tm.yaml"))).config_file(),
            PathBuf::from("/etc/tm.yaml")
        );
        assert_eq!(ctx(None).config_file(), Config::default_path());
    }
}
