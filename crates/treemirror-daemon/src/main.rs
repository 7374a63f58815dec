//! treemirror daemon - background watcher for one directory tree
//!
//! Started detached by `treemirror daemon start` (or by the session-start
//! hook), one process per watched root:
//! - Takes the per-directory watch lock, exiting quietly if another watcher
//!   already holds it
//! - Runs an initial sync pass, then mirrors filesystem changes as they
//!   settle
//! - Shuts down gracefully on SIGTERM/SIGINT/SIGHUP, releasing the lock and its own
//!   daemon record
//!
//! # Architecture
//!
//! The [`WatchSession`] loop is controlled by a `CancellationToken` that is
//! triggered on receipt of SIGTERM, SIGINT or SIGHUP. A quota failure ends the
//! process with a non-zero exit and an actionable message in the log.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use treemirror_core::config::Config;
use treemirror_store::StoreClient;
use treemirror_supervisor::lock::WatchLock;
use treemirror_supervisor::process::{DetachedSpawner, ProcessTable, SystemProcesses};
use treemirror_supervisor::signal::spawn_shutdown_handler;
use treemirror_supervisor::supervisor::{DaemonSupervisor, SupervisorContext};
use treemirror_sync::session::{SessionSettings, WatchSession};

/// Hint appended to quota failures
const UPGRADE_HINT: &str = "Upgrade your plan to keep this directory in sync";

// ============================================================================
// Arguments
// ============================================================================

/// Background watcher keeping one directory mirrored into the remote store
#[derive(Debug, Parser)]
#[command(name = "treemirrord", version)]
struct Args {
    /// Path to a configuration file (default: platform config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory to watch
    dir: PathBuf,
}

/// Loads the configuration named on the command line, or the default one
///
/// An explicitly named file must exist and parse; the default location is
/// optional.
fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let config = match explicit {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load_or_default(&Config::default_path()),
    };
    Ok(config.with_env_overrides())
}

// ============================================================================
// WatchDaemon
// ============================================================================

/// One watcher process for one resolved root
struct WatchDaemon {
    /// Application configuration loaded from YAML
    config: Config,
    /// Canonical directory being mirrored
    root: PathBuf,
    /// Token for signalling graceful shutdown
    shutdown: CancellationToken,
    processes: Arc<dyn ProcessTable>,
}

impl WatchDaemon {
    fn new(config: Config, dir: &Path, shutdown: CancellationToken) -> Result<Self> {
        let root = std::fs::canonicalize(dir)
            .with_context(|| format!("Cannot resolve watch directory {}", dir.display()))?;
        if !root.is_dir() {
            anyhow::bail!("{} is not a directory", root.display());
        }

        Ok(Self {
            config,
            root,
            shutdown,
            processes: Arc::new(SystemProcesses),
        })
    }

    /// Runs until shutdown; the watch lock and daemon record are released on
    /// every exit path
    async fn run(&self) -> Result<()> {
        let lock = WatchLock::new(
            &self.config.daemon.lock_dir,
            &self.root,
            Arc::clone(&self.processes),
        );
        if !lock.acquire() {
            info!(
                root = %self.root.display(),
                owner = ?lock.owner(),
                "Another watcher holds the lock, exiting"
            );
            self.remove_own_record();
            return Ok(());
        }

        let result = self.watch().await;

        lock.release();
        self.remove_own_record();
        result
    }

    async fn watch(&self) -> Result<()> {
        let store = Arc::new(StoreClient::from_config(&self.config.store)?);
        let settings = SessionSettings::from_config(&self.config);
        let session = WatchSession::new(store, self.root.clone(), settings)
            .context("Failed to create watch session")?;

        info!(
            root = %self.root.display(),
            store_id = %self.config.store.store_id,
            "Watching directory"
        );

        match session.run(self.shutdown.clone()).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_quota() => {
                error!(error = %err, "Remote store quota exceeded, stopping watcher");
                Err(anyhow::anyhow!("{err}. {UPGRADE_HINT}"))
            }
            Err(err) => Err(err).context("Watch session failed"),
        }
    }

    /// Deletes this process's daemon record, leaving a successor's alone
    fn remove_own_record(&self) {
        let daemon = &self.config.daemon;
        let spawner = DetachedSpawner::new(
            DetachedSpawner::resolve_program(daemon.program.as_deref()),
            daemon.log_dir.clone(),
        );
        let supervisor = DaemonSupervisor::new(SupervisorContext {
            state_dir: daemon.state_dir.clone(),
            processes: Arc::clone(&self.processes),
            spawner: Arc::new(spawner),
        });

        if let Err(err) = supervisor.remove_record(&self.root, std::process::id()) {
            warn!(error = %err, "Failed to remove daemon record");
        }
    }
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .init();

    info!(pid = std::process::id(), "treemirror daemon starting (treemirrord)");

    let shutdown_token = CancellationToken::new();
    spawn_shutdown_handler(shutdown_token.clone());

    let daemon = WatchDaemon::new(config, &args.dir, shutdown_token)?;
    let result = daemon.run().await;

    match &result {
        Ok(()) => info!("treemirror daemon shut down gracefully"),
        Err(e) => error!(error = %e, "treemirror daemon exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
