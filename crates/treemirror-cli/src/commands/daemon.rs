//! Daemon management commands
//!
//! Provides the `treemirror daemon` CLI subcommands for the detached
//! background watchers registered with the supervisor.
//!
//! # Subcommands
//!
//! - `start` - Ensure a watcher covers a directory
//! - `stop`  - Stop the watcher of a directory (or all of them)
//! - `list`  - Show running watchers

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing::info;
use treemirror_core::domain::DaemonRecord;
use treemirror_supervisor::supervisor::EnsureOutcome;

use crate::context::{resolve_dir, CliContext};
use crate::output::plural;

/// Manage background watchers
#[derive(Debug, Subcommand)]
pub enum DaemonCommand {
    /// Start a background watcher for a directory
    Start {
        /// Directory to watch (default: current directory)
        dir: Option<PathBuf>,
    },
    /// Stop the background watcher of a directory
    Stop {
        /// Directory whose watcher to stop (default: current directory)
        dir: Option<PathBuf>,
        /// Stop every running watcher
        #[arg(long, conflicts_with = "dir")]
        all: bool,
    },
    /// List running watchers
    List {
        /// Delete records of watchers that are no longer running
        #[arg(long)]
        prune: bool,
    },
}

impl DaemonCommand {
    /// Execute the selected daemon subcommand
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        match self {
            DaemonCommand::Start { dir } => daemon_start(ctx, dir.as_deref()),
            DaemonCommand::Stop { dir, all } => daemon_stop(ctx, dir.as_deref(), *all),
            DaemonCommand::List { prune } => daemon_list(ctx, *prune),
        }
    }
}

fn record_json(record: &DaemonRecord) -> serde_json::Value {
    serde_json::json!({"pid": record.pid, "dir": record.dir.display().to_string()})
}

// ============================================================================
// daemon start
// ============================================================================

fn daemon_start(ctx: &CliContext, dir: Option<&std::path::Path>) -> Result<()> {
    let formatter = ctx.formatter();
    let config = ctx.load_config()?;
    let dir = resolve_dir(dir)?;

    info!(dir = %dir.display(), "Ensuring background watcher");
    let outcome = ctx
        .supervisor(&config)
        .ensure_daemon(&dir)
        .context("Failed to start watcher")?;

    if ctx.format.is_json() {
        let json = match &outcome {
            EnsureOutcome::AlreadyCovered(record) => serde_json::json!({
                "action": "start",
                "status": "already_running",
                "daemon": record_json(record),
            }),
            EnsureOutcome::StartInProgress => serde_json::json!({
                "action": "start",
                "status": "in_progress",
            }),
            EnsureOutcome::Started { pid, replaced } => serde_json::json!({
                "action": "start",
                "status": "started",
                "daemon": {"pid": pid, "dir": dir.display().to_string()},
                "replaced": replaced.iter().map(record_json).collect::<Vec<_>>(),
            }),
        };
        formatter.print_json(&json);
        return Ok(());
    }

    match outcome {
        EnsureOutcome::AlreadyCovered(record) if record.dir == dir => {
            formatter.success(&format!("Watcher already running (pid {})", record.pid));
        }
        EnsureOutcome::AlreadyCovered(record) => {
            formatter.success(&format!(
                "Already covered by the watcher of {} (pid {})",
                record.dir.display(),
                record.pid
            ));
        }
        EnsureOutcome::StartInProgress => {
            formatter.info("Another process is starting a watcher for this directory");
        }
        EnsureOutcome::Started { pid, replaced } => {
            formatter.success(&format!("Started watcher for {} (pid {pid})", dir.display()));
            if !replaced.is_empty() {
                formatter.info(&format!(
                    "Replaced {} of subdirectories",
                    plural(replaced.len(), "watcher")
                ));
            }
        }
    }
    Ok(())
}

// ============================================================================
// daemon stop
// ============================================================================

fn daemon_stop(ctx: &CliContext, dir: Option<&std::path::Path>, all: bool) -> Result<()> {
    let formatter = ctx.formatter();
    let config = ctx.load_config()?;
    let supervisor = ctx.supervisor(&config);

    if all {
        let stopped = supervisor.stop_all().context("Failed to stop watchers")?;
        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "action": "stop",
                "stopped": stopped.iter().map(record_json).collect::<Vec<_>>(),
            }));
        } else if stopped.is_empty() {
            formatter.info("No watchers running");
        } else {
            formatter.success(&format!("Stopped {}", plural(stopped.len(), "watcher")));
        }
        return Ok(());
    }

    let dir = resolve_dir(dir)?;
    let stopped = supervisor
        .stop_daemon(&dir)
        .context("Failed to stop watcher")?;

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({
            "action": "stop",
            "dir": dir.display().to_string(),
            "stopped": stopped,
        }));
    } else if stopped {
        formatter.success(&format!("Stopped watcher for {}", dir.display()));
    } else {
        formatter.info(&format!("No watcher running for {}", dir.display()));
    }
    Ok(())
}

// ============================================================================
// daemon list
// ============================================================================

fn daemon_list(ctx: &CliContext, prune: bool) -> Result<()> {
    let formatter = ctx.formatter();
    let config = ctx.load_config()?;
    let supervisor = ctx.supervisor(&config);

    let pruned = if prune {
        supervisor.prune_dead().context("Failed to prune records")?
    } else {
        0
    };
    let daemons = supervisor.list_daemons().context("Failed to list watchers")?;

    if ctx.format.is_json() {
        formatter.print_json(&serde_json::json!({
            "daemons": daemons.iter().map(record_json).collect::<Vec<_>>(),
            "pruned": pruned,
        }));
        return Ok(());
    }

    if daemons.is_empty() {
        formatter.info("No watchers running");
    } else {
        formatter.success(&format!("{} running", plural(daemons.len(), "watcher")));
        for daemon in &daemons {
            formatter.info(&format!("{:>8}  {}", daemon.pid, daemon.dir.display()));
        }
    }
    if prune {
        formatter.info(&format!("Pruned {}", plural(pruned, "stale record")));
    }
    Ok(())
}
