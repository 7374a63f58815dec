//! Sync command - one-shot mirror of a directory
//!
//! Provides the `treemirror sync` CLI command which:
//! 1. Loads configuration and resolves the directory
//! 2. Skips the pass if a watcher already owns the directory
//! 3. Runs one full pass (or a dry run) and reports the counts

use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;
use treemirror_store::StoreClient;
use treemirror_sync::executor::{ExecuteOptions, ProgressEvent, SyncSummary};
use treemirror_sync::session::{SessionSettings, WatchSession};
use treemirror_sync::SyncError;

use crate::context::{resolve_dir, CliContext};
use crate::output::plural;

/// Hint appended to quota failures
pub const UPGRADE_HINT: &str = "Upgrade your plan to keep syncing";

/// Synchronize a directory with the remote store once
#[derive(Debug, Args)]
pub struct SyncCommand {
    /// Show what would be done without making changes
    #[arg(long)]
    pub dry_run: bool,

    /// Directory to sync (default: current directory)
    pub dir: Option<PathBuf>,
}

/// Per-file events collected during a pass
#[derive(Debug, Default)]
pub struct PassReport {
    failures: Mutex<Vec<(String, String)>>,
    would_upload: Mutex<Vec<String>>,
    would_delete: Mutex<Vec<String>>,
}

impl PassReport {
    pub fn record(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Failed { target, message } => lock(&self.failures)
                .push((target.clone(), message.clone())),
            ProgressEvent::WouldUpload { path } => {
                lock(&self.would_upload).push(path.display().to_string())
            }
            ProgressEvent::WouldDelete { external_id } => {
                lock(&self.would_delete).push(external_id.to_string())
            }
            _ => {}
        }
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        let mut failures = lock(&self.failures).clone();
        failures.sort();
        failures
    }

    fn sorted(list: &Mutex<Vec<String>>) -> Vec<String> {
        let mut items = lock(list).clone();
        items.sort();
        items
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncCommand {
    /// Execute the sync command
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config()?;
        let root = resolve_dir(self.dir.as_deref())?;

        let lock = ctx.watch_lock(&config, &root);
        if lock.is_locked() {
            info!(root = %root.display(), owner = ?lock.owner(), "Watcher active, skipping sync");
            if ctx.format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "root": root.display().to_string(),
                    "skipped": true,
                    "reason": "watcher active",
                }));
            } else {
                formatter.success(&format!(
                    "{} is already being synced by a watcher, nothing to do",
                    root.display()
                ));
            }
            return Ok(());
        }

        let store = Arc::new(StoreClient::from_config(&config.store)?);
        let session = WatchSession::new(store, root.clone(), SessionSettings::from_config(&config))
            .context("Failed to create sync session")?;

        let report = Arc::new(PassReport::default());
        let sink = Arc::clone(&report);
        let options = ExecuteOptions {
            dry_run: self.dry_run,
            progress: Some(Arc::new(move |event: &ProgressEvent| sink.record(event))),
        };

        if !ctx.format.is_json() {
            formatter.info(&format!("Syncing {}...", root.display()));
        }

        let summary = session
            .run_pass(options)
            .await
            .map_err(|err| explain_sync_error(err, &config.sync.ignore_file_name))?;

        render_summary(ctx, &root, self.dry_run, &summary, &report);
        Ok(())
    }
}

/// Turns a pass-ending error into the message shown to the user
pub fn explain_sync_error(err: SyncError, ignore_file_name: &str) -> anyhow::Error {
    match err {
        err if err.is_quota() => anyhow::anyhow!("{err}. {UPGRADE_HINT}"),
        SyncError::FileCountExceeded { count, limit } => anyhow::anyhow!(
            "{count} files need syncing, more than the limit of {limit}. \
             Exclude paths in {ignore_file_name} or raise sync.max_file_count"
        ),
        other => anyhow::Error::new(other).context("Sync failed"),
    }
}

fn render_summary(
    ctx: &CliContext,
    root: &std::path::Path,
    dry_run: bool,
    summary: &SyncSummary,
    report: &PassReport,
) {
    let formatter = ctx.formatter();
    let failures = report.failures();

    if ctx.format.is_json() {
        let failures: Vec<_> = failures
            .iter()
            .map(|(target, message)| serde_json::json!({"target": target, "error": message}))
            .collect();
        let mut json = serde_json::json!({
            "root": root.display().to_string(),
            "dry_run": dry_run,
            "processed": summary.processed,
            "uploaded": summary.uploaded,
            "deleted": summary.deleted,
            "errors": summary.errors,
            "total": summary.total,
            "failures": failures,
        });
        if dry_run {
            json["would_upload"] = serde_json::json!(PassReport::sorted(&report.would_upload));
            json["would_delete"] = serde_json::json!(PassReport::sorted(&report.would_delete));
        }
        formatter.print_json(&json);
        return;
    }

    if summary.total == 0 {
        formatter.success("Already up to date");
        return;
    }

    if dry_run {
        formatter.success(&format!(
            "Dry run: would upload {} and delete {}",
            plural(summary.uploaded, "file"),
            plural(summary.deleted, "file")
        ));
        for path in PassReport::sorted(&report.would_upload) {
            formatter.info(&format!("+ {path}"));
        }
        for id in PassReport::sorted(&report.would_delete) {
            formatter.info(&format!("- {id}"));
        }
    } else {
        formatter.success(&format!("Synced {}", root.display()));
        if summary.uploaded > 0 {
            formatter.info(&format!("Uploaded: {}", plural(summary.uploaded, "file")));
        }
        if summary.deleted > 0 {
            formatter.info(&format!("Deleted:  {}", plural(summary.deleted, "file")));
        }
    }

    if summary.errors > 0 {
        formatter.warn(&format!("{} could not be synced", plural(summary.errors, "file")));
        if ctx.verbose == 0 {
            formatter.info("Re-run with -v to see each failure");
        } else {
            for (target, message) in &failures {
                formatter.info(&format!("{target}: {message}"));
            }
        }
    }
}
