//! Watch command - foreground watcher
//!
//! `treemirror watch` does in the foreground what `treemirrord` does in the
//! background: take the watch lock, sync once, then follow changes until
//! SIGINT, SIGTERM or SIGHUP. The lock is released on each of them.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tokio_util::sync::CancellationToken;
use treemirror_store::StoreClient;
use treemirror_supervisor::signal::spawn_shutdown_handler;
use treemirror_sync::session::{SessionSettings, WatchSession};

use crate::commands::sync::explain_sync_error;
use crate::context::{resolve_dir, CliContext};
use crate::output::plural;

/// Watch a directory and keep it synced until interrupted
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Directory to watch (default: current directory)
    pub dir: Option<PathBuf>,
}

impl WatchCommand {
    pub async fn execute(&self, ctx: &CliContext) -> Result<()> {
        let formatter = ctx.formatter();
        let config = ctx.load_config()?;
        let root = resolve_dir(self.dir.as_deref())?;

        let lock = ctx.watch_lock(&config, &root);
        if !lock.acquire() {
            let owner = lock
                .owner()
                .map_or_else(|| "another process".to_string(), |pid| format!("pid {pid}"));
            formatter.error(&format!("{} is already watched by {owner}", root.display()));
            return Ok(());
        }

        let result = self.watch(ctx, &config, root.clone()).await;
        lock.release();
        result
    }

    async fn watch(
        &self,
        ctx: &CliContext,
        config: &treemirror_core::config::Config,
        root: PathBuf,
    ) -> Result<()> {
        let formatter = ctx.formatter();
        let store = Arc::new(StoreClient::from_config(&config.store)?);
        let session = WatchSession::new(store, root.clone(), SessionSettings::from_config(config))
            .context("Failed to create watch session")?;

        let cancel = CancellationToken::new();
        spawn_shutdown_handler(cancel.clone());

        formatter.success(&format!(
            "Watching {} (Ctrl+C to stop)",
            root.display()
        ));

        let summary = session
            .run(cancel)
            .await
            .map_err(|err| explain_sync_error(err, &config.sync.ignore_file_name))?;

        if ctx.format.is_json() {
            formatter.print_json(&serde_json::json!({
                "root": root.display().to_string(),
                "initial_sync": {
                    "uploaded": summary.uploaded,
                    "deleted": summary.deleted,
                    "errors": summary.errors,
                },
            }));
        } else {
            formatter.success("Stopped watching");
            if summary.errors > 0 {
                formatter.warn(&format!(
                    "{} failed during the initial sync; re-run with -v for details",
                    plural(summary.errors, "file")
                ));
            }
        }
        Ok(())
    }
}
