//! treemirror CLI - Command-line interface for treemirror
//!
//! Provides commands for:
//! - One-shot and continuous sync of a directory tree
//! - Managing background watchers
//! - Editor/agent session hooks
//! - Inspecting configuration

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;
mod context;
mod output;

use commands::{
    config::ConfigCommand, daemon::DaemonCommand, hook::HookCommand, sync::SyncCommand,
    watch::WatchCommand,
};
use context::CliContext;
use output::OutputFormat;

#[derive(Debug, Parser)]
#[command(
    name = "treemirror",
    version,
    about = "Mirror a directory tree into a remote search store"
)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    /// Verbose output (can be repeated: -v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Use alternate config file
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Sync a directory with the remote store once
    Sync(SyncCommand),
    /// Watch a directory in the foreground and keep it synced
    Watch(WatchCommand),
    /// Manage background watchers
    #[command(subcommand)]
    Daemon(DaemonCommand),
    /// Session lifecycle hooks (read a JSON payload from stdin)
    #[command(subcommand)]
    Hook(HookCommand),
    /// View and check configuration
    #[command(subcommand)]
    Config(ConfigCommand),
}

/// Log filter for a `-v` count
///
/// Without `-v` only errors are logged, so per-file failures show up as a
/// summary count rather than one line each.
fn log_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays clean for JSON and hook responses
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_filter(cli.verbose)));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let ctx = CliContext {
        format: if cli.json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        },
        verbose: cli.verbose,
        config_path: cli.config,
    };

    match cli.command {
        Commands::Sync(cmd) => cmd.execute(&ctx).await,
        Commands::Watch(cmd) => cmd.execute(&ctx).await,
        Commands::Daemon(cmd) => cmd.execute(&ctx).await,
        Commands::Hook(cmd) => cmd.execute(&ctx).await,
        Commands::Config(cmd) => cmd.execute(&ctx).await,
    }
}
