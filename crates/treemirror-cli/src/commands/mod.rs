//! CLI subcommands

pub mod config;
pub mod daemon;
pub mod hook;
pub mod sync;
pub mod watch;
