//! Shutdown signal handling shared by the daemon and foreground watchers
//!
//! Handlers are registered synchronously by [`ShutdownSignals::install`], so
//! a signal arriving right after startup is never delivered with its default
//! (process-killing) disposition. The first SIGINT, SIGTERM or SIGHUP cancels
//! the token, letting the owner release its watch lock and records.

use std::io;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Registered shutdown signal handlers
pub struct ShutdownSignals {
    #[cfg(unix)]
    interrupt: Signal,
    #[cfg(unix)]
    terminate: Signal,
    #[cfg(unix)]
    hangup: Signal,
}

impl ShutdownSignals {
    /// Registers the handlers; must be called inside a tokio runtime
    ///
    /// # Errors
    /// Returns an error if a handler cannot be registered
    #[cfg(unix)]
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
        })
    }

    #[cfg(not(unix))]
    pub fn install() -> io::Result<Self> {
        Ok(Self {})
    }

    /// Waits for the next shutdown signal and returns its name
    #[cfg(unix)]
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.hangup.recv() => "SIGHUP",
        }
    }

    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> &'static str {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "SIGINT"
    }

    /// Cancels `token` on the first shutdown signal
    pub async fn cancel_on_signal(mut self, token: CancellationToken) {
        let name = self.recv().await;
        info!(signal = name, "Received shutdown signal");
        token.cancel();
    }
}

/// Installs the handlers now and cancels `token` from a background task
///
/// If the handlers cannot be registered the failure is logged and the token
/// is only cancelled by its other owners.
pub fn spawn_shutdown_handler(token: CancellationToken) {
    match ShutdownSignals::install() {
        Ok(signals) => {
            tokio::spawn(signals.cancel_on_signal(token));
        }
        Err(err) => warn!(error = %err, "Failed to install shutdown signal handlers"),
    }
}
