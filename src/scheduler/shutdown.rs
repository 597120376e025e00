//! Cooperative shutdown for worker processes.
//!
//! A worker stops when any of these happen:
//! - the stop file appears (written by `queuectl worker stop`)
//! - the process receives SIGINT or SIGTERM
//! - [`ShutdownSignal::trigger`] is called
//!
//! Shutdown is observed between cycles only. A job that is already running
//! is allowed to finish and its outcome is recorded before the worker exits.

use std::io;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default stop file, relative to the working directory.
pub const DEFAULT_STOP_FILE: &str = ".stop_workers";

/// Shared shutdown flag for one worker process.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    stop_file: Option<PathBuf>,
}

impl ShutdownSignal {
    /// Creates a signal that also watches `stop_file`.
    pub fn new(stop_file: impl Into<PathBuf>) -> Self {
        Self {
            token: CancellationToken::new(),
            stop_file: Some(stop_file.into()),
        }
    }

    /// Creates a signal that is only triggered programmatically or by OS
    /// signals.
    pub fn without_stop_file() -> Self {
        Self {
            token: CancellationToken::new(),
            stop_file: None,
        }
    }

    /// Returns whether shutdown has been requested.
    ///
    /// Seeing the stop file latches the signal, so later checks stay true
    /// even if the file is removed.
    pub fn is_triggered(&self) -> bool {
        if self.token.is_cancelled() {
            return true;
        }
        match &self.stop_file {
            Some(path) if path.exists() => {
                info!(stop_file = %path.display(), "Stop file detected");
                self.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Requests shutdown.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Resolves once shutdown is triggered through the token.
    ///
    /// The stop file is not watched here; it is picked up by the next
    /// [`is_triggered`](Self::is_triggered) check.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Spawns a task that triggers this signal on SIGINT or SIGTERM.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn install_signal_handlers(&self) -> io::Result<()> {
        let token = self.token.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, finishing current job before exit");
                    }
                    _ = sigint.recv() => {
                        info!("Received SIGINT, finishing current job before exit");
                    }
                    _ = token.cancelled() => return,
                }
                token.cancel();
            });
        }

        #[cfg(not(unix))]
        {
            tokio::spawn(async move {
                tokio::select! {
                    result = tokio::signal::ctrl_c() => {
                        if let Err(e) = result {
                            warn!(error = %e, "Failed to listen for Ctrl-C");
                            return;
                        }
                        info!("Received Ctrl-C, finishing current job before exit");
                    }
                    _ = token.cancelled() => return,
                }
                token.cancel();
            });
        }

        Ok(())
    }
}

/// Writes the stop file, asking every worker that watches it to exit.
pub fn request_stop(path: &Path) -> io::Result<()> {
    std::fs::write(path, b"stop\n")
}

/// Removes a stale stop file. Returns whether one was present.
pub fn clear_stop(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => {
            warn!(stop_file = %path.display(), error = %e, "Failed to remove stop file");
            Err(e)
        }
    }
}
