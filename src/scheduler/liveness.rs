//! Worker liveness.
//!
//! Workers prove they are alive by refreshing `last_heartbeat` on their row in
//! the `workers` table. Activity is derived at query time; nothing reaps
//! stale rows, so a crashed worker's record stays until it is overwritten by
//! a new process with the same pid or removed by hand.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A worker counts as active while its last heartbeat is at most this old.
///
/// Three times the loop's heartbeat interval, to absorb scheduling jitter.
pub const LIVENESS_WINDOW: Duration = Duration::from_secs(15);

/// A row of the `workers` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct WorkerRecord {
    /// Operating-system process id.
    pub pid: u32,
    pub hostname: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    /// Creates a record for a worker starting at `now`.
    pub fn new(pid: u32, hostname: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            pid,
            hostname: hostname.into(),
            started_at: now,
            last_heartbeat: now,
        }
    }

    /// Returns whether the worker is active at `now`.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        is_active(self.last_heartbeat, now)
    }
}

/// Returns whether a heartbeat at `last_heartbeat` is within the liveness
/// window at `now`.
pub fn is_active(last_heartbeat: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(last_heartbeat) <= window()
}

/// Oldest heartbeat still considered active at `now`.
pub fn active_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - window()
}

fn window() -> chrono::Duration {
    chrono::Duration::from_std(LIVENESS_WINDOW).unwrap_or_else(|_| chrono::Duration::seconds(15))
}

/// Best-effort host name of this machine.
///
/// Asks the kernel first, then falls back to `COMPUTERNAME` and finally
/// `"localhost"`.
pub fn local_hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("COMPUTERNAME").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    None
}
