//! Store-backed configuration.
//!
//! Tunables live in the `config` table as string key/value pairs so that
//! `queuectl config set` takes effect on running workers at their next cycle.
//! Lookups never fail: a missing key, an unparsable value or an unavailable
//! store all resolve to the caller's default.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use crate::scheduler::backoff::{RetryPolicy, DEFAULT_BACKOFF_BASE};

/// Well-known configuration keys.
pub mod keys {
    /// Exponential base of the retry delay, in seconds.
    pub const BACKOFF_BASE: &str = "backoff_base";
    /// Execution timeout for a job command, in milliseconds.
    pub const JOB_TIMEOUT_MS: &str = "job_timeout_ms";
    /// Heartbeat interval shown alongside worker listings, in seconds.
    pub const WORKER_HEARTBEAT_INTERVAL: &str = "worker_heartbeat_interval";
    /// Retry budget for jobs enqueued without `max_attempts`.
    pub const DEFAULT_MAX_ATTEMPTS: &str = "default_max_attempts";
}

/// Default job execution timeout in milliseconds.
pub const DEFAULT_JOB_TIMEOUT_MS: i64 = 30_000;

/// Default heartbeat interval in seconds.
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: i64 = 5;

/// Default retry budget.
pub const DEFAULT_MAX_ATTEMPTS: i64 = 3;

/// Rows inserted by `queuectl init` when absent.
pub fn default_entries() -> Vec<ConfigEntry> {
    vec![
        ConfigEntry::new(keys::BACKOFF_BASE, DEFAULT_BACKOFF_BASE.to_string()),
        ConfigEntry::new(keys::JOB_TIMEOUT_MS, DEFAULT_JOB_TIMEOUT_MS.to_string()),
        ConfigEntry::new(
            keys::WORKER_HEARTBEAT_INTERVAL,
            DEFAULT_HEARTBEAT_INTERVAL_SECS.to_string(),
        ),
        ConfigEntry::new(keys::DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS.to_string()),
    ]
}

/// A row of the `config` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
}

impl ConfigEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// A resolved configuration value.
///
/// Stored values are strings. A value that starts with an integer is
/// returned as [`ConfigValue::Int`]; trailing text after the digits is
/// ignored, so `"5000ms"` reads as 5000 and `"3.5"` as 3.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Int(i64),
    Text(String),
}

impl ConfigValue {
    /// Interprets a raw stored value.
    pub fn parse(raw: &str) -> Self {
        match leading_int(raw) {
            Some(v) => ConfigValue::Int(v),
            None => ConfigValue::Text(raw.to_string()),
        }
    }

    /// Returns the integer value, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            ConfigValue::Int(v) => Some(*v),
            ConfigValue::Text(_) => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Int(v) => write!(f, "{}", v),
            ConfigValue::Text(s) => f.write_str(s),
        }
    }
}

/// Reads the integer prefix of `raw`: optional leading whitespace, an
/// optional sign, then decimal digits. `None` if there are no digits or the
/// prefix overflows `i64`.
fn leading_int(raw: &str) -> Option<i64> {
    let s = raw.trim_start();
    let sign_len = usize::from(s.starts_with(['+', '-']));
    let digits = s[sign_len..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    if digits == 0 {
        return None;
    }
    s[..sign_len + digits].parse().ok()
}

/// Resolves tunables from the `config` table with hard-coded fallbacks.
#[derive(Clone)]
pub struct ConfigResolver {
    pool: SqlitePool,
}

impl ConfigResolver {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Looks up `key`, returning `default` when it is absent or the store
    /// cannot be read.
    pub async fn get(&self, key: &str, default: ConfigValue) -> ConfigValue {
        let row: Result<Option<(String,)>, sqlx::Error> =
            sqlx::query_as("SELECT value FROM config WHERE key = ?1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await;

        match row {
            Ok(Some((raw,))) => ConfigValue::parse(&raw),
            Ok(None) => default,
            Err(e) => {
                debug!(key = key, error = %e, "Config lookup failed, using default");
                default
            }
        }
    }

    /// Looks up an integer `key`, falling back to `default` when the stored
    /// value is not an integer or fails `valid`.
    async fn get_int(&self, key: &str, default: i64, valid: impl Fn(i64) -> bool) -> i64 {
        let value = self.get(key, ConfigValue::Int(default)).await;
        match value.as_int() {
            Some(v) if valid(v) => v,
            _ => {
                warn!(key = key, value = %value, default = default, "Ignoring invalid config value");
                default
            }
        }
    }

    /// Exponential base for retry delays.
    pub async fn backoff_base(&self) -> u32 {
        let base = self
            .get_int(keys::BACKOFF_BASE, i64::from(DEFAULT_BACKOFF_BASE), |v| {
                (1..=i64::from(u32::MAX)).contains(&v)
            })
            .await;
        u32::try_from(base).unwrap_or(DEFAULT_BACKOFF_BASE)
    }

    /// Retry policy built from the configured base.
    pub async fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.backoff_base().await)
    }

    /// Execution timeout for job commands.
    pub async fn job_timeout(&self) -> Duration {
        let ms = self
            .get_int(keys::JOB_TIMEOUT_MS, DEFAULT_JOB_TIMEOUT_MS, |v| v > 0)
            .await;
        Duration::from_millis(ms.unsigned_abs())
    }

    /// Configured heartbeat interval, used for display.
    pub async fn heartbeat_interval(&self) -> Duration {
        let secs = self
            .get_int(
                keys::WORKER_HEARTBEAT_INTERVAL,
                DEFAULT_HEARTBEAT_INTERVAL_SECS,
                |v| v > 0,
            )
            .await;
        Duration::from_secs(secs.unsigned_abs())
    }

    /// Retry budget for jobs enqueued without one.
    pub async fn default_max_attempts(&self) -> u32 {
        let attempts = self
            .get_int(keys::DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS, |v| {
                (1..=i64::from(u32::MAX)).contains(&v)
            })
            .await;
        u32::try_from(attempts).unwrap_or(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::JobStore;

    async fn open_store(dir: &tempfile::TempDir) -> JobStore {
        JobStore::open(dir.path().join("config.db")).await.unwrap()
    }

    #[test]
    fn test_config_value_parse() {
        assert_eq!(ConfigValue::parse("42"), ConfigValue::Int(42));
        assert_eq!(ConfigValue::parse(" -7 "), ConfigValue::Int(-7));
        assert_eq!(
            ConfigValue::parse("exponential"),
            ConfigValue::Text("exponential".to_string())
        );
        assert_eq!(ConfigValue::parse("abc12").as_int(), None);
        assert_eq!(ConfigValue::parse("-").as_int(), None);
        assert_eq!(ConfigValue::parse("").as_int(), None);
    }

    #[test]
    fn test_config_value_reads_leading_integer() {
        assert_eq!(ConfigValue::parse("5000ms"), ConfigValue::Int(5000));
        assert_eq!(ConfigValue::parse("3.5"), ConfigValue::Int(3));
        assert_eq!(ConfigValue::parse("12abc"), ConfigValue::Int(12));
        assert_eq!(ConfigValue::parse("  +8 retries"), ConfigValue::Int(8));
        assert_eq!(ConfigValue::parse("-2x"), ConfigValue::Int(-2));
        assert_eq!(
            ConfigValue::parse("99999999999999999999"),
            ConfigValue::Text("99999999999999999999".to_string())
        );
    }

    #[test]
    fn test_config_value_display() {
        assert_eq!(ConfigValue::Int(5).to_string(), "5");
        assert_eq!(ConfigValue::Text("abc".to_string()).to_string(), "abc");
    }

    #[test]
    fn test_default_entries_cover_known_keys() {
        let entries = default_entries();
        let keys: Vec<&str> = entries.iter().map(|e| e.key.as_str()).collect();
        assert!(keys.contains(&keys::BACKOFF_BASE));
        assert!(keys.contains(&keys::JOB_TIMEOUT_MS));
        assert!(keys.contains(&keys::WORKER_HEARTBEAT_INTERVAL));
        assert!(keys.contains(&keys::DEFAULT_MAX_ATTEMPTS));
    }

    #[tokio::test]
    async fn test_get_absent_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let resolver = store.config();

        assert_eq!(
            resolver.get("missing", ConfigValue::Int(9)).await,
            ConfigValue::Int(9)
        );
    }

    #[tokio::test]
    async fn test_get_parses_int_or_returns_raw() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        store.set_config("numeric", "15").await.unwrap();
        store.set_config("strategy", "exponential").await.unwrap();
        let resolver = store.config();

        assert_eq!(
            resolver.get("numeric", ConfigValue::Int(0)).await,
            ConfigValue::Int(15)
        );
        assert_eq!(
            resolver.get("strategy", ConfigValue::Int(0)).await,
            ConfigValue::Text("exponential".to_string())
        );
    }

    #[tokio::test]
    async fn test_typed_helpers_fall_back_on_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let resolver = store.config();

        assert_eq!(resolver.backoff_base().await, 2);
        assert_eq!(resolver.job_timeout().await, Duration::from_millis(30_000));
        assert_eq!(resolver.heartbeat_interval().await, Duration::from_secs(5));
        assert_eq!(resolver.default_max_attempts().await, 3);

        store.set_config(keys::BACKOFF_BASE, "three").await.unwrap();
        store.set_config(keys::JOB_TIMEOUT_MS, "-5").await.unwrap();
        store.set_config(keys::DEFAULT_MAX_ATTEMPTS, "0").await.unwrap();
        assert_eq!(resolver.backoff_base().await, 2);
        assert_eq!(resolver.job_timeout().await, Duration::from_millis(30_000));
        assert_eq!(resolver.default_max_attempts().await, 3);

        store.set_config(keys::BACKOFF_BASE, "3").await.unwrap();
        store.set_config(keys::JOB_TIMEOUT_MS, "1500").await.unwrap();
        store.set_config(keys::DEFAULT_MAX_ATTEMPTS, "5").await.unwrap();
        assert_eq!(resolver.retry_policy().await, RetryPolicy::exponential(3));
        assert_eq!(resolver.job_timeout().await, Duration::from_millis(1500));
        assert_eq!(resolver.default_max_attempts().await, 5);

        store.set_config(keys::JOB_TIMEOUT_MS, "2500ms").await.unwrap();
        store.set_config(keys::BACKOFF_BASE, "4.9").await.unwrap();
        assert_eq!(resolver.job_timeout().await, Duration::from_millis(2500));
        assert_eq!(resolver.backoff_base().await, 4);
    }

    #[tokio::test]
    async fn test_get_survives_closed_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&dir).await;
        let resolver = store.config();
        store.pool().close().await;

        assert_eq!(
            resolver.get(keys::BACKOFF_BASE, ConfigValue::Int(2)).await,
            ConfigValue::Int(2)
        );
    }
}
