//! Database schema constants.
//!
//! This module contains all SQL schema definitions for the SQLite store,
//! together with the timestamp encoding shared by every query.

use chrono::{DateTime, Utc};

/// SQL schema for creating the jobs table.
pub const CREATE_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT    PRIMARY KEY,
    command      TEXT    NOT NULL,
    state        TEXT    NOT NULL DEFAULT 'pending'
                         CHECK (state IN ('pending', 'processing', 'completed', 'dead')),
    attempts     INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    created_at   TEXT    NOT NULL,
    updated_at   TEXT    NOT NULL,
    next_run_at  TEXT    NOT NULL,
    last_error   TEXT
)
"#;

/// SQL schema for creating the config table.
pub const CREATE_CONFIG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS config (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// SQL schema for creating the workers table.
pub const CREATE_WORKERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS workers (
    pid            INTEGER PRIMARY KEY,
    hostname       TEXT    NOT NULL,
    started_at     TEXT    NOT NULL,
    last_heartbeat TEXT    NOT NULL
)
"#;

/// SQL for creating all required indexes, one statement each.
pub const CREATE_INDEXES: [&str; 3] = [
    "CREATE INDEX IF NOT EXISTS idx_jobs_pending ON jobs(state, next_run_at)",
    "CREATE INDEX IF NOT EXISTS idx_jobs_updated_at ON jobs(updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_workers_last_heartbeat ON workers(last_heartbeat)",
];

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut statements = vec![CREATE_JOBS_TABLE, CREATE_CONFIG_TABLE, CREATE_WORKERS_TABLE];
    statements.extend(CREATE_INDEXES);
    statements
}

/// Table names in the schema.
pub mod tables {
    /// Jobs table name.
    pub const JOBS: &str = "jobs";
    /// Config table name.
    pub const CONFIG: &str = "config";
    /// Workers table name.
    pub const WORKERS: &str = "workers";
}

/// Encodes a timestamp for storage.
///
/// Every timestamp column uses this fixed-width UTC form, so comparing the
/// text in SQL gives chronological order.
pub fn encode_timestamp(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}
