//! Command-line interface for queuectl.
//!
//! Provides commands for enqueueing jobs, inspecting the queue and dead
//! letter queue, editing configuration, and managing worker processes.

mod commands;

pub use commands::{parse_cli, run_with_cli, Cli, Commands, DEFAULT_DB_PATH};
