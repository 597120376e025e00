//! Shell command execution for jobs.
//!
//! A job's command is handed verbatim to the platform shell (`sh -c` on
//! Unix, `cmd /C` on Windows). Exit status 0 is success; anything else, a
//! spawn failure or running past the timeout is a failure whose message
//! becomes the job's `last_error`.

use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

/// Result of running one job command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// Exited with status 0.
    Succeeded { stdout: String, duration: Duration },
    /// Exited non-zero, was killed by a signal, or could not be spawned.
    Failed {
        error: String,
        exit_code: Option<i32>,
        duration: Duration,
    },
    /// Still running when the timeout elapsed; the process was killed.
    TimedOut { timeout: Duration },
}

impl ExecutionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionOutcome::Succeeded { .. })
    }

    /// Error text to record on the job, `None` on success.
    pub fn error_message(&self) -> Option<String> {
        match self {
            ExecutionOutcome::Succeeded { .. } => None,
            ExecutionOutcome::Failed { error, .. } => Some(error.clone()),
            ExecutionOutcome::TimedOut { timeout } => {
                Some(format!("Job timed out after {}ms", timeout.as_millis()))
            }
        }
    }
}

/// Runs job commands through the system shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }

    fn shell_command(command: &str) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        }
    }

    /// Runs `command`, killing it if it outlives `timeout`.
    pub async fn run(&self, command: &str, timeout: Duration) -> ExecutionOutcome {
        let start = Instant::now();

        let mut cmd = Self::shell_command(command);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::Failed {
                    error: format!("Failed to spawn command: {}", e),
                    exit_code: None,
                    duration: start.elapsed(),
                }
            }
        };

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return ExecutionOutcome::Failed {
                    error: format!("Process error: {}", e),
                    exit_code: None,
                    duration: start.elapsed(),
                }
            }
            Err(_) => return ExecutionOutcome::TimedOut { timeout },
        };

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let exit_code = output.status.code();

        debug!(
            exit_code = ?exit_code,
            duration_ms = duration.as_millis() as u64,
            "Command finished"
        );

        if output.status.success() {
            return ExecutionOutcome::Succeeded { stdout, duration };
        }

        let error = if !stderr.is_empty() {
            stderr
        } else {
            match exit_code {
                Some(code) => format!("Command exited with status {}", code),
                None => "Command terminated by signal".to_string(),
            }
        };

        ExecutionOutcome::Failed {
            error,
            exit_code,
            duration,
        }
    }
}
