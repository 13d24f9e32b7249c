//! Child process execution with a timeout

use kiln_core::error::ExecutionError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs a prepared command and captures its output
///
/// The child is killed if the timeout elapses; `command_line` names the command
/// in errors and logs.
pub(crate) async fn run(
    mut command: Command,
    command_line: &str,
    timeout: Duration,
) -> Result<ExecOutput, ExecutionError> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = command.spawn().map_err(|source| ExecutionError::Spawn {
        command: command_line.to_string(),
        source,
    })?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecutionError::Timeout {
            command: command_line.to_string(),
            secs: timeout.as_secs(),
        })?
        .map_err(|source| ExecutionError::Spawn {
            command: command_line.to_string(),
            source,
        })?;

    let result = ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    debug!(
        "'{}' exited with {} (stdout_len={}, stderr_len={})",
        command_line,
        result.exit_code,
        result.stdout.len(),
        result.stderr.len()
    );

    Ok(result)
}
