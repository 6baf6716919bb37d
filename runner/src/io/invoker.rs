//! External tool invocation.
//!
//! The [`ToolInvoker`] trait decouples stage execution from real process
//! spawning. Tests use scripted invokers that return predetermined
//! [`ProcessResult`]s without touching the toolchain.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::core::types::{ProcessResult, millis};
use crate::io::process::{SpawnFailure, run_command_with_timeout};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// One call of the external tool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory for the child process.
    pub cwd: PathBuf,
    pub timeout: Option<Duration>,
    /// Extra environment variables layered over the inherited environment.
    pub env: BTreeMap<String, String>,
}

impl Invocation {
    /// `program arg1 arg2 ...`, for logs and error messages.
    pub fn display(&self) -> String {
        let mut buf = self.program.clone();
        for arg in &self.args {
            buf.push(' ');
            buf.push_str(arg);
        }
        buf
    }
}

/// The tool could not be run to completion. Never fed to the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("failed to start `{command}`: {message}")]
    Spawn { command: String, message: String },
    #[error("failed while waiting for `{command}`: {message}")]
    Wait { command: String, message: String },
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

impl InvocationError {
    pub fn command(&self) -> &str {
        match self {
            InvocationError::Spawn { command, .. }
            | InvocationError::Wait { command, .. }
            | InvocationError::TimedOut { command, .. } => command,
        }
    }
}

/// Abstraction over external tool execution.
pub trait ToolInvoker {
    /// Run `invocation` to completion.
    ///
    /// A non-zero exit is an `Ok` result with `success == false`; `Err` is
    /// reserved for invocation-level failures.
    fn invoke(&self, invocation: &Invocation) -> Result<ProcessResult, InvocationError>;
}

/// Invoker that spawns real child processes.
#[derive(Debug, Clone)]
pub struct CommandInvoker {
    pub output_limit_bytes: usize,
}

impl Default for CommandInvoker {
    fn default() -> Self {
        Self {
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl ToolInvoker for CommandInvoker {
    #[instrument(skip_all, fields(program = %invocation.program, args = invocation.args.len()))]
    fn invoke(&self, invocation: &Invocation) -> Result<ProcessResult, InvocationError> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .current_dir(&invocation.cwd)
            .envs(&invocation.env);

        let command = invocation.display();
        let output = run_command_with_timeout(cmd, invocation.timeout, self.output_limit_bytes)
            .map_err(|failure| match failure {
                SpawnFailure::Spawn(err) => InvocationError::Spawn {
                    command: command.clone(),
                    message: err.to_string(),
                },
                SpawnFailure::Wait(err) => InvocationError::Wait {
                    command: command.clone(),
                    message: format!("{err:#}"),
                },
            })?;

        if output.timed_out {
            let timeout = invocation.timeout.unwrap_or_default();
            warn!(command = %command, timeout_ms = millis(timeout), "invocation timed out");
            return Err(InvocationError::TimedOut { command, timeout });
        }

        let result = ProcessResult {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: output.stdout_lossy(),
            stderr: output.stderr_lossy(),
            duration: output.elapsed,
        };
        debug!(exit_code = ?result.exit_code, duration_ms = millis(result.duration), "invocation finished");
        Ok(result)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn invocation(program: &str, args: &[&str], timeout: Option<Duration>) -> Invocation {
        let temp = std::env::temp_dir();
        Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            cwd: temp,
            timeout,
            env: BTreeMap::from([("CI_RUNNER_PROBE".to_string(), "42".to_string())]),
        }
    }

    #[test]
    fn non_zero_exit_is_a_result() {
        let result = CommandInvoker::default()
            .invoke(&invocation("sh", &["-c", "echo $CI_RUNNER_PROBE; exit 2"], None))
            .expect("invoke");
        assert!(!result.success);
        assert_eq!(result.exit_code, Some(2));
        assert_eq!(result.stdout, "42\n");
    }

    #[test]
    fn missing_program_is_invocation_error() {
        let err = CommandInvoker::default()
            .invoke(&invocation("ci-runner-missing-tool", &["check"], None))
            .unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
        assert_eq!(err.command(), "ci-runner-missing-tool check");
    }

    #[test]
    fn timeout_is_invocation_error() {
        let err = CommandInvoker::default()
            .invoke(&invocation(
                "sh",
                &["-c", "exec sleep 5"],
                Some(Duration::from_millis(100)),
            ))
            .unwrap_err();
        assert!(matches!(err, InvocationError::TimedOut { .. }));
    }
}
