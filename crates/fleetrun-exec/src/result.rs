//! Result types for command execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Result of a completed command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code, `None` when the caller did not wait for it
    pub status: Option<i32>,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// stdout and stderr in the order they arrived
    pub output: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Turn a nonzero exit status into [`ExecError::CommandFailed`].
    ///
    /// A result without a status passes through unchanged.
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` if the status is known and nonzero
    pub fn check(self) -> Result<Self, ExecError> {
        match self.status {
            Some(status) if status != 0 => Err(ExecError::CommandFailed {
                status,
                stderr: self.stderr,
            }),
            _ => Ok(self),
        }
    }
}

/// Outcome of dispatching a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Execution {
    /// The command ran to completion (or to output EOF)
    Completed(CommandResult),
    /// The command was handed to the remote host and left running
    Dispatched,
}

impl Execution {
    /// The completed result, if the command was waited on
    #[must_use]
    pub fn completed(self) -> Option<CommandResult> {
        match self {
            Execution::Completed(result) => Some(result),
            Execution::Dispatched => None,
        }
    }

    /// Exit status of a completed command
    #[must_use]
    pub fn status(&self) -> Option<i32> {
        match self {
            Execution::Completed(result) => result.status,
            Execution::Dispatched => None,
        }
    }
}

/// Network target for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    22
}

impl Target {
    /// Create a target on the default SSH port
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
        }
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Whether the target is the local machine
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.host == "localhost" || self.host == "127.0.0.1"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(status: Option<i32>, stderr: &str) -> CommandResult {
        CommandResult {
            status,
            stderr: stderr.to_string(),
            ..CommandResult::default()
        }
    }

    #[test]
    fn test_check_nonzero() {
        let err = result(Some(3), "boom").check().unwrap_err();
        match err {
            ExecError::CommandFailed { status, stderr } => {
                assert_eq!(status, 3);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_check_passes_unknown_status() {
        assert!(result(None, "").check().is_ok());
        assert!(result(Some(0), "warning").check().is_ok());
    }

    #[test]
    fn test_local_target() {
        assert!(Target::new("localhost").is_local());
        assert!(!Target::new("10.0.0.7").with_port(2222).is_local());
    }
}
