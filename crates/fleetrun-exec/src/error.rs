//! Error types for fleetrun-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during remote execution
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Transport connected but does not report itself active
    #[error("transport not active")]
    Inactive,

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Remote command exited with a nonzero status
    #[error("command failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// The server did not confirm a channel open in time
    #[error("channel open timed out: {0}")]
    ChannelOpenTimeout(String),

    /// Channel-level failure while dispatching a command
    #[error("channel error: {0}")]
    Channel(String),

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecError::ConnectionFailed(_)
                | ExecError::Inactive
                | ExecError::Timeout { .. }
                | ExecError::ChannelOpenTimeout(_)
                | ExecError::NotConnected
        )
    }

    /// Classify a channel dispatch failure from its message.
    ///
    /// Channel open timeouts are transient and reported separately so that
    /// callers can decide whether to re-issue the command.
    pub fn from_dispatch(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();
        if lower.contains("channel") && (lower.contains("timeout") || lower.contains("timed out"))
        {
            ExecError::ChannelOpenTimeout(message)
        } else {
            ExecError::Channel(message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_classification() {
        assert!(matches!(
            ExecError::from_dispatch("Channel open timeout"),
            ExecError::ChannelOpenTimeout(_)
        ));
        assert!(matches!(
            ExecError::from_dispatch("channel open timed out after 30s"),
            ExecError::ChannelOpenTimeout(_)
        ));
        assert!(matches!(
            ExecError::from_dispatch("administratively prohibited"),
            ExecError::Channel(_)
        ));
    }

    #[test]
    fn test_retryable() {
        assert!(ExecError::Inactive.is_retryable());
        assert!(ExecError::ConnectionFailed("refused".into()).is_retryable());
        assert!(!ExecError::AuthenticationFailed("denied".into()).is_retryable());
        assert!(
            !ExecError::CommandFailed {
                status: 1,
                stderr: String::new()
            }
            .is_retryable()
        );
    }
}
