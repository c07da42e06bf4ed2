//! Execution modes and principals

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default timeout for synchronous commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Default ceiling for streaming commands
pub const DEFAULT_STREAMING_CEILING: Duration = Duration::from_secs(4200);

/// Which of the two per-host sessions a command runs on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Principal {
    /// Non-privileged test user
    #[default]
    Operator,
    /// Root/admin user
    Privileged,
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Operator => write!(f, "operator"),
            Principal::Privileged => write!(f, "privileged"),
        }
    }
}

/// How a command is run and waited on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Block until the command finishes or `timeout` elapses.
    ///
    /// With `check_exit_code` unset the call returns at output EOF without
    /// waiting for the exit status.
    Synchronous {
        timeout: Duration,
        check_exit_code: bool,
    },
    /// Dispatch and return; the remote process keeps running
    FireAndForget,
    /// Accumulate output as it arrives until the exit status is ready
    Streaming { ceiling: Duration },
}

impl ExecMode {
    /// Synchronous mode with a custom timeout
    #[must_use]
    pub fn synchronous(timeout: Duration) -> Self {
        ExecMode::Synchronous {
            timeout,
            check_exit_code: true,
        }
    }

    /// Streaming mode with the default ceiling
    #[must_use]
    pub fn streaming() -> Self {
        ExecMode::Streaming {
            ceiling: DEFAULT_STREAMING_CEILING,
        }
    }

    /// Upper bound on how long the call may block, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        match self {
            ExecMode::Synchronous { timeout, .. } => Some(*timeout),
            ExecMode::Streaming { ceiling } => Some(*ceiling),
            ExecMode::FireAndForget => None,
        }
    }
}

impl Default for ExecMode {
    fn default() -> Self {
        ExecMode::Synchronous {
            timeout: DEFAULT_COMMAND_TIMEOUT,
            check_exit_code: true,
        }
    }
}

/// How a remote file is opened for writing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Create or truncate
    #[default]
    Truncate,
    /// Create or append
    Append,
}

impl WriteMode {
    /// Shell redirection operator for this mode
    #[must_use]
    pub fn redirect(&self) -> &'static str {
        match self {
            WriteMode::Truncate => ">",
            WriteMode::Append => ">>",
        }
    }
}

/// Quote a string for a POSIX shell
#[must_use]
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode() {
        let mode = ExecMode::default();
        assert_eq!(mode.deadline(), Some(Duration::from_secs(60)));
        assert!(matches!(
            mode,
            ExecMode::Synchronous {
                check_exit_code: true,
                ..
            }
        ));
        assert_eq!(ExecMode::FireAndForget.deadline(), None);
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/etc/ceph/ceph.conf"), "'/etc/ceph/ceph.conf'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
