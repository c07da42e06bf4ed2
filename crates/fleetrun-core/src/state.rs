//! Host connection state machine types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connection state of a `RemoteHost`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    /// No connection has been attempted
    #[default]
    Unconnected,
    Connecting,
    /// Both sessions are established
    Connected,
    /// Sessions were dropped, typically around a reboot
    Disconnected,
    /// Connection attempts were exhausted
    Failed,
}

impl HostState {
    /// Check whether a transition is allowed
    #[must_use]
    pub fn can_transition_to(self, next: HostState) -> bool {
        use HostState::{Connected, Connecting, Disconnected, Failed, Unconnected};

        matches!(
            (self, next),
            (Unconnected | Disconnected | Failed, Connecting)
                | (Connecting, Connected | Failed | Disconnected)
                | (Connected, Disconnected)
        )
    }

    #[must_use]
    pub fn is_connected(self) -> bool {
        self == HostState::Connected
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HostState::Unconnected => "unconnected",
            HostState::Connecting => "connecting",
            HostState::Connected => "connected",
            HostState::Disconnected => "disconnected",
            HostState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Details kept while a host sits in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedContext {
    pub previous_state: HostState,
    pub error: String,
    /// Attempts made before giving up
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

impl FailedContext {
    pub fn new(previous_state: HostState, error: impl Into<String>, attempts: u32) -> Self {
        Self {
            previous_state,
            error: error.into(),
            attempts,
            failed_at: Utc::now(),
        }
    }
}
