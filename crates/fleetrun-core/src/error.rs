//! Core error types for fleetrun-core

use std::time::Duration;

use thiserror::Error;

use fleetrun_exec::{ExecError, Principal};

use crate::state::HostState;

/// Errors raised by `RemoteHost` and `Fleet` operations
#[derive(Error, Debug, Clone)]
pub enum HostError {
    /// Host not found in the fleet
    #[error("host not found: {0}")]
    HostNotFound(String),

    /// Short name matches more than one host
    #[error("host name {name} is ambiguous: {}", candidates.join(", "))]
    AmbiguousHost {
        name: String,
        candidates: Vec<String>,
    },

    /// Host already registered in the fleet
    #[error("host already exists: {0}")]
    HostAlreadyExists(String),

    /// Command issued before both sessions were established
    #[error("{host}: not connected (state {state})")]
    NotConnected { host: String, state: HostState },

    /// A session could not be established within the retry bound
    #[error("{host}: {principal} session failed after {attempts} attempts: {source}")]
    ConnectFailed {
        host: String,
        principal: Principal,
        attempts: u32,
        #[source]
        source: ExecError,
    },

    /// Sessions opened but the liveness probe did not answer
    #[error("{host}: liveness probe failed: {reason}")]
    ProbeFailed { host: String, reason: String },

    /// Command dispatch or execution error
    #[error("{host}: {source}")]
    Exec {
        host: String,
        #[source]
        source: ExecError,
    },

    /// Host did not come back within the deadline
    #[error("{host}: not reachable within {deadline:?}")]
    Timeout { host: String, deadline: Duration },

    /// Invalid state transition attempted
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: HostState, to: HostState },
}

impl HostError {
    /// Check if error is retryable
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            HostError::ConnectFailed { source, .. } | HostError::Exec { source, .. } => {
                source.is_retryable()
            }
            HostError::NotConnected { .. } | HostError::ProbeFailed { .. } => true,
            _ => false,
        }
    }

    /// Exit status carried by a command failure
    #[must_use]
    pub fn exit_status(&self) -> Option<i32> {
        match self {
            HostError::Exec {
                source: ExecError::CommandFailed { status, .. },
                ..
            } => Some(*status),
            _ => None,
        }
    }
}
