//! fleetrun-exec: Remote execution transport
//!
//! Provides the session traits plus SSH and local implementations, command
//! results, and the retry policy used for connection setup.

pub mod error;
pub mod keys;
pub mod local;
pub mod mode;
pub mod result;
pub mod retry;
pub mod ssh;
pub mod traits;

pub use error::ExecError;
pub use keys::{Auth, Credentials, KeySource};
pub use local::{LocalConnector, LocalSession};
pub use mode::{ExecMode, Principal, WriteMode, shell_quote};
pub use result::{CommandResult, Execution, Target};
pub use retry::{Backoff, RetryError, RetryPolicy};
pub use ssh::{SshConnector, SshSession};
pub use traits::{Connector, RemoteWrite, Session};
