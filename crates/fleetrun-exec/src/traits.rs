//! Session and connector traits

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::mode::{ExecMode, Principal, WriteMode};
use crate::result::{Execution, Target};

/// An authenticated, persistent session to one host as one principal
#[async_trait]
pub trait Session: Send + Sync {
    /// Whether the underlying transport is still usable
    fn is_active(&self) -> bool;

    /// Run a shell command in the given mode
    async fn exec(&self, cmd: &str, mode: ExecMode) -> Result<Execution, ExecError>;

    /// Open a remote file for writing
    async fn open_writer(
        &self,
        path: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn RemoteWrite>, ExecError>;

    /// Tear the session down
    async fn disconnect(&self) -> Result<(), ExecError>;

    fn session_type(&self) -> &'static str;
}

/// Write half of a remote file
#[async_trait]
pub trait RemoteWrite: Send {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ExecError>;

    async fn flush(&mut self) -> Result<(), ExecError>;

    /// Flush and release the remote handle
    async fn close(self: Box<Self>) -> Result<(), ExecError>;
}

/// Opens sessions against a target
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &Target,
        principal: Principal,
    ) -> Result<Arc<dyn Session>, ExecError>;
}
