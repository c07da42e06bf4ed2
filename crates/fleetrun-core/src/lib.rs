//! fleetrun-core: hosts, fleets and parallel execution
//!
//! `RemoteHost` drives the connection state machine of one machine over a
//! privileged and an operator session. `ParallelExecutor` fans work out
//! across hosts and joins it. `Fleet` ties both to a declarative `FleetSpec`.

pub mod config;
pub mod error;
pub mod fleet;
pub mod host;
pub mod package;
pub mod parallel;
pub mod state;

pub use config::{ConnectSettings, FleetSpec, HostId, HostSpec, TcpKeepalive};
pub use error::HostError;
pub use fleet::{
    ConnectorFactory, DefaultConnectorFactory, ExitStatusMap, Fleet, FleetRun, FleetRunError,
};
pub use host::{ExecOptions, HostStatus, LastStatus, RemoteFile, RemoteHost};
pub use package::PackageFamily;
pub use parallel::{
    GroupError, JoinReport, OperationError, OperationId, Outcome, ParallelExecutor,
};
pub use state::{FailedContext, HostState};
