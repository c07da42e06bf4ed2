//! Runtime registry of fleet members
//!
//! A [`Fleet`] is built from a serializable [`FleetSpec`]. Live sessions
//! exist only inside the registry and are looked up by [`HostId`].

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{error, info, warn};

use fleetrun_exec::{CommandResult, Connector, ExecError, LocalConnector, SshConnector};

use crate::config::{ConnectSettings, FleetSpec, HostId, HostSpec};
use crate::error::HostError;
use crate::host::{ExecOptions, RemoteHost};
use crate::parallel::{JoinReport, OperationError, ParallelExecutor};

/// Exit status per host name
pub type ExitStatusMap = BTreeMap<String, i32>;

/// Factory for per-host connectors
///
/// Allows injection of different transports per host.
pub trait ConnectorFactory: Send + Sync {
    fn create_connector(&self, spec: &HostSpec, settings: &ConnectSettings) -> Arc<dyn Connector>;
}

/// Local targets get a [`LocalConnector`], everything else SSH
#[derive(Debug, Clone, Default)]
pub struct DefaultConnectorFactory;

impl ConnectorFactory for DefaultConnectorFactory {
    fn create_connector(&self, spec: &HostSpec, settings: &ConnectSettings) -> Arc<dyn Connector> {
        if spec.target().is_local() {
            return Arc::new(LocalConnector);
        }

        Arc::new(
            SshConnector::new(spec.operator.clone(), spec.privileged.clone())
                .with_keepalive(settings.keepalive())
                .with_connect_timeout(settings.connect_timeout()),
        )
    }
}

/// Per-host results of one fan-out command
#[derive(Debug, Default)]
pub struct FleetRun {
    /// Exit status of every host whose command completed
    pub statuses: ExitStatusMap,
    /// Full output of every host whose command completed
    pub results: BTreeMap<String, CommandResult>,
    /// Hosts whose command could not be run or waited on
    pub errors: BTreeMap<String, HostError>,
    /// First host to fail, by completion order
    first_failure: Option<String>,
}

/// First failure of a fan-out command, with the statuses gathered around it
#[derive(Error, Debug)]
#[error("{host}: {error} ({} hosts reported)", statuses.len())]
pub struct FleetRunError {
    pub host: String,
    pub error: HostError,
    pub statuses: ExitStatusMap,
}

impl FleetRun {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.first_failure.is_none()
    }

    /// Host that failed first, if any
    #[must_use]
    pub fn first_failure(&self) -> Option<&str> {
        self.first_failure.as_deref()
    }

    /// The status map, or the first failure (nonzero exit or error)
    ///
    /// # Errors
    /// Returns `FleetRunError` naming the first host to fail
    pub fn into_result(mut self) -> Result<ExitStatusMap, FleetRunError> {
        let Some(host) = self.first_failure.take() else {
            return Ok(self.statuses);
        };

        let error = match self.errors.remove(&host) {
            Some(error) => error,
            None => {
                let stderr = self
                    .results
                    .remove(&host)
                    .map(|r| r.stderr)
                    .unwrap_or_default();
                HostError::Exec {
                    host: host.clone(),
                    source: ExecError::CommandFailed {
                        status: self.statuses.get(&host).copied().unwrap_or(-1),
                        stderr,
                    },
                }
            }
        };

        Err(FleetRunError {
            host,
            error,
            statuses: self.statuses,
        })
    }
}

/// Runtime registry of connected hosts
pub struct Fleet {
    settings: ConnectSettings,
    hosts: BTreeMap<HostId, Arc<RemoteHost>>,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("hosts", &self.hosts.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Build the registry from a spec without connecting
    ///
    /// # Errors
    /// Returns `HostError::HostAlreadyExists` on duplicate host names
    pub fn from_spec(spec: FleetSpec, factory: &dyn ConnectorFactory) -> Result<Self, HostError> {
        let mut hosts = BTreeMap::new();

        for host_spec in spec.hosts {
            let id = host_spec.id();
            if hosts.contains_key(&id) {
                return Err(HostError::HostAlreadyExists(id.to_string()));
            }
            let connector = factory.create_connector(&host_spec, &spec.settings);
            let host = RemoteHost::new(host_spec, spec.settings.clone(), connector);
            hosts.insert(id, Arc::new(host));
        }

        info!(hosts = hosts.len(), "fleet registered");

        Ok(Self {
            settings: spec.settings,
            hosts,
        })
    }

    /// The declarative parameters needed to rebuild this fleet
    #[must_use]
    pub fn spec(&self) -> FleetSpec {
        FleetSpec {
            settings: self.settings.clone(),
            hosts: self.hosts.values().map(|h| h.spec().clone()).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &Arc<RemoteHost>> {
        self.hosts.values()
    }

    /// Look a host up by full name, or by a short name that is unique
    ///
    /// # Errors
    /// Returns `HostError::HostNotFound`, or `HostError::AmbiguousHost` when
    /// a short name matches several hosts
    pub fn get(&self, name: &str) -> Result<Arc<RemoteHost>, HostError> {
        if let Some(host) = self.hosts.values().find(|h| h.name() == name) {
            return Ok(Arc::clone(host));
        }

        let mut matches = self.hosts.values().filter(|h| h.short_name() == name);
        match (matches.next(), matches.next()) {
            (Some(host), None) => Ok(Arc::clone(host)),
            (None, _) => Err(HostError::HostNotFound(name.to_string())),
            (Some(_), Some(_)) => Err(HostError::AmbiguousHost {
                name: name.to_string(),
                candidates: self
                    .hosts
                    .values()
                    .filter(|h| h.short_name() == name)
                    .map(|h| h.name().to_string())
                    .collect(),
            }),
        }
    }

    #[must_use]
    pub fn with_role(&self, role: &str) -> Vec<Arc<RemoteHost>> {
        self.hosts
            .values()
            .filter(|h| h.spec().has_role(role))
            .cloned()
            .collect()
    }

    fn group<T: Send + 'static>(&self) -> ParallelExecutor<T, HostError> {
        match self.settings.max_parallelism {
            Some(limit) => ParallelExecutor::with_parallelism(limit),
            None => ParallelExecutor::new(),
        }
    }

    /// Run `op` once per host concurrently and wait for all of them
    pub async fn for_each<T, F, Fut>(
        &self,
        hosts: impl IntoIterator<Item = Arc<RemoteHost>>,
        op: F,
    ) -> JoinReport<T, HostError>
    where
        T: Send + 'static,
        F: Fn(Arc<RemoteHost>) -> Fut,
        Fut: Future<Output = Result<T, HostError>> + Send + 'static,
    {
        let mut group = self.group();
        for host in hosts {
            let name = host.name().to_string();
            group.spawn(name, op(host));
        }
        group.join().await
    }

    /// Connect every host concurrently
    pub async fn connect_all(&self) -> JoinReport<(), HostError> {
        let report = self
            .for_each(self.hosts.values().cloned(), |host| async move {
                host.connect().await
            })
            .await;

        if report.is_success() {
            info!(hosts = report.len(), "fleet connected");
        } else {
            error!(
                failed = report.failed_count(),
                total = report.len(),
                "fleet connect incomplete"
            );
        }
        report
    }

    /// Run `cmd` on every host
    pub async fn run_all(&self, cmd: &str, options: ExecOptions) -> FleetRun {
        self.run_hosts(self.hosts.values().cloned().collect(), cmd, options)
            .await
    }

    /// Run `cmd` on the named hosts
    ///
    /// # Errors
    /// Returns `HostError::HostNotFound` if any name is unknown
    pub async fn run_on(
        &self,
        names: &[&str],
        cmd: &str,
        options: ExecOptions,
    ) -> Result<FleetRun, HostError> {
        let hosts = names
            .iter()
            .map(|name| self.get(name))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(self.run_hosts(hosts, cmd, options).await)
    }

    async fn run_hosts(
        &self,
        hosts: Vec<Arc<RemoteHost>>,
        cmd: &str,
        options: ExecOptions,
    ) -> FleetRun {
        let mut group = self.group();
        for host in hosts {
            let cmd = cmd.to_string();
            group.spawn(host.name().to_string(), async move {
                host.execute(&cmd, options).await
            });
        }

        let mut run = FleetRun::default();
        while let Some(outcome) = group.next().await {
            match outcome.result {
                Ok(execution) => {
                    let Some(result) = execution.completed() else {
                        continue;
                    };
                    if let Some(status) = result.status {
                        if status != 0 && run.first_failure.is_none() {
                            run.first_failure = Some(outcome.name.clone());
                        }
                        run.statuses.insert(outcome.name.clone(), status);
                    }
                    run.results.insert(outcome.name, result);
                }
                Err(e) => {
                    let error = match e {
                        OperationError::Failed(error) => error,
                        OperationError::Panicked(reason) => HostError::Exec {
                            host: outcome.name.clone(),
                            source: ExecError::IoError(format!("worker panicked: {reason}")),
                        },
                        OperationError::Cancelled => HostError::Exec {
                            host: outcome.name.clone(),
                            source: ExecError::IoError("worker cancelled".to_string()),
                        },
                    };
                    warn!(host = %outcome.name, error = %error, "fan-out command failed");
                    if run.first_failure.is_none() {
                        run.first_failure = Some(outcome.name.clone());
                    }
                    run.errors.insert(outcome.name, error);
                }
            }
        }

        run
    }

    /// Reboot one host and wait until it accepts commands again
    ///
    /// # Errors
    /// Returns `HostError::Timeout` if the host is not back within `deadline`
    pub async fn reboot_and_wait(&self, name: &str, deadline: Duration) -> Result<(), HostError> {
        self.get(name)?.reboot_and_wait(deadline).await
    }

    /// Close every host's sessions
    pub async fn disconnect_all(&self) {
        let report = self
            .for_each(self.hosts.values().cloned(), |host| async move {
                host.disconnect().await;
                Ok(())
            })
            .await;
        info!(hosts = report.len(), "fleet disconnected");
    }
}
