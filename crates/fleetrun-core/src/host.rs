//! `RemoteHost`: one fleet member
//!
//! Owns a privileged and an operator session to the same address, drives the
//! connection state machine, and runs commands one at a time.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use fleetrun_exec::{
    CommandResult, Connector, ExecError, ExecMode, Execution, Principal, RemoteWrite, RetryError,
    Session, WriteMode,
};

use crate::config::{ConnectSettings, HostId, HostSpec};
use crate::error::HostError;
use crate::package::PackageFamily;
use crate::state::{FailedContext, HostState};

/// Bound on tearing down a session that may already be dead
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Liveness probe run once both sessions are up
const LIVENESS_PROBE: &str = "echo ok";

/// Principal and mode for one command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub principal: Principal,
    pub mode: ExecMode,
}

impl ExecOptions {
    /// Synchronous, privileged session
    #[must_use]
    pub fn privileged() -> Self {
        Self {
            principal: Principal::Privileged,
            mode: ExecMode::default(),
        }
    }

    #[must_use]
    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = principal;
        self
    }

    #[must_use]
    pub fn with_mode(mut self, mode: ExecMode) -> Self {
        self.mode = mode;
        self
    }

    /// Synchronous mode with a custom timeout
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_mode(ExecMode::synchronous(timeout))
    }

    #[must_use]
    pub fn streaming(self) -> Self {
        self.with_mode(ExecMode::streaming())
    }

    #[must_use]
    pub fn fire_and_forget(self) -> Self {
        self.with_mode(ExecMode::FireAndForget)
    }
}

/// Exit status and stderr of the most recent completed command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastStatus {
    pub command: String,
    pub status: i32,
    pub stderr: String,
}

/// Point-in-time view of a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostStatus {
    pub name: String,
    pub short_name: String,
    pub addr: String,
    pub state: HostState,
    pub package_family: Option<PackageFamily>,
    pub connected_at: Option<DateTime<Utc>>,
    pub failure: Option<FailedContext>,
    pub last: Option<LastStatus>,
}

struct Sessions {
    privileged: Arc<dyn Session>,
    operator: Arc<dyn Session>,
}

impl Sessions {
    fn get(&self, principal: Principal) -> &Arc<dyn Session> {
        match principal {
            Principal::Privileged => &self.privileged,
            Principal::Operator => &self.operator,
        }
    }
}

#[derive(Default)]
struct HostInner {
    state: HostState,
    sessions: Option<Sessions>,
    package_family: Option<PackageFamily>,
    connected_at: Option<DateTime<Utc>>,
    failure: Option<FailedContext>,
    last: Option<LastStatus>,
}

/// A fleet member reachable over two persistent sessions
pub struct RemoteHost {
    spec: HostSpec,
    settings: ConnectSettings,
    connector: Arc<dyn Connector>,
    /// Serializes connect, reconnect and command execution
    exec_lock: tokio::sync::Mutex<()>,
    /// Never held across an await
    inner: Mutex<HostInner>,
}

impl std::fmt::Debug for RemoteHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteHost")
            .field("name", &self.spec.name)
            .field("addr", &self.spec.addr)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl RemoteHost {
    /// Create an unconnected host
    pub fn new(spec: HostSpec, settings: ConnectSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            spec,
            settings,
            connector,
            exec_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(HostInner::default()),
        }
    }

    /// Get the hostname
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    #[must_use]
    pub fn short_name(&self) -> &str {
        self.spec.short_name()
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.spec.addr
    }

    #[must_use]
    pub fn id(&self) -> HostId {
        self.spec.id()
    }

    #[must_use]
    pub fn spec(&self) -> &HostSpec {
        &self.spec
    }

    /// Get current state
    #[must_use]
    pub fn state(&self) -> HostState {
        self.inner().state
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Package family detected at connect time
    #[must_use]
    pub fn package_family(&self) -> Option<PackageFamily> {
        self.inner().package_family
    }

    /// Snapshot of the most recent completed command
    #[must_use]
    pub fn last_status(&self) -> Option<LastStatus> {
        self.inner().last.clone()
    }

    #[must_use]
    pub fn status(&self) -> HostStatus {
        let inner = self.inner();
        HostStatus {
            name: self.spec.name.clone(),
            short_name: self.short_name().to_string(),
            addr: self.spec.addr.clone(),
            state: inner.state,
            package_family: inner.package_family,
            connected_at: inner.connected_at,
            failure: inner.failure.clone(),
            last: inner.last.clone(),
        }
    }

    fn inner(&self) -> MutexGuard<'_, HostInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Transition to a new state with validation
    fn transition_to(&self, new_state: HostState) -> Result<(), HostError> {
        let mut inner = self.inner();
        if !inner.state.can_transition_to(new_state) {
            return Err(HostError::InvalidTransition {
                from: inner.state,
                to: new_state,
            });
        }

        let old_state = inner.state;
        inner.state = new_state;

        info!(
            host = %self.spec.name,
            from = %old_state,
            to = %new_state,
            "state transition"
        );

        Ok(())
    }

    /// Transition to `Failed`, preserving error context
    fn fail_with_error(&self, error: &HostError, attempts: u32) {
        let mut inner = self.inner();
        let previous = inner.state;
        inner.failure = Some(FailedContext::new(previous, error.to_string(), attempts));
        inner.state = HostState::Failed;
        inner.sessions = None;

        error!(
            host = %self.spec.name,
            previous_state = %previous,
            attempts,
            error = %error,
            "host entered failed state"
        );
    }

    /// Establish both sessions.
    ///
    /// Returns immediately when already connected. Exhausting the retry
    /// bound for either session leaves the host in `Failed`.
    ///
    /// # Errors
    /// Returns `HostError::ConnectFailed` or `HostError::ProbeFailed`
    #[instrument(skip(self), fields(host = %self.spec.name))]
    pub async fn connect(&self) -> Result<(), HostError> {
        let _guard = self.exec_lock.lock().await;
        self.connect_locked().await
    }

    async fn connect_locked(&self) -> Result<(), HostError> {
        if self.state().is_connected() {
            debug!(host = %self.spec.name, "already connected");
            return Ok(());
        }
        // left over from an attempt that was abandoned mid-flight
        if self.state() == HostState::Connecting {
            self.mark_disconnected();
        }

        self.transition_to(HostState::Connecting)?;

        match self.establish().await {
            Ok((sessions, family)) => {
                {
                    let mut inner = self.inner();
                    inner.sessions = Some(sessions);
                    inner.package_family = Some(family);
                    inner.connected_at = Some(Utc::now());
                    inner.failure = None;
                }
                self.transition_to(HostState::Connected)?;
                info!(host = %self.spec.name, package_family = %family, "host connected");
                Ok(())
            }
            Err(e) => {
                let attempts = match &e {
                    HostError::ConnectFailed { attempts, .. } => *attempts,
                    _ => 1,
                };
                self.fail_with_error(&e, attempts);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<(Sessions, PackageFamily), HostError> {
        let privileged = self.open_session(Principal::Privileged).await?;
        let operator = match self.open_session(Principal::Operator).await {
            Ok(session) => session,
            Err(e) => {
                close_quietly(&self.spec.name, privileged.as_ref()).await;
                return Err(e);
            }
        };
        let sessions = Sessions {
            privileged,
            operator,
        };

        self.tune_tcp_keepalive(sessions.privileged.as_ref()).await;

        if let Err(e) = self.probe_liveness(sessions.operator.as_ref()).await {
            close_quietly(&self.spec.name, sessions.privileged.as_ref()).await;
            close_quietly(&self.spec.name, sessions.operator.as_ref()).await;
            return Err(e);
        }

        let family = self.probe_package_family(sessions.operator.as_ref()).await;

        Ok((sessions, family))
    }

    async fn open_session(&self, principal: Principal) -> Result<Arc<dyn Session>, HostError> {
        let target = self.spec.target();
        let connector = &self.connector;

        self.settings
            .connect_policy()
            .run(
                |attempt| {
                    let target = &target;
                    async move {
                        debug!(host = %target.host, %principal, attempt, "opening session");
                        let session = connector.connect(target, principal).await?;
                        if session.is_active() {
                            Ok(session)
                        } else {
                            Err(ExecError::Inactive)
                        }
                    }
                },
                ExecError::is_retryable,
            )
            .await
            .map_err(|e| {
                let attempts = e.attempts();
                HostError::ConnectFailed {
                    host: self.spec.name.clone(),
                    principal,
                    attempts,
                    source: e.into_last().unwrap_or(ExecError::Inactive),
                }
            })
    }

    /// Push the TCP keep-alive sysctls; failure only costs idle-connection resilience
    async fn tune_tcp_keepalive(&self, privileged: &dyn Session) {
        if privileged.session_type() == "local" {
            return;
        }
        let cmd = self.settings.tcp_keepalive.sysctl_command();
        match privileged.exec(&cmd, ExecMode::default()).await {
            Ok(execution) if execution.status() == Some(0) => {
                debug!(host = %self.spec.name, "tcp keep-alive tuned");
            }
            Ok(execution) => {
                warn!(host = %self.spec.name, status = ?execution.status(), "tcp keep-alive sysctl failed");
            }
            Err(e) => {
                warn!(host = %self.spec.name, error = %e, "tcp keep-alive sysctl failed");
            }
        }
    }

    async fn probe_liveness(&self, operator: &dyn Session) -> Result<(), HostError> {
        let probe_failed = |reason: String| HostError::ProbeFailed {
            host: self.spec.name.clone(),
            reason,
        };

        let result = operator
            .exec(LIVENESS_PROBE, ExecMode::default())
            .await
            .map_err(|e| probe_failed(e.to_string()))?
            .completed()
            .ok_or_else(|| probe_failed("probe was not waited on".to_string()))?;

        if result.success() && result.stdout.trim() == "ok" {
            Ok(())
        } else {
            Err(probe_failed(format!(
                "status {:?}, stdout {:?}",
                result.status,
                result.stdout.trim()
            )))
        }
    }

    async fn probe_package_family(&self, operator: &dyn Session) -> PackageFamily {
        let cmd = self.settings.package_probe_command();
        let status = match operator.exec(&cmd, ExecMode::default()).await {
            Ok(execution) => execution.status(),
            Err(e) => {
                warn!(host = %self.spec.name, error = %e, "package family probe failed");
                None
            }
        };
        PackageFamily::from_probe_status(status)
    }

    fn session(&self, principal: Principal) -> Result<Arc<dyn Session>, HostError> {
        let inner = self.inner();
        match (&inner.sessions, inner.state) {
            (Some(sessions), HostState::Connected) => Ok(Arc::clone(sessions.get(principal))),
            (_, state) => Err(HostError::NotConnected {
                host: self.spec.name.clone(),
                state,
            }),
        }
    }

    /// Run a command.
    ///
    /// A nonzero exit status is not an error here; it is returned in the
    /// result and recorded as [`LastStatus`]. Use [`RemoteHost::run`] for
    /// fail-on-nonzero semantics. Calls on one host never overlap each
    /// other, but may overlap an open [`RemoteFile`].
    ///
    /// # Errors
    /// Returns `HostError::NotConnected` before `connect()` or after the
    /// transport dropped, and `HostError::Exec` for dispatch failures and
    /// timeouts.
    #[instrument(skip(self, options), fields(host = %self.spec.name, principal = %options.principal))]
    pub async fn execute(&self, cmd: &str, options: ExecOptions) -> Result<Execution, HostError> {
        let _guard = self.exec_lock.lock().await;

        let session = self.session(options.principal)?;
        if !session.is_active() {
            warn!(host = %self.spec.name, "session transport is gone");
            self.mark_disconnected();
            return Err(HostError::NotConnected {
                host: self.spec.name.clone(),
                state: HostState::Disconnected,
            });
        }

        let execution = session.exec(cmd, options.mode).await.map_err(|source| {
            match &source {
                ExecError::ChannelOpenTimeout(_) => {
                    warn!(host = %self.spec.name, command = %cmd, "channel open timed out");
                }
                _ => error!(host = %self.spec.name, command = %cmd, error = %source, "command dispatch failed"),
            }
            HostError::Exec {
                host: self.spec.name.clone(),
                source,
            }
        })?;

        if let Execution::Completed(result) = &execution
            && let Some(status) = result.status
        {
            if status != 0 {
                debug!(host = %self.spec.name, command = %cmd, status, "command exited nonzero");
            }
            self.inner().last = Some(LastStatus {
                command: cmd.to_string(),
                status,
                stderr: result.stderr.clone(),
            });
        }

        Ok(execution)
    }

    /// Run synchronously as the operator and fail on a nonzero exit status
    ///
    /// # Errors
    /// Returns `HostError::Exec` wrapping `ExecError::CommandFailed` on nonzero exit
    pub async fn run(&self, cmd: &str) -> Result<CommandResult, HostError> {
        self.run_as(cmd, ExecOptions::default()).await
    }

    /// Run synchronously as the privileged user and fail on a nonzero exit status
    ///
    /// # Errors
    /// Returns `HostError::Exec` wrapping `ExecError::CommandFailed` on nonzero exit
    pub async fn run_privileged(&self, cmd: &str) -> Result<CommandResult, HostError> {
        self.run_as(cmd, ExecOptions::privileged()).await
    }

    async fn run_as(&self, cmd: &str, options: ExecOptions) -> Result<CommandResult, HostError> {
        let execution = self.execute(cmd, options).await?;
        let result = execution.completed().unwrap_or_default();
        result.check().map_err(|source| HostError::Exec {
            host: self.spec.name.clone(),
            source,
        })
    }

    /// Open a remote file for writing.
    ///
    /// Opening waits for any running command on this host. Once open, the
    /// handle streams data alongside later commands and is released when
    /// closed or dropped. A handle opened before a reconnect fails on its
    /// next write.
    ///
    /// # Errors
    /// Returns `HostError::NotConnected` or `HostError::Exec`
    #[instrument(skip(self), fields(host = %self.spec.name))]
    pub async fn open_scoped_file(
        &self,
        path: &str,
        mode: WriteMode,
        principal: Principal,
    ) -> Result<RemoteFile, HostError> {
        let _guard = self.exec_lock.lock().await;
        let session = self.session(principal)?;
        let writer = session
            .open_writer(path, mode)
            .await
            .map_err(|source| HostError::Exec {
                host: self.spec.name.clone(),
                source,
            })?;

        Ok(RemoteFile {
            host: self.spec.name.clone(),
            path: path.to_string(),
            writer: Some(writer),
        })
    }

    /// Write `contents` to a remote file and close it
    ///
    /// # Errors
    /// Returns `HostError` if opening, writing, or closing fails
    pub async fn write_file(
        &self,
        path: &str,
        contents: &[u8],
        mode: WriteMode,
        principal: Principal,
    ) -> Result<(), HostError> {
        let mut file = self.open_scoped_file(path, mode, principal).await?;
        file.write_all(contents).await?;
        file.close().await
    }

    /// Drop both sessions without network I/O, e.g. right after issuing a reboot
    pub fn mark_disconnected(&self) {
        let mut inner = self.inner();
        inner.sessions = None;
        if matches!(inner.state, HostState::Connected | HostState::Connecting) {
            info!(host = %self.spec.name, from = %inner.state, "marked disconnected");
            inner.state = HostState::Disconnected;
        }
    }

    /// Clear the connected state and connect again
    ///
    /// # Errors
    /// Same as [`RemoteHost::connect`]
    #[instrument(skip(self), fields(host = %self.spec.name))]
    pub async fn reconnect(&self) -> Result<(), HostError> {
        let _guard = self.exec_lock.lock().await;

        let sessions = self.inner().sessions.take();
        if let Some(sessions) = sessions {
            close_quietly(&self.spec.name, sessions.privileged.as_ref()).await;
            close_quietly(&self.spec.name, sessions.operator.as_ref()).await;
        }
        self.mark_disconnected();

        self.connect_locked().await
    }

    /// Poll [`RemoteHost::reconnect`] until it succeeds or `deadline` passes
    ///
    /// # Errors
    /// Returns `HostError::Timeout` once the deadline is exceeded
    pub async fn reconnect_until(&self, deadline: Duration) -> Result<(), HostError> {
        self.settings
            .reconnect_policy(deadline)
            .run(
                |attempt| async move {
                    debug!(host = %self.spec.name, attempt, "reconnect attempt");
                    self.reconnect().await
                },
                |_| true,
            )
            .await
            .map_err(|e| match e {
                RetryError::DeadlineExceeded { .. } => {
                    // an attempt abandoned mid-flight may have left us connecting
                    self.mark_disconnected();
                    HostError::Timeout {
                        host: self.spec.name.clone(),
                        deadline,
                    }
                }
                RetryError::Exhausted { last, .. } | RetryError::Fatal { last, .. } => last,
            })
    }

    /// Issue a privileged reboot and wait for the host to come back
    ///
    /// # Errors
    /// Returns `HostError::Timeout` if the host is not reachable again within `deadline`
    #[instrument(skip(self), fields(host = %self.spec.name))]
    pub async fn reboot_and_wait(&self, deadline: Duration) -> Result<(), HostError> {
        let started = tokio::time::Instant::now();
        let old_session = self.session(Principal::Privileged)?;

        info!(host = %self.spec.name, "rebooting");
        self.execute("reboot", ExecOptions::privileged().fire_and_forget())
            .await?;

        let went_down = tokio::time::timeout(self.settings.reboot_grace(), async {
            while old_session.is_active() {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await
        .is_ok();
        if !went_down {
            debug!(host = %self.spec.name, "session still open after reboot grace period");
        }
        drop(old_session);
        self.mark_disconnected();

        let remaining = deadline.saturating_sub(started.elapsed());
        self.reconnect_until(remaining).await?;

        info!(host = %self.spec.name, elapsed = ?started.elapsed(), "host back after reboot");
        Ok(())
    }

    /// Close both sessions
    pub async fn disconnect(&self) {
        let _guard = self.exec_lock.lock().await;
        let sessions = self.inner().sessions.take();
        if let Some(sessions) = sessions {
            close_quietly(&self.spec.name, sessions.privileged.as_ref()).await;
            close_quietly(&self.spec.name, sessions.operator.as_ref()).await;
        }
        self.mark_disconnected();
    }
}

async fn close_quietly(host: &str, session: &dyn Session) {
    match tokio::time::timeout(DISCONNECT_TIMEOUT, session.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(host = %host, error = %e, "session close failed"),
        Err(_) => debug!(host = %host, "session close timed out"),
    }
}

/// Write handle to a remote file
///
/// Prefer [`RemoteFile::close`] to observe errors; a handle dropped while
/// still open is closed in the background.
pub struct RemoteFile {
    host: String,
    path: String,
    writer: Option<Box<dyn RemoteWrite>>,
}

impl RemoteFile {
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    fn writer(&mut self) -> Result<&mut Box<dyn RemoteWrite>, HostError> {
        self.writer.as_mut().ok_or_else(|| HostError::Exec {
            host: self.host.clone(),
            source: ExecError::IoError(format!("{} already closed", self.path)),
        })
    }

    fn wrap(&self, source: ExecError) -> HostError {
        HostError::Exec {
            host: self.host.clone(),
            source,
        }
    }

    /// # Errors
    /// Returns `HostError::Exec` if the write fails
    pub async fn write_all(&mut self, data: &[u8]) -> Result<(), HostError> {
        let result = self.writer()?.write_all(data).await;
        result.map_err(|e| self.wrap(e))
    }

    /// # Errors
    /// Returns `HostError::Exec` if the flush fails
    pub async fn flush(&mut self) -> Result<(), HostError> {
        let result = self.writer()?.flush().await;
        result.map_err(|e| self.wrap(e))
    }

    /// Flush and release the remote handle
    ///
    /// # Errors
    /// Returns `HostError::Exec` if the remote side reports a failure
    pub async fn close(mut self) -> Result<(), HostError> {
        match self.writer.take() {
            Some(writer) => writer.close().await.map_err(|e| self.wrap(e)),
            None => Ok(()),
        }
    }
}

impl Drop for RemoteFile {
    fn drop(&mut self) {
        let Some(writer) = self.writer.take() else {
            return;
        };
        let host = self.host.clone();
        let path = self.path.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = writer.close().await {
                        warn!(host = %host, path = %path, error = %e, "failed to close dropped remote file");
                    }
                });
            }
            Err(_) => {
                warn!(host = %host, path = %path, "remote file dropped outside a runtime");
            }
        }
    }
}
