//! SSH command execution using russh crate

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect};
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{Auth, Credentials};
use crate::local::Streams;
use crate::mode::{ExecMode, Principal, WriteMode, shell_quote};
use crate::result::{Execution, Target};
use crate::traits::{Connector, RemoteWrite, Session};

/// Default transport keep-alive interval
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(15);

/// Default bound on TCP connect plus key exchange
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on the server confirming a new channel
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(30);

/// SSH client handler for russh
#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Fleet nodes are freshly provisioned, host keys are never known ahead
        Ok(true)
    }
}

/// One authenticated SSH session
pub struct SshSession {
    target: Target,
    principal: Principal,
    handle: client::Handle<SshClientHandler>,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("target", &self.target)
            .field("principal", &self.principal)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Open a channel and start `cmd` on it
    async fn dispatch(&self, cmd: &str) -> Result<Channel<Msg>, ExecError> {
        let channel = timeout(CHANNEL_OPEN_TIMEOUT, self.handle.channel_open_session())
            .await
            .map_err(|_| {
                ExecError::ChannelOpenTimeout(format!(
                    "no channel confirmation within {CHANNEL_OPEN_TIMEOUT:?}"
                ))
            })?
            .map_err(|e| ExecError::from_dispatch(e.to_string()))?;

        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::from_dispatch(e.to_string()))?;

        Ok(channel)
    }

    /// Read channel messages until output EOF and, if requested, the exit status
    async fn collect(
        &self,
        channel: &mut Channel<Msg>,
        wait_for_status: bool,
        log_chunks: bool,
    ) -> (Streams, Option<i32>) {
        let mut streams = Streams::default();
        let mut status = None;
        let mut eof = false;

        loop {
            match channel.wait().await {
                Some(ChannelMsg::Data { data }) => {
                    if log_chunks {
                        debug!(host = %self.target.host, stream = "stdout", "{}", String::from_utf8_lossy(&data).trim_end());
                    }
                    streams.push_stdout(&data);
                }
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    // ext 1 is stderr
                    if ext == 1 {
                        if log_chunks {
                            debug!(host = %self.target.host, stream = "stderr", "{}", String::from_utf8_lossy(&data).trim_end());
                        }
                        streams.push_stderr(&data);
                    }
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    status = Some(exit_status.cast_signed());
                    if eof {
                        break;
                    }
                }
                Some(ChannelMsg::Eof) => {
                    eof = true;
                    if !wait_for_status || status.is_some() {
                        break;
                    }
                }
                Some(ChannelMsg::Close) | None => break,
                _ => {}
            }
        }

        (streams, if wait_for_status { status } else { None })
    }

    async fn run_collected(
        &self,
        cmd: &str,
        wait_for_status: bool,
        log_chunks: bool,
    ) -> Result<Execution, ExecError> {
        let start = Instant::now();
        let mut channel = self.dispatch(cmd).await?;
        let (streams, status) = self.collect(&mut channel, wait_for_status, log_chunks).await;
        let result = streams.into_result(status, start.elapsed());

        debug!(
            host = %self.target.host,
            command = %cmd,
            status = ?result.status,
            duration = ?result.duration,
            "remote command completed"
        );

        Ok(Execution::Completed(result))
    }
}

#[async_trait]
impl Session for SshSession {
    fn is_active(&self) -> bool {
        !self.handle.is_closed()
    }

    #[instrument(skip(self, cmd), fields(host = %self.target.host, principal = %self.principal))]
    async fn exec(&self, cmd: &str, mode: ExecMode) -> Result<Execution, ExecError> {
        debug!(command = %cmd, mode = ?mode, "executing remote command");

        let (limit, wait_for_status, log_chunks) = match mode {
            ExecMode::FireAndForget => {
                let mut channel = self.dispatch(cmd).await?;
                // drain in the background so the channel is released once the
                // remote side closes it
                tokio::spawn(async move { while channel.wait().await.is_some() {} });
                return Ok(Execution::Dispatched);
            }
            ExecMode::Synchronous {
                timeout,
                check_exit_code,
            } => (timeout, check_exit_code, false),
            ExecMode::Streaming { ceiling } => (ceiling, true, true),
        };

        match timeout(limit, self.run_collected(cmd, wait_for_status, log_chunks)).await {
            Ok(result) => result,
            Err(_) => {
                error!(command = %cmd, timeout = ?limit, "command timed out");
                Err(ExecError::Timeout { timeout: limit })
            }
        }
    }

    #[instrument(skip(self), fields(host = %self.target.host, principal = %self.principal))]
    async fn open_writer(
        &self,
        path: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn RemoteWrite>, ExecError> {
        let cmd = format!("cat {} {}", mode.redirect(), shell_quote(path));
        let channel = self.dispatch(&cmd).await?;
        debug!(path = %path, ?mode, "opened remote file");
        Ok(Box::new(SshFileWriter {
            channel,
            path: path.to_string(),
        }))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        if self.handle.is_closed() {
            return Ok(());
        }
        self.handle
            .disconnect(Disconnect::ByApplication, "", "English")
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        info!(host = %self.target.host, principal = %self.principal, "SSH disconnected");
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "ssh"
    }
}

/// Remote file fed through `cat` on its own channel
struct SshFileWriter {
    channel: Channel<Msg>,
    path: String,
}

#[async_trait]
impl RemoteWrite for SshFileWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.channel
            .data(data)
            .await
            .map_err(|e| ExecError::IoError(format!("{}: {e}", self.path)))
    }

    async fn flush(&mut self) -> Result<(), ExecError> {
        // channel data is sent as it is written
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> Result<(), ExecError> {
        self.channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(format!("{}: {e}", self.path)))?;

        let mut stderr = Vec::new();
        let mut status = None;
        while let Some(msg) = self.channel.wait().await {
            match msg {
                ChannelMsg::ExtendedData { data, ext: 1 } => stderr.extend_from_slice(&data),
                ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status.cast_signed()),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        match status {
            Some(0) => Ok(()),
            Some(status) => Err(ExecError::CommandFailed {
                status,
                stderr: String::from_utf8_lossy(&stderr).to_string(),
            }),
            None => {
                warn!(path = %self.path, "remote writer closed without exit status");
                Ok(())
            }
        }
    }
}

/// Opens russh sessions for a host's two principals
#[derive(Debug, Clone)]
pub struct SshConnector {
    operator: Credentials,
    privileged: Credentials,
    keepalive: Duration,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Create a connector with operator and privileged credentials
    pub fn new(operator: Credentials, privileged: Credentials) -> Self {
        Self {
            operator,
            privileged,
            keepalive: DEFAULT_KEEPALIVE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the transport keep-alive interval
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    /// Set the connect timeout
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    fn credentials(&self, principal: Principal) -> &Credentials {
        match principal {
            Principal::Operator => &self.operator,
            Principal::Privileged => &self.privileged,
        }
    }
}

async fn authenticate(
    session: &mut client::Handle<SshClientHandler>,
    creds: &Credentials,
) -> Result<(), ExecError> {
    let auth_res = match &creds.auth {
        Auth::Password(password) => session
            .authenticate_password(&creds.user, password)
            .await
            .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?,
        Auth::Key(source) => {
            let key = source
                .resolve()
                .map_err(|e| ExecError::SshKeyError(e.to_string()))?;
            let key_pair = load_secret_key(key.path(), None)
                .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

            let hash_alg = session
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            session
                .authenticate_publickey(
                    &creds.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?
        }
    };

    if !auth_res.success() {
        return Err(ExecError::AuthenticationFailed(format!(
            "server rejected credentials for {}",
            creds.user
        )));
    }

    Ok(())
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self), fields(host = %target.host))]
    async fn connect(
        &self,
        target: &Target,
        principal: Principal,
    ) -> Result<Arc<dyn Session>, ExecError> {
        let creds = self.credentials(principal);

        info!(
            host = %target.host,
            port = target.port,
            user = %creds.user,
            %principal,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config {
            keepalive_interval: Some(self.keepalive),
            ..client::Config::default()
        });

        // key exchange and authentication count against the same bound as TCP connect
        let handshake = async {
            let mut handle =
                client::connect(config, (&target.host[..], target.port), SshClientHandler)
                    .await
                    .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;
            authenticate(&mut handle, creds).await?;
            Ok::<_, ExecError>(handle)
        };

        let handle = timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!(
                    "handshake timed out after {:?}",
                    self.connect_timeout
                ))
            })??;

        if handle.is_closed() {
            return Err(ExecError::Inactive);
        }

        info!(host = %target.host, %principal, "SSH connected and authenticated");

        Ok(Arc::new(SshSession {
            target: target.clone(),
            principal,
            handle,
        }))
    }
}
