//! Local command execution using `tokio::process`

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::mode::{ExecMode, Principal, WriteMode};
use crate::result::{CommandResult, Execution, Target};
use crate::traits::{Connector, RemoteWrite, Session};

/// Local command session
///
/// Executes commands on the local machine through `sh -c`. Both principals
/// run as the current user.
#[derive(Debug)]
pub struct LocalSession {
    active: AtomicBool,
}

impl LocalSession {
    /// Create a new local session
    #[must_use]
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    fn shell(cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }

    fn spawn_piped(cmd: &str) -> Result<Child, ExecError> {
        Self::shell(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))
    }

    /// Run to output EOF and optionally to exit
    async fn run_to_completion(
        &self,
        cmd: &str,
        wait_for_status: bool,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();
        let mut child = Self::spawn_piped(cmd)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::IoError("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::IoError("stderr not captured".to_string()))?;

        let streams = drain_streams(stdout, stderr).await?;

        let status = if wait_for_status {
            let exit = child
                .wait()
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            Some(exit.code().unwrap_or(-1))
        } else {
            None
        };

        let result = streams.into_result(status, start.elapsed());

        debug!(
            command = %cmd,
            status = ?result.status,
            duration = ?result.duration,
            "command completed"
        );

        Ok(result)
    }
}

impl Default for LocalSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Bytes read from a child's stdout and stderr
#[derive(Debug, Default)]
pub(crate) struct Streams {
    pub(crate) stdout: Vec<u8>,
    pub(crate) stderr: Vec<u8>,
    pub(crate) output: Vec<u8>,
}

impl Streams {
    pub(crate) fn push_stdout(&mut self, data: &[u8]) {
        self.stdout.extend_from_slice(data);
        self.output.extend_from_slice(data);
    }

    pub(crate) fn push_stderr(&mut self, data: &[u8]) {
        self.stderr.extend_from_slice(data);
        self.output.extend_from_slice(data);
    }

    pub(crate) fn into_result(self, status: Option<i32>, duration: Duration) -> CommandResult {
        CommandResult {
            status,
            stdout: String::from_utf8_lossy(&self.stdout).to_string(),
            stderr: String::from_utf8_lossy(&self.stderr).to_string(),
            output: String::from_utf8_lossy(&self.output).to_string(),
            duration,
        }
    }
}

/// Read both streams until EOF, recording chunks in arrival order
async fn drain_streams<O, E>(mut stdout: O, mut stderr: E) -> Result<Streams, ExecError>
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut streams = Streams::default();
    let mut out_buf = [0u8; 8192];
    let mut err_buf = [0u8; 8192];
    let mut out_done = false;
    let mut err_done = false;

    while !(out_done && err_done) {
        tokio::select! {
            n = stdout.read(&mut out_buf), if !out_done => {
                let n = n.map_err(|e| ExecError::IoError(e.to_string()))?;
                if n == 0 {
                    out_done = true;
                } else {
                    streams.push_stdout(&out_buf[..n]);
                }
            }
            n = stderr.read(&mut err_buf), if !err_done => {
                let n = n.map_err(|e| ExecError::IoError(e.to_string()))?;
                if n == 0 {
                    err_done = true;
                } else {
                    streams.push_stderr(&err_buf[..n]);
                }
            }
        }
    }

    Ok(streams)
}

#[async_trait]
impl Session for LocalSession {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[instrument(skip(self), level = "debug")]
    async fn exec(&self, cmd: &str, mode: ExecMode) -> Result<Execution, ExecError> {
        if !self.is_active() {
            return Err(ExecError::NotConnected);
        }

        debug!(command = %cmd, mode = ?mode, "executing local command");

        let (limit, wait_for_status) = match mode {
            ExecMode::FireAndForget => {
                Self::shell(cmd)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(|e| ExecError::SpawnError(e.to_string()))?;
                return Ok(Execution::Dispatched);
            }
            ExecMode::Synchronous {
                timeout,
                check_exit_code,
            } => (timeout, check_exit_code),
            ExecMode::Streaming { ceiling } => (ceiling, true),
        };

        match timeout(limit, self.run_to_completion(cmd, wait_for_status)).await {
            Ok(result) => result.map(Execution::Completed),
            Err(_) => {
                error!(command = %cmd, timeout = ?limit, "command timed out");
                Err(ExecError::Timeout { timeout: limit })
            }
        }
    }

    async fn open_writer(
        &self,
        path: &str,
        mode: WriteMode,
    ) -> Result<Box<dyn RemoteWrite>, ExecError> {
        let mut options = tokio::fs::OpenOptions::new();
        options.create(true);
        match mode {
            WriteMode::Truncate => options.write(true).truncate(true),
            WriteMode::Append => options.append(true),
        };
        let file = options
            .open(path)
            .await
            .map_err(|e| ExecError::IoError(format!("{path}: {e}")))?;
        Ok(Box::new(LocalFileWriter { file }))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn session_type(&self) -> &'static str {
        "local"
    }
}

struct LocalFileWriter {
    file: tokio::fs::File,
}

#[async_trait]
impl RemoteWrite for LocalFileWriter {
    async fn write_all(&mut self, data: &[u8]) -> Result<(), ExecError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn flush(&mut self) -> Result<(), ExecError> {
        self.file
            .flush()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn close(mut self: Box<Self>) -> Result<(), ExecError> {
        self.flush().await?;
        self.file
            .sync_all()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }
}

/// Connector producing [`LocalSession`]s
#[derive(Debug, Clone, Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        target: &Target,
        principal: Principal,
    ) -> Result<Arc<dyn Session>, ExecError> {
        debug!(host = %target.host, %principal, "opening local session");
        Ok(Arc::new(LocalSession::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(cmd: &str, mode: ExecMode) -> Result<CommandResult, ExecError> {
        let session = LocalSession::new();
        session
            .exec(cmd, mode)
            .await
            .map(|e| e.completed().expect("completed"))
    }

    #[tokio::test]
    async fn test_run_success() {
        let result = run("echo hello", ExecMode::default()).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let result = run("echo nope >&2; exit 42", ExecMode::default())
            .await
            .unwrap();

        assert!(!result.success());
        assert_eq!(result.status, Some(42));
        assert_eq!(result.stderr.trim(), "nope");
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let result = run("sleep 5", ExecMode::synchronous(Duration::from_millis(100))).await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_unchecked_exit_code() {
        let mode = ExecMode::Synchronous {
            timeout: Duration::from_secs(5),
            check_exit_code: false,
        };
        let result = run("echo hi; exit 3", mode).await.unwrap();

        assert_eq!(result.status, None);
        assert_eq!(result.stdout.trim(), "hi");
    }

    #[tokio::test]
    async fn test_streaming_collects_both_streams() {
        let cmd = "for i in 1 2 3; do echo out$i; echo err$i >&2; sleep 0.05; done; exit 7";
        let result = run(cmd, ExecMode::streaming()).await.unwrap();

        assert_eq!(result.status, Some(7));
        assert_eq!(result.stdout, "out1\nout2\nout3\n");
        assert_eq!(result.stderr, "err1\nerr2\nerr3\n");
        assert_eq!(
            result.output.len(),
            result.stdout.len() + result.stderr.len()
        );
        for line in ["out1", "out2", "out3", "err1", "err2", "err3"] {
            assert_eq!(result.output.matches(line).count(), 1);
        }
    }

    #[tokio::test]
    async fn test_fire_and_forget() {
        let session = LocalSession::new();
        let execution = session
            .exec("sleep 1", ExecMode::FireAndForget)
            .await
            .unwrap();

        assert_eq!(execution, Execution::Dispatched);
    }

    #[tokio::test]
    async fn test_disconnected_session_rejects_commands() {
        let session = LocalSession::new();
        session.disconnect().await.unwrap();

        assert!(!session.is_active());
        assert!(matches!(
            session.exec("true", ExecMode::default()).await,
            Err(ExecError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_writer_append() {
        let path = std::env::temp_dir().join(format!("fleetrun_local_writer_{}", std::process::id()));
        let path_str = path.to_str().unwrap();
        let session = LocalSession::new();

        let mut writer = session
            .open_writer(path_str, WriteMode::Truncate)
            .await
            .unwrap();
        writer.write_all(b"first\n").await.unwrap();
        writer.close().await.unwrap();

        let mut writer = session
            .open_writer(path_str, WriteMode::Append)
            .await
            .unwrap();
        writer.write_all(b"second\n").await.unwrap();
        writer.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
        std::fs::remove_file(&path).unwrap();
    }
}
