//! Control connection to the remote host
//!
//! [`RemoteExecutor`] opens a [`ControlConnection`]; the connection runs command
//! strings with a bounded timeout and keeps the transport alive. The OpenSSH
//! implementation starts one ControlMaster process per connection and runs every
//! command as a multiplexed client over its socket, so commands share one
//! authenticated transport and a hung command can be killed on its own.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RemoteError;
use crate::shell::ShellChannel;
use crate::ssh::{forward_stderr, shell_quote, SshCommand};
use crate::target::{Credentials, HostTarget};

/// ssh exits with 255 when the transport, not the remote command, failed
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Result of one remote command: success flag and the text worth showing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    /// stdout on success; stderr (or stdout when stderr is empty) on failure
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }

    /// Turn a non-zero exit into [`RemoteError::CommandFailed`]
    pub fn into_result(self, command: &str) -> Result<String, RemoteError> {
        if self.success {
            Ok(self.output)
        } else {
            Err(RemoteError::CommandFailed {
                command: command.to_string(),
                output: self.output,
            })
        }
    }
}

/// Opens control connections
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn connect(
        &self,
        target: &HostTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn ControlConnection>, RemoteError>;
}

/// An authenticated channel for running commands on the host
#[async_trait]
pub trait ControlConnection: Send + Sync {
    fn target(&self) -> &HostTarget;

    /// Run `command`, feeding `input` (plus a newline) to its stdin when given.
    ///
    /// A non-zero exit is reported through [`CommandOutput::success`]; `Err` is
    /// reserved for transport failures and the timeout.
    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        input: Option<&str>,
    ) -> Result<CommandOutput, RemoteError>;

    /// Open an interactive PTY shell, optionally running `command` in it
    async fn open_shell(&self, command: Option<&str>) -> Result<ShellChannel, RemoteError>;

    /// Close the transport. Safe to call more than once.
    async fn close(&self) -> Result<(), RemoteError>;
}

/// Settings for [`OpenSshExecutor`]
#[derive(Debug, Clone)]
pub struct OpenSshConfig {
    pub ssh_program: String,
    pub connect_timeout: Duration,
    pub keepalive_interval: Duration,
    /// Directory for ControlMaster sockets; keep the path short (unix socket limit)
    pub control_dir: PathBuf,
    /// Wrap commands in `bash -lc` so the login PATH is loaded
    pub login_shell: bool,
}

impl Default for OpenSshConfig {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            connect_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(15),
            control_dir: std::env::temp_dir(),
            login_shell: true,
        }
    }
}

/// [`RemoteExecutor`] backed by the system OpenSSH client
#[derive(Debug, Clone, Default)]
pub struct OpenSshExecutor {
    config: OpenSshConfig,
}

impl OpenSshExecutor {
    pub fn new(config: OpenSshConfig) -> Self {
        Self { config }
    }

    fn master_command(
        &self,
        target: &HostTarget,
        credentials: &Credentials,
        socket: &Path,
    ) -> SshCommand {
        SshCommand::new(target, credentials)
            .program(self.config.ssh_program.clone())
            .flag("-N")
            .option("ControlMaster", "yes")
            .option("ControlPath", socket.display().to_string())
            .option("ControlPersist", "no")
            .option(
                "ServerAliveInterval",
                self.config.keepalive_interval.as_secs().max(1).to_string(),
            )
            .option("ServerAliveCountMax", "3")
            .option(
                "ConnectTimeout",
                self.config.connect_timeout.as_secs().max(1).to_string(),
            )
    }

    async fn master_ready(&self, target: &HostTarget, socket: &Path) -> bool {
        if !socket.exists() {
            return false;
        }
        let mut check = SshCommand::multiplexed(target, socket)
            .program(self.config.ssh_program.clone())
            .flag("-O")
            .flag("check")
            .into_command();
        check.stderr(Stdio::null());
        matches!(check.status().await, Ok(status) if status.success())
    }
}

#[async_trait]
impl RemoteExecutor for OpenSshExecutor {
    async fn connect(
        &self,
        target: &HostTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn ControlConnection>, RemoteError> {
        let socket = self
            .config
            .control_dir
            .join(format!("gpuhost-{}.sock", Uuid::new_v4().simple()));

        info!(host = %target, "Opening control connection");

        let (program, _) = self.master_command(target, credentials, &socket).argv();
        let mut master = self
            .master_command(target, credentials, &socket)
            .into_command()
            .spawn()
            .map_err(|source| RemoteError::Spawn { program, source })?;

        // Grace on top of ssh's own ConnectTimeout for the auth exchange.
        let deadline = tokio::time::Instant::now() + self.config.connect_timeout * 2;
        loop {
            if let Some(status) = master.try_wait()? {
                let reason = read_stderr(master.stderr.take()).await;
                warn!(host = %target, ?status, "Control connection failed: {}", reason.trim());
                return Err(classify_connect_failure(target, reason));
            }

            if self.master_ready(target, &socket).await {
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                let _ = master.kill().await;
                return Err(RemoteError::ConnectionFailed {
                    target: target.to_string(),
                    reason: format!(
                        "no control socket after {:?}",
                        self.config.connect_timeout * 2
                    ),
                });
            }

            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        info!(host = %target, socket = %socket.display(), "Control connection established");
        forward_stderr(master.stderr.take(), format!("control master {}", target));

        Ok(Box::new(OpenSshConnection {
            target: target.clone(),
            socket,
            ssh_program: self.config.ssh_program.clone(),
            login_shell: self.config.login_shell,
            master: Mutex::new(Some(master)),
        }))
    }
}

/// One ControlMaster process and the socket its clients use
pub struct OpenSshConnection {
    target: HostTarget,
    socket: PathBuf,
    ssh_program: String,
    login_shell: bool,
    master: Mutex<Option<Child>>,
}

impl OpenSshConnection {
    fn client(&self) -> SshCommand {
        SshCommand::multiplexed(&self.target, &self.socket).program(self.ssh_program.clone())
    }

    fn wrap(&self, command: &str) -> String {
        if self.login_shell {
            format!("bash -lc {}", shell_quote(command))
        } else {
            command.to_string()
        }
    }
}

#[async_trait]
impl ControlConnection for OpenSshConnection {
    fn target(&self) -> &HostTarget {
        &self.target
    }

    async fn execute(
        &self,
        command: &str,
        timeout: Duration,
        input: Option<&str>,
    ) -> Result<CommandOutput, RemoteError> {
        if self.master.lock().await.is_none() {
            return Err(RemoteError::ConnectionFailed {
                target: self.target.to_string(),
                reason: "control connection closed".to_string(),
            });
        }

        debug!(host = %self.target, command = %command, "Executing remote command");

        let mut cmd = self.client().flag("-T").remote_command(self.wrap(command)).into_command();
        cmd.stdout(Stdio::piped());
        if input.is_some() {
            cmd.stdin(Stdio::piped());
        }

        let mut child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            program: self.ssh_program.clone(),
            source,
        })?;

        if let Some(text) = input {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(format!("{}\n", text).as_bytes()).await?;
                stdin.flush().await?;
            }
        }

        // Dropping the future on timeout drops the child, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(host = %self.target, command = %command, ?timeout, "Remote command timed out");
                return Err(RemoteError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.code() == Some(SSH_TRANSPORT_FAILURE) {
            return Err(RemoteError::ConnectionFailed {
                target: self.target.to_string(),
                reason: stderr.trim().to_string(),
            });
        }

        if output.status.success() {
            Ok(CommandOutput::ok(stdout))
        } else if stderr.trim().is_empty() {
            Ok(CommandOutput::failed(stdout))
        } else {
            Ok(CommandOutput::failed(stderr))
        }
    }

    async fn open_shell(&self, command: Option<&str>) -> Result<ShellChannel, RemoteError> {
        let mut ssh = self.client().flag("-tt");
        if let Some(command) = command {
            ssh = ssh.remote_command(command.to_string());
        }
        let mut cmd = ssh.into_command();
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped());

        let child = cmd.spawn().map_err(|source| RemoteError::Spawn {
            program: self.ssh_program.clone(),
            source,
        })?;
        info!(host = %self.target, "Opened interactive shell");
        ShellChannel::from_child(child)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        let Some(mut master) = self.master.lock().await.take() else {
            return Ok(());
        };

        let mut exit = self.client().flag("-O").flag("exit").into_command();
        exit.stderr(Stdio::null());
        match tokio::time::timeout(Duration::from_secs(3), exit.status()).await {
            Ok(Ok(status)) if status.success() => {}
            _ => debug!(host = %self.target, "Control master did not accept exit request"),
        }

        if tokio::time::timeout(Duration::from_secs(2), master.wait())
            .await
            .is_err()
        {
            master.kill().await?;
        }

        if self.socket.exists() {
            let _ = tokio::fs::remove_file(&self.socket).await;
        }

        info!(host = %self.target, "Control connection closed");
        Ok(())
    }
}

impl Drop for OpenSshConnection {
    fn drop(&mut self) {
        // Unclosed: the master is killed on drop, its socket file is not removed by ssh
        if self.master.get_mut().is_some() {
            let _ = std::fs::remove_file(&self.socket);
        }
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = stderr {
        let _ = stderr.read_to_string(&mut text).await;
    }
    text
}

fn classify_connect_failure(target: &HostTarget, reason: String) -> RemoteError {
    let lowered = reason.to_lowercase();
    let reason = reason.trim().to_string();
    if lowered.contains("permission denied") || lowered.contains("authentication failed") {
        RemoteError::AuthenticationFailed {
            target: target.to_string(),
            reason,
        }
    } else {
        RemoteError::ConnectionFailed {
            target: target.to_string(),
            reason,
        }
    }
}
