//! Spawning and terminating forwarding processes

use async_trait::async_trait;
use gpuhost_remote::{forward_stderr, Credentials, HostTarget, SshCommand};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// What to forward: `localhost:local_port` to `remote_host:remote_port` as seen from the SSH host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelSpec {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl TunnelSpec {
    pub fn new(local_port: u16, remote_host: impl Into<String>, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    pub fn remote(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "localhost:{} -> {}", self.local_port, self.remote())
    }
}

/// How a forwarding process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Graceful,
    Killed,
    AlreadyExited,
}

/// A running forwarding process owned by exactly one tunnel handle
#[async_trait]
pub trait TunnelProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Whether the process is still running
    fn is_alive(&mut self) -> bool;

    /// Ask the process to exit, wait up to `grace`, then force-kill
    async fn terminate(&mut self, grace: Duration) -> Result<Termination, TunnelError>;
}

#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    async fn launch(
        &self,
        spec: &TunnelSpec,
        via: &HostTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError>;
}

/// Launches `ssh -N -L` children
#[derive(Debug, Clone)]
pub struct SshTunnelLauncher {
    ssh_program: String,
    settle: Duration,
    keepalive: Duration,
}

impl Default for SshTunnelLauncher {
    fn default() -> Self {
        Self {
            ssh_program: "ssh".to_string(),
            settle: Duration::from_millis(1500),
            keepalive: Duration::from_secs(30),
        }
    }
}

impl SshTunnelLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.ssh_program = program.into();
        self
    }

    /// How long the child must stay up before the tunnel counts as established
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }

    fn command(&self, spec: &TunnelSpec, via: &HostTarget, credentials: &Credentials) -> Command {
        SshCommand::new(via, credentials)
            .program(&self.ssh_program)
            .flag("-N")
            .option("ExitOnForwardFailure", "yes")
            .option("ServerAliveInterval", self.keepalive.as_secs().max(1).to_string())
            .option("ServerAliveCountMax", "3")
            .local_forward(spec.local_port, &spec.remote_host, spec.remote_port)
            .into_command()
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn launch(
        &self,
        spec: &TunnelSpec,
        via: &HostTarget,
        credentials: &Credentials,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        debug!(tunnel = %spec, host = %via, "Spawning forwarding process");
        let mut child = self
            .command(spec, via, credentials)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: self.ssh_program.clone(),
                source,
            })?;

        match tokio::time::timeout(self.settle, child.wait()).await {
            Ok(Ok(status)) => {
                let stderr = drain_stderr(&mut child).await;
                let diagnostic = if stderr.is_empty() {
                    format!("forwarding process exited with {}", status)
                } else {
                    format!("forwarding process exited with {}: {}", status, stderr)
                };
                Err(TunnelError::LaunchFailed {
                    local_port: spec.local_port,
                    remote: spec.remote(),
                    diagnostic,
                })
            }
            Ok(Err(e)) => Err(TunnelError::Io(e)),
            Err(_) => {
                info!(tunnel = %spec, pid = ?child.id(), "Tunnel established");
                forward_stderr(child.stderr.take(), format!("tunnel {}", spec));
                Ok(Box::new(ChildTunnel::new(child)))
            }
        }
    }
}

async fn drain_stderr(child: &mut Child) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = child.stderr.take() {
        if let Err(e) = stderr.read_to_string(&mut text).await {
            debug!("Failed to read tunnel stderr: {}", e);
        }
    }
    text.trim().to_string()
}

/// Forwarding process backed by a local child
pub struct ChildTunnel {
    child: Child,
}

impl ChildTunnel {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl TunnelProcess for ChildTunnel {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    async fn terminate(&mut self, grace: Duration) -> Result<Termination, TunnelError> {
        if !self.is_alive() {
            return Ok(Termination::AlreadyExited);
        }

        if let Some(pid) = self.child.id() {
            let signalled = Command::new("kill")
                .args(["-TERM", &pid.to_string()])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status()
                .await;
            if let Err(e) = signalled {
                warn!(pid, "Failed to signal forwarding process: {}", e);
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(_)) => Ok(Termination::Graceful),
            Ok(Err(e)) => Err(TunnelError::Io(e)),
            Err(_) => {
                warn!(pid = ?self.child.id(), "Forwarding process ignored SIGTERM, killing");
                self.child.kill().await?;
                Ok(Termination::Killed)
            }
        }
    }
}
