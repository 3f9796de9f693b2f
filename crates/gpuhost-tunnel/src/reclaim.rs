//! Forcible release of local ports held by other processes

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// Finds and evicts whatever is listening on a local port
#[async_trait]
pub trait PortReclaimer: Send + Sync {
    /// Process ids listening on `port`; clients connected to it are not holders
    async fn holders(&self, port: u16) -> Result<Vec<u32>, TunnelError>;

    /// Human readable listing of the holders, `None` when the port is unused
    async fn describe(&self, port: u16) -> Result<Option<String>, TunnelError>;

    /// Kill every holder of `port`; returns the pids that were signalled
    async fn release(&self, port: u16) -> Result<Vec<u32>, TunnelError>;
}

/// `lsof` based reclaimer, signals holders with `kill -9`
#[derive(Debug, Clone)]
pub struct LsofReclaimer {
    lsof_program: String,
    timeout: Duration,
}

impl Default for LsofReclaimer {
    fn default() -> Self {
        Self {
            lsof_program: "lsof".to_string(),
            timeout: Duration::from_secs(3),
        }
    }
}

impl LsofReclaimer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.lsof_program = program.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, program: &str, args: &[String]) -> Result<(bool, String), TunnelError> {
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TunnelError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TunnelError::Timeout {
                program: program.to_string(),
                timeout: self.timeout,
            })??;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).into_owned(),
        ))
    }
}

#[async_trait]
impl PortReclaimer for LsofReclaimer {
    async fn holders(&self, port: u16) -> Result<Vec<u32>, TunnelError> {
        // lsof exits 1 when nothing matches, so only the output matters
        let (_, stdout) = self.run(&self.lsof_program, &listener_args(port)).await?;
        Ok(parse_pids(&stdout))
    }

    async fn describe(&self, port: u16) -> Result<Option<String>, TunnelError> {
        let (_, stdout) = self
            .run(
                &self.lsof_program,
                &[format!("-i:{}", port), "-P".to_string(), "-n".to_string()],
            )
            .await?;
        let listing = stdout.trim();
        Ok(if listing.is_empty() {
            None
        } else {
            Some(listing.to_string())
        })
    }

    async fn release(&self, port: u16) -> Result<Vec<u32>, TunnelError> {
        let own_pid = std::process::id();
        let pids: Vec<u32> = self
            .holders(port)
            .await?
            .into_iter()
            .filter(|pid| *pid != own_pid)
            .collect();

        let mut killed = Vec::with_capacity(pids.len());
        for pid in pids {
            match self
                .run("kill", &["-9".to_string(), pid.to_string()])
                .await
            {
                Ok((true, _)) => {
                    info!(port, pid, "Killed process holding local port");
                    killed.push(pid);
                }
                Ok((false, _)) => debug!(port, pid, "Holder already gone"),
                Err(e) => warn!(port, pid, "Failed to kill holder: {}", e),
            }
        }
        Ok(killed)
    }
}

/// `lsof` arguments selecting only the listening side of `port`
pub fn listener_args(port: u16) -> Vec<String> {
    vec![
        "-t".to_string(),
        format!("-iTCP:{}", port),
        "-sTCP:LISTEN".to_string(),
    ]
}

/// One pid per line; anything else is ignored
pub fn parse_pids(output: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}
