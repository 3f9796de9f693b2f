//! Tunnel lifecycle: pre-empt the local port, launch, tear down

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use gpuhost_remote::{Credentials, HostTarget};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::TunnelError;
use crate::launcher::{SshTunnelLauncher, Termination, TunnelLauncher, TunnelProcess, TunnelSpec};
use crate::port::PortRange;
use crate::reclaim::{LsofReclaimer, PortReclaimer};

/// Concurrent lsof invocations during a range sweep
const SWEEP_CONCURRENCY: usize = 16;

/// Owned handle to one live forwarding process
pub struct TunnelHandle {
    spec: TunnelSpec,
    process: Box<dyn TunnelProcess>,
    established_at: DateTime<Utc>,
}

impl TunnelHandle {
    pub fn new(spec: TunnelSpec, process: Box<dyn TunnelProcess>) -> Self {
        Self {
            spec,
            process,
            established_at: Utc::now(),
        }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    pub fn local_port(&self) -> u16 {
        self.spec.local_port
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    pub fn is_alive(&mut self) -> bool {
        self.process.is_alive()
    }
}

impl std::fmt::Debug for TunnelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelHandle")
            .field("spec", &self.spec)
            .field("pid", &self.process.pid())
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// One occupied port in a range report
#[derive(Debug, Clone, Serialize)]
pub struct PortUsage {
    pub port: u16,
    pub holders: String,
}

pub struct TunnelManager {
    reclaimer: Arc<dyn PortReclaimer>,
    launcher: Arc<dyn TunnelLauncher>,
    terminate_grace: Duration,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new(Arc::new(LsofReclaimer::new()), Arc::new(SshTunnelLauncher::new()))
    }
}

impl TunnelManager {
    pub fn new(reclaimer: Arc<dyn PortReclaimer>, launcher: Arc<dyn TunnelLauncher>) -> Self {
        Self {
            reclaimer,
            launcher,
            terminate_grace: Duration::from_secs(2),
        }
    }

    /// Time a forwarding process gets to exit after SIGTERM
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    pub fn reclaimer(&self) -> &Arc<dyn PortReclaimer> {
        &self.reclaimer
    }

    /// Forward `localhost:local_port` to `remote_host:remote_port` through `via`.
    ///
    /// Whatever already holds the local port is killed first; the port may have
    /// been grabbed between allocation and now.
    pub async fn establish(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
        via: &HostTarget,
        credentials: &Credentials,
    ) -> Result<TunnelHandle, TunnelError> {
        let spec = TunnelSpec::new(local_port, remote_host, remote_port);

        match self.reclaimer.release(local_port).await {
            Ok(killed) if !killed.is_empty() => {
                warn!(port = local_port, pids = ?killed, "Pre-empted stale holders of local port");
            }
            Ok(_) => {}
            Err(e) => warn!(port = local_port, "Could not check local port holders: {}", e),
        }

        let process = self.launcher.launch(&spec, via, credentials).await?;
        Ok(TunnelHandle::new(spec, process))
    }

    /// Stop the forwarding process and free its local port. Never fails.
    pub async fn teardown(&self, mut handle: TunnelHandle) {
        let port = handle.local_port();
        match handle.process.terminate(self.terminate_grace).await {
            Ok(Termination::Graceful) => info!(port, "Tunnel terminated"),
            Ok(Termination::Killed) => warn!(port, "Tunnel force-killed after grace period"),
            Ok(Termination::AlreadyExited) => debug!(port, "Tunnel had already exited"),
            Err(e) => error!(port, "Failed to terminate tunnel: {}", e),
        }

        if let Err(e) = self.reclaimer.release(port).await {
            warn!(port, "Failed to release local port after teardown: {}", e);
        }
    }

    /// Kill every holder of every port in `range`; returns the ports that were freed
    pub async fn sweep_range(&self, range: PortRange) -> Vec<u16> {
        let freed = self.sweep_ports(range.iter().collect()).await;
        if !freed.is_empty() {
            info!(range = %range, ports = ?freed, "Swept local port range");
        }
        freed
    }

    /// Kill every holder of each of `ports`; returns the ports that were freed
    pub async fn sweep_ports(&self, ports: Vec<u16>) -> Vec<u16> {
        self.sweep_ports_unless(ports, |_| false).await
    }

    /// Like [`sweep_ports`](Self::sweep_ports), but a port is left alone when
    /// `keep` returns true for it just before its holders would be killed
    pub async fn sweep_ports_unless<F>(&self, ports: Vec<u16>, keep: F) -> Vec<u16>
    where
        F: Fn(u16) -> bool + Send + Sync,
    {
        let reclaimer = self.reclaimer.clone();
        let keep = &keep;
        let mut freed: Vec<u16> = stream::iter(ports)
            .map(|port| {
                let reclaimer = reclaimer.clone();
                async move {
                    if keep(port) {
                        debug!(port, "Port is in use by a live forwarding, skipping");
                        return None;
                    }
                    match reclaimer.release(port).await {
                        Ok(killed) if !killed.is_empty() => Some(port),
                        Ok(_) => None,
                        Err(e) => {
                            warn!(port, "Sweep failed on port: {}", e);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter_map(|port| async move { port })
            .collect()
            .await;
        freed.sort_unstable();
        freed
    }

    /// Occupied ports in `range` with a description of their holders
    pub async fn report(&self, range: PortRange) -> Vec<PortUsage> {
        let reclaimer = self.reclaimer.clone();
        let mut usage: Vec<PortUsage> = stream::iter(range.iter())
            .map(|port| {
                let reclaimer = reclaimer.clone();
                async move {
                    match reclaimer.describe(port).await {
                        Ok(Some(holders)) => Some(PortUsage { port, holders }),
                        Ok(None) => None,
                        Err(e) => {
                            debug!(port, "Could not describe port: {}", e);
                            None
                        }
                    }
                }
            })
            .buffer_unordered(SWEEP_CONCURRENCY)
            .filter_map(|usage| async move { usage })
            .collect()
            .await;
        usage.sort_by_key(|u| u.port);
        usage
    }
}
