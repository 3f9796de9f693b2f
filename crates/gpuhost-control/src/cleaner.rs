//! Per-session teardown, shared by removal, expiry and shutdown

use async_trait::async_trait;
use gpuhost_remote::WorkloadController;
use gpuhost_session::{Session, SessionTeardown};
use gpuhost_tunnel::TunnelManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Releases a session's resources in reverse order of acquisition.
///
/// Every step is best-effort and logs on failure. The forwarding is taken out
/// of the session before the first await, so even an abandoned teardown drops
/// the port claim and the tunnel child (which is killed on drop).
pub struct SessionCleaner {
    workloads: WorkloadController,
    tunnels: Arc<TunnelManager>,
    shell_grace: Duration,
    stop_workload: bool,
}

impl SessionCleaner {
    pub fn new(workloads: WorkloadController, tunnels: Arc<TunnelManager>) -> Self {
        Self {
            workloads,
            tunnels,
            shell_grace: Duration::from_secs(1),
            stop_workload: true,
        }
    }

    pub fn with_stop_workload(mut self, stop: bool) -> Self {
        self.stop_workload = stop;
        self
    }

    pub fn with_shell_grace(mut self, grace: Duration) -> Self {
        self.shell_grace = grace;
        self
    }

    /// Tunnel down, then the port claim goes with the forwarding record
    pub async fn release_forwarding(&self, session: &Session) -> bool {
        match session.take_forwarding() {
            Some(forwarding) => {
                let port = forwarding.local_port();
                self.tunnels.teardown(forwarding.tunnel).await;
                drop(forwarding.claim);
                info!(session_id = %session.id(), local_port = port, "Forwarding released");
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl SessionTeardown for SessionCleaner {
    async fn teardown(&self, session: Arc<Session>) {
        let id = session.id().to_string();
        let forwarding = session.take_forwarding();
        info!(session_id = %id, "Tearing down session");

        if let Some(shell) = session.take_shell().await {
            shell.close(self.shell_grace).await;
            debug!(session_id = %id, "Shell closed");
        }

        if let Some(forwarding) = forwarding {
            let port = forwarding.local_port();
            self.tunnels.teardown(forwarding.tunnel).await;
            drop(forwarding.claim);
            debug!(session_id = %id, local_port = port, "Port released");
        }

        if self.stop_workload {
            if let Some(workload) = session.workload() {
                if let Err(e) = self.workloads.stop(session.control(), &workload).await {
                    warn!(session_id = %id, workload = %workload, "Failed to stop workload: {}", e);
                }
            }
        }

        if let Err(e) = session.control().close().await {
            warn!(session_id = %id, "Failed to close control connection: {}", e);
        }
        info!(session_id = %id, "Session torn down");
    }
}
