//! Bounded-time drain of every session, then a port sweep as a backstop

use gpuhost_session::{SessionRegistry, SessionTeardown};
use gpuhost_tunnel::{PortRange, TunnelManager};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// What happened during a shutdown
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    pub cleaned: Vec<String>,
    pub abandoned: Vec<String>,
    pub swept_ports: Vec<u16>,
    pub deadline_exceeded: bool,
    pub elapsed_millis: u64,
}

enum CleanupOutcome {
    Cleaned(String),
    Abandoned(String),
}

pub struct ShutdownCoordinator {
    registry: Arc<SessionRegistry>,
    teardown: Arc<dyn SessionTeardown>,
    tunnels: Arc<TunnelManager>,
    range: PortRange,
    pool_size: usize,
    task_timeout: Duration,
    deadline: Duration,
}

impl ShutdownCoordinator {
    pub fn new(
        registry: Arc<SessionRegistry>,
        teardown: Arc<dyn SessionTeardown>,
        tunnels: Arc<TunnelManager>,
        range: PortRange,
    ) -> Self {
        Self {
            registry,
            teardown,
            tunnels,
            range,
            pool_size: 5,
            task_timeout: Duration::from_secs(5),
            deadline: Duration::from_secs(30),
        }
    }

    /// At most `size` sessions are cleaned at once
    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size.max(1);
        self
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = timeout;
        self
    }

    /// Overall bound; once passed, stragglers are left behind
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub async fn shutdown(&self) -> ShutdownReport {
        let started = Instant::now();
        let mut report = ShutdownReport::default();

        let sessions: Vec<_> = self
            .registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.take(id))
            .collect();
        info!(
            sessions = sessions.len(),
            pool_size = self.pool_size,
            task_timeout = ?self.task_timeout,
            "Shutting down sessions"
        );

        let semaphore = Arc::new(Semaphore::new(self.pool_size));
        let mut tasks = JoinSet::new();
        for session in sessions {
            let semaphore = semaphore.clone();
            let teardown = self.teardown.clone();
            let task_timeout = self.task_timeout;
            tasks.spawn(async move {
                let id = session.id().to_string();
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return CleanupOutcome::Abandoned(id),
                };
                match tokio::time::timeout(task_timeout, teardown.teardown(session)).await {
                    Ok(()) => CleanupOutcome::Cleaned(id),
                    Err(_) => CleanupOutcome::Abandoned(id),
                }
            });
        }

        let drain = async {
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(CleanupOutcome::Cleaned(id)) => report.cleaned.push(id),
                    Ok(CleanupOutcome::Abandoned(id)) => {
                        warn!(session_id = %id, timeout = ?self.task_timeout, "Session cleanup abandoned");
                        report.abandoned.push(id);
                    }
                    Err(e) => error!("Session cleanup task failed: {}", e),
                }
            }
        };

        if tokio::time::timeout(self.deadline, drain).await.is_err() {
            report.deadline_exceeded = true;
            warn!(deadline = ?self.deadline, "Shutdown deadline passed, abandoning remaining cleanups");
            tasks.abort_all();
        } else {
            let left = self.deadline.saturating_sub(started.elapsed());
            match tokio::time::timeout(left, self.tunnels.sweep_range(self.range)).await {
                Ok(ports) => report.swept_ports = ports,
                Err(_) => {
                    report.deadline_exceeded = true;
                    warn!("Shutdown deadline passed during port sweep");
                }
            }
        }

        report.elapsed_millis = started.elapsed().as_millis() as u64;
        info!(
            cleaned = report.cleaned.len(),
            abandoned = report.abandoned.len(),
            swept = report.swept_ports.len(),
            elapsed_ms = report.elapsed_millis,
            "Shutdown complete"
        );
        report
    }
}
