//! `GpuHost`: the operations offered to a front end, wired from one config

use gpuhost_discovery::EndpointDiscovery;
use gpuhost_remote::{
    Credentials, GpuInfo, OpenSshConfig, OpenSshExecutor, RemoteExecutor, WorkloadController,
    WorkloadInfo,
};
use gpuhost_session::{ForwardingInfo, SessionRegistry, SessionView};
use gpuhost_tunnel::{
    BindProbe, LsofReclaimer, PortAllocator, PortProbe, PortReclaimer, PortUsage,
    SshTunnelLauncher, TunnelLauncher, TunnelManager,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::cleaner::SessionCleaner;
use crate::config::GpuHostConfig;
use crate::error::GpuHostError;
use crate::lifecycle::{ForwardingRequest, LifecycleController};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};

/// Builds a [`GpuHost`]; every collaborator can be swapped, the rest come from the config
pub struct GpuHostBuilder {
    config: GpuHostConfig,
    executor: Option<Arc<dyn RemoteExecutor>>,
    reclaimer: Option<Arc<dyn PortReclaimer>>,
    launcher: Option<Arc<dyn TunnelLauncher>>,
    probe: Option<Arc<dyn PortProbe>>,
    discovery: Option<EndpointDiscovery>,
}

impl GpuHostBuilder {
    pub fn new(config: GpuHostConfig) -> Self {
        Self {
            config,
            executor: None,
            reclaimer: None,
            launcher: None,
            probe: None,
            discovery: None,
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_reclaimer(mut self, reclaimer: Arc<dyn PortReclaimer>) -> Self {
        self.reclaimer = Some(reclaimer);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn TunnelLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn PortProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_discovery(mut self, discovery: EndpointDiscovery) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn build(self) -> Result<GpuHost, GpuHostError> {
        let config = self.config;
        config.validate()?;

        let executor = self.executor.unwrap_or_else(|| {
            Arc::new(OpenSshExecutor::new(OpenSshConfig {
                ssh_program: config.ssh.program.clone(),
                connect_timeout: Duration::from_secs(config.ssh.connect_timeout_secs),
                keepalive_interval: Duration::from_secs(config.ssh.keepalive_interval_secs),
                ..OpenSshConfig::default()
            }))
        });
        let reclaimer = self
            .reclaimer
            .unwrap_or_else(|| Arc::new(LsofReclaimer::new()));
        let launcher = self.launcher.unwrap_or_else(|| {
            Arc::new(
                SshTunnelLauncher::new()
                    .with_program(config.ssh.program.clone())
                    .with_settle(config.tunnel_settle()),
            )
        });
        let probe = self.probe.unwrap_or_else(|| Arc::new(BindProbe));
        let discovery = self.discovery.unwrap_or_else(|| {
            EndpointDiscovery::default().with_retries(
                config.service.discovery_retries,
                config.service.retry_delay(),
            )
        });

        let range = config.ports.local_range;
        let tunnels = Arc::new(
            TunnelManager::new(reclaimer, launcher).with_terminate_grace(config.terminate_grace()),
        );
        let allocator = Arc::new(PortAllocator::with_probe(range, probe));
        let workloads = WorkloadController::new(config.workload.clone(), config.command_timeout());

        let cleaner = Arc::new(
            SessionCleaner::new(workloads.clone(), tunnels.clone())
                .with_stop_workload(config.sessions.stop_workload_on_teardown),
        );
        let registry = Arc::new(
            SessionRegistry::new(cleaner.clone())
                .with_cleanup_timeout(config.cleanup_timeout())
                .with_max_per_owner(config.sessions.max_per_owner),
        );

        let controller = LifecycleController::new(
            executor,
            config.target(""),
            registry.clone(),
            workloads,
            Arc::new(discovery),
            config.service.clone(),
            allocator.clone(),
            tunnels.clone(),
            cleaner.clone(),
        )
        .with_max_per_owner(config.sessions.max_per_owner);

        let coordinator = ShutdownCoordinator::new(registry.clone(), cleaner, tunnels.clone(), range)
            .with_pool_size(config.shutdown.pool_size)
            .with_task_timeout(config.shutdown_task_timeout())
            .with_deadline(config.shutdown_deadline());

        Ok(GpuHost {
            config,
            controller,
            registry,
            allocator,
            tunnels,
            coordinator,
            sweeper: Mutex::new(None),
            shutting_down: AtomicBool::new(false),
        })
    }
}

pub struct GpuHost {
    config: GpuHostConfig,
    controller: LifecycleController,
    registry: Arc<SessionRegistry>,
    allocator: Arc<PortAllocator>,
    tunnels: Arc<TunnelManager>,
    coordinator: ShutdownCoordinator,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl GpuHost {
    /// Host wired to the system `ssh` and `lsof`
    pub fn new(config: GpuHostConfig) -> Result<Self, GpuHostError> {
        GpuHostBuilder::new(config).build()
    }

    pub fn builder(config: GpuHostConfig) -> GpuHostBuilder {
        GpuHostBuilder::new(config)
    }

    pub fn config(&self) -> &GpuHostConfig {
        &self.config
    }

    fn ensure_running(&self) -> Result<(), GpuHostError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(GpuHostError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub async fn create_session(
        &self,
        owner: &str,
        credentials: Credentials,
    ) -> Result<String, GpuHostError> {
        self.ensure_running()?;
        let id = self.controller.create_session(owner, credentials).await?;
        if self.shutting_down.load(Ordering::SeqCst) {
            // Registered after the shutdown snapshot; nothing else will drain it
            self.registry.remove_and_wait(&id).await;
            return Err(GpuHostError::ShuttingDown);
        }
        Ok(id)
    }

    pub fn get_session(&self, id: &str) -> Result<SessionView, GpuHostError> {
        self.registry
            .get(id)
            .and_then(|_| self.registry.view(id))
            .ok_or_else(|| GpuHostError::SessionNotFound(id.to_string()))
    }

    pub async fn establish_forwarding(
        &self,
        id: &str,
        request: &ForwardingRequest,
    ) -> Result<ForwardingInfo, GpuHostError> {
        self.ensure_running()?;
        self.controller.establish_forwarding(id, request).await
    }

    /// Drop the session's tunnel, then sweep range ports no live session claims
    pub async fn release_forwarding(&self, id: &str) -> Result<bool, GpuHostError> {
        let released = self.controller.release_forwarding(id).await?;
        self.cleanup_ports().await;
        Ok(released)
    }

    /// Always succeeds; removing an unknown id is a no-op
    pub fn remove_session(&self, id: &str) -> bool {
        self.controller.remove_session(id)
    }

    /// Like [`remove_session`](Self::remove_session) but waits for the teardown
    pub async fn close_session(&self, id: &str) -> bool {
        self.registry.remove_and_wait(id).await
    }

    pub fn list_sessions(&self) -> Vec<SessionView> {
        self.registry.list()
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    pub async fn list_workloads(&self, id: &str) -> Result<Vec<WorkloadInfo>, GpuHostError> {
        self.controller.list_workloads(id).await
    }

    pub async fn gpu_usage(&self, id: &str) -> Result<Vec<GpuInfo>, GpuHostError> {
        self.controller.gpu_usage(id).await
    }

    pub async fn remove_workload(&self, id: &str, name: &str) -> Result<(), GpuHostError> {
        self.controller.remove_workload(id, name).await
    }

    pub async fn open_shell(&self, id: &str, workload: Option<&str>) -> Result<(), GpuHostError> {
        self.ensure_running()?;
        self.controller.open_shell(id, workload).await
    }

    pub async fn shell_write(&self, id: &str, input: &str) -> Result<(), GpuHostError> {
        self.controller.shell_write(id, input).await
    }

    pub async fn shell_read(&self, id: &str, wait: Duration) -> Result<Vec<u8>, GpuHostError> {
        self.controller.shell_read(id, wait).await
    }

    pub async fn close_shell(&self, id: &str) -> Result<bool, GpuHostError> {
        self.controller.close_shell(id).await
    }

    /// Ports in the configured range that something is listening on
    pub async fn port_report(&self) -> Vec<PortUsage> {
        self.tunnels.report(self.config.ports.local_range).await
    }

    /// Kill holders of range ports that no live session has claimed
    pub async fn cleanup_ports(&self) -> Vec<u16> {
        // Claims are checked per port since forwardings may start mid-sweep
        let allocator = &self.allocator;
        let freed = self
            .tunnels
            .sweep_ports_unless(self.config.ports.local_range.iter().collect(), |port| {
                allocator.is_claimed(port)
            })
            .await;
        if !freed.is_empty() {
            info!(ports = ?freed, "Cleaned up orphaned local ports");
        }
        freed
    }

    pub fn sweep_expired(&self) -> Vec<String> {
        self.registry.sweep_expired(self.config.session_timeout())
    }

    /// Sweep idle sessions every `sessions.sweep_interval_secs` until shutdown
    pub fn start_expiry_sweeper(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }

        let registry = self.registry.clone();
        let max_age = self.config.session_timeout();
        let period = self.config.sweep_interval();
        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // first tick fires immediately
            interval.tick().await;
            loop {
                interval.tick().await;
                let expired = registry.sweep_expired(max_age);
                debug!(expired = expired.len(), "Expiry sweep ran");
            }
        }));
        info!(interval = ?period, max_age = ?max_age, "Session expiry sweeper started");
    }

    fn stop_expiry_sweeper(&self) {
        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    /// Refuse new work, drain every session within the configured bounds, sweep the range
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.stop_expiry_sweeper();
        self.coordinator.shutdown().await
    }
}

impl Drop for GpuHost {
    fn drop(&mut self) {
        self.stop_expiry_sweeper();
    }
}
