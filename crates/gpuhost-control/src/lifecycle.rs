//! Per-session workflows: connect, bring up a workload, find its service,
//! forward it to a local port, and undo all of that again.

use gpuhost_discovery::{EndpointDiscovery, ProbeContext, ServiceProfile};
use gpuhost_remote::{
    validate_name, Credentials, GpuInfo, HostTarget, Provision, RemoteExecutor,
    WorkloadController, WorkloadInfo,
};
use gpuhost_session::{Forwarding, ForwardingInfo, Session, SessionRegistry};
use gpuhost_tunnel::{PortAllocator, TunnelManager};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cleaner::SessionCleaner;
use crate::error::GpuHostError;

/// What `establish_forwarding` should bring up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingRequest {
    pub workload: String,
    /// Create the workload with this framework/version when it does not exist
    pub provision: Option<Provision>,
    /// Start the service inside the workload before discovering it
    pub launch_service: bool,
}

impl ForwardingRequest {
    pub fn new(workload: impl Into<String>) -> Self {
        Self {
            workload: workload.into(),
            provision: None,
            launch_service: true,
        }
    }

    pub fn with_provision(mut self, provision: Provision) -> Self {
        self.provision = Some(provision);
        self
    }

    pub fn without_launch(mut self) -> Self {
        self.launch_service = false;
        self
    }
}

pub struct LifecycleController {
    executor: Arc<dyn RemoteExecutor>,
    server: HostTarget,
    registry: Arc<SessionRegistry>,
    workloads: WorkloadController,
    discovery: Arc<EndpointDiscovery>,
    profile: ServiceProfile,
    allocator: Arc<PortAllocator>,
    tunnels: Arc<TunnelManager>,
    cleaner: Arc<SessionCleaner>,
    max_per_owner: Option<usize>,
}

impl LifecycleController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        server: HostTarget,
        registry: Arc<SessionRegistry>,
        workloads: WorkloadController,
        discovery: Arc<EndpointDiscovery>,
        profile: ServiceProfile,
        allocator: Arc<PortAllocator>,
        tunnels: Arc<TunnelManager>,
        cleaner: Arc<SessionCleaner>,
    ) -> Self {
        Self {
            executor,
            server,
            registry,
            workloads,
            discovery,
            profile,
            allocator,
            tunnels,
            cleaner,
            max_per_owner: None,
        }
    }

    pub fn with_max_per_owner(mut self, limit: usize) -> Self {
        self.max_per_owner = Some(limit);
        self
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn session(&self, id: &str) -> Result<Arc<Session>, GpuHostError> {
        self.registry
            .get(id)
            .ok_or_else(|| GpuHostError::SessionNotFound(id.to_string()))
    }

    /// Open a control connection for `owner` and register a session around it
    pub async fn create_session(
        &self,
        owner: &str,
        credentials: Credentials,
    ) -> Result<String, GpuHostError> {
        if let Some(limit) = self.max_per_owner {
            if self.registry.count_for_owner(owner) >= limit {
                return Err(GpuHostError::SessionLimit {
                    owner: owner.to_string(),
                    limit,
                });
            }
        }

        let target = HostTarget::new(&self.server.host, self.server.port, owner);
        let control = self.executor.connect(&target, &credentials).await?;
        let session = Session::new(owner, credentials, control);

        match self.registry.create(session) {
            Ok(session) => Ok(session.id().to_string()),
            Err(e) => {
                // Lost the race for the last slot; dropping the session kills its master
                warn!(owner = %owner, "Session rejected after connect: {}", e);
                Err(e.into())
            }
        }
    }

    /// Bring the workload's service up and forward it to a free local port.
    ///
    /// A previous forwarding of the same session is replaced once the new one is up.
    pub async fn establish_forwarding(
        &self,
        id: &str,
        request: &ForwardingRequest,
    ) -> Result<ForwardingInfo, GpuHostError> {
        let session = self.session(id)?;
        let conn = session.control();
        let name = request.workload.as_str();
        validate_name(name)?;

        self.workloads
            .ensure_running(conn, name, request.provision.as_ref())
            .await?;
        session.set_workload(Some(name.to_string()));

        let gpu = self.workloads.least_loaded_gpu(conn).await;
        let container_id = self.workloads.container_id(conn, name).await?;

        if request.launch_service {
            let script = script_for_gpu(&self.profile.startup_script, gpu);
            self.workloads
                .launch_service(
                    conn,
                    &container_id,
                    &self.profile.name,
                    &self.profile.script_path,
                    &script,
                    &self.profile.log_path,
                )
                .await?;
            tokio::time::sleep(self.profile.startup_wait()).await;
        }

        let host = self.workloads.address(conn, &container_id).await;
        let ctx = ProbeContext {
            conn,
            container_id: &container_id,
            host: &host,
            profile: &self.profile,
            timeout: self.workloads.timeout(),
        };
        let endpoint = self.discovery.discover(&ctx).await?;

        let claim = self.allocator.allocate()?;
        let tunnel = self
            .tunnels
            .establish(
                claim.port(),
                &endpoint.host,
                endpoint.port,
                conn.target(),
                session.credentials(),
            )
            .await?;

        let forwarding = Forwarding::new(tunnel, claim, Some(gpu)).with_token(endpoint.token);
        let info = forwarding.info();

        let previous = session.replace_forwarding(forwarding);
        if let Some(previous) = previous {
            debug!(session_id = %id, local_port = previous.local_port(), "Replacing previous forwarding");
            self.tunnels.teardown(previous.tunnel).await;
        }

        if !self.registry.contains(id) {
            // Removed while we were setting up; nothing may outlive the session
            if let Some(orphan) = session.take_forwarding() {
                warn!(session_id = %id, "Session removed during setup, dropping new forwarding");
                self.tunnels.teardown(orphan.tunnel).await;
            }
            return Err(GpuHostError::SessionNotFound(id.to_string()));
        }

        info!(
            session_id = %id,
            workload = %name,
            local_port = info.local_port,
            remote = %format!("{}:{}", info.remote_host, info.remote_port),
            gpu,
            "Forwarding established"
        );
        Ok(info)
    }

    /// Drop the session's tunnel but keep the session
    pub async fn release_forwarding(&self, id: &str) -> Result<bool, GpuHostError> {
        let session = self.session(id)?;
        Ok(self.cleaner.release_forwarding(&session).await)
    }

    /// Idempotent; teardown continues in the background
    pub fn remove_session(&self, id: &str) -> bool {
        self.registry.remove(id)
    }

    pub async fn list_workloads(&self, id: &str) -> Result<Vec<WorkloadInfo>, GpuHostError> {
        let session = self.session(id)?;
        Ok(self.workloads.list(session.control()).await?)
    }

    pub async fn gpu_usage(&self, id: &str) -> Result<Vec<GpuInfo>, GpuHostError> {
        let session = self.session(id)?;
        Ok(self.workloads.gpu_usage(session.control()).await?)
    }

    /// Stop and delete a workload. Clears the session's workload if it was this one.
    pub async fn remove_workload(&self, id: &str, name: &str) -> Result<(), GpuHostError> {
        let session = self.session(id)?;
        if session.workload().as_deref() == Some(name) {
            self.cleaner.release_forwarding(&session).await;
            session.set_workload(None);
        }
        self.workloads.remove(session.control(), name).await?;
        Ok(())
    }

    /// Open an interactive shell on the host, or inside `workload` when given.
    /// Replaces any shell the session already has.
    pub async fn open_shell(&self, id: &str, workload: Option<&str>) -> Result<(), GpuHostError> {
        let session = self.session(id)?;
        let conn = session.control();

        let command = match workload {
            Some(name) => {
                let container_id = self.workloads.container_id(conn, name).await?;
                Some(format!("docker exec -it {} bash", container_id))
            }
            None => None,
        };
        let shell = conn.open_shell(command.as_deref()).await?;

        let previous = session.shell().lock().await.replace(shell);
        if let Some(previous) = previous {
            previous.close(Duration::from_millis(500)).await;
        }
        info!(session_id = %id, workload = ?workload, "Shell opened");
        Ok(())
    }

    pub async fn shell_write(&self, id: &str, input: &str) -> Result<(), GpuHostError> {
        let session = self.session(id)?;
        let mut slot = session.shell().lock().await;
        let shell = slot
            .as_mut()
            .ok_or_else(|| GpuHostError::InvalidRequest("no shell open".to_string()))?;
        shell.send(input).await?;
        Ok(())
    }

    /// Output produced since the last read, waiting up to `wait` for the first chunk
    pub async fn shell_read(&self, id: &str, wait: Duration) -> Result<Vec<u8>, GpuHostError> {
        let session = self.session(id)?;
        let mut slot = session.shell().lock().await;
        let shell = slot
            .as_mut()
            .ok_or_else(|| GpuHostError::InvalidRequest("no shell open".to_string()))?;

        let mut output = match tokio::time::timeout(wait, shell.recv()).await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return Err(GpuHostError::Command("shell exited".to_string())),
            Err(_) => return Ok(Vec::new()),
        };
        while let Some(chunk) = shell.try_recv() {
            output.extend_from_slice(&chunk);
        }
        Ok(output)
    }

    pub async fn close_shell(&self, id: &str) -> Result<bool, GpuHostError> {
        let session = self.session(id)?;
        match session.take_shell().await {
            Some(shell) => {
                shell.close(Duration::from_secs(1)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Pin the service to one GPU by exporting `CUDA_VISIBLE_DEVICES` after the shebang
pub fn script_for_gpu(script: &str, gpu: u32) -> String {
    let export = format!("export CUDA_VISIBLE_DEVICES={}\n", gpu);
    match script.split_once('\n') {
        Some((first, rest)) if first.starts_with("#!") => format!("{}\n{}{}", first, export, rest),
        _ => format!("{}{}", export, script),
    }
}
