use chrono::{DateTime, Utc};
use gpuhost_remote::{ControlConnection, Credentials, ShellChannel};
use gpuhost_tunnel::{PortClaim, TunnelHandle};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Active tunnel of a session. Holding it keeps the local port claimed.
#[derive(Debug)]
pub struct Forwarding {
    pub tunnel: TunnelHandle,
    pub claim: PortClaim,
    pub gpu: Option<u32>,
    pub token: Option<String>,
}

impl Forwarding {
    pub fn new(tunnel: TunnelHandle, claim: PortClaim, gpu: Option<u32>) -> Self {
        Self {
            tunnel,
            claim,
            gpu,
            token: None,
        }
    }

    /// Access token the forwarded service expects
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn local_port(&self) -> u16 {
        self.tunnel.local_port()
    }

    pub fn info(&self) -> ForwardingInfo {
        let spec = self.tunnel.spec();
        ForwardingInfo {
            local_port: spec.local_port,
            remote_host: spec.remote_host.clone(),
            remote_port: spec.remote_port,
            gpu: self.gpu,
            token: self.token.clone(),
            established_at: self.tunnel.established_at(),
        }
    }
}

/// Plain-data copy of a [`Forwarding`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingInfo {
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub established_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SessionState {
    workload: Option<String>,
    forwarding: Option<Forwarding>,
}

/// One user's engagement with the host. Owns its control connection,
/// at most one forwarding and at most one shell.
pub struct Session {
    id: String,
    owner: String,
    credentials: Credentials,
    control: Box<dyn ControlConnection>,
    created_at: DateTime<Utc>,
    /// Id came from the caller rather than a fresh UUID
    caller_id: bool,
    state: Mutex<SessionState>,
    shell: tokio::sync::Mutex<Option<ShellChannel>>,
}

impl Session {
    pub fn new(
        owner: impl Into<String>,
        credentials: Credentials,
        control: Box<dyn ControlConnection>,
    ) -> Self {
        let mut session = Self::with_id(Uuid::new_v4().to_string(), owner, credentials, control);
        session.caller_id = false;
        session
    }

    pub fn with_id(
        id: impl Into<String>,
        owner: impl Into<String>,
        credentials: Credentials,
        control: Box<dyn ControlConnection>,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            credentials,
            control,
            created_at: Utc::now(),
            caller_id: true,
            state: Mutex::new(SessionState::default()),
            shell: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn control(&self) -> &dyn ControlConnection {
        self.control.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Whether the id was supplied through [`Session::with_id`]
    pub fn has_caller_id(&self) -> bool {
        self.caller_id
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn workload(&self) -> Option<String> {
        self.state().workload.clone()
    }

    pub fn set_workload(&self, workload: Option<String>) {
        self.state().workload = workload;
    }

    pub fn forwarding(&self) -> Option<ForwardingInfo> {
        self.state().forwarding.as_ref().map(Forwarding::info)
    }

    /// Install `forwarding`, handing back the one it replaces
    pub fn replace_forwarding(&self, forwarding: Forwarding) -> Option<Forwarding> {
        self.state().forwarding.replace(forwarding)
    }

    pub fn take_forwarding(&self) -> Option<Forwarding> {
        self.state().forwarding.take()
    }

    /// Interactive shell slot; lock it to send or receive
    pub fn shell(&self) -> &tokio::sync::Mutex<Option<ShellChannel>> {
        &self.shell
    }

    pub async fn take_shell(&self) -> Option<ShellChannel> {
        self.shell.lock().await.take()
    }

    pub fn view(&self, idle: Duration) -> SessionView {
        let shell_open = match self.shell.try_lock() {
            Ok(slot) => slot.is_some(),
            // somebody is using it right now
            Err(_) => true,
        };
        let state = self.state();
        SessionView {
            id: self.id.clone(),
            owner: self.owner.clone(),
            host: self.control.target().to_string(),
            created_at: self.created_at,
            idle_secs: idle.as_secs(),
            workload: state.workload.clone(),
            forwarding: state.forwarding.as_ref().map(Forwarding::info),
            shell_open,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("host", &self.control.target().to_string())
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Snapshot of a session for callers outside the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionView {
    pub id: String,
    pub owner: String,
    pub host: String,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub workload: Option<String>,
    pub forwarding: Option<ForwardingInfo>,
    pub shell_open: bool,
}
