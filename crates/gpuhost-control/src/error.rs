use gpuhost_discovery::DiscoveryError;
use gpuhost_remote::RemoteError;
use gpuhost_session::SessionError;
use gpuhost_tunnel::TunnelError;
use thiserror::Error;

/// Failures surfaced to callers of the lifecycle operations
#[derive(Error, Debug)]
pub enum GpuHostError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Remote command failed: {0}")]
    Command(String),

    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No free local port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Tunnel failure: {0}")]
    TunnelFailure(String),

    #[error("Discovery failure: {0}")]
    DiscoveryFailure(#[from] DiscoveryError),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Owner {owner} already holds the maximum of {limit} sessions")]
    SessionLimit { owner: String, limit: usize },

    #[error("Duplicate session id: {0}")]
    DuplicateSession(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<RemoteError> for GpuHostError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::ConnectionFailed { .. } | RemoteError::Spawn { .. } => {
                GpuHostError::Connection(err.to_string())
            }
            RemoteError::AuthenticationFailed { .. } => GpuHostError::Authentication(err.to_string()),
            RemoteError::Timeout { .. } => GpuHostError::Timeout(err.to_string()),
            RemoteError::WorkloadNotFound(name) => GpuHostError::WorkloadNotFound(name),
            RemoteError::InvalidName(name) => {
                GpuHostError::InvalidRequest(format!("invalid name: {}", name))
            }
            RemoteError::CommandFailed { .. } | RemoteError::ShellClosed | RemoteError::Io(_) => {
                GpuHostError::Command(err.to_string())
            }
        }
    }
}

impl From<TunnelError> for GpuHostError {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::PortExhausted { start, end } => GpuHostError::PortExhausted { start, end },
            TunnelError::InvalidRange(range) => GpuHostError::Config(format!("port range {}", range)),
            other => GpuHostError::TunnelFailure(other.to_string()),
        }
    }
}

impl From<SessionError> for GpuHostError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(id) => GpuHostError::SessionNotFound(id),
            SessionError::Duplicate(id) => GpuHostError::DuplicateSession(id),
            SessionError::LimitReached { owner, limit } => GpuHostError::SessionLimit { owner, limit },
        }
    }
}
