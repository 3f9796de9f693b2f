use std::time::Duration;
use thiserror::Error;

/// Errors from port allocation and tunnel management
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("No free local port in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Invalid port range: {0}")]
    InvalidRange(String),

    #[error("Tunnel localhost:{local_port} -> {remote} failed: {diagnostic}")]
    LaunchFailed {
        local_port: u16,
        remote: String,
        diagnostic: String,
    },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
