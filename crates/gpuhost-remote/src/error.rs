use std::time::Duration;
use thiserror::Error;

/// Errors raised by the control connection and the workload commands built on it
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("Failed to connect to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("Authentication rejected by {target}: {reason}")]
    AuthenticationFailed { target: String, reason: String },

    #[error("Remote command `{command}` failed: {output}")]
    CommandFailed { command: String, output: String },

    #[error("Remote command `{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("Workload not found: {0}")]
    WorkloadNotFound(String),

    #[error("Invalid workload name: {0:?}")]
    InvalidName(String),

    #[error("Shell channel closed")]
    ShellClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RemoteError {
    /// True for failures of the transport itself rather than of a command run over it
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            RemoteError::ConnectionFailed { .. } | RemoteError::AuthenticationFailed { .. }
        )
    }
}
