//! Control connection and workload commands for the shared compute host
//!
//! The host is reached over the system OpenSSH client. A [`RemoteExecutor`]
//! opens a [`ControlConnection`], and [`WorkloadController`] builds the
//! container lifecycle commands on top of it.

pub mod error;
pub mod executor;
pub mod shell;
pub mod ssh;
pub mod target;
pub mod workload;

pub use error::RemoteError;
pub use executor::{
    CommandOutput, ControlConnection, OpenSshConfig, OpenSshConnection, OpenSshExecutor,
    RemoteExecutor,
};
pub use shell::ShellChannel;
pub use ssh::{forward_stderr, shell_quote, SshCommand};
pub use target::{Credentials, HostTarget};
pub use workload::{
    in_container, parse_gpu_usage, parse_workload_list, validate_name, GpuInfo, Provision,
    WorkloadCommands, WorkloadController, WorkloadInfo,
};
