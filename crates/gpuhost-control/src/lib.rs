//! Session lifecycle for a shared GPU host
//!
//! [`GpuHost`] is the entry point. It owns the [`SessionRegistry`](gpuhost_session::SessionRegistry),
//! drives per-session setup through the [`LifecycleController`], and drains
//! everything through the [`ShutdownCoordinator`] on exit.

pub mod cleaner;
pub mod config;
pub mod error;
pub mod host;
pub mod lifecycle;
pub mod shutdown;

pub use cleaner::SessionCleaner;
pub use config::{
    GpuHostConfig, PortsConfig, ServerConfig, SessionsConfig, ShutdownConfig, SshConfig,
    TunnelConfig,
};
pub use error::GpuHostError;
pub use host::{GpuHost, GpuHostBuilder};
pub use lifecycle::{script_for_gpu, ForwardingRequest, LifecycleController};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
