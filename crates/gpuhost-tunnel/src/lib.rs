//! Local side of port forwarding
//!
//! [`PortAllocator`] picks a free local port from a fixed range, [`TunnelManager`]
//! forwards it to a remote `host:port` through the SSH host by running a
//! dedicated `ssh -N -L` child per tunnel. Before a tunnel is launched, any
//! process still bound to the local port is killed.

pub mod error;
pub mod launcher;
pub mod manager;
pub mod port;
pub mod reclaim;

pub use error::TunnelError;
pub use launcher::{
    ChildTunnel, SshTunnelLauncher, Termination, TunnelLauncher, TunnelProcess, TunnelSpec,
};
pub use manager::{PortUsage, TunnelHandle, TunnelManager};
pub use port::{BindProbe, PortAllocator, PortClaim, PortProbe, PortRange};
pub use reclaim::{parse_pids, LsofReclaimer, PortReclaimer};
