//! Runtime settings for the whole manager

use gpuhost_discovery::ServiceProfile;
use gpuhost_remote::{HostTarget, WorkloadCommands};
use gpuhost_tunnel::PortRange;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GpuHostError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "10.1.23.20".to_string(),
            port: 22,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortsConfig {
    pub local_range: PortRange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub program: String,
    pub connect_timeout_secs: u64,
    pub keepalive_interval_secs: u64,
    pub command_timeout_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            program: "ssh".to_string(),
            connect_timeout_secs: 10,
            keepalive_interval_secs: 15,
            command_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// An exit inside this window counts as a failed tunnel
    pub settle_millis: u64,
    pub terminate_grace_millis: u64,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            settle_millis: 1500,
            terminate_grace_millis: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_per_owner: usize,
    pub cleanup_timeout_secs: u64,
    pub stop_workload_on_teardown: bool,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 3600,
            sweep_interval_secs: 300,
            max_per_owner: 5,
            cleanup_timeout_secs: 10,
            stop_workload_on_teardown: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub pool_size: usize,
    pub task_timeout_secs: u64,
    pub deadline_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            pool_size: 5,
            task_timeout_secs: 5,
            deadline_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GpuHostConfig {
    pub server: ServerConfig,
    pub ports: PortsConfig,
    pub ssh: SshConfig,
    pub tunnel: TunnelConfig,
    pub sessions: SessionsConfig,
    pub shutdown: ShutdownConfig,
    pub workload: WorkloadCommands,
    pub service: ServiceProfile,
}

impl GpuHostConfig {
    pub fn validate(&self) -> Result<(), GpuHostError> {
        let fail = |msg: &str| Err(GpuHostError::Config(msg.to_string()));

        if self.server.host.trim().is_empty() {
            return fail("server.host is empty");
        }
        if self.server.port == 0 {
            return fail("server.port must be non-zero");
        }
        if self.ssh.connect_timeout_secs == 0 || self.ssh.command_timeout_secs == 0 {
            return fail("ssh timeouts must be non-zero");
        }
        if self.tunnel.terminate_grace_millis == 0 {
            return fail("tunnel.terminate_grace_millis must be non-zero");
        }
        if self.sessions.timeout_secs == 0
            || self.sessions.sweep_interval_secs == 0
            || self.sessions.cleanup_timeout_secs == 0
        {
            return fail("session timeouts must be non-zero");
        }
        if self.sessions.max_per_owner == 0 {
            return fail("sessions.max_per_owner must be at least 1");
        }
        if self.shutdown.pool_size == 0 {
            return fail("shutdown.pool_size must be at least 1");
        }
        if self.shutdown.task_timeout_secs == 0 || self.shutdown.deadline_secs == 0 {
            return fail("shutdown timeouts must be non-zero");
        }
        Ok(())
    }

    /// SSH host for `user`
    pub fn target(&self, user: &str) -> HostTarget {
        HostTarget::new(&self.server.host, self.server.port, user)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh.command_timeout_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sessions.sweep_interval_secs)
    }

    pub fn cleanup_timeout(&self) -> Duration {
        Duration::from_secs(self.sessions.cleanup_timeout_secs)
    }

    pub fn tunnel_settle(&self) -> Duration {
        Duration::from_millis(self.tunnel.settle_millis)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.tunnel.terminate_grace_millis)
    }

    pub fn shutdown_task_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown.task_timeout_secs)
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown.deadline_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GpuHostConfig::default();
        config.validate().unwrap();
        assert_eq!(config.ports.local_range.to_string(), "9000-9099");
        assert_eq!(config.shutdown.pool_size, 5);
        assert_eq!(config.session_timeout(), Duration::from_secs(3600));
        assert_eq!(config.target("alice").to_string(), "alice@10.1.23.20:22");
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "server:\n  host: gpu.lab\nports:\n  local_range: 9500-9510\nshutdown:\n  pool_size: 2\n";
        let config: GpuHostConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.host, "gpu.lab");
        assert_eq!(config.server.port, 22);
        assert_eq!(config.ports.local_range, PortRange::new(9500, 9510).unwrap());
        assert_eq!(config.shutdown.pool_size, 2);
        assert_eq!(config.shutdown.deadline_secs, 30);
        config.validate().unwrap();
    }

    #[test]
    fn test_inverted_range_rejected_on_parse() {
        let yaml = "ports:\n  local_range: 9100-9000\n";
        assert!(serde_yaml::from_str::<GpuHostConfig>(yaml).is_err());
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = GpuHostConfig::default();
        config.shutdown.pool_size = 0;
        assert!(matches!(config.validate(), Err(GpuHostError::Config(_))));

        let mut config = GpuHostConfig::default();
        config.ssh.command_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = GpuHostConfig::default();
        config.sessions.max_per_owner = 0;
        assert!(config.validate().is_err());
    }
}
