//! Read-only probes that each try to locate the service port

use async_trait::async_trait;
use gpuhost_remote::{in_container, ControlConnection};
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::parse::{
    port_from_lsof, port_from_socket_table, port_from_url_text, reports_port_zero,
    server_from_json_lines, token_from_text,
};
use crate::profile::ServiceProfile;

/// Resolved service address as reachable from the SSH host
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    /// Access token the server printed, when it requires one
    pub token: Option<String>,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a strategy may look at
pub struct ProbeContext<'a> {
    pub conn: &'a dyn ControlConnection,
    pub container_id: &'a str,
    /// Address of the workload; strategies only find the port
    pub host: &'a str,
    pub profile: &'a ServiceProfile,
    pub timeout: Duration,
}

impl ProbeContext<'_> {
    /// Run `inner` inside the container with the profile prelude.
    /// Failure and empty output both come back as `Err(diagnostic)`.
    pub async fn run(&self, inner: &str) -> Result<String, String> {
        let command = in_container(self.container_id, &self.profile.with_prelude(inner));
        match self.conn.execute(&command, self.timeout, None).await {
            Ok(out) if out.success && !out.output.trim().is_empty() => Ok(out.output),
            Ok(out) if out.success => Err(format!("`{}` printed nothing", inner)),
            Ok(out) => Err(format!("`{}` failed: {}", inner, out.output.trim())),
            Err(e) => Err(format!("`{}` errored: {}", inner, e)),
        }
    }

    fn endpoint(&self, port: u16) -> Endpoint {
        self.endpoint_with_token(port, None)
    }

    fn endpoint_with_token(&self, port: u16, token: Option<String>) -> Endpoint {
        Endpoint {
            host: self.host.to_string(),
            port,
            token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Found(Endpoint),
    NotFound(String),
}

#[async_trait]
pub trait DiscoveryStrategy: Send + Sync {
    fn name(&self) -> &str;

    /// Must not change state inside the workload
    async fn probe(&self, ctx: &ProbeContext<'_>) -> ProbeOutcome;
}

/// The service's own JSON server listing
pub struct StructuredListing;

#[async_trait]
impl DiscoveryStrategy for StructuredListing {
    fn name(&self) -> &str {
        "structured-listing"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        let output = match ctx.run(&ctx.profile.structured_listing).await {
            Ok(output) => output,
            Err(diagnostic) => return ProbeOutcome::NotFound(diagnostic),
        };
        match server_from_json_lines(&output) {
            Some((port, token)) => ProbeOutcome::Found(ctx.endpoint_with_token(port, token)),
            None => ProbeOutcome::NotFound(format!("no port in listing: {}", output.trim())),
        }
    }
}

/// Prose listing with server URLs
pub struct AlternateListing;

#[async_trait]
impl DiscoveryStrategy for AlternateListing {
    fn name(&self) -> &str {
        "alternate-listing"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        let output = match ctx.run(&ctx.profile.alternate_listing).await {
            Ok(output) => output,
            Err(diagnostic) => return ProbeOutcome::NotFound(diagnostic),
        };
        match port_from_url_text(&output) {
            Some(port) => {
                ProbeOutcome::Found(ctx.endpoint_with_token(port, token_from_text(&output)))
            }
            None => ProbeOutcome::NotFound(format!("no server URL in: {}", output.trim())),
        }
    }
}

/// Listening sockets of the service process
pub struct SocketTable;

#[async_trait]
impl DiscoveryStrategy for SocketTable {
    fn name(&self) -> &str {
        "socket-table"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        let process = &ctx.profile.process_name;
        let command = format!(
            "netstat -tlnp 2>/dev/null | grep {p} || ss -tlnp 2>/dev/null | grep {p}",
            p = process
        );
        let output = match ctx.run(&command).await {
            Ok(output) => output,
            Err(diagnostic) => return ProbeOutcome::NotFound(diagnostic),
        };
        match port_from_socket_table(&output) {
            Some(port) => ProbeOutcome::Found(ctx.endpoint(port)),
            None => ProbeOutcome::NotFound(format!("no listening port for {}", process)),
        }
    }
}

/// Tail of the startup log, with socket fallbacks when the log says port 0
pub struct LogScan;

impl LogScan {
    async fn fallback(&self, ctx: &ProbeContext<'_>) -> Result<u16, String> {
        let process = &ctx.profile.fallback_process;
        let ss = format!("ss -tlnp 2>/dev/null | grep {}", process);
        let ss_miss = match ctx.run(&ss).await {
            Ok(output) => match port_from_socket_table(&output) {
                Some(port) => return Ok(port),
                None => "ss listed no port".to_string(),
            },
            Err(diagnostic) => diagnostic,
        };

        let lsof = format!("lsof -i -P -n 2>/dev/null | grep {}", process);
        match ctx.run(&lsof).await {
            Ok(output) => port_from_lsof(&output)
                .ok_or_else(|| format!("{}; lsof listed no port", ss_miss)),
            Err(diagnostic) => Err(format!("{}; {}", ss_miss, diagnostic)),
        }
    }
}

#[async_trait]
impl DiscoveryStrategy for LogScan {
    fn name(&self) -> &str {
        "log-scan"
    }

    async fn probe(&self, ctx: &ProbeContext<'_>) -> ProbeOutcome {
        let command = format!(
            "tail -n {} {}",
            ctx.profile.log_tail_lines, ctx.profile.log_path
        );
        let log = match ctx.run(&command).await {
            Ok(log) => log,
            Err(diagnostic) => return ProbeOutcome::NotFound(diagnostic),
        };
        let token = token_from_text(&log);
        if let Some(port) = port_from_url_text(&log) {
            return ProbeOutcome::Found(ctx.endpoint_with_token(port, token));
        }

        if reports_port_zero(&log) {
            debug!(container = %ctx.container_id, "Log reports port 0, checking sockets");
        }
        match self.fallback(ctx).await {
            Ok(port) => ProbeOutcome::Found(ctx.endpoint_with_token(port, token)),
            Err(diagnostic) => ProbeOutcome::NotFound(format!(
                "no usable URL in log; {}",
                diagnostic
            )),
        }
    }
}
