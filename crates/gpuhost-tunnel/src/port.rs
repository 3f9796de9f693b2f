//! Local port range scanning and in-process claims
//!
//! [`PortAllocator::find_free_port`] is a pure scan: ascending order, first
//! candidate the probe reports free, nothing reserved. [`PortAllocator::allocate`]
//! adds a process-local claim on top so two sessions of this process never pick
//! the same port; other processes can still race us, which the tunnel manager
//! handles by pre-empting the port at establish time.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::error::TunnelError;

/// Inclusive range of local ports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, TunnelError> {
        if start == 0 || start > end {
            return Err(TunnelError::InvalidRange(format!("{}-{}", start, end)));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn len(&self) -> usize {
        (self.end - self.start) as usize + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self {
            start: 9000,
            end: 9099,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for PortRange {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| TunnelError::InvalidRange(s.to_string()))?;
        let start = start
            .trim()
            .parse()
            .map_err(|_| TunnelError::InvalidRange(s.to_string()))?;
        let end = end
            .trim()
            .parse()
            .map_err(|_| TunnelError::InvalidRange(s.to_string()))?;
        Self::new(start, end)
    }
}

impl TryFrom<String> for PortRange {
    type Error = TunnelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

/// Liveness check for one local port
pub trait PortProbe: Send + Sync {
    fn is_free(&self, port: u16) -> bool;
}

/// Probe by binding the port on the wildcard and loopback addresses
#[derive(Debug, Clone, Copy, Default)]
pub struct BindProbe;

impl PortProbe for BindProbe {
    fn is_free(&self, port: u16) -> bool {
        [Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST]
            .into_iter()
            .all(|ip| TcpListener::bind(SocketAddrV4::new(ip, port)).is_ok())
    }
}

/// Process-local exclusive hold on a port; released on drop
#[derive(Debug)]
pub struct PortClaim {
    port: u16,
    claims: Arc<Mutex<HashSet<u16>>>,
}

impl PortClaim {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortClaim {
    fn drop(&mut self) {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        claims.remove(&self.port);
        debug!(port = self.port, "Released port claim");
    }
}

pub struct PortAllocator {
    range: PortRange,
    probe: Arc<dyn PortProbe>,
    claims: Arc<Mutex<HashSet<u16>>>,
}

impl PortAllocator {
    pub fn new(range: PortRange) -> Self {
        Self::with_probe(range, Arc::new(BindProbe))
    }

    pub fn with_probe(range: PortRange, probe: Arc<dyn PortProbe>) -> Self {
        Self {
            range,
            probe,
            claims: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn range(&self) -> PortRange {
        self.range
    }

    /// First port in ascending order that the probe reports free
    pub fn find_free_port(&self) -> Result<u16, TunnelError> {
        self.scan(&HashSet::new())
    }

    /// Like [`find_free_port`](Self::find_free_port), then claim the port for this process
    pub fn allocate(&self) -> Result<PortClaim, TunnelError> {
        let mut claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let port = self.scan(&claims)?;
        claims.insert(port);
        info!(port, range = %self.range, "Allocated local port");
        Ok(PortClaim {
            port,
            claims: self.claims.clone(),
        })
    }

    /// Ports currently claimed by this process
    pub fn claimed(&self) -> Vec<u16> {
        let claims = self.claims.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = claims.iter().copied().collect();
        ports.sort_unstable();
        ports
    }

    pub fn is_claimed(&self, port: u16) -> bool {
        self.claims
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    fn scan(&self, skip: &HashSet<u16>) -> Result<u16, TunnelError> {
        for port in self.range.iter() {
            if skip.contains(&port) {
                continue;
            }
            if self.probe.is_free(port) {
                return Ok(port);
            }
            debug!(port, "Port is in use");
        }

        warn!(range = %self.range, "No available ports");
        Err(TunnelError::PortExhausted {
            start: self.range.start,
            end: self.range.end,
        })
    }
}
