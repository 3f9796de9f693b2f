//! Hand-written collaborators shared by the control tests
#![allow(dead_code)]

use async_trait::async_trait;
use gpuhost_remote::{
    CommandOutput, ControlConnection, Credentials, HostTarget, RemoteError, RemoteExecutor,
    ShellChannel,
};
use gpuhost_tunnel::{
    PortProbe, PortReclaimer, Termination, TunnelError, TunnelLauncher, TunnelProcess, TunnelSpec,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Log = Arc<Mutex<Vec<String>>>;

pub fn log() -> Log {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(log: &Log) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Canned host: answers by substring, records commands into a shared log
pub struct ScriptedConnection {
    target: HostTarget,
    responses: Arc<Vec<(&'static str, CommandOutput)>>,
    commands: Log,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl ControlConnection for ScriptedConnection {
    fn target(&self) -> &HostTarget {
        &self.target
    }

    async fn execute(
        &self,
        command: &str,
        _timeout: Duration,
        _input: Option<&str>,
    ) -> Result<CommandOutput, RemoteError> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(self
            .responses
            .iter()
            .find(|(needle, _)| command.contains(needle))
            .map(|(_, out)| out.clone())
            .unwrap_or_else(|| CommandOutput::failed("command not found")))
    }

    async fn open_shell(&self, _command: Option<&str>) -> Result<ShellChannel, RemoteError> {
        Err(RemoteError::ShellClosed)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out scripted connections, or refuses every connection
pub struct MockExecutor {
    pub responses: Arc<Vec<(&'static str, CommandOutput)>>,
    pub commands: Log,
    pub connects: AtomicUsize,
    pub closed: Arc<AtomicBool>,
    pub refuse: bool,
    pub connect_delay: Duration,
}

impl MockExecutor {
    pub fn new(responses: Vec<(&'static str, CommandOutput)>) -> Self {
        Self {
            responses: Arc::new(responses),
            commands: log(),
            connects: AtomicUsize::new(0),
            closed: Arc::new(AtomicBool::new(false)),
            refuse: false,
            connect_delay: Duration::ZERO,
        }
    }

    /// Connections take `delay` to come up
    pub fn slow(responses: Vec<(&'static str, CommandOutput)>, delay: Duration) -> Self {
        Self {
            connect_delay: delay,
            ..Self::new(responses)
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(vec![])
        }
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn connect(
        &self,
        target: &HostTarget,
        _credentials: &Credentials,
    ) -> Result<Box<dyn ControlConnection>, RemoteError> {
        if !self.connect_delay.is_zero() {
            tokio::time::sleep(self.connect_delay).await;
        }
        if self.refuse {
            return Err(RemoteError::ConnectionFailed {
                target: target.to_string(),
                reason: "Connection refused".to_string(),
            });
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedConnection {
            target: target.clone(),
            responses: self.responses.clone(),
            commands: self.commands.clone(),
            closed: self.closed.clone(),
        }))
    }
}

/// Host output for a workload `alpha` whose notebook listens on 8888
pub fn happy_host() -> Vec<(&'static str, CommandOutput)> {
    vec![
        (
            "mlc-list",
            CommandOutput::ok("Available ml-containers are:\n[alpha] Pytorch-2.1.0 stopped\n"),
        ),
        ("mlc-start", CommandOutput::ok("started")),
        ("mlc-stop", CommandOutput::ok("stopped")),
        ("mlc-remove", CommandOutput::ok("removed")),
        (
            "nvidia-smi",
            CommandOutput::ok("0, 80, 9000, 16000\n1, 5, 200, 16000\n"),
        ),
        ("docker ps", CommandOutput::ok("abc123\n")),
        ("base64 -d", CommandOutput::ok("")),
        ("tmux new-session", CommandOutput::ok("tmux_ok\n")),
        ("docker inspect -f", CommandOutput::ok("172.17.0.4\n")),
        (
            "--json",
            CommandOutput::ok("{\"hostname\": \"0.0.0.0\", \"port\": 8888}\n"),
        ),
    ]
}

/// Every port is free
pub struct OpenProbe;

impl PortProbe for OpenProbe {
    fn is_free(&self, _port: u16) -> bool {
        true
    }
}

/// Reports the listed ports as bound by something else
pub struct BusyProbe(pub HashSet<u16>);

impl PortProbe for BusyProbe {
    fn is_free(&self, port: u16) -> bool {
        !self.0.contains(&port)
    }
}

/// Pretends some ports are held by foreign pids; releases of gated ports block until opened
#[derive(Default)]
pub struct FakeReclaimer {
    pub holders: Mutex<HashMap<u16, Vec<u32>>>,
    pub released: Mutex<Vec<u16>>,
    gated: Mutex<HashSet<u16>>,
    gate: tokio::sync::Notify,
}

impl FakeReclaimer {
    pub fn occupy(&self, port: u16, pid: u32) {
        self.holders.lock().unwrap().entry(port).or_default().push(pid);
    }

    pub fn hold_releases(&self, ports: impl IntoIterator<Item = u16>) {
        self.gated.lock().unwrap().extend(ports);
    }

    pub fn open_gate(&self) {
        self.gated.lock().unwrap().clear();
        self.gate.notify_waiters();
    }
}

#[async_trait]
impl PortReclaimer for FakeReclaimer {
    async fn holders(&self, port: u16) -> Result<Vec<u32>, TunnelError> {
        Ok(self
            .holders
            .lock()
            .unwrap()
            .get(&port)
            .cloned()
            .unwrap_or_default())
    }

    async fn describe(&self, port: u16) -> Result<Option<String>, TunnelError> {
        Ok(self
            .holders
            .lock()
            .unwrap()
            .get(&port)
            .map(|pids| format!("pids {:?}", pids)))
    }

    async fn release(&self, port: u16) -> Result<Vec<u32>, TunnelError> {
        loop {
            let opened = self.gate.notified();
            if !self.gated.lock().unwrap().contains(&port) {
                break;
            }
            opened.await;
        }
        self.released.lock().unwrap().push(port);
        Ok(self.holders.lock().unwrap().remove(&port).unwrap_or_default())
    }
}

struct FakeTunnel {
    port: u16,
    events: Log,
}

#[async_trait]
impl TunnelProcess for FakeTunnel {
    fn pid(&self) -> Option<u32> {
        Some(1000 + self.port as u32)
    }

    fn is_alive(&mut self) -> bool {
        true
    }

    async fn terminate(&mut self, _grace: Duration) -> Result<Termination, TunnelError> {
        self.events
            .lock()
            .unwrap()
            .push(format!("terminate {}", self.port));
        Ok(Termination::Graceful)
    }
}

/// Records launches; the first `fail_first` launches fail
pub struct FakeLauncher {
    pub events: Log,
    pub fail_first: AtomicUsize,
}

impl FakeLauncher {
    pub fn new() -> Self {
        Self {
            events: log(),
            fail_first: AtomicUsize::new(0),
        }
    }

    pub fn failing(times: usize) -> Self {
        Self {
            events: log(),
            fail_first: AtomicUsize::new(times),
        }
    }
}

#[async_trait]
impl TunnelLauncher for FakeLauncher {
    async fn launch(
        &self,
        spec: &TunnelSpec,
        _via: &HostTarget,
        _credentials: &Credentials,
    ) -> Result<Box<dyn TunnelProcess>, TunnelError> {
        let remaining = self.fail_first.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_first.store(remaining - 1, Ordering::SeqCst);
            self.events
                .lock()
                .unwrap()
                .push(format!("failed {}", spec.local_port));
            return Err(TunnelError::LaunchFailed {
                local_port: spec.local_port,
                remote: spec.remote(),
                diagnostic: "channel 0: open failed: connect failed".to_string(),
            });
        }
        self.events
            .lock()
            .unwrap()
            .push(format!("launch {} -> {}", spec.local_port, spec.remote()));
        Ok(Box::new(FakeTunnel {
            port: spec.local_port,
            events: self.events.clone(),
        }))
    }
}
