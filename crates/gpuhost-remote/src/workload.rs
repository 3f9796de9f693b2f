//! Workload (container) commands on the shared host
//!
//! Everything here runs through a [`ControlConnection`] and treats the text that
//! comes back as untrusted: list output is parsed line by line and malformed
//! lines are skipped, never fatal.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::executor::ControlConnection;
use crate::ssh::shell_quote;

const DEFAULT_TOOL_DIR: &str = "/opt/aime-ml-containers";

/// Remote programs used to manage workloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadCommands {
    pub list: String,
    pub create: String,
    pub start: String,
    pub stop: String,
    pub remove: String,
}

impl Default for WorkloadCommands {
    fn default() -> Self {
        Self {
            list: format!("{}/mlc-list", DEFAULT_TOOL_DIR),
            create: format!("{}/mlc-create", DEFAULT_TOOL_DIR),
            start: format!("{}/mlc-start", DEFAULT_TOOL_DIR),
            stop: format!("{}/mlc-stop", DEFAULT_TOOL_DIR),
            remove: format!("{}/mlc-remove", DEFAULT_TOOL_DIR),
        }
    }
}

/// One row of the workload list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    pub name: String,
    pub framework: String,
    pub version: String,
    pub status: String,
}

/// Framework and version used when a missing workload has to be created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provision {
    pub framework: String,
    pub version: String,
}

/// Utilisation of one GPU on the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub utilization: u32,
    pub memory_used: u64,
    pub memory_total: u64,
}

/// Runs workload lifecycle commands over a control connection
#[derive(Debug, Clone)]
pub struct WorkloadController {
    commands: WorkloadCommands,
    timeout: Duration,
    settle: Duration,
}

impl WorkloadController {
    pub fn new(commands: WorkloadCommands, timeout: Duration) -> Self {
        Self {
            commands,
            timeout,
            settle: Duration::from_secs(1),
        }
    }

    /// Pause after start/stop before the next command relies on the new state
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn run(&self, conn: &dyn ControlConnection, command: &str) -> Result<String, RemoteError> {
        conn.execute(command, self.timeout, None)
            .await?
            .into_result(command)
    }

    pub async fn list(&self, conn: &dyn ControlConnection) -> Result<Vec<WorkloadInfo>, RemoteError> {
        let output = self.run(conn, &self.commands.list).await?;
        let workloads = parse_workload_list(&output);
        debug!(count = workloads.len(), "Parsed workload list");
        Ok(workloads)
    }

    pub async fn exists(&self, conn: &dyn ControlConnection, name: &str) -> Result<bool, RemoteError> {
        validate_name(name)?;
        let output = self.run(conn, &self.commands.list).await?;
        let listed = parse_workload_list(&output).iter().any(|w| w.name == name);
        Ok(listed || output.contains(&format!("[{}]", name)))
    }

    pub async fn create(
        &self,
        conn: &dyn ControlConnection,
        name: &str,
        provision: &Provision,
    ) -> Result<String, RemoteError> {
        validate_name(name)?;
        validate_name(&provision.framework)?;
        validate_name(&provision.version)?;
        info!(workload = %name, framework = %provision.framework, version = %provision.version, "Creating workload");
        let command = format!(
            "{} {} {} {}",
            self.commands.create, name, provision.framework, provision.version
        );
        self.run(conn, &command).await
    }

    /// Start the workload; a workload that is already running counts as started
    pub async fn start(&self, conn: &dyn ControlConnection, name: &str) -> Result<(), RemoteError> {
        validate_name(name)?;
        let command = format!("{} {}", self.commands.start, name);
        let result = conn.execute(&command, self.timeout, None).await?;
        if !result.success && !is_already_running(&result.output) {
            return Err(RemoteError::CommandFailed {
                command,
                output: result.output,
            });
        }
        tokio::time::sleep(self.settle).await;
        Ok(())
    }

    /// Make sure `name` exists and is running, creating it when `provision` is given
    pub async fn ensure_running(
        &self,
        conn: &dyn ControlConnection,
        name: &str,
        provision: Option<&Provision>,
    ) -> Result<(), RemoteError> {
        if !self.exists(conn, name).await? {
            match provision {
                Some(provision) => {
                    self.create(conn, name, provision).await?;
                }
                None => return Err(RemoteError::WorkloadNotFound(name.to_string())),
            }
        }
        self.start(conn, name).await
    }

    pub async fn stop(&self, conn: &dyn ControlConnection, name: &str) -> Result<String, RemoteError> {
        validate_name(name)?;
        info!(workload = %name, "Stopping workload");
        self.run(conn, &format!("{} {} -Y", self.commands.stop, name))
            .await
    }

    /// Stop (best-effort) and then remove the workload, answering the confirmation prompt
    pub async fn remove(&self, conn: &dyn ControlConnection, name: &str) -> Result<(), RemoteError> {
        if let Err(e) = self.stop(conn, name).await {
            warn!(workload = %name, "Stop before removal failed, continuing: {}", e);
        }
        tokio::time::sleep(self.settle).await;

        let command = format!("{} {}", self.commands.remove, name);
        conn.execute(&command, self.timeout, Some("Y"))
            .await?
            .into_result(&command)?;
        info!(workload = %name, "Workload removed");
        Ok(())
    }

    /// Container id of the running workload
    pub async fn container_id(
        &self,
        conn: &dyn ControlConnection,
        name: &str,
    ) -> Result<String, RemoteError> {
        validate_name(name)?;
        let command = format!("docker ps --filter 'name={}' --format '{{{{.ID}}}}'", name);
        let output = self.run(conn, &command).await?;
        output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .map(str::to_string)
            .ok_or_else(|| RemoteError::WorkloadNotFound(name.to_string()))
    }

    /// Network address of the container, `localhost` when it cannot be determined.
    /// A container on several networks answers with its first address.
    pub async fn address(&self, conn: &dyn ControlConnection, container_id: &str) -> String {
        let inspect = format!(
            "docker inspect -f '{{{{range.NetworkSettings.Networks}}}}{{{{.IPAddress}}}} {{{{end}}}}' {}",
            container_id
        );
        let fallback = format!(
            "docker inspect {} | grep -A 10 'NetworkSettings' | grep 'IPAddress' | head -1 | cut -d'\"' -f4",
            container_id
        );

        for command in [inspect, fallback] {
            match self.run(conn, &command).await {
                Ok(output) => {
                    if let Some(ip) = output.split_whitespace().next() {
                        return ip.to_string();
                    }
                }
                Err(e) => debug!(container = %container_id, "Address lookup failed: {}", e),
            }
        }

        warn!(container = %container_id, "Could not determine container address, using localhost");
        "localhost".to_string()
    }

    pub async fn gpu_usage(&self, conn: &dyn ControlConnection) -> Result<Vec<GpuInfo>, RemoteError> {
        let output = self
            .run(
                conn,
                "nvidia-smi --query-gpu=index,utilization.gpu,memory.used,memory.total --format=csv,noheader,nounits",
            )
            .await?;
        Ok(parse_gpu_usage(&output))
    }

    /// GPU with the lowest (utilisation, memory used); 0 when nothing can be read
    pub async fn least_loaded_gpu(&self, conn: &dyn ControlConnection) -> u32 {
        match self.gpu_usage(conn).await {
            Ok(gpus) => pick_least_loaded(&gpus),
            Err(e) => {
                debug!("GPU query failed, defaulting to GPU 0: {}", e);
                0
            }
        }
    }

    /// Install `script` in the container and start it, in tmux when available.
    ///
    /// Without tmux the script runs detached with its output in `log_path`.
    pub async fn launch_service(
        &self,
        conn: &dyn ControlConnection,
        container_id: &str,
        session_tag: &str,
        script_path: &str,
        script: &str,
        log_path: &str,
    ) -> Result<(), RemoteError> {
        let encoded = BASE64.encode(script.as_bytes());
        let install = in_container(
            container_id,
            &format!(
                "mkdir -p $(dirname {path}) && echo {encoded} | base64 -d > {path} && chmod +x {path}",
                path = script_path,
                encoded = encoded
            ),
        );
        self.run(conn, &install).await?;

        let tmux = in_container(
            container_id,
            &format!(
                "if command -v tmux >/dev/null 2>&1; then tmux new-session -d -s {tag}-$RANDOM {path}; echo tmux_ok; else echo tmux_missing; fi",
                tag = session_tag,
                path = script_path
            ),
        );
        let output = self.run(conn, &tmux).await?;

        if output.contains("tmux_missing") {
            debug!(container = %container_id, "tmux missing, starting service detached");
            let detached = format!(
                "docker exec -d {} bash -lc {}",
                container_id,
                shell_quote(&format!("{} > {} 2>&1", script_path, log_path))
            );
            self.run(conn, &detached).await?;
        }

        info!(container = %container_id, script = %script_path, "Service launched");
        Ok(())
    }
}

/// Wrap `inner` so it runs inside the container
pub fn in_container(container_id: &str, inner: &str) -> String {
    format!("docker exec {} bash -c {}", container_id, shell_quote(inner))
}

/// Parse `[name] Framework-version Status` rows, skipping headers and junk
pub fn parse_workload_list(output: &str) -> Vec<WorkloadInfo> {
    static ROW: OnceLock<Regex> = OnceLock::new();
    let row = ROW.get_or_init(|| {
        Regex::new(r"^\[([^\]]+)\]\s+([^-\s]+)-(\S+)\s+(.+)$").expect("valid workload row regex")
    });

    output
        .lines()
        .map(str::trim)
        .filter(|line| {
            !line.is_empty()
                && !line.contains("Available ml-containers are:")
                && !line.contains("CONTAINER")
        })
        .filter_map(|line| {
            let caps = row.captures(line)?;
            Some(WorkloadInfo {
                name: caps[1].to_string(),
                framework: caps[2].trim().to_string(),
                version: caps[3].trim().to_string(),
                status: caps[4].trim().to_string(),
            })
        })
        .collect()
}

/// Parse `nvidia-smi` csv rows (`index, util, mem_used, mem_total`)
pub fn parse_gpu_usage(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(GpuInfo {
                index: parts[0].parse().ok()?,
                utilization: parts[1].parse().ok()?,
                memory_used: parts[2].parse().ok()?,
                memory_total: parts[3].parse().ok()?,
            })
        })
        .collect()
}

pub fn pick_least_loaded(gpus: &[GpuInfo]) -> u32 {
    gpus.iter()
        .min_by_key(|gpu| (gpu.utilization, gpu.memory_used))
        .map(|gpu| gpu.index)
        .unwrap_or(0)
}

fn is_already_running(output: &str) -> bool {
    output.to_lowercase().contains("already running")
}

/// Names are interpolated into shell commands, so only allow a safe alphabet
pub fn validate_name(name: &str) -> Result<(), RemoteError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RemoteError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::CommandOutput;
    use crate::shell::ShellChannel;
    use crate::target::HostTarget;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replays canned responses by command prefix and records every command
    struct ScriptedConnection {
        target: HostTarget,
        responses: Vec<(&'static str, CommandOutput)>,
        seen: Mutex<Vec<(String, Option<String>)>>,
    }

    impl ScriptedConnection {
        fn new(responses: Vec<(&'static str, CommandOutput)>) -> Self {
            Self {
                target: HostTarget::new("h", 22, "u"),
                responses,
                seen: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|(c, _)| c.clone()).collect()
        }
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
            input: Option<&str>,
        ) -> Result<CommandOutput, RemoteError> {
            self.seen
                .lock()
                .unwrap()
                .push((command.to_string(), input.map(str::to_string)));
            Ok(self
                .responses
                .iter()
                .find(|(prefix, _)| command.starts_with(prefix))
                .map(|(_, out)| out.clone())
                .unwrap_or_else(|| CommandOutput::failed("unexpected command")))
        }

        async fn open_shell(&self, _command: Option<&str>) -> Result<ShellChannel, RemoteError> {
            Err(RemoteError::ShellClosed)
        }

        async fn close(&self) -> Result<(), RemoteError> {
            Ok(())
        }
    }

    fn controller() -> WorkloadController {
        WorkloadController::new(WorkloadCommands::default(), Duration::from_secs(5))
            .with_settle(Duration::ZERO)
    }

    const LIST: &str = "Available ml-containers are:\n\
        CONTAINER     FRAMEWORK   STATUS\n\
        [alpha] Pytorch-2.1.0-aime running\n\
        garbage line\n\
        [beta] Tensorflow-2.11.0 stopped\n";

    #[test]
    fn test_parse_workload_list() {
        let workloads = parse_workload_list(LIST);
        assert_eq!(workloads.len(), 2);
        assert_eq!(workloads[0].name, "alpha");
        assert_eq!(workloads[0].framework, "Pytorch");
        assert_eq!(workloads[0].version, "2.1.0-aime");
        assert_eq!(workloads[0].status, "running");
        assert_eq!(workloads[1].name, "beta");
        assert_eq!(workloads[1].status, "stopped");
    }

    #[test]
    fn test_parse_gpu_usage_and_pick() {
        let gpus = parse_gpu_usage("0, 80, 1000, 16000\n1, 5, 9000, 16000\n2, 5, 200, 16000\nbad\n");
        assert_eq!(gpus.len(), 3);
        assert_eq!(pick_least_loaded(&gpus), 2);
        assert_eq!(pick_least_loaded(&[]), 0);
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("my-container_1.0").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("x; rm -rf /").is_err());
        assert!(validate_name("$(whoami)").is_err());
    }

    #[test]
    fn test_in_container_quotes_inner_command() {
        assert_eq!(
            in_container("abc123", "tail -20 /workspace/jupyter.log"),
            "docker exec abc123 bash -c 'tail -20 /workspace/jupyter.log'"
        );
    }

    #[tokio::test]
    async fn test_start_treats_already_running_as_success() {
        let conn = ScriptedConnection::new(vec![(
            "/opt/aime-ml-containers/mlc-start",
            CommandOutput::failed("Container alpha is already running"),
        )]);
        controller().start(&conn, "alpha").await.unwrap();
    }

    #[tokio::test]
    async fn test_start_failure_is_command_error() {
        let conn = ScriptedConnection::new(vec![(
            "/opt/aime-ml-containers/mlc-start",
            CommandOutput::failed("no such container"),
        )]);
        let err = controller().start(&conn, "alpha").await.unwrap_err();
        assert!(matches!(err, RemoteError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_ensure_running_creates_missing_workload() {
        let conn = ScriptedConnection::new(vec![
            ("/opt/aime-ml-containers/mlc-list", CommandOutput::ok(LIST)),
            ("/opt/aime-ml-containers/mlc-create", CommandOutput::ok("created")),
            ("/opt/aime-ml-containers/mlc-start", CommandOutput::ok("started")),
        ]);
        let provision = Provision {
            framework: "Pytorch".into(),
            version: "2.1.0".into(),
        };
        controller()
            .ensure_running(&conn, "gamma", Some(&provision))
            .await
            .unwrap();

        let commands = conn.commands();
        assert!(commands
            .iter()
            .any(|c| c == "/opt/aime-ml-containers/mlc-create gamma Pytorch 2.1.0"));
        assert_eq!(commands.last().unwrap(), "/opt/aime-ml-containers/mlc-start gamma");
    }

    #[tokio::test]
    async fn test_ensure_running_without_provision_reports_missing() {
        let conn = ScriptedConnection::new(vec![(
            "/opt/aime-ml-containers/mlc-list",
            CommandOutput::ok(LIST),
        )]);
        let err = controller()
            .ensure_running(&conn, "gamma", None)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::WorkloadNotFound(name) if name == "gamma"));
    }

    #[tokio::test]
    async fn test_remove_confirms_and_ignores_stop_failure() {
        let conn = ScriptedConnection::new(vec![
            ("/opt/aime-ml-containers/mlc-stop", CommandOutput::failed("not running")),
            ("/opt/aime-ml-containers/mlc-remove", CommandOutput::ok("removed")),
        ]);
        controller().remove(&conn, "alpha").await.unwrap();

        let seen = conn.seen.lock().unwrap();
        let (command, input) = seen.last().unwrap();
        assert_eq!(command, "/opt/aime-ml-containers/mlc-remove alpha");
        assert_eq!(input.as_deref(), Some("Y"));
    }

    #[tokio::test]
    async fn test_container_id_and_address() {
        let conn = ScriptedConnection::new(vec![
            ("docker ps", CommandOutput::ok("\n3f2a9c\n")),
            ("docker inspect -f", CommandOutput::ok("172.17.0.4\n")),
        ]);
        let ctl = controller();
        let cid = ctl.container_id(&conn, "alpha").await.unwrap();
        assert_eq!(cid, "3f2a9c");
        assert_eq!(ctl.address(&conn, &cid).await, "172.17.0.4");
    }

    #[tokio::test]
    async fn test_address_of_container_on_two_networks() {
        let conn = ScriptedConnection::new(vec![(
            "docker inspect -f",
            CommandOutput::ok("172.17.0.4 10.20.0.7 \n"),
        )]);
        assert_eq!(controller().address(&conn, "3f2a9c").await, "172.17.0.4");
        assert!(conn.commands()[0].contains("{{.IPAddress}} {{end}}"));
    }

    #[tokio::test]
    async fn test_address_falls_back_to_localhost() {
        let conn = ScriptedConnection::new(vec![]);
        assert_eq!(controller().address(&conn, "3f2a9c").await, "localhost");
    }

    #[tokio::test]
    async fn test_launch_service_without_tmux_runs_detached() {
        let conn = ScriptedConnection::new(vec![
            ("docker exec 3f2a9c bash -c 'mkdir", CommandOutput::ok("")),
            ("docker exec 3f2a9c bash -c 'if command -v tmux", CommandOutput::ok("tmux_missing\n")),
            ("docker exec -d 3f2a9c", CommandOutput::ok("")),
        ]);
        controller()
            .launch_service(&conn, "3f2a9c", "jup-alpha", "/workspace/start.sh", "#!/bin/sh\n", "/workspace/svc.log")
            .await
            .unwrap();

        let commands = conn.commands();
        assert_eq!(commands.len(), 3);
        assert!(commands[2].contains("/workspace/start.sh > /workspace/svc.log 2>&1"));
    }
}
