//! Command-line builder for the system OpenSSH client
//!
//! Both the control connection and the forwarding tunnels shell out to `ssh`.
//! This builder owns the argument ordering (options, then destination, then the
//! remote command) and the password hand-off through `sshpass -e`, so the
//! password never shows up in a process listing.

use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{ChildStderr, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::target::{Credentials, HostTarget};

/// Environment variable read by `sshpass -e`
const SSHPASS_ENV: &str = "SSHPASS";

#[derive(Debug, Clone)]
pub struct SshCommand {
    program: String,
    target: HostTarget,
    credentials: Credentials,
    flags: Vec<String>,
    options: Vec<(String, String)>,
    remote: Vec<String>,
}

impl SshCommand {
    pub fn new(target: &HostTarget, credentials: &Credentials) -> Self {
        Self {
            program: "ssh".to_string(),
            target: target.clone(),
            credentials: credentials.clone(),
            flags: Vec::new(),
            options: vec![(
                "StrictHostKeyChecking".to_string(),
                "accept-new".to_string(),
            )],
            remote: Vec::new(),
        }
    }

    /// Client command that rides on an existing ControlMaster socket
    pub fn multiplexed(target: &HostTarget, socket: &Path) -> Self {
        Self::new(target, &Credentials::Agent)
            .option("ControlMaster", "no")
            .option("ControlPath", socket.display().to_string())
    }

    /// Use a different ssh binary
    pub fn program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Bare flag such as `-N` or `-tt`
    pub fn flag(mut self, flag: impl Into<String>) -> Self {
        self.flags.push(flag.into());
        self
    }

    /// `-o key=value`
    pub fn option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.push((key.into(), value.into()));
        self
    }

    /// Local forward `-L local_port:remote_host:remote_port`
    pub fn local_forward(self, local_port: u16, remote_host: &str, remote_port: u16) -> Self {
        self.flag("-L")
            .flag(format!("{}:{}:{}", local_port, remote_host, remote_port))
    }

    /// Remote command, passed after the destination
    pub fn remote_command(mut self, command: impl Into<String>) -> Self {
        self.remote.push(command.into());
        self
    }

    /// Program and argument vector, without the password
    pub fn argv(&self) -> (String, Vec<String>) {
        let mut args = Vec::new();
        args.push("-p".to_string());
        args.push(self.target.port.to_string());
        args.extend(self.flags.iter().cloned());

        match &self.credentials {
            Credentials::Password(_) => {
                args.push("-o".to_string());
                args.push("PreferredAuthentications=password,keyboard-interactive".to_string());
                args.push("-o".to_string());
                args.push("PubkeyAuthentication=no".to_string());
            }
            Credentials::IdentityFile(path) => {
                args.push("-i".to_string());
                args.push(path.display().to_string());
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
            Credentials::Agent => {
                args.push("-o".to_string());
                args.push("BatchMode=yes".to_string());
            }
        }

        for (key, value) in &self.options {
            args.push("-o".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.push(self.target.destination());
        args.extend(self.remote.iter().cloned());

        if self.credentials.password().is_some() {
            let mut wrapped = vec!["-e".to_string(), self.program.clone()];
            wrapped.extend(args);
            ("sshpass".to_string(), wrapped)
        } else {
            (self.program.clone(), args)
        }
    }

    /// Tokio command with the password exported and stdio closed by default
    pub fn into_command(self) -> Command {
        let (program, args) = self.argv();
        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(password) = self.credentials.password() {
            command.env(SSHPASS_ENV, password);
        }
        command
    }
}

/// Log a long-lived child's stderr line by line until it closes
///
/// ssh keeps writing diagnostics (one line per refused forwarded connection)
/// for as long as it runs; an unread pipe eventually blocks it.
pub fn forward_stderr(
    stderr: Option<ChildStderr>,
    label: impl Into<String>,
) -> Option<JoinHandle<()>> {
    let stderr = stderr?;
    let label = label.into();
    Some(tokio::spawn(async move {
        let mut segments = BufReader::new(stderr).split(b'\n');
        loop {
            match segments.next_segment().await {
                Ok(Some(line)) => {
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim_end();
                    if !line.is_empty() {
                        debug!(process = %label, "{}", line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(process = %label, "Stopped reading stderr: {}", e);
                    break;
                }
            }
        }
    }))
}

/// Quote a string for a POSIX shell using single quotes
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'\''"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn target() -> HostTarget {
        HostTarget::new("gpu.example.org", 2222, "bob")
    }

    #[test]
    fn test_password_goes_through_sshpass() {
        let creds = Credentials::Password("s3cret".to_string());
        let (program, args) = SshCommand::new(&target(), &creds).flag("-N").argv();

        assert_eq!(program, "sshpass");
        assert_eq!(args[0], "-e");
        assert_eq!(args[1], "ssh");
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(args.contains(&"PubkeyAuthentication=no".to_string()));
        assert_eq!(args.last().unwrap(), "bob@gpu.example.org");
    }

    #[test]
    fn test_identity_file_and_port() {
        let creds = Credentials::IdentityFile(PathBuf::from("/keys/id_ed25519"));
        let (program, args) = SshCommand::new(&target(), &creds).argv();

        assert_eq!(program, "ssh");
        assert_eq!(&args[0..2], &["-p".to_string(), "2222".to_string()]);
        let i = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[i + 1], "/keys/id_ed25519");
        assert!(args.contains(&"BatchMode=yes".to_string()));
    }

    #[test]
    fn test_remote_command_follows_destination() {
        let (_, args) = SshCommand::new(&target(), &Credentials::Agent)
            .option("ServerAliveInterval", "15")
            .remote_command("uptime")
            .argv();

        let dest = args.iter().position(|a| a == "bob@gpu.example.org").unwrap();
        let opt = args
            .iter()
            .position(|a| a == "ServerAliveInterval=15")
            .unwrap();
        assert!(opt < dest);
        assert_eq!(args[dest + 1], "uptime");
    }

    #[test]
    fn test_local_forward_spec() {
        let (_, args) = SshCommand::new(&target(), &Credentials::Agent)
            .local_forward(9001, "172.17.0.3", 8888)
            .argv();
        let l = args.iter().position(|a| a == "-L").unwrap();
        assert_eq!(args[l + 1], "9001:172.17.0.3:8888");
    }

    #[test]
    fn test_multiplexed_uses_control_path() {
        let (_, args) =
            SshCommand::multiplexed(&target(), Path::new("/tmp/gpuhost-1.sock")).argv();
        assert!(args.contains(&"ControlPath=/tmp/gpuhost-1.sock".to_string()));
        assert!(args.contains(&"ControlMaster=no".to_string()));
    }

    #[tokio::test]
    async fn test_forward_stderr_drains_until_exit() {
        // Far more than a pipe buffer; the child only exits once it is all read
        let mut child = Command::new("sh")
            .args(["-c", "yes 'channel 3: open failed: connect failed' | head -n 5000 >&2"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let reader = forward_stderr(child.stderr.take(), "test").unwrap();
        let status = tokio::time::timeout(std::time::Duration::from_secs(5), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(status.success());
        reader.await.unwrap();
        assert!(forward_stderr(None, "none").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("ls -la"), "'ls -la'");
        assert_eq!(shell_quote("it's"), r#"'it'\''s'"#);
        assert_eq!(shell_quote(""), "''");
    }
}
