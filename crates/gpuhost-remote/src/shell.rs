//! Interactive shell channel over the control connection

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::RemoteError;

const READ_CHUNK: usize = 4096;
const OUTPUT_BUFFER: usize = 256;

/// A live PTY shell; output arrives as raw byte chunks in the order the remote produced them
pub struct ShellChannel {
    child: Child,
    stdin: Option<ChildStdin>,
    output_rx: mpsc::Receiver<Vec<u8>>,
    readers: Vec<JoinHandle<()>>,
}

impl ShellChannel {
    /// Wrap a spawned shell process whose stdin/stdout/stderr are piped
    pub fn from_child(mut child: Child) -> Result<Self, RemoteError> {
        let stdin = child.stdin.take().ok_or(RemoteError::ShellClosed)?;
        let stdout = child.stdout.take().ok_or(RemoteError::ShellClosed)?;
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);

        let mut readers = vec![tokio::spawn(pump(stdout, output_tx.clone()))];
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(pump(stderr, output_tx)));
        }

        Ok(Self {
            child,
            stdin: Some(stdin),
            output_rx,
            readers,
        })
    }

    /// Write raw input to the shell
    pub async fn send(&mut self, input: &str) -> Result<(), RemoteError> {
        let stdin = self.stdin.as_mut().ok_or(RemoteError::ShellClosed)?;
        stdin.write_all(input.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Next output chunk, `None` once the shell has exited and output is drained
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    /// Output already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.try_recv().ok()
    }

    /// Close stdin, give the shell `grace` to exit, then kill it
    pub async fn close(mut self, grace: Duration) {
        self.stdin.take();
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(?status, "Shell exited"),
            Ok(Err(e)) => warn!("Failed waiting for shell: {}", e),
            Err(_) => {
                if let Err(e) = self.child.kill().await {
                    warn!("Failed to kill shell: {}", e);
                }
            }
        }
        for reader in self.readers.drain(..) {
            reader.abort();
        }
    }
}

async fn pump<R>(mut source: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match source.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Shell output stream ended: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    fn spawn_cat() -> Child {
        Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap()
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let mut shell = ShellChannel::from_child(spawn_cat()).unwrap();
        shell.send("hello\n").await.unwrap();

        let chunk = tokio::time::timeout(Duration::from_secs(5), shell.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(chunk, b"hello\n");

        shell.close(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_send_after_stdin_closed_fails() {
        let mut shell = ShellChannel::from_child(spawn_cat()).unwrap();
        shell.stdin.take();
        assert!(matches!(
            shell.send("x").await,
            Err(RemoteError::ShellClosed)
        ));
        shell.close(Duration::from_millis(500)).await;
    }
}
