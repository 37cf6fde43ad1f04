//! Standard-stream transport: a child process framed with newline-delimited JSON

use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Transport, TransportEvent, FRAME_CHANNEL_CAPACITY};
use crate::error::{UpstreamError, UpstreamResult};

/// Grace period between SIGTERM and SIGKILL on close
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Child process transport
pub struct StdioTransport {
    upstream_id: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<String>,

    child: Option<Child>,
    stdin: Option<BufWriter<ChildStdin>>,
}

impl StdioTransport {
    pub fn new(
        upstream_id: String,
        command: String,
        args: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<String>,
    ) -> Self {
        Self {
            upstream_id,
            command,
            args,
            env,
            cwd,
            child: None,
            stdin: None,
        }
    }

    /// Ask the child to exit, escalating to SIGKILL after the grace period
    async fn terminate_child(mut child: Child) {
        #[cfg(unix)]
        if let Some(pid) = child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            if tokio::time::timeout(TERMINATE_GRACE, child.wait()).await.is_ok() {
                return;
            }
            warn!("child ignored SIGTERM, killing");
        }

        if let Err(e) = child.kill().await {
            warn!(error = %e, "failed to kill child process");
        }
        let _ = child.wait().await;
    }
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&mut self) -> UpstreamResult<mpsc::Receiver<TransportEvent>> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .envs(&self.env)
            .kill_on_drop(true);

        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| UpstreamError::ConnectionFailed {
            message: format!("failed to spawn '{}': {}", self.command, e),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| UpstreamError::Transport {
            message: "failed to get stdin handle".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| UpstreamError::Transport {
            message: "failed to get stdout handle".to_string(),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| UpstreamError::Transport {
            message: "failed to get stderr handle".to_string(),
        })?;

        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);

        // Reader: one JSON object per line
        let upstream_id = self.upstream_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str(line) {
                            Ok(frame) => {
                                if tx.send(TransportEvent::Frame(frame)).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(upstream_id = %upstream_id, error = %e, "discarding malformed frame");
                            }
                        }
                    }
                    Ok(None) => {
                        let _ = tx
                            .send(TransportEvent::Closed {
                                reason: Some("child closed stdout".to_string()),
                            })
                            .await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Closed {
                                reason: Some(format!("stdout read error: {}", e)),
                            })
                            .await;
                        return;
                    }
                }
            }
        });

        // Child diagnostics go to our logs
        let upstream_id = self.upstream_id.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(upstream_id = %upstream_id, "stderr: {}", line);
            }
        });

        self.stdin = Some(BufWriter::new(stdin));
        self.child = Some(child);

        Ok(rx)
    }

    async fn send(&mut self, frame: serde_json::Value) -> UpstreamResult<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| UpstreamError::Transport {
            message: "transport not open".to_string(),
        })?;

        let json = serde_json::to_string(&frame)?;
        let write = async {
            stdin.write_all(json.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await?;
            Ok::<_, std::io::Error>(())
        };

        write.await.map_err(|e| UpstreamError::SendFailed {
            message: format!("failed to write to child stdin: {}", e),
        })
    }

    async fn close(&mut self) -> UpstreamResult<()> {
        if let Some(mut stdin) = self.stdin.take() {
            let _ = stdin.shutdown().await;
        }
        if let Some(child) = self.child.take() {
            Self::terminate_child(child).await;
        }
        Ok(())
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        // Best effort cleanup
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
        }
    }
}
