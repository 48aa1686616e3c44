//! Container exec backend.
//!
//! Runs `<runtime> exec -i <container> <command...>` with piped standard
//! streams. No pseudo-terminal is allocated: stdout and stderr are merged into
//! one untagged output stream and there is no notion of a terminal size.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{BackendError, BackendEvent, EVENT_CHANNEL_CAPACITY, READ_BUFFER_SIZE};
use crate::config::ContainerConfig;

/// A command running inside a container.
pub struct ContainerExec {
    /// Target container name or id.
    container: String,

    /// Process ID of the runtime client process.
    pid: Option<u32>,

    /// Standard input of the exec process.
    stdin: Mutex<Option<ChildStdin>>,

    /// Cancelled to ask the supervising task to kill the process.
    kill_token: CancellationToken,

    /// Set once the process has been reaped.
    exited: Arc<AtomicBool>,
}

impl std::fmt::Debug for ContainerExec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerExec")
            .field("container", &self.container)
            .field("pid", &self.pid)
            .field("exited", &self.has_exited())
            .finish()
    }
}

impl ContainerExec {
    /// Starts the configured command inside `container`.
    pub fn spawn(
        config: &ContainerConfig,
        container: &str,
    ) -> Result<(Self, mpsc::Receiver<BackendEvent>), BackendError> {
        let mut cmd = Command::new(&config.runtime);
        cmd.arg("exec").arg("-i").arg(container).args(&config.command);
        Self::spawn_command(cmd, container)
    }

    /// Starts an already-built command as the exec process for `container`.
    pub(crate) fn spawn_command(
        mut cmd: Command,
        container: &str,
    ) -> Result<(Self, mpsc::Receiver<BackendEvent>), BackendError> {
        let program = cmd.as_std().get_program().to_string_lossy().into_owned();

        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| BackendError::SpawnFailed {
            program: program.clone(),
            reason: e.to_string(),
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let kill_token = CancellationToken::new();
        let exited = Arc::new(AtomicBool::new(false));

        let token = kill_token.clone();
        let exited_flag = Arc::clone(&exited);
        let container_name = container.to_string();
        tokio::spawn(async move {
            let wait = async {
                tokio::select! {
                    status = child.wait() => status,
                    _ = token.cancelled() => {
                        if let Err(e) = child.start_kill() {
                            tracing::debug!(error = %e, "Exec process already gone");
                        }
                        child.wait().await
                    }
                }
            };

            // The exit event goes out only after both pipes are drained, so it is
            // always the last event on the stream.
            let (_, _, status) = tokio::join!(
                pump(stdout, event_tx.clone()),
                pump(stderr, event_tx.clone()),
                wait
            );

            let code = match status {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    tracing::warn!(container = %container_name, error = %e, "Failed to wait for exec process");
                    -1
                }
            };
            exited_flag.store(true, Ordering::SeqCst);
            tracing::info!(container = %container_name, code, "Container exec exited");
            let _ = event_tx.send(BackendEvent::Exited { code }).await;
        });

        tracing::debug!(
            program = %program,
            container = %container,
            pid = ?pid,
            "Spawned container exec"
        );

        let exec = ContainerExec {
            container: container.to_string(),
            pid,
            stdin: Mutex::new(stdin),
            kill_token,
            exited,
        };

        Ok((exec, event_rx))
    }

    /// Returns the target container.
    pub fn container(&self) -> &str {
        &self.container
    }

    /// Returns the process ID of the runtime client, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns whether the process has exited.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Writes data to the process's standard input.
    pub async fn write(&self, data: Bytes) -> Result<(), BackendError> {
        if self.has_exited() {
            return Err(BackendError::Exited);
        }

        let mut stdin = self.stdin.lock().await;
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| BackendError::WriteFailed("stdin is closed".to_string()))?;
        pipe.write_all(&data)
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
        pipe.flush()
            .await
            .map_err(|e| BackendError::WriteFailed(e.to_string()))
    }

    /// Terminates the process. Does nothing if it has already exited.
    pub fn kill(&self) -> Result<(), BackendError> {
        if !self.has_exited() && !self.kill_token.is_cancelled() {
            tracing::debug!(container = %self.container, pid = ?self.pid, "Killing container exec");
            self.kill_token.cancel();
        }
        Ok(())
    }
}

impl Drop for ContainerExec {
    fn drop(&mut self) {
        self.kill_token.cancel();
    }
}

/// Forwards one output pipe to the event channel until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: Option<R>, event_tx: mpsc::Sender<BackendEvent>) {
    let Some(mut reader) = reader else {
        return;
    };

    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = Bytes::copy_from_slice(&buffer[..n]);
                if event_tx.send(BackendEvent::Data(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Exec output read ended");
                break;
            }
        }
    }
}
