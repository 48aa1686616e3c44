//! Process backends.
//!
//! A backend is the interactive process paired with one session. Two variants
//! exist behind the same [`Backend`] API:
//!
//! - [`HostShell`]: the host's shell inside a pseudo-terminal. Supports resize.
//! - [`ContainerExec`]: a command run inside an existing container through the
//!   container runtime's `exec`, wired to plain pipes. There is no terminal, so
//!   resize is accepted and ignored.
//!
//! Output and exit are delivered as a finite stream of [`BackendEvent`]s over
//! a channel returned from [`Backend::spawn`]. The stream ends once the process
//! has exited and its output has been drained.

pub mod container_exec;
pub mod host_shell;

use bytes::Bytes;
use protocol::{BackendTarget, TerminalSize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{ContainerConfig, ShellConfig};

pub use container_exec::ContainerExec;
pub use host_shell::HostShell;

/// Buffer size for reading backend output.
pub(crate) const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for backend events.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors that can occur during backend operations.
#[derive(Error, Debug)]
pub enum BackendError {
    /// The process could not be started.
    #[error("failed to start {program}: {reason}")]
    SpawnFailed {
        /// Program that was being started.
        program: String,
        /// Why it failed.
        reason: String,
    },

    /// The process has already exited.
    #[error("process has already exited")]
    Exited,

    /// Failed to write to the process input.
    #[error("failed to write to process: {0}")]
    WriteFailed(String),

    /// Failed to resize the terminal.
    #[error("failed to resize terminal: {0}")]
    ResizeFailed(String),

    /// Failed to terminate the process.
    #[error("failed to kill process: {0}")]
    KillFailed(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// An event produced by a running backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// A chunk of output, exactly as the process produced it.
    Data(Bytes),
    /// The process exited with the given code.
    Exited {
        /// Exit code. Processes ended by a signal report `-1`.
        code: i32,
    },
}

/// Which variant a backend is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Host shell in a pseudo-terminal.
    HostShell,
    /// Command inside a container.
    ContainerExec,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::HostShell => write!(f, "host-shell"),
            BackendKind::ContainerExec => write!(f, "container-exec"),
        }
    }
}

/// The interactive process paired with a session.
#[derive(Debug)]
pub enum Backend {
    /// Host shell in a pseudo-terminal.
    HostShell(HostShell),
    /// Command inside a container.
    ContainerExec(ContainerExec),
}

impl Backend {
    /// Spawns the backend requested by an init message.
    ///
    /// Returns the backend and the receiving end of its event stream.
    pub fn spawn(
        target: &BackendTarget,
        size: TerminalSize,
        shell: &ShellConfig,
        container: &ContainerConfig,
    ) -> Result<(Self, mpsc::Receiver<BackendEvent>), BackendError> {
        match target {
            BackendTarget::Local => {
                let (backend, events) = HostShell::spawn(shell, size)?;
                Ok((Backend::HostShell(backend), events))
            }
            BackendTarget::Container { name } => {
                let (backend, events) = ContainerExec::spawn(container, name)?;
                Ok((Backend::ContainerExec(backend), events))
            }
        }
    }

    /// Returns the variant of this backend.
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::HostShell(_) => BackendKind::HostShell,
            Backend::ContainerExec(_) => BackendKind::ContainerExec,
        }
    }

    /// Whether [`Backend::resize`] has any effect.
    pub fn supports_resize(&self) -> bool {
        matches!(self, Backend::HostShell(_))
    }

    /// Process ID, when the platform reports one.
    pub fn pid(&self) -> Option<u32> {
        match self {
            Backend::HostShell(shell) => shell.pid(),
            Backend::ContainerExec(exec) => exec.pid(),
        }
    }

    /// Whether the process has been observed to exit.
    pub fn has_exited(&self) -> bool {
        match self {
            Backend::HostShell(shell) => shell.has_exited(),
            Backend::ContainerExec(exec) => exec.has_exited(),
        }
    }

    /// Writes bytes to the process input.
    pub async fn write(&self, data: Bytes) -> Result<(), BackendError> {
        match self {
            Backend::HostShell(shell) => shell.write(data).await,
            Backend::ContainerExec(exec) => exec.write(data).await,
        }
    }

    /// Resizes the terminal. A no-op for backends without one.
    pub fn resize(&self, size: TerminalSize) -> Result<(), BackendError> {
        match self {
            Backend::HostShell(shell) => shell.resize(size),
            Backend::ContainerExec(_) => Ok(()),
        }
    }

    /// Terminates the process. Killing an exited process is a no-op.
    pub fn kill(&self) -> Result<(), BackendError> {
        match self {
            Backend::HostShell(shell) => shell.kill(),
            Backend::ContainerExec(exec) => exec.kill(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn sh_config() -> ShellConfig {
        ShellConfig {
            program: "/bin/sh".to_string(),
            ..ShellConfig::default()
        }
    }

    #[test]
    fn test_backend_kind_display() {
        assert_eq!(BackendKind::HostShell.to_string(), "host-shell");
        assert_eq!(BackendKind::ContainerExec.to_string(), "container-exec");
    }

    #[tokio::test]
    async fn test_spawn_local_selects_host_shell() {
        let (backend, _events) = Backend::spawn(
            &BackendTarget::Local,
            TerminalSize::default(),
            &sh_config(),
            &ContainerConfig::default(),
        )
        .unwrap();

        assert_eq!(backend.kind(), BackendKind::HostShell);
        assert!(backend.supports_resize());
        assert!(backend.pid().is_some());

        backend.kill().unwrap();
    }

    #[tokio::test]
    async fn test_spawn_container_with_missing_runtime_fails() {
        let container = ContainerConfig {
            runtime: "/nonexistent/container-runtime".to_string(),
            ..ContainerConfig::default()
        };

        let result = Backend::spawn(
            &BackendTarget::Container {
                name: "web".to_string(),
            },
            TerminalSize::default(),
            &sh_config(),
            &container,
        );

        match result {
            Err(BackendError::SpawnFailed { program, .. }) => {
                assert_eq!(program, "/nonexistent/container-runtime");
            }
            other => panic!("expected spawn failure, got {:?}", other.map(|(b, _)| b)),
        }
    }

    #[tokio::test]
    async fn test_container_resize_is_accepted_noop() {
        let (backend, mut events) =
            ContainerExec::spawn_command(tokio::process::Command::new("cat"), "test").unwrap();
        let backend = Backend::ContainerExec(backend);

        assert!(!backend.supports_resize());
        assert!(backend.resize(TerminalSize::new(200, 50).unwrap()).is_ok());

        backend.kill().unwrap();
        let exited = timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if matches!(event, BackendEvent::Exited { .. }) {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap();
        assert!(exited);
    }
}
