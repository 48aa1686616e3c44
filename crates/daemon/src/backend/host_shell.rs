//! Host shell backend.
//!
//! Runs the configured shell inside a pseudo-terminal. The shell starts in
//! the daemon user's home directory with a UTF-8 locale forced through `LANG`
//! and `LC_ALL`.
//!
//! The shell leads its own terminal session. Jobs it leaves running keep the
//! terminal open, and with it the output reader thread, so teardown sends
//! SIGHUP to everything still in that session.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use protocol::TerminalSize;
use tokio::sync::mpsc;

use super::{BackendError, BackendEvent, EVENT_CHANNEL_CAPACITY, READ_BUFFER_SIZE};
use crate::config::ShellConfig;

/// A shell running inside a pseudo-terminal.
pub struct HostShell {
    /// The PTY master handle.
    master: Mutex<Box<dyn MasterPty + Send>>,

    /// The writer for the PTY. Shared with blocking write tasks.
    writer: Arc<Mutex<Box<dyn Write + Send>>>,

    /// Handle used to terminate the shell while the waiter thread owns the child.
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,

    /// Set once the waiter thread has reaped the shell.
    exited: Arc<AtomicBool>,

    /// Thread reading PTY output.
    reader: JoinHandle<()>,

    /// Shell program path.
    shell: String,

    /// Process ID.
    pid: Option<u32>,

    /// Current terminal size.
    size: Mutex<TerminalSize>,
}

impl std::fmt::Debug for HostShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostShell")
            .field("shell", &self.shell)
            .field("pid", &self.pid)
            .field("size", &self.size())
            .field("exited", &self.has_exited())
            .finish()
    }
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows(),
        cols: size.cols(),
        pixel_width: 0,
        pixel_height: 0,
    }
}

impl HostShell {
    /// Spawns the configured shell in a new pseudo-terminal of the given size.
    ///
    /// Returns the shell and a receiver for its output and exit events.
    pub fn spawn(
        config: &ShellConfig,
        size: TerminalSize,
    ) -> Result<(Self, mpsc::Receiver<BackendEvent>), BackendError> {
        let spawn_failed = |reason: String| BackendError::SpawnFailed {
            program: config.program.clone(),
            reason,
        };

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(pty_size(size))
            .map_err(|e| spawn_failed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&config.program);
        cmd.args(&config.args);
        if let Some(dir) = config.resolved_working_dir() {
            cmd.cwd(dir);
        }
        cmd.env("TERM", &config.term);
        cmd.env("LANG", &config.locale);
        cmd.env("LC_ALL", &config.locale);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| spawn_failed(e.to_string()))?;

        // The master must see EOF once the shell is gone, so no slave handle
        // may outlive the spawn.
        drop(pair.slave);

        let pid = child.process_id();
        let killer = child.clone_killer();

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| spawn_failed(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| spawn_failed(e.to_string()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let exited = Arc::new(AtomicBool::new(false));

        let reader = spawn_reader(reader, event_tx.clone(), pid)?;
        spawn_waiter(child, event_tx, Arc::clone(&exited), pid)?;

        tracing::debug!(
            shell = %config.program,
            pid = ?pid,
            cols = size.cols(),
            rows = size.rows(),
            "Spawned host shell"
        );

        let shell = HostShell {
            master: Mutex::new(pair.master),
            writer: Arc::new(Mutex::new(writer)),
            killer: Mutex::new(killer),
            exited,
            reader,
            shell: config.program.clone(),
            pid,
            size: Mutex::new(size),
        };

        Ok((shell, event_rx))
    }

    /// Returns the process ID of the shell, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns the shell program path.
    pub fn shell(&self) -> &str {
        &self.shell
    }

    /// Returns the current terminal size.
    pub fn size(&self) -> TerminalSize {
        match self.size.lock() {
            Ok(size) => *size,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Returns whether the shell has exited.
    pub fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    /// Returns whether the output reader thread has stopped.
    ///
    /// The reader only stops once no process holds the terminal open.
    pub fn reader_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Writes data to the PTY.
    ///
    /// The write runs on the blocking pool; callers awaiting each write in
    /// turn get their bytes delivered in order.
    pub async fn write(&self, data: Bytes) -> Result<(), BackendError> {
        if self.has_exited() {
            return Err(BackendError::Exited);
        }

        let writer = Arc::clone(&self.writer);
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| BackendError::WriteFailed("PTY writer lock poisoned".to_string()))?;
            writer
                .write_all(&data)
                .map_err(|e| BackendError::WriteFailed(e.to_string()))?;
            writer
                .flush()
                .map_err(|e| BackendError::WriteFailed(e.to_string()))
        })
        .await
        .map_err(|e| BackendError::WriteFailed(e.to_string()))?
    }

    /// Resizes the PTY to the given dimensions.
    pub fn resize(&self, size: TerminalSize) -> Result<(), BackendError> {
        if self.has_exited() {
            return Err(BackendError::Exited);
        }

        let master = self
            .master
            .lock()
            .map_err(|_| BackendError::ResizeFailed("PTY master lock poisoned".to_string()))?;
        master
            .resize(pty_size(size))
            .map_err(|e| BackendError::ResizeFailed(e.to_string()))?;
        drop(master);

        if let Ok(mut current) = self.size.lock() {
            *current = size;
        }

        tracing::debug!(pid = ?self.pid, cols = size.cols(), rows = size.rows(), "Resized PTY");
        Ok(())
    }

    /// Terminates the shell and hangs up its jobs. Does nothing if the shell
    /// has already exited.
    pub fn kill(&self) -> Result<(), BackendError> {
        if self.has_exited() {
            return Ok(());
        }

        if let Some(pid) = self.pid {
            let jobs = hang_up_session(pid);
            if jobs > 0 {
                tracing::debug!(pid, jobs, "Hung up host shell jobs");
            }
        }

        let mut killer = self
            .killer
            .lock()
            .map_err(|_| BackendError::KillFailed("killer lock poisoned".to_string()))?;

        match killer.kill() {
            Ok(()) => {
                tracing::debug!(pid = ?self.pid, "Sent termination to host shell");
                Ok(())
            }
            // Lost the race with the waiter thread; the shell is already gone
            Err(_) if self.has_exited() => Ok(()),
            Err(e) => Err(BackendError::KillFailed(e.to_string())),
        }
    }
}

impl Drop for HostShell {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill host shell on drop");
        }

        // Jobs can outlive a shell that exited on its own. Once the shell is
        // reaped its pid no longer leads a live process, so the session ID
        // still names only what it left behind.
        if let Some(pid) = self.pid {
            if self.has_exited() && !leader_alive(pid) {
                let jobs = hang_up_session(pid);
                if jobs > 0 {
                    tracing::debug!(pid, jobs, "Hung up jobs left by host shell");
                }
            }
        }

        if !self.reader.is_finished() {
            tracing::debug!(pid = ?self.pid, "PTY reader still attached after teardown");
        }
    }
}

/// Sends SIGHUP to every process in the shell's session except the shell.
///
/// Job control moves background jobs into their own process groups, so the
/// session is the only grouping that still covers all of them. Returns how
/// many processes were signalled.
#[cfg(target_os = "linux")]
fn hang_up_session(leader: u32) -> usize {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Ok(entries) = std::fs::read_dir("/proc") else {
        return 0;
    };

    entries
        .flatten()
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .filter(|&pid| pid != leader && session_id(pid) == Some(leader))
        .filter_map(|pid| i32::try_from(pid).ok())
        .filter(|&pid| kill(Pid::from_raw(pid), Signal::SIGHUP).is_ok())
        .count()
}

/// Reads a process's session ID from `/proc/<pid>/stat`.
#[cfg(target_os = "linux")]
fn session_id(pid: u32) -> Option<u32> {
    let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
    // Fields after the command name: state, ppid, pgrp, session
    let fields = &stat[stat.rfind(')')? + 1..];
    fields.split_whitespace().nth(3)?.parse().ok()
}

#[cfg(target_os = "linux")]
fn leader_alive(pid: u32) -> bool {
    std::path::Path::new(&format!("/proc/{}", pid)).exists()
}

/// Without a process table to walk, only the shell's own process group is
/// reachable.
#[cfg(all(unix, not(target_os = "linux")))]
fn hang_up_session(leader: u32) -> usize {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    match i32::try_from(leader) {
        Ok(pgid) if killpg(Pid::from_raw(pgid), Signal::SIGHUP).is_ok() => 1,
        _ => 0,
    }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn leader_alive(pid: u32) -> bool {
    use nix::unistd::Pid;

    i32::try_from(pid)
        .map(|pid| nix::sys::signal::kill(Pid::from_raw(pid), None).is_ok())
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn hang_up_session(_leader: u32) -> usize {
    0
}

#[cfg(not(unix))]
fn leader_alive(_pid: u32) -> bool {
    true
}

/// Reads PTY output on a dedicated thread until EOF.
///
/// The reader owns a duplicate of the master, so it keeps blocking for as long
/// as any process holds the slave side open.
fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    event_tx: mpsc::Sender<BackendEvent>,
    pid: Option<u32>,
) -> Result<JoinHandle<()>, BackendError> {
    let handle = std::thread::Builder::new()
        .name("pty-reader".to_string())
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => {
                        tracing::debug!(pid = ?pid, "PTY EOF");
                        break;
                    }
                    Ok(n) => {
                        let chunk = Bytes::copy_from_slice(&buffer[..n]);
                        if event_tx.blocking_send(BackendEvent::Data(chunk)).is_err() {
                            tracing::trace!(pid = ?pid, "No receiver for PTY output");
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        // Linux reports EIO once the slave side is closed
                        tracing::debug!(pid = ?pid, error = %e, "PTY read ended");
                        break;
                    }
                }
            }
        })?;
    Ok(handle)
}

/// Waits for the shell to exit on a dedicated thread and reports its code.
fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    event_tx: mpsc::Sender<BackendEvent>,
    exited: Arc<AtomicBool>,
    pid: Option<u32>,
) -> Result<(), BackendError> {
    std::thread::Builder::new()
        .name("pty-waiter".to_string())
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => status.exit_code() as i32,
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for host shell");
                    -1
                }
            };
            exited.store(true, Ordering::SeqCst);
            tracing::info!(pid = ?pid, code, "Host shell exited");
            let _ = event_tx.blocking_send(BackendEvent::Exited { code });
        })?;
    Ok(())
}
