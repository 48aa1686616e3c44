//! Connection relay.
//!
//! Drives one session from accept to close: waits for the init message,
//! spawns the backend, then relays bytes both ways until the peer closes, the
//! backend exits, or the session is cancelled.
//!
//! Input is handed to a dedicated writer task through a short ordered queue,
//! so a backend that is slow to accept input never stalls delivery of its
//! output. While the queue is full the relay stops reading from the client and
//! the transport pushes back.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use protocol::{FrameKind, FramingPolicy, OutputFrame, OutputFramer};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use super::registry::{Registration, SessionHandle};
use super::state::{Action, SessionMachine};
use super::{SessionError, SessionId};
use crate::backend::{Backend, BackendError, BackendEvent};
use crate::config::{Config, ContainerConfig, ShellConfig};

/// How long output produced before a backend exit may keep arriving.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// How long to wait for a killed backend to be reaped.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Input frames queued for the writer task before client reads pause.
const INPUT_QUEUE_CAPACITY: usize = 32;

type WsSink<S> = SplitSink<WebSocketStream<S>, Message>;
type WsStream<S> = SplitStream<WebSocketStream<S>>;

/// Settings shared by every session.
#[derive(Debug, Clone, Default)]
pub struct SessionSettings {
    /// Host shell backend settings.
    pub shell: ShellConfig,
    /// Container exec backend settings.
    pub container: ContainerConfig,
    /// Which inbound frames may carry control messages.
    pub framing: FramingPolicy,
}

impl SessionSettings {
    /// Extracts the session settings from the daemon configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            shell: config.shell.clone(),
            container: config.container.clone(),
            framing: config.protocol.framing,
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The client closed the connection.
    PeerClosed,
    /// The backend process exited.
    BackendExited {
        /// Exit code, when it was observed.
        code: Option<i32>,
    },
    /// The session was cancelled, usually by shutdown.
    Cancelled,
}

impl std::fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEnd::PeerClosed => write!(f, "peer closed"),
            SessionEnd::BackendExited { code: Some(code) } => {
                write!(f, "backend exited with code {}", code)
            }
            SessionEnd::BackendExited { code: None } => write!(f, "backend exited"),
            SessionEnd::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// An inbound WebSocket message, reduced to what the session cares about.
enum Incoming {
    Data(FrameKind, Bytes),
    Close,
    /// Ping, pong and raw frames. The transport answers pings itself.
    Transport,
}

impl From<Message> for Incoming {
    fn from(message: Message) -> Self {
        match message {
            Message::Text(text) => Incoming::Data(FrameKind::Text, Bytes::from(text)),
            Message::Binary(data) => Incoming::Data(FrameKind::Binary, Bytes::from(data)),
            Message::Close(_) => Incoming::Close,
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Incoming::Transport,
        }
    }
}

fn output_message(frame: OutputFrame) -> Message {
    match frame {
        OutputFrame::Text(text) => Message::Text(text),
        OutputFrame::Binary(data) => Message::Binary(data.to_vec()),
    }
}

enum Handshake {
    Ready {
        backend: Backend,
        events: mpsc::Receiver<BackendEvent>,
    },
    Ended(SessionEnd),
}

/// One client connection and, once initialized, its backend.
pub struct Session<S> {
    ws: WebSocketStream<S>,
    registration: Registration,
    settings: Arc<SessionSettings>,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Creates a session for an accepted WebSocket connection.
    pub fn new(
        ws: WebSocketStream<S>,
        registration: Registration,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            ws,
            registration,
            settings,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        self.registration.handle().id()
    }

    /// Runs the session to completion.
    ///
    /// The backend is gone, the connection closed and the session
    /// deregistered by the time this returns.
    pub async fn run(self) -> Result<SessionEnd, SessionError> {
        let Session {
            ws,
            registration,
            settings,
        } = self;
        let handle = Arc::clone(registration.handle());
        let (mut sink, mut stream) = ws.split();
        let mut machine = SessionMachine::new();

        machine.accept();
        handle.set_state(machine.state());
        tracing::info!(session_id = %handle.id(), peer = ?handle.peer(), "Session opened");

        let result =
            match handshake(&handle, &settings, &mut machine, &mut sink, &mut stream).await {
                Ok(Handshake::Ready { backend, events }) => {
                    relay(
                        &handle,
                        &settings,
                        &mut machine,
                        backend,
                        events,
                        &mut sink,
                        &mut stream,
                    )
                    .await
                }
                Ok(Handshake::Ended(end)) => Ok(end),
                Err(e) => Err(e),
            };

        machine.begin_close();
        handle.set_state(machine.state());

        if let Err(e) = sink.close().await {
            tracing::trace!(session_id = %handle.id(), error = %e, "Connection already closed");
        }

        machine.finish();
        handle.set_state(machine.state());

        match &result {
            Ok(end) => tracing::info!(session_id = %handle.id(), reason = %end, "Session closed"),
            Err(e) => tracing::warn!(session_id = %handle.id(), error = %e, "Session failed"),
        }

        drop(registration);
        result
    }
}

/// Waits for a well-formed init and spawns the backend it asks for.
async fn handshake<S>(
    handle: &SessionHandle,
    settings: &SessionSettings,
    machine: &mut SessionMachine,
    sink: &mut WsSink<S>,
    stream: &mut WsStream<S>,
) -> Result<Handshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cancel = handle.cancel_token().clone();

    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => return Ok(Handshake::Ended(SessionEnd::Cancelled)),
            message = stream.next() => message,
        };

        let (kind, payload) = match message {
            None => return Ok(Handshake::Ended(SessionEnd::PeerClosed)),
            Some(Err(e)) => return Err(e.into()),
            Some(Ok(message)) => match Incoming::from(message) {
                Incoming::Data(kind, payload) => (kind, payload),
                Incoming::Close => return Ok(Handshake::Ended(SessionEnd::PeerClosed)),
                Incoming::Transport => continue,
            },
        };

        let init = match machine.handle(settings.framing.classify(kind, payload)) {
            Action::Spawn(init) => init,
            other => {
                tracing::debug!(session_id = %handle.id(), action = ?other, "Discarded message before init");
                continue;
            }
        };

        let spawned = Backend::spawn(&init.target, init.size, &settings.shell, &settings.container);
        return match spawned {
            Ok((backend, events)) => {
                machine.activate(init.size);
                handle.set_backend(backend.kind(), backend.pid(), init.size);
                handle.set_state(machine.state());
                tracing::info!(
                    session_id = %handle.id(),
                    backend = %backend.kind(),
                    pid = ?backend.pid(),
                    size = %init.size,
                    "Backend started"
                );
                Ok(Handshake::Ready { backend, events })
            }
            Err(e) => {
                tracing::warn!(session_id = %handle.id(), error = %e, "Failed to start backend");
                let diagnostic = format!("ptybridge: {}\r\n", e);
                if let Err(send_err) = sink.send(Message::Text(diagnostic)).await {
                    tracing::debug!(session_id = %handle.id(), error = %send_err, "Could not deliver diagnostic");
                }
                Err(SessionError::Spawn(e))
            }
        };
    }
}

/// Relays bytes between the connection and the backend, then tears the
/// backend down.
async fn relay<S>(
    handle: &SessionHandle,
    settings: &SessionSettings,
    machine: &mut SessionMachine,
    backend: Backend,
    mut events: mpsc::Receiver<BackendEvent>,
    sink: &mut WsSink<S>,
    stream: &mut WsStream<S>,
) -> Result<SessionEnd, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let session_id = handle.id().clone();
    let cancel = handle.cancel_token().clone();
    let backend = Arc::new(backend);
    let mut framer = OutputFramer::new();

    let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_CAPACITY);
    let writer = tokio::spawn(write_input(
        Arc::clone(&backend),
        input_rx,
        session_id.clone(),
    ));

    let outcome = loop {
        tokio::select! {
            _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),

            event = events.recv() => match event {
                Some(BackendEvent::Data(chunk)) => {
                    if let Some(frame) = framer.push(&chunk) {
                        if let Err(e) = sink.send(output_message(frame)).await {
                            break Err(SessionError::from(e));
                        }
                    }
                }
                Some(BackendEvent::Exited { code }) => {
                    break Ok(SessionEnd::BackendExited { code: Some(code) });
                }
                None => break Ok(SessionEnd::BackendExited { code: None }),
            },

            // Only this task sends, so spare capacity here guarantees room
            message = stream.next(), if input_tx.capacity() > 0 => match message {
                None => break Ok(SessionEnd::PeerClosed),
                Some(Err(e)) => break Err(SessionError::from(e)),
                Some(Ok(message)) => match Incoming::from(message) {
                    Incoming::Close => break Ok(SessionEnd::PeerClosed),
                    Incoming::Transport => {}
                    Incoming::Data(kind, payload) => {
                        match machine.handle(settings.framing.classify(kind, payload)) {
                            Action::Write(data) => {
                                if input_tx.try_send(data).is_err() {
                                    tracing::debug!(session_id = %session_id, "Backend input closed, dropping input");
                                }
                            }
                            Action::Resize(size) => {
                                handle.set_size(size);
                                if !backend.supports_resize() {
                                    tracing::trace!(session_id = %session_id, size = %size, "Backend has no terminal, resize ignored");
                                } else if let Err(e) = backend.resize(size) {
                                    tracing::debug!(session_id = %session_id, error = %e, "Resize failed");
                                }
                            }
                            other => {
                                tracing::debug!(session_id = %session_id, action = ?other, "Discarded message");
                            }
                        }
                    }
                },
            },
        }
    };

    machine.begin_close();
    handle.set_state(machine.state());
    drop(input_tx);

    match &outcome {
        Ok(SessionEnd::BackendExited { .. }) => {
            // The exit can overtake output still queued by the reader
            let drained = timeout(DRAIN_TIMEOUT, async {
                while let Some(event) = events.recv().await {
                    if let BackendEvent::Data(chunk) = event {
                        if let Some(frame) = framer.push(&chunk) {
                            sink.send(output_message(frame)).await?;
                        }
                    }
                }
                Ok::<(), tokio_tungstenite::tungstenite::Error>(())
            })
            .await;
            match drained {
                Ok(Ok(())) => {
                    if let Some(frame) = framer.finish() {
                        let _ = sink.send(output_message(frame)).await;
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(session_id = %session_id, error = %e, "Connection lost while draining output");
                }
                Err(_) => {
                    tracing::debug!(session_id = %session_id, "Output still open after backend exit");
                }
            }
        }
        _ => {
            if let Err(e) = backend.kill() {
                tracing::warn!(session_id = %session_id, error = %e, "Failed to kill backend");
            }
            let reaped = timeout(KILL_TIMEOUT, async {
                while let Some(event) = events.recv().await {
                    if matches!(event, BackendEvent::Exited { .. }) {
                        return;
                    }
                }
            })
            .await;
            if reaped.is_err() {
                tracing::warn!(session_id = %session_id, pid = ?backend.pid(), "Backend did not exit after kill");
            }
        }
    }

    writer.abort();
    outcome
}

/// Writes queued input to the backend in arrival order.
async fn write_input(
    backend: Arc<Backend>,
    mut input: mpsc::Receiver<Bytes>,
    session_id: SessionId,
) {
    while let Some(data) = input.recv().await {
        match backend.write(data).await {
            Ok(()) => {}
            Err(BackendError::Exited) => break,
            Err(e) => {
                // Killing the backend turns the failure into a normal exit
                tracing::warn!(session_id = %session_id, error = %e, "Backend write failed");
                if let Err(e) = backend.kill() {
                    tracing::warn!(session_id = %session_id, error = %e, "Failed to kill backend");
                }
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::session::{SessionRegistry, SessionState};
    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;
    use tokio_tungstenite::tungstenite::protocol::Role;

    fn sh_settings() -> Arc<SessionSettings> {
        Arc::new(SessionSettings {
            shell: ShellConfig {
                program: "/bin/sh".to_string(),
                ..ShellConfig::default()
            },
            ..SessionSettings::default()
        })
    }

    /// Starts a session over an in-memory stream and returns the client end.
    async fn start_session(
        registry: &Arc<SessionRegistry>,
        settings: Arc<SessionSettings>,
    ) -> (
        WebSocketStream<DuplexStream>,
        JoinHandle<Result<SessionEnd, SessionError>>,
    ) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let server_ws = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
        let client_ws = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;

        let session = Session::new(server_ws, registry.register(None), settings);
        let task = tokio::spawn(session.run());
        (client_ws, task)
    }

    /// Reads output frames until `marker` shows up.
    async fn read_until(client: &mut WebSocketStream<DuplexStream>, marker: &str) -> String {
        let mut output = String::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(Ok(message)) = client.next().await {
                match message {
                    Message::Text(text) => output.push_str(&text),
                    Message::Binary(data) => output.push_str(&String::from_utf8_lossy(&data)),
                    _ => continue,
                }
                if output.contains(marker) {
                    break;
                }
            }
        })
        .await;
        output
    }

    async fn send_text(client: &mut WebSocketStream<DuplexStream>, text: &str) {
        client.send(Message::Text(text.to_string())).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_relays_shell_io() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, task) = start_session(&registry, sh_settings()).await;

        send_text(&mut client, r#"{"type":"init","mode":"local","cols":80,"rows":24}"#).await;
        send_text(&mut client, "echo relay_marker_$((6*7))\n").await;

        let output = read_until(&mut client, "relay_marker_42").await;
        assert!(output.contains("relay_marker_42"), "output: {:?}", output);

        let info = &registry.snapshot()[0];
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.backend, Some(crate::backend::BackendKind::HostShell));
        assert_eq!(info.size, Some(protocol::TerminalSize::default()));
        assert!(info.pid.is_some());

        client.close(None).await.unwrap();
        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end.unwrap(), SessionEnd::PeerClosed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_session_ignores_input_before_init() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, task) = start_session(&registry, sh_settings()).await;

        send_text(&mut client, "echo too_early\n").await;
        send_text(&mut client, r#"{"type":"resize","cols":100,"rows":30}"#).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let info = &registry.snapshot()[0];
        assert_eq!(info.state, SessionState::AwaitingInit);
        assert_eq!(info.size, None);
        assert_eq!(info.backend, None);

        client.close(None).await.unwrap();
        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end.unwrap(), SessionEnd::PeerClosed);
    }

    #[tokio::test]
    async fn test_session_closes_when_backend_exits() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, task) = start_session(&registry, sh_settings()).await;

        send_text(&mut client, r#"{"type":"init","mode":"local"}"#).await;
        send_text(&mut client, "echo last_words; exit 7\n").await;

        let output = read_until(&mut client, "last_words\r\n").await;
        assert!(output.contains("last_words"));

        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end.unwrap(), SessionEnd::BackendExited { code: Some(7) });

        // The client sees the close
        let closed = timeout(Duration::from_secs(5), async {
            loop {
                match client.next().await {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await
        .unwrap();
        assert!(closed);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_session_spawn_failure_sends_diagnostic() {
        let registry = Arc::new(SessionRegistry::new());
        let settings = Arc::new(SessionSettings {
            container: ContainerConfig {
                runtime: "/nonexistent/container-runtime".to_string(),
                ..ContainerConfig::default()
            },
            ..SessionSettings::default()
        });
        let (mut client, task) = start_session(&registry, settings).await;

        send_text(
            &mut client,
            r#"{"type":"init","mode":"container","containerName":"web"}"#,
        )
        .await;

        let output = read_until(&mut client, "\r\n").await;
        assert!(output.contains("/nonexistent/container-runtime"), "output: {:?}", output);

        let result = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(result, Err(SessionError::Spawn(_))));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_session_cancel_kills_backend() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, task) = start_session(&registry, sh_settings()).await;

        send_text(&mut client, r#"{"type":"init","mode":"local"}"#).await;
        send_text(&mut client, "echo ready_$((1+1))\n").await;
        read_until(&mut client, "ready_2").await;

        let pid = registry.snapshot()[0].pid.unwrap();
        registry.cancel_all();

        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end.unwrap(), SessionEnd::Cancelled);
        assert!(registry.is_empty());

        // The shell has been killed and reaped
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[tokio::test]
    async fn test_stalled_backend_pushes_back_on_client() {
        use std::os::unix::fs::PermissionsExt;

        // Stand-in runtime: `runtime exec -i <name> <command...>` runs the command here
        let dir = tempfile::TempDir::new().unwrap();
        let runtime = dir.path().join("fake-runtime");
        std::fs::write(&runtime, "#!/bin/sh\nshift 3\nexec \"$@\"\n").unwrap();
        std::fs::set_permissions(&runtime, std::fs::Permissions::from_mode(0o755)).unwrap();

        let registry = Arc::new(SessionRegistry::new());
        let settings = Arc::new(SessionSettings {
            container: ContainerConfig {
                runtime: runtime.to_string_lossy().into_owned(),
                command: vec!["sleep".to_string(), "30".to_string()],
            },
            ..SessionSettings::default()
        });
        let (mut client, task) = start_session(&registry, settings).await;

        send_text(
            &mut client,
            r#"{"type":"init","mode":"container","containerName":"web"}"#,
        )
        .await;
        timeout(Duration::from_secs(5), async {
            while registry.snapshot()[0].state != SessionState::Active {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        // The backend never reads stdin, so sending must stall well short of the flood
        let chunk = "x".repeat(1024 * 1024);
        let mut sent = 0usize;
        let flood = timeout(Duration::from_secs(2), async {
            for _ in 0..256 {
                client.send(Message::Text(chunk.clone())).await.unwrap();
                sent += 1;
            }
        })
        .await;
        assert!(flood.is_err(), "all frames were accepted");
        assert!(sent < 2 * INPUT_QUEUE_CAPACITY, "{} frames accepted", sent);

        let pid = registry.snapshot()[0].pid.unwrap();
        registry.cancel_all();

        let end = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert_eq!(end.unwrap(), SessionEnd::Cancelled);
        assert!(!std::path::Path::new(&format!("/proc/{}", pid)).exists());
    }

    #[tokio::test]
    async fn test_session_resize_updates_size() {
        let registry = Arc::new(SessionRegistry::new());
        let (mut client, task) = start_session(&registry, sh_settings()).await;

        send_text(&mut client, r#"{"type":"init","mode":"local","cols":80,"rows":24}"#).await;
        send_text(&mut client, r#"{"type":"resize","cols":120,"rows":40}"#).await;
        send_text(&mut client, "stty size\n").await;

        let output = read_until(&mut client, "40 120").await;
        assert!(output.contains("40 120"), "output: {:?}", output);
        assert_eq!(
            registry.snapshot()[0].size,
            protocol::TerminalSize::new(120, 40)
        );

        client.close(None).await.unwrap();
        let _ = timeout(Duration::from_secs(5), task).await;
    }

    #[test]
    fn test_session_end_display() {
        assert_eq!(SessionEnd::PeerClosed.to_string(), "peer closed");
        assert_eq!(
            SessionEnd::BackendExited { code: Some(3) }.to_string(),
            "backend exited with code 3"
        );
        assert_eq!(SessionEnd::Cancelled.to_string(), "cancelled");
    }
}
