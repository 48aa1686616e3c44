//! TCP listener and per-connection setup.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::time::timeout;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::orchestrator::OrchestratorEvent;
use crate::session::{Session, SessionRegistry, SessionSettings};

/// How long a client gets to complete the WebSocket handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept, which usually means descriptor exhaustion.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Everything a connection task needs.
#[derive(Clone)]
pub(crate) struct ServerContext {
    /// Registry of live sessions.
    pub(crate) registry: Arc<SessionRegistry>,
    /// Settings shared by every session.
    pub(crate) settings: Arc<SessionSettings>,
    /// One permit per allowed concurrent session.
    pub(crate) permits: Arc<Semaphore>,
    /// Configured session limit, for logging.
    pub(crate) max_sessions: usize,
    /// Orchestrator event sender.
    pub(crate) events: broadcast::Sender<OrchestratorEvent>,
    /// Tracks connection tasks so shutdown can wait for them.
    pub(crate) tracker: TaskTracker,
}

/// A bound WebSocket listener.
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Listener {
    /// Binds the listener to `addr` (`host:port`).
    ///
    /// Port `0` picks a free port; see [`Listener::local_addr`].
    pub async fn bind(addr: &str) -> Result<Self, io::Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Returns the address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accepts connections until `shutdown` is cancelled.
    pub(crate) async fn serve(self, ctx: ServerContext, shutdown: CancellationToken) {
        tracing::info!(addr = %self.local_addr, "Listening for WebSocket connections");

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(error = %e, "TCP accept error");
                    let _ = ctx.events.send(OrchestratorEvent::Error {
                        message: format!("accept failed: {}", e),
                    });
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if let Err(e) = stream.set_nodelay(true) {
                tracing::debug!(peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let permit = Arc::clone(&ctx.permits).try_acquire_owned().ok();
            ctx.tracker.spawn(handle_connection(
                stream,
                peer,
                permit,
                ctx.clone(),
                shutdown.clone(),
            ));
        }

        tracing::info!(addr = %self.local_addr, "Stopped accepting connections");
    }
}

/// Upgrades one TCP connection and runs its session.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    permit: Option<OwnedSemaphorePermit>,
    ctx: ServerContext,
    shutdown: CancellationToken,
) {
    let handshake = tokio::select! {
        _ = shutdown.cancelled() => return,
        result = timeout(HANDSHAKE_TIMEOUT, accept_async(stream)) => result,
    };

    let mut ws = match handshake {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            tracing::warn!(peer = %peer, error = %e, "WebSocket handshake failed");
            return;
        }
        Err(_) => {
            tracing::warn!(peer = %peer, "WebSocket handshake timed out");
            return;
        }
    };

    let Some(permit) = permit else {
        tracing::warn!(peer = %peer, limit = ctx.max_sessions, "Session limit reached, refusing connection");
        let _ = ctx.events.send(OrchestratorEvent::SessionRefused { peer });
        let frame = CloseFrame {
            code: CloseCode::Again,
            reason: "session limit reached".into(),
        };
        if let Err(e) = ws.close(Some(frame)).await {
            tracing::debug!(peer = %peer, error = %e, "Failed to close refused connection");
        }
        return;
    };

    let registration = ctx.registry.register(Some(peer));
    let session_id = registration.handle().id().clone();
    let _ = ctx.events.send(OrchestratorEvent::SessionOpened {
        session_id: session_id.clone(),
        peer,
    });

    let reason = match Session::new(ws, registration, ctx.settings).run().await {
        Ok(end) => end.to_string(),
        Err(e) => e.to_string(),
    };
    drop(permit);

    let _ = ctx.events.send(OrchestratorEvent::SessionClosed { session_id, reason });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[tokio::test]
    async fn test_bind_port_in_use_fails() {
        let first = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = first.local_addr().to_string();

        assert!(Listener::bind(&addr).await.is_err());
    }

    #[tokio::test]
    async fn test_bind_invalid_address_fails() {
        assert!(Listener::bind("not an address").await.is_err());
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr();
        let (events, _) = broadcast::channel(16);
        let ctx = ServerContext {
            registry: Arc::new(SessionRegistry::new()),
            settings: Arc::new(SessionSettings::default()),
            permits: Arc::new(Semaphore::new(1)),
            max_sessions: 1,
            events,
            tracker: TaskTracker::new(),
        };
        let shutdown = CancellationToken::new();

        let serve = tokio::spawn(listener.serve(ctx, shutdown.clone()));
        shutdown.cancel();
        timeout(Duration::from_secs(1), serve).await.unwrap().unwrap();

        // The port is released once the loop has returned
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
