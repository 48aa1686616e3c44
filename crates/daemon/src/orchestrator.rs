//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `Orchestrator` that owns the listener, the session
//! registry and the shutdown sequence. It replaces any process-global state:
//! everything a running daemon needs hangs off one orchestrator value with
//! explicit [`Orchestrator::start`] and [`Orchestrator::shutdown`] entry points.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use tokio::sync::{broadcast, OnceCell, RwLock, Semaphore};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::server::{Listener, ServerContext};
use crate::session::{SessionId, SessionInfo, SessionRegistry, SessionSettings};

/// Capacity of the orchestrator event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Binding the listener.
    Starting,
    /// Running and accepting connections.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// A client connected and a session was registered.
    SessionOpened {
        session_id: SessionId,
        peer: SocketAddr,
    },
    /// A session ended and was deregistered.
    SessionClosed { session_id: SessionId, reason: String },
    /// A client was turned away because the session limit was reached.
    SessionRefused { peer: SocketAddr },
    /// Error occurred.
    Error { message: String },
}

/// How a shutdown finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every session closed within the grace period.
    Graceful,
    /// The grace period ran out with sessions still open.
    Forced {
        /// Sessions still registered when the grace period ended.
        remaining: usize,
    },
}

/// Daemon orchestrator that manages all subsystems.
pub struct Orchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Registry of live sessions.
    registry: Arc<SessionRegistry>,
    /// Settings handed to every session.
    settings: Arc<SessionSettings>,
    /// Tracks the accept loop and every connection task.
    tracker: TaskTracker,
    /// Address the listener is bound to, once started.
    local_addr: OnceLock<SocketAddr>,
    /// Cancellation token that stops the accept loop.
    shutdown_token: CancellationToken,
    /// Result of the one shutdown sequence.
    shutdown_outcome: OnceCell<ShutdownOutcome>,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl Orchestrator {
    /// Creates a new orchestrator. Nothing is bound until [`Orchestrator::start`].
    pub fn new(config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let settings = Arc::new(SessionSettings::from_config(&config));

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            registry: Arc::new(SessionRegistry::new()),
            settings,
            tracker: TaskTracker::new(),
            local_addr: OnceLock::new(),
            shutdown_token: CancellationToken::new(),
            shutdown_outcome: OnceCell::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration the orchestrator was built with.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the bound address once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Returns a snapshot of every live session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.registry.snapshot()
    }

    /// Returns the number of live sessions.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// A bind failure is returned as an error and leaves the orchestrator
    /// stopped.
    pub async fn start(&self) -> Result<SocketAddr> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped || self.shutdown_token.is_cancelled() {
                anyhow::bail!("Orchestrator cannot be started from state {:?}", *state);
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        let addr = self.config.server.listen_addr();
        info!("Starting ptybridge on {}...", addr);

        let listener = match Listener::bind(&addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.set_state(OrchestratorState::Stopped).await;
                return Err(e).with_context(|| format!("Failed to bind {}", addr));
            }
        };
        let local_addr = listener.local_addr();
        let _ = self.local_addr.set(local_addr);

        let ctx = ServerContext {
            registry: Arc::clone(&self.registry),
            settings: Arc::clone(&self.settings),
            permits: Arc::new(Semaphore::new(self.config.server.max_sessions)),
            max_sessions: self.config.server.max_sessions,
            events: self.event_tx.clone(),
            tracker: self.tracker.clone(),
        };
        self.tracker
            .spawn(listener.serve(ctx, self.shutdown_token.clone()));

        self.set_state(OrchestratorState::Running).await;
        info!(
            addr = %local_addr,
            max_sessions = self.config.server.max_sessions,
            framing = %self.settings.framing,
            "ptybridge started"
        );
        Ok(local_addr)
    }

    /// Stops accepting, terminates every session and waits up to the grace
    /// period for them to close.
    ///
    /// Concurrent and repeated calls share one shutdown sequence and all
    /// receive its outcome.
    pub async fn shutdown(&self) -> ShutdownOutcome {
        *self
            .shutdown_outcome
            .get_or_init(|| self.run_shutdown())
            .await
    }

    async fn run_shutdown(&self) -> ShutdownOutcome {
        self.set_state(OrchestratorState::ShuttingDown).await;
        info!("Shutting down ptybridge...");

        // Stop accepting before terminating sessions so no new ones slip in
        self.shutdown_token.cancel();
        let requested = self.registry.cancel_all();
        debug!(sessions = requested, "Requested termination of all sessions");

        self.tracker.close();
        let grace = self.config.shutdown.grace_period();

        let outcome = match timeout(grace, self.tracker.wait()).await {
            Ok(()) => ShutdownOutcome::Graceful,
            Err(_) => ShutdownOutcome::Forced {
                remaining: self.registry.len(),
            },
        };

        match outcome {
            ShutdownOutcome::Graceful => info!("All sessions closed"),
            ShutdownOutcome::Forced { remaining } => warn!(
                remaining,
                grace_secs = grace.as_secs(),
                "Sessions still open after grace period"
            ),
        }

        self.set_state(OrchestratorState::Stopped).await;
        outcome
    }

    async fn set_state(&self, new_state: OrchestratorState) {
        {
            let mut state = self.state.write().await;
            *state = new_state;
        }
        self.emit_event(OrchestratorEvent::StateChanged(new_state));
    }

    /// Emits an orchestrator event.
    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
