//! Session management module.
//!
//! A session pairs one WebSocket connection with one backend process for the
//! whole lifetime of both. This module provides the lifecycle state machine,
//! the relay that drives a connection, and the registry of live sessions.

pub mod registry;
pub mod relay;
pub mod state;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use crate::backend::BackendError;

pub use registry::{Registration, SessionHandle, SessionInfo, SessionRegistry, SessionStatus};
pub use relay::{Session, SessionEnd, SessionSettings};
pub use state::{Action, SessionMachine, SessionState};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that end a session abnormally.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The requested backend could not be started.
    #[error("backend failed to start: {0}")]
    Spawn(#[source] BackendError),

    /// The WebSocket connection failed.
    #[error("WebSocket error: {0}")]
    Transport(#[from] tungstenite::Error),
}
