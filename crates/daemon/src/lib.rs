//! # ptybridge Daemon Library
//!
//! This crate provides the server side of ptybridge: a WebSocket service that
//! pairs each client connection with an interactive process on the host.
//!
//! ## Overview
//!
//! Every connection becomes a session. The session's first message selects a
//! backend, after which bytes flow both ways untouched:
//!
//! - **Host shell**: the platform shell inside a pseudo-terminal
//! - **Container exec**: a command inside a running container, over pipes
//! - **Session relay**: handshake, byte relay and teardown per connection
//! - **Orchestrator**: listener, session registry and coordinated shutdown
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      Orchestrator                        │
//! ├──────────────────────────────────────────────────────────┤
//! │  ┌──────────────┐   ┌──────────────────────────────────┐ │
//! │  │   Listener   │──▶│  Session (one task per client)   │ │
//! │  └──────────────┘   │   state machine + byte relay     │ │
//! │  ┌──────────────┐   └────────────────┬─────────────────┘ │
//! │  │   Session    │                    │                   │
//! │  │   Registry   │           ┌────────▼────────┐          │
//! │  └──────────────┘           │     Backend     │          │
//! │                             │ HostShell | Exec│          │
//! │                             └─────────────────┘          │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::{Config, Orchestrator, ShutdownOutcome};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = Orchestrator::new(config);
//!     let addr = orchestrator.start().await?;
//!     println!("listening on ws://{}", addr);
//!
//!     // Wait for a shutdown signal...
//!
//!     if let ShutdownOutcome::Forced { remaining } = orchestrator.shutdown().await {
//!         eprintln!("{} sessions did not close in time", remaining);
//!         std::process::exit(1);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`backend`]: Host shell and container exec processes
//! - [`session`]: Session state machine, relay and registry
//! - [`server`]: WebSocket listener
//! - [`orchestrator`]: Main daemon coordinator

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

// Re-export config types for convenience
pub use config::Config;

// Re-export backend types for convenience
pub use backend::{Backend, BackendError, BackendEvent, BackendKind};

// Re-export session types for convenience
pub use session::{SessionEnd, SessionError, SessionId, SessionInfo, SessionState};

// Re-export orchestrator types for convenience
pub use orchestrator::{Orchestrator, OrchestratorEvent, OrchestratorState, ShutdownOutcome};
