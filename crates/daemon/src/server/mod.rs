//! WebSocket listener.
//!
//! Binds the daemon's single network endpoint, performs the WebSocket
//! handshake for every inbound TCP connection and hands each one to a
//! [`Session`](crate::session::Session) running on its own task.

mod listener;

pub(crate) use listener::ServerContext;
pub use listener::{Listener, HANDSHAKE_TIMEOUT};
