//! # ptybridge Protocol Library
//!
//! Wire protocol between a browser terminal and the ptybridge daemon.
//!
//! ## Overview
//!
//! A client opens one WebSocket per terminal. Its first message is an init
//! control message; after that it sends resize control messages or raw
//! terminal input. The daemon answers with the backend's raw output bytes and
//! nothing else: no acknowledgements, no framing.
//!
//! ```text
//! client                                   daemon
//!   │ {"type":"init","mode":"local",...}  ──▶ │ spawn shell
//!   │ ◀── raw prompt bytes                    │
//!   │ "ls\n"                              ──▶ │ write to pty
//!   │ {"type":"resize","cols":..}         ──▶ │ resize pty
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use bytes::Bytes;
//! use protocol::{classify, ControlMessage, Inbound};
//!
//! let inbound = classify(Bytes::from_static(br#"{"type":"resize","cols":100,"rows":30}"#));
//! assert!(matches!(inbound, Inbound::Control(ControlMessage::Resize(_))));
//!
//! let inbound = classify(Bytes::from_static(b"ls\n"));
//! assert_eq!(inbound, Inbound::Input(Bytes::from_static(b"ls\n")));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Control message definitions and payload classification
//! - [`framing`]: Which WebSocket frames may carry control messages, and how
//!   output is framed
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{FrameKind, FramingPolicy, OutputFrame, OutputFramer};
pub use messages::{
    classify, BackendTarget, ControlKind, ControlMessage, InitRequest, Inbound, Mode,
    TerminalSize, DEFAULT_COLS, DEFAULT_ROWS,
};
