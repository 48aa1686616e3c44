//! Control message definitions for ptybridge.
//!
//! Control messages share the WebSocket with raw terminal input. Every inbound
//! payload is first tried as JSON; when it decodes to an object whose `type`
//! names a control message it is consumed as one, otherwise the payload is
//! terminal input and travels to the backend untouched.
//!
//! Input that happens to be a JSON object with `"type":"init"` or
//! `"type":"resize"` is therefore read as a control message. That ambiguity is
//! part of the wire protocol the browser client speaks.

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};

/// Terminal columns used when an init omits them or sends zero.
pub const DEFAULT_COLS: u16 = 80;

/// Terminal rows used when an init omits them or sends zero.
pub const DEFAULT_ROWS: u16 = 24;

/// Terminal dimensions in character cells. Both are always non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TerminalSize {
    cols: u16,
    rows: u16,
}

impl TerminalSize {
    /// Creates a size, returning `None` when either dimension is zero.
    pub fn new(cols: u16, rows: u16) -> Option<Self> {
        (cols > 0 && rows > 0).then_some(Self { cols, rows })
    }

    /// Width in columns.
    pub fn cols(&self) -> u16 {
        self.cols
    }

    /// Height in rows.
    pub fn rows(&self) -> u16 {
        self.rows
    }
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

impl std::fmt::Display for TerminalSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.cols, self.rows)
    }
}

/// Backend mode requested by an init message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// A shell on the host, inside a pseudo-terminal.
    Local,
    /// A command executed inside an already-running container.
    Container,
}

/// What an init message asks the session to spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendTarget {
    /// The host's default shell.
    Local,
    /// An interactive command inside the named container.
    Container {
        /// Container name or id, as understood by the container runtime.
        name: String,
    },
}

impl BackendTarget {
    /// Returns the wire mode for this target.
    pub fn mode(&self) -> Mode {
        match self {
            BackendTarget::Local => Mode::Local,
            BackendTarget::Container { .. } => Mode::Container,
        }
    }
}

/// A validated init request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitRequest {
    /// Backend to spawn.
    pub target: BackendTarget,
    /// Initial terminal size.
    pub size: TerminalSize,
}

/// The two kinds of control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Session setup.
    Init,
    /// Terminal size change.
    Resize,
}

impl ControlKind {
    /// Maps a wire `type` value to a control kind.
    pub fn from_type(value: &str) -> Option<Self> {
        match value {
            "init" => Some(ControlKind::Init),
            "resize" => Some(ControlKind::Resize),
            _ => None,
        }
    }

    /// The wire `type` value.
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlKind::Init => "init",
            ControlKind::Resize => "resize",
        }
    }
}

/// A well-formed control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    /// Spawn the backend. Only the first one per session takes effect.
    Init(InitRequest),
    /// Resize the backend's terminal.
    Resize(TerminalSize),
}

/// Control messages exactly as they appear on the wire.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum WireControl {
    Init {
        mode: Mode,
        #[serde(
            rename = "containerName",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        container_name: Option<String>,
        #[serde(
            default,
            deserialize_with = "lenient_dimension",
            skip_serializing_if = "Option::is_none"
        )]
        cols: Option<u16>,
        #[serde(
            default,
            deserialize_with = "lenient_dimension",
            skip_serializing_if = "Option::is_none"
        )]
        rows: Option<u16>,
    },
    Resize {
        #[serde(default)]
        cols: Option<Value>,
        #[serde(default)]
        rows: Option<Value>,
    },
}

impl ControlMessage {
    /// The kind of this message.
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlMessage::Init(_) => ControlKind::Init,
            ControlMessage::Resize(_) => ControlKind::Resize,
        }
    }

    /// Decodes a control message from a JSON value that has already been
    /// identified as carrying a control `type`.
    pub fn from_value(value: Value) -> Result<Self> {
        let wire: WireControl = serde_json::from_value(value)?;

        match wire {
            WireControl::Init {
                mode,
                container_name,
                cols,
                rows,
            } => {
                let target = match mode {
                    Mode::Local => BackendTarget::Local,
                    Mode::Container => {
                        let name = container_name
                            .filter(|name| !name.trim().is_empty())
                            .ok_or(ProtocolError::MissingField("containerName"))?;
                        validate_container_name(&name)?;
                        BackendTarget::Container { name }
                    }
                };

                // Zero, absent or unusable dimensions fall back to the defaults
                // one by one.
                let cols = cols.filter(|c| *c > 0).unwrap_or(DEFAULT_COLS);
                let rows = rows.filter(|r| *r > 0).unwrap_or(DEFAULT_ROWS);

                Ok(ControlMessage::Init(InitRequest {
                    target,
                    size: TerminalSize { cols, rows },
                }))
            }
            WireControl::Resize { cols, rows } => {
                let cols = require_dimension("cols", cols.as_ref())?;
                let rows = require_dimension("rows", rows.as_ref())?;
                Ok(ControlMessage::Resize(TerminalSize { cols, rows }))
            }
        }
    }

    /// Decodes a control message from raw bytes.
    pub fn from_json(payload: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(payload)?;
        let type_name = type_field(&value)
            .map(str::to_owned)
            .ok_or(ProtocolError::MissingField("type"))?;
        if ControlKind::from_type(&type_name).is_none() {
            return Err(ProtocolError::UnknownControlType(type_name));
        }
        Self::from_value(value)
    }

    /// Encodes this message in its wire form.
    pub fn to_json(&self) -> String {
        let wire = match self {
            ControlMessage::Init(init) => WireControl::Init {
                mode: init.target.mode(),
                container_name: match &init.target {
                    BackendTarget::Local => None,
                    BackendTarget::Container { name } => Some(name.clone()),
                },
                cols: Some(init.size.cols),
                rows: Some(init.size.rows),
            },
            ControlMessage::Resize(size) => WireControl::Resize {
                cols: Some(size.cols.into()),
                rows: Some(size.rows.into()),
            },
        };
        // Serializing a plain enum of strings and integers cannot fail.
        serde_json::to_string(&wire).unwrap_or_default()
    }
}

/// The result of classifying one inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A well-formed control message.
    Control(ControlMessage),
    /// A payload that claimed a control `type` but did not decode. It is
    /// consumed, never forwarded as input.
    ///
    /// A resize whose dimensions are present but not integers in range is
    /// not malformed control: it is classified as [`Inbound::Input`].
    MalformedControl {
        /// The claimed kind.
        kind: ControlKind,
        /// Why it was rejected.
        error: ProtocolError,
    },
    /// Literal terminal input, forwarded verbatim.
    Input(Bytes),
}

/// Classifies an inbound payload as control or terminal input.
pub fn classify(payload: Bytes) -> Inbound {
    let value: Value = match serde_json::from_slice(&payload) {
        Ok(value) => value,
        Err(_) => return Inbound::Input(payload),
    };

    let Some(kind) = type_field(&value).and_then(ControlKind::from_type) else {
        return Inbound::Input(payload);
    };

    match ControlMessage::from_value(value) {
        Ok(message) => Inbound::Control(message),
        Err(ProtocolError::MalformedDimension { .. }) if kind == ControlKind::Resize => {
            Inbound::Input(payload)
        }
        Err(error) => Inbound::MalformedControl { kind, error },
    }
}

fn type_field(value: &Value) -> Option<&str> {
    value.as_object()?.get("type")?.as_str()
}

fn require_dimension(field: &'static str, value: Option<&Value>) -> Result<u16> {
    let value = match value {
        None | Some(Value::Null) => return Err(ProtocolError::MissingField(field)),
        Some(value) => value,
    };
    match value.as_u64().map(u16::try_from) {
        Some(Ok(0)) => Err(ProtocolError::InvalidDimension { field, value: 0 }),
        Some(Ok(v)) => Ok(v),
        _ => Err(ProtocolError::MalformedDimension {
            field,
            value: value.to_string(),
        }),
    }
}

/// Reads an init dimension, treating anything but an integer in `u16` range
/// as absent.
fn lenient_dimension<'de, D>(deserializer: D) -> std::result::Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_u64)
        .and_then(|v| u16::try_from(v).ok()))
}

fn validate_container_name(name: &str) -> Result<()> {
    if name.starts_with('-') || name.chars().any(|c| c.is_control() || c.is_whitespace()) {
        return Err(ProtocolError::InvalidContainerName(name.to_string()));
    }
    Ok(())
}
