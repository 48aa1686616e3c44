//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering every way a control message can be rejected.
///
/// None of these are fatal to a session: a rejected control message is
/// dropped and the connection carries on.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Failed to decode the control message body.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The `type` field names something other than a control message.
    #[error("unknown control type: {0}")]
    UnknownControlType(String),

    /// A field required by the control message is absent or empty.
    #[error("missing field: {0}")]
    MissingField(&'static str),

    /// A terminal dimension was zero.
    #[error("invalid {field}: {value} (must be a positive integer)")]
    InvalidDimension {
        /// Name of the offending field (`cols` or `rows`).
        field: &'static str,
        /// The value that was received.
        value: u16,
    },

    /// A terminal dimension was present but not an integer in range.
    #[error("invalid {field}: {value} (not a terminal dimension)")]
    MalformedDimension {
        /// Name of the offending field (`cols` or `rows`).
        field: &'static str,
        /// The JSON value that was received.
        value: String,
    },

    /// The container name cannot be handed to a container runtime.
    #[error("invalid container name: {0:?}")]
    InvalidContainerName(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ProtocolError::MissingField("containerName");
        assert_eq!(err.to_string(), "missing field: containerName");

        let err = ProtocolError::InvalidDimension {
            field: "cols",
            value: 0,
        };
        assert_eq!(err.to_string(), "invalid cols: 0 (must be a positive integer)");

        let err = ProtocolError::MalformedDimension {
            field: "rows",
            value: "\"abc\"".to_string(),
        };
        assert_eq!(err.to_string(), "invalid rows: \"abc\" (not a terminal dimension)");

        let err = ProtocolError::InvalidContainerName("-rm".to_string());
        assert_eq!(err.to_string(), "invalid container name: \"-rm\"");
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<u16>("\"eighty\"").unwrap_err();
        let err: ProtocolError = json_err.into();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
