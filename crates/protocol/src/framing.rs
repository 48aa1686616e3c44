//! Inbound frame policy.
//!
//! WebSocket messages arrive as text or binary frames. The framing policy
//! decides which frames are eligible to carry control messages:
//!
//! - [`FramingPolicy::Sniff`] treats both frame types alike and tries every
//!   payload as JSON. This is what the browser terminal client expects.
//! - [`FramingPolicy::BinaryData`] reserves binary frames for terminal data, so
//!   a client that sends keystrokes as binary frames can never have them
//!   mistaken for a control message. Text frames are still sniffed.
//!
//! Outbound, [`OutputFramer`] turns raw backend output into frames. Output is
//! sent as text frames so browser clients receive strings; a multi-byte UTF-8
//! sequence split across two reads is held back until it completes. Bytes that
//! can never be valid UTF-8 go out unchanged in a binary frame.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::messages::{classify, Inbound};

/// The WebSocket frame type a payload arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// A UTF-8 text frame.
    Text,
    /// A binary frame.
    Binary,
}

/// Which inbound frames may carry control messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FramingPolicy {
    /// Every frame is tried as a control message first.
    #[default]
    Sniff,
    /// Binary frames are always terminal input.
    BinaryData,
}

impl FramingPolicy {
    /// Classifies a payload according to this policy.
    pub fn classify(self, kind: FrameKind, payload: Bytes) -> Inbound {
        match (self, kind) {
            (FramingPolicy::BinaryData, FrameKind::Binary) => Inbound::Input(payload),
            _ => classify(payload),
        }
    }
}

impl std::fmt::Display for FramingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FramingPolicy::Sniff => write!(f, "sniff"),
            FramingPolicy::BinaryData => write!(f, "binary-data"),
        }
    }
}

/// One outbound WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFrame {
    /// Output that is valid UTF-8.
    Text(String),
    /// Output that is not valid UTF-8, passed through byte for byte.
    Binary(Bytes),
}

/// Frames backend output without altering its bytes or their order.
#[derive(Debug, Default)]
pub struct OutputFramer {
    /// Start of a UTF-8 sequence whose remaining bytes have not arrived yet.
    carry: Vec<u8>,
}

impl OutputFramer {
    /// Creates a framer with nothing carried over.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames the next chunk of output.
    ///
    /// Returns `None` when the whole chunk had to be carried over.
    pub fn push(&mut self, chunk: &[u8]) -> Option<OutputFrame> {
        let mut pending = std::mem::take(&mut self.carry);
        pending.extend_from_slice(chunk);

        match std::str::from_utf8(&pending).err() {
            None => {}
            // Truncated at the end: the rest of the sequence is still to come
            Some(e) if e.error_len().is_none() => {
                self.carry = pending.split_off(e.valid_up_to());
            }
            Some(_) => return Some(OutputFrame::Binary(Bytes::from(pending))),
        }

        if pending.is_empty() {
            return None;
        }
        match String::from_utf8(pending) {
            Ok(text) => Some(OutputFrame::Text(text)),
            Err(e) => Some(OutputFrame::Binary(Bytes::from(e.into_bytes()))),
        }
    }

    /// Flushes anything still carried over once output has ended.
    pub fn finish(&mut self) -> Option<OutputFrame> {
        if self.carry.is_empty() {
            return None;
        }
        Some(OutputFrame::Binary(Bytes::from(std::mem::take(
            &mut self.carry,
        ))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ControlMessage;

    const RESIZE: &[u8] = br#"{"type":"resize","cols":100,"rows":30}"#;

    #[test]
    fn test_sniff_classifies_both_frame_kinds() {
        let policy = FramingPolicy::Sniff;
        for kind in [FrameKind::Text, FrameKind::Binary] {
            let inbound = policy.classify(kind, Bytes::from_static(RESIZE));
            assert!(matches!(inbound, Inbound::Control(ControlMessage::Resize(_))));
        }
    }

    #[test]
    fn test_binary_data_keeps_binary_frames_as_input() {
        let policy = FramingPolicy::BinaryData;

        let inbound = policy.classify(FrameKind::Binary, Bytes::from_static(RESIZE));
        assert_eq!(inbound, Inbound::Input(Bytes::from_static(RESIZE)));

        let inbound = policy.classify(FrameKind::Text, Bytes::from_static(RESIZE));
        assert!(matches!(inbound, Inbound::Control(ControlMessage::Resize(_))));
    }

    #[test]
    fn test_default_is_sniff() {
        assert_eq!(FramingPolicy::default(), FramingPolicy::Sniff);
    }

    #[test]
    fn test_serde_names() {
        #[derive(Deserialize)]
        struct Wrapper {
            framing: FramingPolicy,
        }
        let w: Wrapper = serde_json::from_str(r#"{"framing":"binary-data"}"#).unwrap();
        assert_eq!(w.framing, FramingPolicy::BinaryData);
        assert_eq!(FramingPolicy::BinaryData.to_string(), "binary-data");
    }

    #[test]
    fn test_output_ascii_is_text() {
        let mut framer = OutputFramer::new();
        assert_eq!(
            framer.push(b"$ ls\r\n"),
            Some(OutputFrame::Text("$ ls\r\n".to_string()))
        );
        assert_eq!(framer.push(b""), None);
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_output_split_multibyte_is_carried() {
        let euro = "\u{20ac}".as_bytes();
        let mut framer = OutputFramer::new();

        let mut first = b"price: ".to_vec();
        first.extend_from_slice(&euro[..1]);
        assert_eq!(
            framer.push(&first),
            Some(OutputFrame::Text("price: ".to_string()))
        );
        assert_eq!(framer.push(&euro[1..2]), None);

        let mut last = euro[2..].to_vec();
        last.extend_from_slice(b"!");
        assert_eq!(
            framer.push(&last),
            Some(OutputFrame::Text("\u{20ac}!".to_string()))
        );
    }

    #[test]
    fn test_output_invalid_bytes_are_binary() {
        let mut framer = OutputFramer::new();
        assert_eq!(
            framer.push(&[b'a', 0xff, b'b']),
            Some(OutputFrame::Binary(Bytes::from_static(&[b'a', 0xff, b'b'])))
        );
        // Framing recovers on the next chunk
        assert_eq!(framer.push(b"ok"), Some(OutputFrame::Text("ok".to_string())));
    }

    #[test]
    fn test_output_unfinished_sequence_flushed_on_finish() {
        let mut framer = OutputFramer::new();
        assert_eq!(framer.push(&[0xe2, 0x82]), None);
        assert_eq!(
            framer.finish(),
            Some(OutputFrame::Binary(Bytes::from_static(&[0xe2, 0x82])))
        );
        assert_eq!(framer.finish(), None);
    }
}
