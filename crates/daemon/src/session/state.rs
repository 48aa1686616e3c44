//! Session state machine.
//!
//! Pure bookkeeping for the handshake-then-relay lifecycle. The machine never
//! touches the connection or the backend; it turns each classified inbound
//! message into an [`Action`] that the relay carries out.

use bytes::Bytes;
use protocol::{ControlMessage, InitRequest, Inbound, TerminalSize};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection accepted, nothing processed yet.
    New,
    /// Waiting for the first well-formed init.
    AwaitingInit,
    /// Backend running, bytes relayed in both directions.
    Active,
    /// Tearing down the backend and the connection.
    Closing,
    /// Fully torn down.
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::New => write!(f, "new"),
            SessionState::AwaitingInit => write!(f, "awaiting-init"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closing => write!(f, "closing"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// What the relay should do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Spawn the requested backend, then call [`SessionMachine::activate`].
    Spawn(InitRequest),
    /// Write these bytes to the backend.
    Write(Bytes),
    /// Resize the backend terminal.
    Resize(TerminalSize),
    /// Drop the message.
    Discard(&'static str),
}

/// Tracks one session's state and negotiated terminal size.
#[derive(Debug)]
pub struct SessionMachine {
    state: SessionState,
    size: Option<TerminalSize>,
}

impl SessionMachine {
    /// Creates a machine in [`SessionState::New`].
    pub fn new() -> Self {
        Self {
            state: SessionState::New,
            size: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Negotiated terminal size, once active.
    pub fn size(&self) -> Option<TerminalSize> {
        self.size
    }

    /// Marks the connection as accepted.
    pub fn accept(&mut self) {
        if self.state == SessionState::New {
            self.state = SessionState::AwaitingInit;
        }
    }

    /// Decides what to do with one inbound message.
    pub fn handle(&mut self, inbound: Inbound) -> Action {
        match (self.state, inbound) {
            (SessionState::AwaitingInit, Inbound::Control(ControlMessage::Init(init))) => {
                Action::Spawn(init)
            }
            (SessionState::AwaitingInit, _) => Action::Discard("waiting for init"),

            (SessionState::Active, Inbound::Control(ControlMessage::Init(_))) => {
                Action::Discard("session already initialized")
            }
            (SessionState::Active, Inbound::Control(ControlMessage::Resize(size))) => {
                self.size = Some(size);
                Action::Resize(size)
            }
            (SessionState::Active, Inbound::MalformedControl { .. }) => {
                Action::Discard("malformed control message")
            }
            (SessionState::Active, Inbound::Input(data)) => Action::Write(data),

            (SessionState::New, _) => Action::Discard("connection not accepted yet"),
            (SessionState::Closing | SessionState::Closed, _) => {
                Action::Discard("session closing")
            }
        }
    }

    /// Records a successful spawn. Only the first call has any effect.
    pub fn activate(&mut self, size: TerminalSize) -> bool {
        if self.state != SessionState::AwaitingInit {
            return false;
        }
        self.state = SessionState::Active;
        self.size = Some(size);
        true
    }

    /// Starts teardown.
    pub fn begin_close(&mut self) {
        if self.state != SessionState::Closed {
            self.state = SessionState::Closing;
        }
    }

    /// Finishes teardown.
    pub fn finish(&mut self) {
        self.state = SessionState::Closed;
    }
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{classify, BackendTarget};

    fn inbound(s: &str) -> Inbound {
        classify(Bytes::copy_from_slice(s.as_bytes()))
    }

    fn init_local() -> Inbound {
        inbound(r#"{"type":"init","mode":"local","cols":80,"rows":24}"#)
    }

    fn active_machine() -> SessionMachine {
        let mut machine = SessionMachine::new();
        machine.accept();
        assert!(matches!(machine.handle(init_local()), Action::Spawn(_)));
        assert!(machine.activate(TerminalSize::default()));
        machine
    }

    #[test]
    fn test_starts_new_then_awaits_init() {
        let mut machine = SessionMachine::new();
        assert_eq!(machine.state(), SessionState::New);
        assert_eq!(machine.size(), None);

        machine.accept();
        assert_eq!(machine.state(), SessionState::AwaitingInit);
    }

    #[test]
    fn test_init_activates_exactly_once() {
        let mut machine = SessionMachine::new();
        machine.accept();

        match machine.handle(init_local()) {
            Action::Spawn(init) => {
                assert_eq!(init.target, BackendTarget::Local);
                assert!(machine.activate(init.size));
            }
            other => panic!("expected spawn, got {:?}", other),
        }
        assert_eq!(machine.state(), SessionState::Active);

        // A second init is a no-op
        let second = inbound(r#"{"type":"init","mode":"container","containerName":"db"}"#);
        assert!(matches!(machine.handle(second), Action::Discard(_)));
        assert!(!machine.activate(TerminalSize::new(10, 10).unwrap()));
        assert_eq!(machine.state(), SessionState::Active);
        assert_eq!(machine.size(), Some(TerminalSize::default()));
    }

    #[test]
    fn test_messages_before_init_are_discarded() {
        let mut machine = SessionMachine::new();
        machine.accept();

        for payload in [
            "ls\n",
            "{not valid json",
            r#"{"type":"resize","cols":100,"rows":30}"#,
            r#"{"type":"init","mode":"container"}"#,
        ] {
            assert!(
                matches!(machine.handle(inbound(payload)), Action::Discard(_)),
                "{:?} should be discarded",
                payload
            );
        }
        assert_eq!(machine.state(), SessionState::AwaitingInit);
        assert_eq!(machine.size(), None);
    }

    #[test]
    fn test_resize_while_active_updates_size() {
        let mut machine = active_machine();

        let action = machine.handle(inbound(r#"{"type":"resize","cols":132,"rows":43}"#));
        let size = TerminalSize::new(132, 43).unwrap();
        assert_eq!(action, Action::Resize(size));
        assert_eq!(machine.size(), Some(size));
    }

    #[test]
    fn test_malformed_resize_is_ignored() {
        let mut machine = active_machine();

        let action = machine.handle(inbound(r#"{"type":"resize","cols":0,"rows":43}"#));
        assert!(matches!(action, Action::Discard(_)));
        assert_eq!(machine.size(), Some(TerminalSize::default()));
    }

    #[test]
    fn test_resize_with_unusable_dimensions_is_written() {
        let mut machine = active_machine();

        let payload = r#"{"type":"resize","cols":"abc","rows":43}"#;
        assert_eq!(
            machine.handle(inbound(payload)),
            Action::Write(Bytes::copy_from_slice(payload.as_bytes()))
        );
        assert_eq!(machine.size(), Some(TerminalSize::default()));
    }

    #[test]
    fn test_init_with_negative_dimension_activates() {
        let mut machine = SessionMachine::new();
        machine.accept();

        match machine.handle(inbound(r#"{"type":"init","mode":"local","cols":-1,"rows":30}"#)) {
            Action::Spawn(init) => assert_eq!(init.size, TerminalSize::new(80, 30).unwrap()),
            other => panic!("expected spawn, got {:?}", other),
        }
    }

    #[test]
    fn test_input_is_forwarded_verbatim() {
        let mut machine = active_machine();

        assert_eq!(
            machine.handle(inbound("ls\n")),
            Action::Write(Bytes::from_static(b"ls\n"))
        );
        assert_eq!(
            machine.handle(inbound("{not valid json")),
            Action::Write(Bytes::from_static(b"{not valid json"))
        );
        assert_eq!(
            machine.handle(inbound(r#"{"type":"exec"}"#)),
            Action::Write(Bytes::from_static(br#"{"type":"exec"}"#))
        );
    }

    #[test]
    fn test_input_order_preserved() {
        let mut machine = active_machine();

        let writes: Vec<Bytes> = ["a", "b", r#"{"type":"resize","cols":90,"rows":20}"#, "c"]
            .into_iter()
            .filter_map(|p| match machine.handle(inbound(p)) {
                Action::Write(data) => Some(data),
                _ => None,
            })
            .collect();

        assert_eq!(
            writes,
            vec![
                Bytes::from_static(b"a"),
                Bytes::from_static(b"b"),
                Bytes::from_static(b"c")
            ]
        );
    }

    #[test]
    fn test_closing_discards_everything() {
        let mut machine = active_machine();

        machine.begin_close();
        assert_eq!(machine.state(), SessionState::Closing);
        assert!(matches!(machine.handle(inbound("ls\n")), Action::Discard(_)));

        machine.finish();
        assert_eq!(machine.state(), SessionState::Closed);

        machine.begin_close();
        assert_eq!(machine.state(), SessionState::Closed);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::AwaitingInit.to_string(), "awaiting-init");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}
