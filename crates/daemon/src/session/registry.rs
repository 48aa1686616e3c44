//! Registry of live sessions.
//!
//! The registry is the only structure shared between sessions. It is touched
//! when a session registers, when it deregisters, and when the orchestrator
//! iterates it for shutdown or introspection. Per-session I/O never goes
//! through it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use protocol::TerminalSize;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::state::SessionState;
use super::SessionId;
use crate::backend::BackendKind;

/// Fields of a session that change over its lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    /// Lifecycle state.
    pub state: SessionState,
    /// Backend variant, once spawned.
    pub backend: Option<BackendKind>,
    /// Negotiated terminal size, once active.
    pub size: Option<TerminalSize>,
    /// Backend process ID, once spawned.
    pub pid: Option<u32>,
}

/// A point-in-time view of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Unique session identifier.
    pub id: SessionId,
    /// Lifecycle state.
    pub state: SessionState,
    /// Backend variant, once spawned.
    pub backend: Option<BackendKind>,
    /// Negotiated terminal size, once active.
    pub size: Option<TerminalSize>,
    /// Backend process ID, once spawned.
    pub pid: Option<u32>,
    /// Remote address of the client.
    pub peer: Option<SocketAddr>,
    /// When the connection was accepted.
    pub created_at: SystemTime,
}

/// Registry entry for one live session.
#[derive(Debug)]
pub struct SessionHandle {
    id: SessionId,
    peer: Option<SocketAddr>,
    created_at: SystemTime,
    cancel: CancellationToken,
    status: watch::Sender<SessionStatus>,
}

impl SessionHandle {
    fn new(peer: Option<SocketAddr>, cancel: CancellationToken) -> Self {
        let (status, _) = watch::channel(SessionStatus {
            state: SessionState::New,
            backend: None,
            size: None,
            pid: None,
        });
        Self {
            id: Uuid::new_v4().to_string(),
            peer,
            created_at: SystemTime::now(),
            cancel,
            status,
        }
    }

    /// Returns the session ID.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Returns the client's address.
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Token cancelled when the session is asked to terminate.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Asks the session to terminate.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns the current status.
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// Subscribes to status changes.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    /// Updates the lifecycle state.
    pub fn set_state(&self, state: SessionState) {
        self.status.send_modify(|status| status.state = state);
    }

    /// Records the spawned backend.
    pub fn set_backend(&self, kind: BackendKind, pid: Option<u32>, size: TerminalSize) {
        self.status.send_modify(|status| {
            status.backend = Some(kind);
            status.pid = pid;
            status.size = Some(size);
        });
    }

    /// Records a new negotiated size.
    pub fn set_size(&self, size: TerminalSize) {
        self.status.send_modify(|status| status.size = Some(size));
    }

    /// Returns a snapshot of this session.
    pub fn info(&self) -> SessionInfo {
        let status = self.status();
        SessionInfo {
            id: self.id.clone(),
            state: status.state,
            backend: status.backend,
            size: status.size,
            pid: status.pid,
            peer: self.peer,
            created_at: self.created_at,
        }
    }
}

/// Map of session ID to live session.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<SessionHandle>>,
    /// Parent of every session's cancel token.
    shutdown: CancellationToken,
    /// Notified whenever a session is removed.
    removed: Notify,
}

impl SessionRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            shutdown: CancellationToken::new(),
            removed: Notify::new(),
        }
    }

    /// Registers a new session.
    ///
    /// The session stays registered until the returned [`Registration`] is
    /// dropped.
    pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> Registration {
        let handle = Arc::new(SessionHandle::new(peer, self.shutdown.child_token()));
        self.sessions
            .insert(handle.id().clone(), Arc::clone(&handle));

        tracing::debug!(session_id = %handle.id(), peer = ?peer, "Registered session");

        Registration {
            registry: Arc::clone(self),
            handle,
        }
    }

    fn deregister(&self, id: &SessionId) {
        if self.sessions.remove(id).is_some() {
            tracing::debug!(session_id = %id, "Deregistered session");
        }
        self.removed.notify_waiters();
    }

    /// Looks up a session.
    pub fn get(&self, id: &SessionId) -> Option<Arc<SessionHandle>> {
        self.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is live.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Snapshot of every live session.
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| entry.value().info())
            .collect()
    }

    /// Asks every live session to terminate, returning how many were asked.
    pub fn cancel_all(&self) -> usize {
        let count = self.sessions.len();
        self.shutdown.cancel();
        count
    }

    /// Waits until no session is registered.
    pub async fn wait_empty(&self) {
        loop {
            let removed = self.removed.notified();
            tokio::pin!(removed);
            removed.as_mut().enable();

            if self.sessions.is_empty() {
                return;
            }
            removed.await;
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a session registered while alive.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<SessionRegistry>,
    handle: Arc<SessionHandle>,
}

impl Registration {
    /// The registered session.
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.deregister(self.handle.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn test_register_and_drop() {
        let registry = Arc::new(SessionRegistry::new());
        assert!(registry.is_empty());

        let registration = registry.register(None);
        let id = registration.handle().id().clone();
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&id).is_some());

        drop(registration);
        assert!(registry.is_empty());
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_ids_are_unique() {
        let registry = Arc::new(SessionRegistry::new());
        let a = registry.register(None);
        let b = registry.register(None);
        assert_ne!(a.handle().id(), b.handle().id());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_status_updates_show_in_snapshot() {
        let registry = Arc::new(SessionRegistry::new());
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let registration = registry.register(Some(peer));
        let handle = registration.handle();

        handle.set_state(SessionState::Active);
        handle.set_backend(BackendKind::HostShell, Some(1234), TerminalSize::default());
        handle.set_size(TerminalSize::new(100, 30).unwrap());

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 1);
        let info = &snapshot[0];
        assert_eq!(&info.id, handle.id());
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.backend, Some(BackendKind::HostShell));
        assert_eq!(info.pid, Some(1234));
        assert_eq!(info.size, TerminalSize::new(100, 30));
        assert_eq!(info.peer, Some(peer));
    }

    #[test]
    fn test_cancel_all_reaches_every_session() {
        let registry = Arc::new(SessionRegistry::new());
        let a = registry.register(None);
        let b = registry.register(None);

        assert_eq!(registry.cancel_all(), 2);
        assert!(a.handle().cancel_token().is_cancelled());
        assert!(b.handle().cancel_token().is_cancelled());

        // Sessions registered after shutdown start out cancelled
        let late = registry.register(None);
        assert!(late.handle().cancel_token().is_cancelled());
    }

    #[test]
    fn test_cancel_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let a = registry.register(None);
        let b = registry.register(None);

        a.handle().cancel();
        assert!(a.handle().cancel_token().is_cancelled());
        assert!(!b.handle().cancel_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_wait_empty() {
        let registry = Arc::new(SessionRegistry::new());

        // Returns at once when nothing is registered
        timeout(Duration::from_secs(1), registry.wait_empty())
            .await
            .unwrap();

        let a = registry.register(None);
        let b = registry.register(None);

        let waiter = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.wait_empty().await })
        };

        drop(a);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(b);
        timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_watch_status() {
        let registry = Arc::new(SessionRegistry::new());
        let registration = registry.register(None);
        let mut status = registration.handle().watch_status();

        registration.handle().set_state(SessionState::Closing);
        status.changed().await.unwrap();
        assert_eq!(status.borrow().state, SessionState::Closing);
    }
}
