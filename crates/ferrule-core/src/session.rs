//! Per-connection session state.
//!
//! A [`Session`] is created for every accepted connection that passes the
//! handshake and lives until the dispatch loop ends. The socket itself is
//! owned by the dispatch loop; the session carries the control state that
//! other parties (handlers, the channel, event posting) need to see.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use bitflags::bitflags;
use tracing::debug;

use crate::BoxFuture;
use crate::event::EventQueue;
use crate::sync;

bitflags! {
    /// Session state flags, mutated only under the session lock.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SessionFlags: u32 {
        /// A handler invocation is in flight.
        const ACTIVE = 1 << 0;
        /// The socket is being watched for connection reset.
        const WATCHED = 1 << 1;
        /// The session deadline elapsed; teardown is in progress.
        const TIMEDOUT = 1 << 2;
        /// Channel shutdown reached this session.
        const SHUTDOWN = 1 << 3;
        /// The session executed the EVENT command.
        const EVENT_LISTENER = 1 << 4;
        /// The session's event queue has been shut down.
        const EVQ_SHUTDOWN = 1 << 5;
        /// The peer vanished; no further I/O may be attempted.
        const RESET = 1 << 6;
    }
}

/// Peer credentials attached to a session at accept time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientCreds {
    /// Peer process ID; 0 when the platform could not report one.
    pub pid: i32,
    pub uid: u32,
    pub gid: u32,
}

/// Which lifecycle hook a session callback is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionCallbackKind {
    /// The peer closed or reset the connection while a call was in flight.
    ConnectionReset,
    /// The session ended and has been unregistered from the channel.
    Terminated,
}

/// A typed session lifecycle callback.
///
/// Callbacks run on their own spawned task, so they may block without
/// stalling any dispatch or accept loop.
pub trait SessionCallback: Send + Sync {
    fn call(&self) -> BoxFuture<'static, ()>;
}

impl<F, Fut> SessionCallback for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self) -> BoxFuture<'static, ()> {
        Box::pin(self())
    }
}

#[derive(Debug)]
struct SessionState {
    flags: SessionFlags,
    /// Service name and ID of the in-flight INVOKE, if any.
    active_service: Option<(String, u32)>,
    /// Per-session timeout override requested by a handler.
    timeout: Option<Duration>,
}

/// One accepted connection's control state.
pub struct Session {
    id: u64,
    creds: ClientCreds,
    started_at: SystemTime,
    state: Mutex<SessionState>,
    callbacks: Mutex<HashMap<SessionCallbackKind, Arc<dyn SessionCallback>>>,
    /// Set once when the session becomes an event listener.
    queue: Mutex<Option<Arc<EventQueue>>>,
    /// Guards the one-shot ConnectionReset callback.
    reset_reported: AtomicBool,
}

impl Session {
    pub(crate) fn new(id: u64, creds: ClientCreds) -> Arc<Self> {
        Arc::new(Self {
            id,
            creds,
            started_at: SystemTime::now(),
            state: Mutex::new(SessionState {
                flags: SessionFlags::empty(),
                active_service: None,
                timeout: None,
            }),
            callbacks: Mutex::new(HashMap::new()),
            queue: Mutex::new(None),
            reset_reported: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Credentials of the connected peer.
    pub fn creds(&self) -> ClientCreds {
        self.creds
    }

    /// When the session was accepted.
    pub fn started_at(&self) -> SystemTime {
        self.started_at
    }

    /// Current flag set.
    pub fn flags(&self) -> SessionFlags {
        sync::lock(&self.state).flags
    }

    pub(crate) fn set_flags(&self, flags: SessionFlags) {
        sync::lock(&self.state).flags.insert(flags);
    }

    pub(crate) fn clear_flags(&self, flags: SessionFlags) {
        sync::lock(&self.state).flags.remove(flags);
    }

    /// Service name and ID of the INVOKE currently in flight.
    pub fn active_service(&self) -> Option<(String, u32)> {
        sync::lock(&self.state).active_service.clone()
    }

    pub(crate) fn set_active_service(&self, name: &str, id: u32) {
        let mut state = sync::lock(&self.state);
        state.flags.insert(SessionFlags::ACTIVE);
        state.active_service = Some((name.to_string(), id));
    }

    pub(crate) fn clear_active_service(&self) {
        let mut state = sync::lock(&self.state);
        state.flags.remove(SessionFlags::ACTIVE);
        state.active_service = None;
    }

    /// Override the session timeout for subsequent commands.
    ///
    /// `None` restores the channel-wide default.
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        sync::lock(&self.state).timeout = timeout;
    }

    /// The effective timeout: the per-session override if a handler set
    /// one, otherwise the supplied channel default.
    pub(crate) fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        sync::lock(&self.state).timeout.or(default)
    }

    /// Register a lifecycle callback, replacing any previous one of the
    /// same kind.
    pub fn set_callback(&self, kind: SessionCallbackKind, callback: Arc<dyn SessionCallback>) {
        sync::lock(&self.callbacks).insert(kind, callback);
    }

    /// Remove a lifecycle callback.
    pub fn remove_callback(&self, kind: SessionCallbackKind) {
        sync::lock(&self.callbacks).remove(&kind);
    }

    /// Fire a lifecycle callback on its own task, if one is registered.
    pub(crate) fn fire_callback(&self, kind: SessionCallbackKind) {
        let callback = sync::lock(&self.callbacks).get(&kind).cloned();
        if let Some(callback) = callback {
            tokio::spawn(callback.call());
        }
    }

    /// Mark the session reset and fire the ConnectionReset callback.
    ///
    /// Resets are reported once per session no matter how many paths
    /// observe them.
    pub(crate) fn mark_reset(&self) {
        self.set_flags(SessionFlags::RESET);
        if !self.reset_reported.swap(true, Ordering::AcqRel) {
            debug!(session = self.id, "peer connection reset");
            self.fire_callback(SessionCallbackKind::ConnectionReset);
        }
    }

    pub(crate) fn is_reset(&self) -> bool {
        self.flags().contains(SessionFlags::RESET)
    }

    pub(crate) fn attach_queue(&self, queue: Arc<EventQueue>) {
        self.set_flags(SessionFlags::EVENT_LISTENER);
        *sync::lock(&self.queue) = Some(queue);
    }

    pub(crate) fn queue(&self) -> Option<Arc<EventQueue>> {
        sync::lock(&self.queue).clone()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("creds", &self.creds)
            .field("flags", &self.flags())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> ClientCreds {
        ClientCreds {
            pid: 42,
            uid: 1000,
            gid: 1000,
        }
    }

    #[test]
    fn test_flags_start_empty() {
        let session = Session::new(1, creds());
        assert!(session.flags().is_empty());
        assert!(session.active_service().is_none());
    }

    #[test]
    fn test_active_service_tracking() {
        let session = Session::new(1, creds());
        session.set_active_service("svcA", 3);
        assert!(session.flags().contains(SessionFlags::ACTIVE));
        assert_eq!(session.active_service(), Some(("svcA".to_string(), 3)));

        session.clear_active_service();
        assert!(!session.flags().contains(SessionFlags::ACTIVE));
        assert!(session.active_service().is_none());
    }

    #[test]
    fn test_timeout_override() {
        let session = Session::new(1, creds());
        let default = Some(Duration::from_secs(10));
        assert_eq!(session.effective_timeout(default), default);

        session.set_timeout(Some(Duration::from_secs(2)));
        assert_eq!(
            session.effective_timeout(default),
            Some(Duration::from_secs(2))
        );

        session.set_timeout(None);
        assert_eq!(session.effective_timeout(default), default);
    }

    #[tokio::test]
    async fn test_reset_callback_fires_once() {
        let session = Session::new(1, creds());
        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits_cb = Arc::clone(&hits);
        session.set_callback(
            SessionCallbackKind::ConnectionReset,
            Arc::new(move || {
                let hits = Arc::clone(&hits_cb);
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        session.mark_reset();
        session.mark_reset();
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(session.is_reset());
    }

    #[tokio::test]
    async fn test_callback_replace_and_remove() {
        let session = Session::new(1, creds());
        session.set_callback(
            SessionCallbackKind::Terminated,
            Arc::new(|| async {}),
        );
        session.remove_callback(SessionCallbackKind::Terminated);
        // No callback left; firing is a no-op.
        session.fire_callback(SessionCallbackKind::Terminated);
    }
}
