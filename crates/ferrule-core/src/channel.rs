//! Channel lifecycle and process-wide state.
//!
//! A [`Channel`] owns the listener socket, the handler registry, the
//! active sessions, the event-queue list, and the delivery-descriptor
//! table. A process normally runs at most one channel, registered
//! through [`Channel::init`]; [`Channel::open`] builds an unregistered
//! channel for embedding several in one process (tests do this).
//!
//! Lock order, coarse to fine: session table → event-queue list →
//! per-queue state. The handler-registry lock and the descriptor-table
//! lock are independent and are never held across any other lock. No
//! lock is held across I/O.

use std::os::fd::AsRawFd;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use nix::sys::socket::{self, AddressFamily, Backlog, SockFlag, SockType, UnixAddr};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use ferrule_config::ChannelConfig;

use crate::error::ChannelError;
use crate::evdesc::EvDescTable;
use crate::event::{Event, EventQueue};
use crate::handler::HandlerRegistry;
use crate::server;
use crate::session::Session;
use crate::sync;

/// How long [`Channel::fini`] waits for active sessions to drain.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shutdown signal sent via the channel's broadcast pair.
#[derive(Debug, Clone)]
pub struct ShutdownSignal;

/// The process-wide channel slot. Once a registered channel is finished
/// the slot stays closed; `init` never succeeds twice in one process.
enum ChannelSlot {
    Uninitialized,
    Active(Arc<Channel>),
    Finished,
}

static SLOT: Mutex<ChannelSlot> = Mutex::new(ChannelSlot::Uninitialized);

/// The IPC channel: listener, registries, sessions, and event state.
pub struct Channel {
    name: String,
    socket_path: PathBuf,
    lock_path: PathBuf,
    /// Advisory startup lock; held for the channel's lifetime.
    _lock_file: std::fs::File,
    config: RwLock<ChannelConfig>,
    handlers: HandlerRegistry,
    evdescs: EvDescTable,
    sessions: Mutex<std::collections::HashMap<u64, Arc<Session>>>,
    event_queues: Mutex<Vec<Arc<EventQueue>>>,
    serial: AtomicU32,
    next_session_id: AtomicU64,
    nclients: AtomicU32,
    shutdown_flag: AtomicBool,
    torn_down: AtomicBool,
    shutdown_tx: broadcast::Sender<ShutdownSignal>,
    /// Notified whenever the session table empties.
    drained: Notify,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl Channel {
    /// Initialize the process channel.
    ///
    /// Fails with [`ChannelError::AlreadyInitialized`] if a channel is
    /// registered, and with [`ChannelError::ShutDown`] if the process
    /// channel was already finished; neither failure mutates existing
    /// state. An externally supplied `shutdown` sender replaces the
    /// internally created one, letting the caller tie channel shutdown
    /// into a wider signal fabric.
    ///
    /// Must be called from within a tokio runtime.
    pub fn init(
        name: &str,
        config: ChannelConfig,
        shutdown: Option<broadcast::Sender<ShutdownSignal>>,
    ) -> Result<Arc<Self>, ChannelError> {
        let mut slot = sync::lock(&SLOT);
        match &*slot {
            ChannelSlot::Active(_) => Err(ChannelError::AlreadyInitialized),
            ChannelSlot::Finished => Err(ChannelError::ShutDown),
            ChannelSlot::Uninitialized => {
                let channel = Self::open_with(name, config, shutdown)?;
                *slot = ChannelSlot::Active(Arc::clone(&channel));
                Ok(channel)
            }
        }
    }

    /// The registered process channel, if one is active.
    pub fn current() -> Option<Arc<Self>> {
        match &*sync::lock(&SLOT) {
            ChannelSlot::Active(channel) => Some(Arc::clone(channel)),
            _ => None,
        }
    }

    /// Open a channel without registering it as the process channel.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open(name: &str, config: ChannelConfig) -> Result<Arc<Self>, ChannelError> {
        Self::open_with(name, config, None)
    }

    fn open_with(
        name: &str,
        config: ChannelConfig,
        shutdown: Option<broadcast::Sender<ShutdownSignal>>,
    ) -> Result<Arc<Self>, ChannelError> {
        if !crate::proto::is_valid_service_name(name) {
            return Err(ChannelError::InvalidName(name.to_string()));
        }
        let mode = config.mode_bits()?;
        let config = config.clamped();

        let socket_dir = PathBuf::from(&config.socket_dir);
        std::fs::create_dir_all(&socket_dir).map_err(ChannelError::Io)?;
        let socket_path = socket_dir.join(format!("{name}.sock"));
        let lock_path = socket_dir.join(format!("{name}.sock.lock"));

        // Serialize startup against a concurrently starting instance.
        let lock_file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .mode(0o600)
            .open(&lock_path)
            .map_err(ChannelError::Io)?;
        match lock_file.try_lock() {
            Ok(()) => {}
            Err(std::fs::TryLockError::WouldBlock) => {
                return Err(ChannelError::Locked(lock_path));
            }
            Err(std::fs::TryLockError::Error(e)) => return Err(ChannelError::Io(e)),
        }

        remove_stale_socket(&socket_path)?;
        let listener = bind_listener(&socket_path, config.max_clients)?;
        std::fs::set_permissions(&socket_path, std::fs::Permissions::from_mode(mode))
            .map_err(ChannelError::Io)?;
        let listener = tokio::net::UnixListener::from_std(listener).map_err(ChannelError::Io)?;

        let shutdown_tx = shutdown.unwrap_or_else(|| broadcast::channel(1).0);
        let channel = Arc::new(Self {
            name: name.to_string(),
            socket_path: socket_path.clone(),
            lock_path,
            _lock_file: lock_file,
            config: RwLock::new(config),
            handlers: HandlerRegistry::new(),
            evdescs: EvDescTable::new(),
            sessions: Mutex::new(std::collections::HashMap::new()),
            event_queues: Mutex::new(Vec::new()),
            serial: AtomicU32::new(1),
            next_session_id: AtomicU64::new(1),
            nclients: AtomicU32::new(0),
            shutdown_flag: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
            shutdown_tx,
            drained: Notify::new(),
            accept_task: Mutex::new(None),
        });

        let accept = tokio::spawn(server::accept_loop(
            Arc::downgrade(&channel),
            listener,
            channel.subscribe_shutdown(),
        ));
        *sync::lock(&channel.accept_task) = Some(accept);
        info!(name, path = %socket_path.display(), "channel initialized");
        Ok(channel)
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Path of the listener socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Snapshot of the active configuration.
    pub fn config(&self) -> ChannelConfig {
        sync::read(&self.config).clone()
    }

    /// The service handler registry.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Apply new runtime configuration.
    ///
    /// Re-applies the client/session limits, the session timeout, and
    /// the socket mode. A `max_sessions` below `max_clients` is clamped
    /// with a warning. The socket directory cannot change on a live
    /// channel and is ignored here.
    pub fn reload(&self, config: ChannelConfig) -> Result<(), ChannelError> {
        let mode = config.mode_bits()?;
        let config = config.clamped();
        std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(mode))
            .map_err(ChannelError::Io)?;
        let mut current = sync::write(&self.config);
        info!(
            max_clients = config.max_clients,
            max_sessions = config.max_sessions,
            timeout_secs = config.timeout_secs,
            "channel configuration reloaded"
        );
        current.max_clients = config.max_clients;
        current.max_sessions = config.max_sessions;
        current.timeout_secs = config.timeout_secs;
        current.socket_mode = config.socket_mode;
        Ok(())
    }

    /// Has shutdown been requested?
    pub fn is_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Acquire)
    }

    /// Receiver for the shutdown broadcast.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<ShutdownSignal> {
        self.shutdown_tx.subscribe()
    }

    /// Tear the channel down: stop accepting, shut every event queue
    /// down, cancel outstanding delivery descriptors, clear the handler
    /// registry, and unlink the socket. Idempotent.
    pub fn shutdown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(ShutdownSignal);

        if let Some(accept) = sync::lock(&self.accept_task).take() {
            accept.abort();
        }
        let queues: Vec<_> = sync::lock(&self.event_queues).drain(..).collect();
        for queue in queues {
            queue.mark_shutdown();
            queue.drain();
        }
        self.evdescs.shutdown_all();
        self.handlers.clear();
        self.unlink_socket();
        info!(name = %self.name, "channel shut down");
    }

    /// Finish the channel: signal shutdown, wait for active sessions to
    /// drain, then tear down.
    ///
    /// If sessions are still active after [`SHUTDOWN_DRAIN_TIMEOUT`]
    /// this gives up with [`ChannelError::TimedOut`]; counters and state
    /// are left intact so a retry can observe them.
    pub async fn fini(self: &Arc<Self>) -> Result<(), ChannelError> {
        self.shutdown_flag.store(true, Ordering::Release);
        let _ = self.shutdown_tx.send(ShutdownSignal);

        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        loop {
            let drained = self.drained.notified();
            if self.session_count() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    sessions = self.session_count(),
                    "channel finish timed out waiting for sessions to drain"
                );
                return Err(ChannelError::TimedOut);
            }
        }

        self.shutdown();
        let mut slot = sync::lock(&SLOT);
        if let ChannelSlot::Active(current) = &*slot
            && Arc::ptr_eq(current, self)
        {
            *slot = ChannelSlot::Finished;
        }
        Ok(())
    }

    /// Best-effort exit hook: unlink a leaked socket file, touching
    /// nothing else, and only if the channel slot can be locked without
    /// blocking.
    pub fn cleanup() {
        if let Ok(slot) = SLOT.try_lock()
            && let ChannelSlot::Active(channel) = &*slot
        {
            let _ = std::fs::remove_file(&channel.socket_path);
        }
    }

    fn unlink_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(
                    error = %e,
                    path = %self.socket_path.display(),
                    "failed to unlink channel socket, fixing permissions"
                );
                if let Some(parent) = self.socket_path.parent() {
                    let _ = std::fs::set_permissions(
                        parent,
                        std::fs::Permissions::from_mode(0o700),
                    );
                }
                if let Err(e) = std::fs::remove_file(&self.socket_path) {
                    warn!(
                        error = %e,
                        path = %self.socket_path.display(),
                        "could not remove channel socket"
                    );
                }
            }
        }
        let _ = std::fs::remove_file(&self.lock_path);
    }

    // ── Session bookkeeping ─────────────────────────────────────────────

    /// The effective default session timeout; a configured zero means
    /// no timeout.
    pub(crate) fn default_timeout(&self) -> Option<Duration> {
        match sync::read(&self.config).timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub(crate) fn next_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Admit one more client if the limits allow, reserving a slot.
    pub(crate) fn try_admit(&self) -> bool {
        if self.is_shutdown() {
            return false;
        }
        let config = sync::read(&self.config);
        let sessions = sync::lock(&self.sessions);
        if self.nclients.load(Ordering::Acquire) >= config.max_clients
            || sessions.len() as u32 >= config.max_sessions
        {
            return false;
        }
        self.nclients.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub(crate) fn register_session(&self, session: Arc<Session>) {
        sync::lock(&self.sessions).insert(session.id(), session);
    }

    /// Remove a session, retire its event queue, and release its client
    /// slot.
    pub(crate) fn unregister_session(&self, id: u64) {
        let (removed, empty) = {
            let mut sessions = sync::lock(&self.sessions);
            let removed = sessions.remove(&id);
            if removed.is_some() {
                self.nclients.fetch_sub(1, Ordering::AcqRel);
            }
            (removed, sessions.is_empty())
        };
        sync::lock(&self.event_queues).retain(|queue| queue.session_id() != id);
        if let Some(session) = removed
            && let Some(queue) = session.queue()
        {
            queue.mark_shutdown();
            queue.drain();
        }
        if empty {
            // notify_one stores a permit so a drain landing before
            // fini's first poll is not lost.
            self.drained.notify_one();
        }
        debug!(session = id, "session unregistered");
    }

    /// Number of active sessions.
    pub fn session_count(&self) -> usize {
        sync::lock(&self.sessions).len()
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> u32 {
        self.nclients.load(Ordering::Acquire)
    }

    /// Number of registered event listeners.
    pub fn event_queue_count(&self) -> usize {
        sync::lock(&self.event_queues).len()
    }

    pub(crate) fn register_event_queue(&self, queue: Arc<EventQueue>) {
        sync::lock(&self.event_queues).push(queue);
    }

    // ── Event delivery ──────────────────────────────────────────────────

    /// Next event serial, skipping the reserved zero value on wrap.
    fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed);
            if serial != crate::event::SERIAL_UNASSIGNED {
                return serial;
            }
        }
    }

    /// Post an event to every listener whose mask accepts it.
    ///
    /// A `target` pid restricts delivery to sessions of that client
    /// process. The event is always consumed, also on error; an attached
    /// delivery descriptor completes when the last matched listener is
    /// done with the event, or immediately if none matched.
    pub fn post_event(&self, event: Event, target: Option<i32>) -> Result<u32, ChannelError> {
        if self.is_shutdown() {
            drop(event);
            return Err(ChannelError::ShutDown);
        }
        let serial = self.next_serial();
        let queues = sync::lock(&self.event_queues);
        let matched: Vec<_> = queues
            .iter()
            .filter(|queue| {
                !queue.is_shutdown()
                    && target.is_none_or(|pid| queue.owner_pid() == pid)
                    && queue.mask_matches(event.name(), event.evtype())
            })
            .cloned()
            .collect();

        debug!(
            name = %event.name(),
            evtype = event.evtype(),
            serial,
            listeners = matched.len(),
            "posting event"
        );
        event.stamp(serial, matched.len());
        let event = Arc::new(event);
        for queue in &matched {
            queue.push(Arc::clone(&event));
        }
        Ok(serial)
    }

    /// Attach a delivery-completion descriptor to an unposted event.
    ///
    /// At most one descriptor may exist per event;
    /// [`ChannelError::Busy`] otherwise.
    pub fn evdesc_create(&self, event: &Event) -> Result<u32, ChannelError> {
        if self.is_shutdown() {
            return Err(ChannelError::ShutDown);
        }
        let desc = self.evdescs.create();
        let id = desc.id();
        if let Err(e) = event.attach_desc(desc) {
            let _ = self.evdescs.destroy(id);
            return Err(e);
        }
        Ok(id)
    }

    /// Wait for the event behind a descriptor to finish delivery.
    pub async fn evdesc_wait(
        &self,
        id: u32,
        timeout: Option<Duration>,
    ) -> Result<(), ChannelError> {
        self.evdescs.wait(id, timeout).await
    }

    /// Destroy a delivery descriptor.
    pub fn evdesc_destroy(&self, id: u32) -> Result<(), ChannelError> {
        self.evdescs.destroy(id)
    }

    /// The delivery-descriptor table.
    pub fn evdescs(&self) -> &EvDescTable {
        &self.evdescs
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        // An abandoned channel still stops its accept task and unlinks
        // its socket. No-op after an explicit shutdown or fini.
        self.shutdown();
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("socket_path", &self.socket_path)
            .field("sessions", &self.session_count())
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Detect and remove a stale socket file.
///
/// A zero-length probe connect tells a dead socket from a live one:
/// refused means no listener survives behind the file, anything else
/// means the address is genuinely taken.
fn remove_stale_socket(path: &Path) -> Result<(), ChannelError> {
    if !path.exists() {
        return Ok(());
    }
    match std::os::unix::net::UnixStream::connect(path) {
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            warn!(path = %path.display(), "removing stale channel socket");
            std::fs::remove_file(path).map_err(ChannelError::Io)
        }
        _ => Err(ChannelError::AddrInUse(path.to_path_buf())),
    }
}

/// Bind the listener socket with `listen(backlog = max_clients)`.
///
/// Goes through nix because neither std nor tokio exposes the backlog;
/// the fd converts to a std listener without unsafe code.
fn bind_listener(
    path: &Path,
    max_clients: u32,
) -> Result<std::os::unix::net::UnixListener, ChannelError> {
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(|e| ChannelError::Io(e.into()))?;
    let addr = UnixAddr::new(path).map_err(|e| ChannelError::Io(e.into()))?;
    socket::bind(fd.as_raw_fd(), &addr).map_err(|e| ChannelError::Io(e.into()))?;
    let backlog = Backlog::new(max_clients.try_into().unwrap_or(i32::MAX))
        .unwrap_or(Backlog::MAXCONN);
    socket::listen(&fd, backlog).map_err(|e| ChannelError::Io(e.into()))?;

    let listener = std::os::unix::net::UnixListener::from(fd);
    listener.set_nonblocking(true).map_err(ChannelError::Io)?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferrule_test_utils::socket::test_channel_config;

    #[tokio::test]
    async fn test_open_binds_and_cleans_up() {
        let (dir, config) = test_channel_config();
        let channel = Channel::open("lifecycle", config).unwrap();
        let socket = channel.socket_path().to_path_buf();
        assert!(socket.exists());
        assert_eq!(channel.session_count(), 0);

        channel.shutdown();
        assert!(!socket.exists());
        drop(dir);
    }

    #[tokio::test]
    async fn test_open_rejects_live_socket() {
        let (_dir, config) = test_channel_config();
        let first = Channel::open("dup", config.clone()).unwrap();
        // The lock file trips before the bind does.
        assert!(matches!(
            Channel::open("dup", config),
            Err(ChannelError::Locked(_) | ChannelError::AddrInUse(_))
        ));
        first.shutdown();
    }

    #[tokio::test]
    async fn test_stale_socket_is_replaced() {
        let (_dir, config) = test_channel_config();
        let path = PathBuf::from(&config.socket_dir).join("stale.sock");
        std::fs::create_dir_all(&config.socket_dir).unwrap();
        // A bound-then-dropped listener leaves a dead socket file behind.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let channel = Channel::open("stale", config).unwrap();
        assert_eq!(channel.socket_path(), path);
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_invalid_channel_name() {
        let (_dir, config) = test_channel_config();
        assert!(matches!(
            Channel::open("no spaces", config),
            Err(ChannelError::InvalidName(_))
        ));
    }

    #[tokio::test]
    async fn test_reload_clamps_sessions() {
        let (_dir, config) = test_channel_config();
        let channel = Channel::open("reload", config.clone()).unwrap();

        let mut updated = config;
        updated.max_clients = 8;
        updated.max_sessions = 2;
        updated.timeout_secs = 99;
        channel.reload(updated).unwrap();

        let active = channel.config();
        assert_eq!(active.max_clients, 8);
        assert_eq!(active.max_sessions, 8);
        assert_eq!(active.timeout_secs, 99);
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_post_event_without_listeners() {
        let (_dir, config) = test_channel_config();
        let channel = Channel::open("postless", config).unwrap();

        let event = Event::new("svcA", 1, crate::message::Message::new()).unwrap();
        let id = channel.evdesc_create(&event).unwrap();
        let serial = channel.post_event(event, None).unwrap();
        assert_ne!(serial, crate::event::SERIAL_UNASSIGNED);
        // Nothing matched, so delivery completed at post time.
        channel.evdesc_wait(id, None).await.unwrap();
        // The descriptor ID is single-use.
        assert!(matches!(
            channel.evdesc_wait(id, None).await,
            Err(ChannelError::DescNotFound(_))
        ));
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_post_after_shutdown_consumes_event() {
        let (_dir, config) = test_channel_config();
        let channel = Channel::open("postshut", config).unwrap();
        channel.shutdown();

        let event = Event::new("svcA", 1, crate::message::Message::new()).unwrap();
        assert!(matches!(
            channel.post_event(event, None),
            Err(ChannelError::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_serial_skips_zero_on_wrap() {
        let (_dir, config) = test_channel_config();
        let channel = Channel::open("serial", config).unwrap();
        channel.serial.store(u32::MAX, Ordering::Relaxed);

        let e1 = Event::new("svcA", 0, crate::message::Message::new()).unwrap();
        let e2 = Event::new("svcA", 0, crate::message::Message::new()).unwrap();
        assert_eq!(channel.post_event(e1, None).unwrap(), u32::MAX);
        // The counter wrapped past the reserved zero.
        assert_eq!(channel.post_event(e2, None).unwrap(), 1);
        channel.shutdown();
    }

    #[tokio::test]
    async fn test_fini_with_no_sessions() {
        let (_dir, config) = test_channel_config();
        let channel = Channel::open("finidrain", config).unwrap();
        channel.fini().await.unwrap();
        assert!(channel.is_shutdown());
    }
}
