//! Event delivery descriptors.
//!
//! A descriptor lets whoever posts an event block until that event has
//! finished being delivered to every matching listener. Descriptors live
//! in a channel-wide table keyed by a wrapping, collision-probed numeric
//! ID; each supports exactly one waiter and exactly one terminal state.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bitflags::bitflags;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::error::ChannelError;
use crate::sync;

/// Reserved, never-allocated descriptor ID.
pub const EVDESC_INVALID: u32 = 0;

bitflags! {
    /// Descriptor lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DescState: u32 {
        /// A waiter is blocked on this descriptor.
        const WAITING = 1 << 0;
        /// Delivery finished; the waiter resolves successfully.
        const COMPLETE = 1 << 1;
        /// The event or descriptor was destroyed before delivery.
        const DESTROY = 1 << 2;
        /// Channel shutdown canceled the wait.
        const SHUTDOWN = 1 << 3;
        /// Unlinked from the table; the ID no longer resolves.
        const INVISIBLE = 1 << 4;
    }
}

impl DescState {
    const TERMINAL: DescState = DescState::COMPLETE
        .union(DescState::DESTROY)
        .union(DescState::SHUTDOWN);
}

/// One delivery-completion descriptor.
pub(crate) struct EventDesc {
    id: u32,
    state: Mutex<DescState>,
    wake: Notify,
    table: Weak<DescTableInner>,
}

impl EventDesc {
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Apply a terminal flag and wake the waiter. The first terminal flag
    /// wins; later ones are ignored.
    ///
    /// A completed descriptor stays linked so a later wait can still
    /// observe the completion. Destroy and shutdown unlink right away
    /// when no waiter is registered, since nobody else will.
    pub(crate) fn finish(&self, flag: DescState) {
        let waiting = {
            let mut state = sync::lock(&self.state);
            if !state.intersects(DescState::TERMINAL) {
                state.insert(flag);
            }
            state.contains(DescState::WAITING)
        };
        // notify_one stores a permit, so a wakeup landing before the
        // waiter's first poll is not lost. At most one waiter exists.
        self.wake.notify_one();
        if !waiting
            && flag != DescState::COMPLETE
            && let Some(table) = self.table.upgrade()
        {
            table.unlink(self);
        }
    }
}

struct DescTableInner {
    descs: RwLock<BTreeMap<u32, Arc<EventDesc>>>,
    next_id: AtomicU32,
}

impl DescTableInner {
    /// Remove exactly this descriptor. The identity check matters: an ID
    /// can be reallocated once the counter wraps, and a stale unlink must
    /// not take the newer descriptor with it.
    fn unlink(&self, desc: &EventDesc) {
        let mut descs = sync::write(&self.descs);
        if let Some(current) = descs.get(&desc.id)
            && std::ptr::eq(Arc::as_ptr(current), desc)
        {
            descs.remove(&desc.id);
            sync::lock(&desc.state).insert(DescState::INVISIBLE);
        }
    }
}

/// The channel-wide descriptor table.
pub struct EvDescTable {
    inner: Arc<DescTableInner>,
}

impl EvDescTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(DescTableInner {
                descs: RwLock::new(BTreeMap::new()),
                next_id: AtomicU32::new(1),
            }),
        }
    }

    /// Allocate a descriptor with a fresh ID.
    ///
    /// IDs wrap; [`EVDESC_INVALID`] and IDs still live in the table are
    /// skipped.
    pub(crate) fn create(&self) -> Arc<EventDesc> {
        let mut descs = sync::write(&self.inner.descs);
        let id = loop {
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            if id != EVDESC_INVALID && !descs.contains_key(&id) {
                break id;
            }
        };
        let desc = Arc::new(EventDesc {
            id,
            state: Mutex::new(DescState::empty()),
            wake: Notify::new(),
            table: Arc::downgrade(&self.inner),
        });
        descs.insert(id, Arc::clone(&desc));
        desc
    }

    /// Block until the descriptor reaches a terminal state.
    ///
    /// Exactly one waiter may be registered; a concurrent second call
    /// fails with [`ChannelError::Busy`] and leaves the first wait
    /// untouched. Every other return unlinks the descriptor, so the ID
    /// is single-use.
    pub async fn wait(&self, id: u32, timeout: Option<Duration>) -> Result<(), ChannelError> {
        let desc = sync::read(&self.inner.descs)
            .get(&id)
            .cloned()
            .ok_or(ChannelError::DescNotFound(id))?;

        {
            let mut state = sync::lock(&desc.state);
            if state.contains(DescState::WAITING) {
                return Err(ChannelError::Busy);
            }
            state.insert(DescState::WAITING);
        }

        let deadline = timeout.map(|t| Instant::now() + t);
        let result = loop {
            let woken = desc.wake.notified();
            {
                let state = sync::lock(&desc.state);
                if state.contains(DescState::COMPLETE) {
                    break Ok(());
                }
                if state.contains(DescState::DESTROY) {
                    break Err(ChannelError::Destroyed);
                }
                if state.contains(DescState::SHUTDOWN) {
                    break Err(ChannelError::Canceled);
                }
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, woken).await.is_err() {
                        break Err(ChannelError::TimedOut);
                    }
                }
                None => woken.await,
            }
        };

        self.inner.unlink(&desc);
        sync::lock(&desc.state).remove(DescState::WAITING);
        result
    }

    /// Destroy the descriptor: a registered waiter resolves with
    /// [`ChannelError::Destroyed`]; otherwise the descriptor is unlinked
    /// immediately.
    pub fn destroy(&self, id: u32) -> Result<(), ChannelError> {
        let desc = sync::read(&self.inner.descs)
            .get(&id)
            .cloned()
            .ok_or(ChannelError::DescNotFound(id))?;
        desc.finish(DescState::DESTROY);
        Ok(())
    }

    /// Cancel every live descriptor; waiters resolve with
    /// [`ChannelError::Canceled`].
    pub(crate) fn shutdown_all(&self) {
        let descs: Vec<_> = sync::read(&self.inner.descs).values().cloned().collect();
        if !descs.is_empty() {
            debug!(count = descs.len(), "canceling outstanding event descriptors");
        }
        for desc in descs {
            desc.finish(DescState::SHUTDOWN);
        }
    }

    /// Number of live descriptors.
    pub fn len(&self) -> usize {
        sync::read(&self.inner.descs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
