//! Events and per-listener event queues.
//!
//! An [`Event`] is a named, typed notification. Posting one walks every
//! registered listener queue, enqueues a shared reference wherever the
//! queue's mask matches, and wakes the owning session. Each queue entry
//! that goes away — streamed to the client or discarded at queue
//! shutdown — counts toward delivery completion of the event's
//! descriptor.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::ChannelError;
use crate::evdesc::{DescState, EventDesc};
use crate::message::Message;
use crate::proto::{self, SUBCMD_MASK_ADD, SUBCMD_MASK_DEL, SUBCMD_MASK_RESET};
use crate::sync;

/// Serial value of an event that has not been posted yet.
pub const SERIAL_UNASSIGNED: u32 = 0;

/// A named, typed notification.
///
/// Created with [`Event::new`], then either posted through the channel or
/// destroyed; both consume it. Dropping an unposted event behaves like
/// destroying it: a delivery descriptor attached to it resolves with
/// [`ChannelError::Destroyed`].
pub struct Event {
    name: String,
    evtype: u32,
    payload: Message,
    serial: AtomicU32,
    timestamp: Mutex<Option<SystemTime>>,
    /// Queue entries still holding this event; delivery completes at 0.
    pending: AtomicUsize,
    desc: Mutex<Option<Arc<EventDesc>>>,
    /// Set once the post/destroy path has taken responsibility for the
    /// descriptor, so the eventual drop does not.
    consumed: AtomicBool,
}

impl Event {
    /// Create an event carrying `payload`.
    ///
    /// `name` must be a valid service name and `evtype` must fit the
    /// 32-bit mask word.
    pub fn new(name: &str, evtype: u32, payload: Message) -> Result<Self, ChannelError> {
        if !proto::is_valid_service_name(name) {
            return Err(ChannelError::InvalidName(name.to_string()));
        }
        if evtype > proto::MAX_EVENT_TYPE {
            return Err(ChannelError::InvalidEventType(evtype));
        }
        Ok(Self {
            name: name.to_string(),
            evtype,
            payload,
            serial: AtomicU32::new(SERIAL_UNASSIGNED),
            timestamp: Mutex::new(None),
            pending: AtomicUsize::new(0),
            desc: Mutex::new(None),
            consumed: AtomicBool::new(false),
        })
    }

    /// Originating service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Event type (0..=31).
    pub fn evtype(&self) -> u32 {
        self.evtype
    }

    /// Payload carried to listeners.
    pub fn payload(&self) -> &Message {
        &self.payload
    }

    /// Serial assigned at post time; [`SERIAL_UNASSIGNED`] before.
    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    /// Creation timestamp stamped at post time.
    pub fn timestamp(&self) -> Option<SystemTime> {
        *sync::lock(&self.timestamp)
    }

    /// Discard the event without posting it.
    ///
    /// Any delivery descriptor resolves with
    /// [`ChannelError::Destroyed`].
    pub fn destroy(self) {
        // Drop performs the cancellation.
    }

    /// Attach a delivery descriptor; at most one per event.
    pub(crate) fn attach_desc(&self, desc: Arc<EventDesc>) -> Result<(), ChannelError> {
        let mut slot = sync::lock(&self.desc);
        if slot.is_some() {
            return Err(ChannelError::Busy);
        }
        *slot = Some(desc);
        Ok(())
    }

    pub(crate) fn desc(&self) -> Option<Arc<EventDesc>> {
        sync::lock(&self.desc).clone()
    }

    /// Stamp post-time metadata. `pending` is the number of queues the
    /// event is about to be appended to; with none, delivery is already
    /// complete.
    pub(crate) fn stamp(&self, serial: u32, matched: usize) {
        self.serial.store(serial, Ordering::Release);
        *sync::lock(&self.timestamp) = Some(SystemTime::now());
        self.pending.store(matched, Ordering::Release);
        self.consumed.store(true, Ordering::Release);
        if matched == 0 {
            self.complete_desc();
        }
    }

    /// Account one queue entry going away.
    pub(crate) fn delivered_one(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.complete_desc();
        }
    }

    fn complete_desc(&self) {
        if let Some(desc) = self.desc() {
            desc.finish(DescState::COMPLETE);
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.consumed.swap(true, Ordering::AcqRel)
            && let Some(desc) = self.desc()
        {
            desc.finish(DescState::DESTROY);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name)
            .field("evtype", &self.evtype)
            .field("serial", &self.serial())
            .finish_non_exhaustive()
    }
}

/// One pending delivery in a listener queue.
///
/// Dropping the entry — after streaming it to the client, or when the
/// queue is discarded — counts toward the event's delivery completion.
pub(crate) struct QueueEntry {
    event: Arc<Event>,
}

impl QueueEntry {
    pub(crate) fn event(&self) -> &Event {
        &self.event
    }
}

impl Drop for QueueEntry {
    fn drop(&mut self) {
        self.event.delivered_one();
    }
}

/// A mask subcommand parsed off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskOp {
    Add,
    Del,
    Reset,
}

impl MaskOp {
    /// Decode a subcommand byte.
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte {
            SUBCMD_MASK_ADD => Some(MaskOp::Add),
            SUBCMD_MASK_DEL => Some(MaskOp::Del),
            SUBCMD_MASK_RESET => Some(MaskOp::Reset),
            _ => None,
        }
    }
}

/// The per-listener pending queue and acceptance mask.
pub struct EventQueue {
    session_id: u64,
    owner_pid: i32,
    pending: Mutex<VecDeque<QueueEntry>>,
    mask: Mutex<HashMap<String, u32>>,
    shutdown: AtomicBool,
    wake: Notify,
}

impl EventQueue {
    pub(crate) fn new(session_id: u64, owner_pid: i32) -> Arc<Self> {
        Arc::new(Self {
            session_id,
            owner_pid,
            pending: Mutex::new(VecDeque::new()),
            mask: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            wake: Notify::new(),
        })
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    pub(crate) fn owner_pid(&self) -> i32 {
        self.owner_pid
    }

    /// Does the mask accept an event with this name and type?
    pub(crate) fn mask_matches(&self, name: &str, evtype: u32) -> bool {
        sync::lock(&self.mask)
            .get(name)
            .is_some_and(|mask| mask & (1 << evtype) != 0)
    }

    /// Apply one mask subcommand.
    pub(crate) fn apply_mask(&self, op: MaskOp, pairs: &[(String, u32)]) {
        let mut mask = sync::lock(&self.mask);
        match op {
            MaskOp::Add => {
                for (name, bits) in pairs {
                    *mask.entry(name.clone()).or_insert(0) |= bits;
                }
            }
            MaskOp::Del => {
                for (name, bits) in pairs {
                    if let Some(current) = mask.get_mut(name) {
                        *current &= !bits;
                        if *current == 0 {
                            mask.remove(name);
                        }
                    }
                }
            }
            MaskOp::Reset => {
                mask.clear();
                for (name, bits) in pairs {
                    if *bits != 0 {
                        mask.insert(name.clone(), *bits);
                    }
                }
            }
        }
    }

    /// Number of distinct names in the mask set.
    pub fn mask_len(&self) -> usize {
        sync::lock(&self.mask).len()
    }

    /// Append an entry and wake the owning session.
    pub(crate) fn push(&self, event: Arc<Event>) {
        sync::lock(&self.pending).push_back(QueueEntry { event });
        self.wake.notify_one();
    }

    /// Dequeue in FIFO order.
    pub(crate) fn pop(&self) -> Option<QueueEntry> {
        sync::lock(&self.pending).pop_front()
    }

    /// Number of queued, undelivered events.
    pub fn pending_len(&self) -> usize {
        sync::lock(&self.pending).len()
    }

    /// Wait for a wakeup: a new entry or a shutdown mark.
    pub(crate) fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.wake.notified()
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Mark the queue shut down and wake the owner.
    pub(crate) fn mark_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    /// Discard pending entries; each discard counts as a completed
    /// delivery so descriptors never hang on a dead listener.
    pub(crate) fn drain(&self) {
        sync::lock(&self.pending).clear();
    }
}

/// Stream one event to a listener: type byte, common header, service
/// name, payload.
pub(crate) async fn write_event_pdu<W: AsyncWrite + Unpin>(
    writer: &mut W,
    event: &Event,
) -> io::Result<()> {
    let elapsed = event
        .timestamp()
        .unwrap_or(UNIX_EPOCH)
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    writer.write_u8(event.evtype() as u8).await?;
    writer.write_u32(event.serial()).await?;
    writer.write_u32(event.evtype()).await?;
    writer.write_u8(event.name().len() as u8).await?;
    writer.write_u64(elapsed.as_secs()).await?;
    writer.write_u32(elapsed.subsec_nanos()).await?;
    writer.write_all(event.name().as_bytes()).await?;
    event.payload().write_to(writer).await?;
    writer.flush().await
}
