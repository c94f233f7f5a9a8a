#![deny(unsafe_code)]

//! Ferrule core — a process-local IPC server framework.
//!
//! A [`Channel`] listens on a Unix domain socket, accepts client
//! connections, and runs each one through a handshake and a small
//! command protocol: PING for liveness, INVOKE to call registered named
//! service handlers, and EVENT to subscribe the connection to masked
//! event delivery. Event posters can attach delivery descriptors and
//! block until their event has reached every matching listener.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future — the standard return type for async
/// trait methods that require dynamic dispatch (`dyn Trait`).
///
/// Native `async fn` in traits (stable since Rust 1.75) produces opaque return
/// types that are **not** object-safe. Traits consumed via `Box<dyn Trait>` or
/// `&dyn Trait` must return a concrete `Pin<Box<dyn Future>>` instead. This
/// alias keeps those signatures readable.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Channel lifecycle and process-wide state.
pub mod channel;
/// The per-connection dispatch state machine.
mod dispatch;
/// Error types for the channel runtime.
pub mod error;
/// Event delivery descriptors.
pub mod evdesc;
/// Events and per-listener event queues.
pub mod event;
/// The service handler registry.
pub mod handler;
/// The opaque message codec.
pub mod message;
/// Wire protocol constants and the handshake codec.
pub mod proto;
/// The channel accept loop.
mod server;
/// Per-connection session state.
pub mod session;
/// Poison-tolerant lock accessors.
mod sync;

pub use channel::{Channel, SHUTDOWN_DRAIN_TIMEOUT, ShutdownSignal};
pub use error::ChannelError;
pub use event::Event;
pub use handler::{HandlerRegistry, HandlerStats, InvokeReply, InvokeRequest, ServiceHandler};
pub use message::Message;
pub use session::{ClientCreds, Session, SessionCallback, SessionCallbackKind, SessionFlags};
