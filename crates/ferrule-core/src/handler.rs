//! The service handler registry.
//!
//! Handlers are registered under unique service names and invoked by the
//! INVOKE command. The registry keeps them in a name-ordered map behind a
//! read/write lock: lookups take the read side, add/remove take the write
//! side, and the handler itself always runs with no lock held.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::BoxFuture;
use crate::error::ChannelError;
use crate::message::Message;
use crate::proto::{self, RESP_OK, RESP_UNKNOWN_SERVICE, RESULT_FATAL};
use crate::session::{ClientCreds, Session};
use crate::sync;

/// How long [`HandlerRegistry::remove`] waits for in-flight invocations
/// to drain before giving up with a warning.
pub const REMOVE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// One INVOKE call as seen by a handler.
pub struct InvokeRequest {
    /// The session the call arrived on.
    pub session: Arc<Session>,
    /// Requested service name.
    pub service: String,
    /// Requested service ID, already validated against the handler's
    /// declared service count.
    pub id: u32,
    /// Argument payload.
    pub args: Message,
    /// Credentials of the calling client.
    pub client: ClientCreds,
}

/// What a handler produced for one INVOKE call.
pub struct InvokeReply {
    /// Result code returned to the client. [`RESULT_FATAL`] suppresses
    /// the output message.
    pub result: i32,
    /// Output payload streamed after the response header.
    pub output: Message,
    /// New session timeout requested by the handler; `Some(None)` resets
    /// to the channel default.
    pub timeout_update: Option<Option<Duration>>,
}

impl InvokeReply {
    /// A reply with the given result code and no output.
    pub fn with_result(result: i32) -> Self {
        Self {
            result,
            output: Message::new(),
            timeout_update: None,
        }
    }

    /// A successful reply carrying an output payload.
    pub fn with_output(output: Message) -> Self {
        Self {
            result: 0,
            output,
            timeout_update: None,
        }
    }

    /// The fatal reply: the client sees the result code and no payload.
    pub fn fatal() -> Self {
        Self::with_result(RESULT_FATAL)
    }
}

/// A named service callback.
///
/// Captured state is the implementor's own; dropping the handler after
/// removal releases it.
pub trait ServiceHandler: Send + Sync {
    fn call(&self, request: InvokeRequest) -> BoxFuture<'static, InvokeReply>;
}

impl<F, Fut> ServiceHandler for F
where
    F: Fn(InvokeRequest) -> Fut + Send + Sync,
    Fut: Future<Output = InvokeReply> + Send + 'static,
{
    fn call(&self, request: InvokeRequest) -> BoxFuture<'static, InvokeReply> {
        Box::pin(self(request))
    }
}

/// Point-in-time counters for one handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerStats {
    /// Invocations whose result was not the fatal sentinel.
    pub succeeded: u64,
    /// Invocations that returned the fatal sentinel.
    pub failed: u64,
    /// Requests rejected for an out-of-range service ID.
    pub invalid: u64,
    /// Responses that could not be delivered to the client.
    pub resp_errors: u64,
}

pub(crate) struct HandlerEntry {
    name: String,
    nservices: u32,
    handler: Box<dyn ServiceHandler>,
    succeeded: AtomicU64,
    failed: AtomicU64,
    invalid: AtomicU64,
    resp_errors: AtomicU64,
    inflight: AtomicUsize,
    removed: AtomicBool,
    drained: Notify,
}

impl HandlerEntry {
    fn stats(&self) -> HandlerStats {
        HandlerStats {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            resp_errors: self.resp_errors.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn count_resp_error(&self) {
        self.resp_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn inflight(&self) -> usize {
        self.inflight.load(Ordering::Acquire)
    }
}

/// Decrements the in-flight count when an invocation ends, even if the
/// handler future panicked, so removal can always drain.
struct InflightGuard<'a> {
    entry: &'a HandlerEntry,
}

impl<'a> InflightGuard<'a> {
    fn enter(entry: &'a HandlerEntry) -> Self {
        entry.inflight.fetch_add(1, Ordering::AcqRel);
        Self { entry }
    }
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        if self.entry.inflight.fetch_sub(1, Ordering::AcqRel) == 1
            && self.entry.removed.load(Ordering::Acquire)
        {
            // notify_one stores a permit so the removal wait cannot
            // miss a drain that lands before its first poll.
            self.entry.drained.notify_one();
        }
    }
}

/// Outcome of routing one INVOKE request through the registry.
pub(crate) struct InvokeOutcome {
    pub(crate) resp_code: u32,
    pub(crate) result: i32,
    pub(crate) output: Message,
    pub(crate) timeout_update: Option<Option<Duration>>,
    /// The handler that ran, for response-delivery accounting.
    pub(crate) entry: Option<Arc<HandlerEntry>>,
}

impl InvokeOutcome {
    fn unknown_service(entry: Option<Arc<HandlerEntry>>) -> Self {
        Self {
            resp_code: RESP_UNKNOWN_SERVICE,
            result: 0,
            output: Message::new(),
            timeout_update: None,
            entry,
        }
    }
}

/// The channel's registry of named service handlers.
pub struct HandlerRegistry {
    handlers: RwLock<BTreeMap<String, Arc<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub(crate) fn new() -> Self {
        Self {
            handlers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a handler under `name`, serving IDs `0..nservices`.
    ///
    /// The registration is visible to invocations as soon as this
    /// returns.
    pub fn add(
        &self,
        name: &str,
        nservices: u32,
        handler: impl ServiceHandler + 'static,
    ) -> Result<(), ChannelError> {
        if !proto::is_valid_service_name(name) {
            return Err(ChannelError::InvalidName(name.to_string()));
        }
        let mut handlers = sync::write(&self.handlers);
        if handlers.contains_key(name) {
            return Err(ChannelError::HandlerExists(name.to_string()));
        }
        handlers.insert(
            name.to_string(),
            Arc::new(HandlerEntry {
                name: name.to_string(),
                nservices,
                handler: Box::new(handler),
                succeeded: AtomicU64::new(0),
                failed: AtomicU64::new(0),
                invalid: AtomicU64::new(0),
                resp_errors: AtomicU64::new(0),
                inflight: AtomicUsize::new(0),
                removed: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        );
        debug!(name, nservices, "service handler registered");
        Ok(())
    }

    /// Unregister the handler named `name` and wait for its in-flight
    /// invocations to drain.
    ///
    /// Removal is visible to new lookups immediately; invocations already
    /// holding the handler are allowed to finish. If they have not
    /// finished within [`REMOVE_DRAIN_TIMEOUT`] this returns anyway with
    /// a warning — the entry stays alive until the last in-flight call
    /// drops it.
    pub async fn remove(&self, name: &str) -> Result<(), ChannelError> {
        let entry = sync::write(&self.handlers)
            .remove(name)
            .ok_or_else(|| ChannelError::UnknownService(name.to_string()))?;
        entry.removed.store(true, Ordering::Release);

        let deadline = Instant::now() + REMOVE_DRAIN_TIMEOUT;
        loop {
            let drained = entry.drained.notified();
            if entry.inflight() == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    name,
                    inflight = entry.inflight(),
                    "handler removal timed out with invocations in flight"
                );
                break;
            }
        }
        debug!(name, "service handler removed");
        Ok(())
    }

    /// Route one INVOKE request: look the handler up, validate the
    /// service ID, run the handler with no lock held, and account the
    /// result.
    pub(crate) async fn invoke(&self, request: InvokeRequest) -> InvokeOutcome {
        let entry = {
            let handlers = sync::read(&self.handlers);
            handlers.get(&request.service).cloned()
        };
        let Some(entry) = entry else {
            debug!(service = %request.service, "invoke for unknown service");
            return InvokeOutcome::unknown_service(None);
        };

        if request.id >= entry.nservices {
            entry.invalid.fetch_add(1, Ordering::Relaxed);
            debug!(
                service = %request.service,
                id = request.id,
                nservices = entry.nservices,
                "invoke with out-of-range service ID"
            );
            return InvokeOutcome::unknown_service(Some(entry));
        }

        let reply = {
            let _guard = InflightGuard::enter(&entry);
            entry.handler.call(request).await
        };

        if reply.result == RESULT_FATAL {
            entry.failed.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.succeeded.fetch_add(1, Ordering::Relaxed);
        }

        InvokeOutcome {
            resp_code: RESP_OK,
            result: reply.result,
            output: reply.output,
            timeout_update: reply.timeout_update,
            entry: Some(entry),
        }
    }

    /// Counters for the named handler.
    pub fn stats(&self, name: &str) -> Option<HandlerStats> {
        sync::read(&self.handlers).get(name).map(|e| e.stats())
    }

    /// Registered service names, in order.
    pub fn names(&self) -> Vec<String> {
        sync::read(&self.handlers).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        sync::read(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        sync::read(&self.handlers).is_empty()
    }

    /// Drop every registration. In-flight invocations finish on their
    /// own references.
    pub(crate) fn clear(&self) {
        let mut handlers = sync::write(&self.handlers);
        for entry in handlers.values() {
            entry.removed.store(true, Ordering::Release);
            debug!(name = %entry.name, "service handler dropped at shutdown");
        }
        handlers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;
    use pretty_assertions::assert_eq;

    fn request(service: &str, id: u32) -> InvokeRequest {
        let creds = ClientCreds {
            pid: 1,
            uid: 0,
            gid: 0,
        };
        InvokeRequest {
            session: Session::new(9, creds),
            service: service.to_string(),
            id,
            args: Message::new(),
            client: creds,
        }
    }

    fn echo_registry() -> HandlerRegistry {
        let registry = HandlerRegistry::new();
        registry
            .add("echo", 2, |req: InvokeRequest| async move {
                InvokeReply::with_output(req.args)
            })
            .unwrap();
        registry
    }

    #[test]
    fn test_add_rejects_duplicates() {
        let registry = echo_registry();
        let err = registry
            .add("echo", 1, |_req: InvokeRequest| async {
                InvokeReply::with_result(0)
            })
            .unwrap_err();
        assert!(matches!(err, ChannelError::HandlerExists(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_rejects_bad_names() {
        let registry = HandlerRegistry::new();
        for name in ["", "9lives", "bad name", "bad-name"] {
            let err = registry
                .add(name, 1, |_req: InvokeRequest| async {
                    InvokeReply::with_result(0)
                })
                .unwrap_err();
            assert!(matches!(err, ChannelError::InvalidName(_)), "{name:?}");
        }
    }

    #[tokio::test]
    async fn test_invoke_routes_to_handler() {
        let registry = echo_registry();
        let mut args = Message::new();
        args.push(bytes::Bytes::from_static(b"payload"));

        let mut req = request("echo", 1);
        req.args = args.clone();
        let outcome = registry.invoke(req).await;
        assert_eq!(outcome.resp_code, RESP_OK);
        assert_eq!(outcome.result, 0);
        assert_eq!(outcome.output, args);

        let stats = registry.stats("echo").unwrap();
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.invalid, 0);
    }

    #[tokio::test]
    async fn test_invoke_unknown_service() {
        let registry = echo_registry();
        let outcome = registry.invoke(request("nope", 0)).await;
        assert_eq!(outcome.resp_code, RESP_UNKNOWN_SERVICE);
        assert!(outcome.entry.is_none());
    }

    #[tokio::test]
    async fn test_invoke_out_of_range_id_counts_invalid() {
        let registry = echo_registry();
        let outcome = registry.invoke(request("echo", 5)).await;
        assert_eq!(outcome.resp_code, RESP_UNKNOWN_SERVICE);

        let stats = registry.stats("echo").unwrap();
        assert_eq!(stats.invalid, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn test_fatal_result_counts_failed() {
        let registry = HandlerRegistry::new();
        registry
            .add("boom", 1, |_req: InvokeRequest| async {
                InvokeReply::fatal()
            })
            .unwrap();

        let outcome = registry.invoke(request("boom", 0)).await;
        assert_eq!(outcome.result, RESULT_FATAL);
        let stats = registry.stats("boom").unwrap();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 0);
    }

    #[tokio::test]
    async fn test_remove_waits_for_inflight() {
        let registry = Arc::new(HandlerRegistry::new());
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        registry
            .add("slow", 1, move |_req: InvokeRequest| {
                let mut release = release_rx.clone();
                async move {
                    while !*release.borrow_and_update() {
                        if release.changed().await.is_err() {
                            break;
                        }
                    }
                    InvokeReply::with_result(7)
                }
            })
            .unwrap();

        let invoker = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.invoke(request("slow", 0)).await })
        };
        // Let the invocation reach the handler.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let remover = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.remove("slow").await })
        };
        // Removal must still be waiting while the call is in flight.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!remover.is_finished());
        // New lookups no longer see the handler.
        assert_eq!(registry.len(), 0);

        release_tx.send(true).unwrap();
        let outcome = invoker.await.unwrap();
        assert_eq!(outcome.result, 7);
        remover.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_remove_unknown_name() {
        let registry = HandlerRegistry::new();
        assert!(matches!(
            registry.remove("ghost").await,
            Err(ChannelError::UnknownService(_))
        ));
    }

    #[tokio::test]
    async fn test_clear_empties_registry() {
        let registry = echo_registry();
        registry.clear();
        assert!(registry.is_empty());
        let outcome = registry.invoke(request("echo", 0)).await;
        assert_eq!(outcome.resp_code, RESP_UNKNOWN_SERVICE);
    }
}
