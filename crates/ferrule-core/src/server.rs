//! The channel accept loop.
//!
//! One task owns the listener; every accepted connection gets its own
//! dispatch task. Admission against the client and session limits
//! happens inside the handshake so rejected clients still receive a
//! clean "too many" reply.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::UnixListener;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::channel::{Channel, ShutdownSignal};
use crate::dispatch;

/// The accept task holds the channel weakly so an abandoned channel can
/// still drop and tear itself down.
pub(crate) async fn accept_loop(
    channel: Weak<Channel>,
    listener: UnixListener,
    mut shutdown_rx: broadcast::Receiver<ShutdownSignal>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let Some(channel) = channel.upgrade() else { break };
                match accepted {
                    Ok((stream, _addr)) => {
                        tokio::spawn(dispatch::serve_connection(Arc::clone(&channel), stream));
                    }
                    Err(e) => {
                        // Transient accept failures (EMFILE and friends)
                        // are retried after a breather; the listener
                        // stays up.
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        }
    }
    debug!("accept loop stopped");
}
