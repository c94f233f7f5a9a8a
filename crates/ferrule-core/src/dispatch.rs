//! The per-connection dispatch state machine.
//!
//! Every accepted connection runs `ACCEPTED → HANDSHAKING →
//! {PING | INVOKE | EVENT}* → RESET | SHUTDOWN → CLOSED` on its own
//! task. The command-byte read carries no timeout so idle clients can
//! sit forever; everything after a command byte runs under the session
//! timeout.

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, Interest};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{Channel, ShutdownSignal};
use crate::error::ChannelError;
use crate::event::{EventQueue, MaskOp, write_event_pdu};
use crate::handler::InvokeRequest;
use crate::message::Message;
use crate::proto::{
    self, CMD_EVENT, CMD_INVOKE, CMD_PING, EVENT_ACK_OK, HANDSHAKE_MAGIC,
    HANDSHAKE_MAGIC_TOOMANY, Handshake, RESULT_FATAL,
};
use crate::session::{ClientCreds, Session, SessionCallbackKind, SessionFlags};

/// Upper bound on mask pairs in one subcommand.
const MAX_MASK_PAIRS: usize = 256;

/// What the reset watcher saw while a handler call was in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResetWatch {
    /// The peer closed or errored; the session is dead.
    Reset,
    /// The peer sent bytes mid-call; stop watching and let the dispatch
    /// loop deal with them after the reply.
    DataArrived,
}

/// Entry point for one accepted connection.
pub(crate) async fn serve_connection(channel: Arc<Channel>, stream: UnixStream) {
    let creds = match stream.peer_cred() {
        Ok(cred) => ClientCreds {
            pid: cred.pid().unwrap_or(0),
            uid: cred.uid(),
            gid: cred.gid(),
        },
        Err(e) => {
            debug!(error = %e, "could not read peer credentials, dropping connection");
            return;
        }
    };
    let (mut rd, mut wr) = stream.into_split();
    let timeout = channel.default_timeout();

    // Handshake: magic and byte-order codes, validated before the
    // session exists.
    let mut raw = [0u8; 3];
    if let Err(e) = proto::with_timeout(timeout, rd.read_exact(&mut raw)).await {
        debug!(error = %e, "handshake read failed");
        return;
    }
    let handshake = Handshake::from_bytes(raw);
    if let Err(e) = handshake.validate() {
        debug!(error = %e, pid = creds.pid, "handshake rejected");
        return;
    }

    if !channel.try_admit() {
        // Over the limit: answer cleanly so the client sees a rejection
        // rather than a reset, then close.
        warn!(pid = creds.pid, "connection rejected: client limit reached");
        let reply = Handshake {
            magic: HANDSHAKE_MAGIC_TOOMANY,
            ..handshake
        };
        let _ = proto::with_timeout(timeout, async {
            wr.write_all(&reply.to_bytes()).await?;
            wr.flush().await
        })
        .await;
        return;
    }

    let session = Session::new(channel.next_session_id(), creds);
    channel.register_session(Arc::clone(&session));
    debug!(session = session.id(), pid = creds.pid, "session accepted");

    let reply = Handshake {
        magic: HANDSHAKE_MAGIC,
        ..handshake
    };
    let result = match proto::with_timeout(timeout, async {
        wr.write_all(&reply.to_bytes()).await?;
        wr.flush().await
    })
    .await
    {
        Ok(()) => dispatch_loop(&channel, &session, &mut rd, &mut wr).await,
        Err(e) => Err(e),
    };

    match &result {
        Ok(()) | Err(ChannelError::ShutDown) => {
            debug!(session = session.id(), "session closed")
        }
        Err(ChannelError::ConnectionReset) => session.mark_reset(),
        Err(e) => debug!(session = session.id(), error = %e, "session failed"),
    }

    session.fire_callback(SessionCallbackKind::Terminated);
    channel.unregister_session(session.id());
}

/// Read command bytes and execute them until the session ends.
async fn dispatch_loop(
    channel: &Arc<Channel>,
    session: &Arc<Session>,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
) -> Result<(), ChannelError> {
    let mut shutdown_rx = channel.subscribe_shutdown();
    loop {
        // No timeout here: an idle connection is allowed to wait
        // indefinitely for its next command.
        let cmd = tokio::select! {
            _ = shutdown_rx.recv() => {
                session.set_flags(SessionFlags::SHUTDOWN);
                return Err(ChannelError::ShutDown);
            }
            cmd = rd.read_u8() => cmd.map_err(ChannelError::from)?,
        };
        match cmd {
            CMD_PING => exec_ping(channel, session, rd, wr).await?,
            CMD_INVOKE => exec_invoke(channel, session, rd, wr).await?,
            CMD_EVENT => {
                // Never returns Ok: the session stays a listener until
                // reset or shutdown tears it down.
                return exec_event(channel, session, rd, wr, &mut shutdown_rx).await;
            }
            other => {
                return Err(ChannelError::Protocol(format!(
                    "unknown command byte {other:#04x}"
                )));
            }
        }
    }
}

/// PING: echo a 32-bit token.
async fn exec_ping(
    channel: &Arc<Channel>,
    session: &Arc<Session>,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
) -> Result<(), ChannelError> {
    let timeout = session.effective_timeout(channel.default_timeout());
    let token = proto::with_timeout(timeout, rd.read_u32()).await?;
    proto::with_timeout(timeout, async {
        wr.write_u32(token).await?;
        wr.flush().await
    })
    .await
}

/// INVOKE: route one call through the handler registry while watching
/// the socket for a connection reset.
async fn exec_invoke(
    channel: &Arc<Channel>,
    session: &Arc<Session>,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
) -> Result<(), ChannelError> {
    let timeout = session.effective_timeout(channel.default_timeout());
    let (name, id, args) = proto::with_timeout(timeout, async {
        let name_len = rd.read_u8().await? as usize;
        let id = rd.read_u32().await?;
        if name_len == 0 || name_len > proto::MAX_NAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("bad service name length {name_len}"),
            ));
        }
        let mut name_buf = vec![0u8; name_len];
        rd.read_exact(&mut name_buf).await?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "service name is not UTF-8"))?;
        let args = Message::read_from(rd).await?;
        Ok((name, id, args))
    })
    .await?;
    if !proto::is_valid_service_name(&name) {
        return Err(ChannelError::Protocol(format!("bad service name {name:?}")));
    }

    session.set_active_service(&name, id);
    // The session deadline is always relative to handler invocation.
    let deadline = timeout.map(|t| Instant::now() + t);

    let request = InvokeRequest {
        session: Arc::clone(session),
        service: name.clone(),
        id,
        args,
        client: session.creds(),
    };
    let call = channel.handlers().invoke(request);
    tokio::pin!(call);

    session.set_flags(SessionFlags::WATCHED);
    let outcome = loop {
        let watching = session.flags().contains(SessionFlags::WATCHED);
        tokio::select! {
            outcome = &mut call => break outcome,
            watch = watch_reset(rd), if watching => {
                session.clear_flags(SessionFlags::WATCHED);
                if watch == ResetWatch::Reset {
                    // Report now so reset callbacks run while the
                    // handler may still be blocked; the reply is
                    // skipped once the handler returns.
                    session.mark_reset();
                }
            }
        }
    };
    session.clear_flags(SessionFlags::WATCHED);

    if let Some(update) = outcome.timeout_update {
        session.set_timeout(update);
    }

    if session.is_reset() {
        if let Some(entry) = &outcome.entry {
            entry.count_resp_error();
        }
        return Err(ChannelError::ConnectionReset);
    }
    if let Some(deadline) = deadline
        && Instant::now() >= deadline
    {
        session.set_flags(SessionFlags::TIMEDOUT);
        warn!(
            session = session.id(),
            service = %name,
            "handler exceeded session timeout"
        );
        return Err(ChannelError::TimedOut);
    }

    let send = async {
        wr.write_u32(outcome.resp_code).await?;
        wr.write_i32(outcome.result).await?;
        if outcome.result != RESULT_FATAL {
            outcome.output.write_to(wr).await?;
        }
        wr.flush().await
    };
    let sent = match deadline {
        Some(deadline) => match tokio::time::timeout_at(deadline, send).await {
            Ok(result) => result.map_err(ChannelError::from),
            Err(_) => Err(ChannelError::TimedOut),
        },
        None => send.await.map_err(ChannelError::from),
    };
    if let Err(e) = sent {
        if let Some(entry) = &outcome.entry {
            entry.count_resp_error();
        }
        return Err(e);
    }

    session.clear_active_service();
    Ok(())
}

/// Watch an idle read half for connection reset while a handler call is
/// in flight. Resolves without consuming any buffered bytes.
async fn watch_reset(rd: &OwnedReadHalf) -> ResetWatch {
    loop {
        match rd.ready(Interest::READABLE | Interest::ERROR).await {
            Err(_) => return ResetWatch::Reset,
            Ok(ready) if ready.is_read_closed() || ready.is_error() => return ResetWatch::Reset,
            Ok(ready) if ready.is_readable() => return ResetWatch::DataArrived,
            Ok(_) => continue,
        }
    }
}

/// EVENT: turn the session into an event listener.
///
/// The loop alternates between streaming queued events to the client and
/// applying mask subcommands from it, and exits only on reset or on
/// channel/queue shutdown — the shutdown sentinel tells the caller to
/// end the session task.
async fn exec_event(
    channel: &Arc<Channel>,
    session: &Arc<Session>,
    rd: &mut OwnedReadHalf,
    wr: &mut OwnedWriteHalf,
    shutdown_rx: &mut broadcast::Receiver<ShutdownSignal>,
) -> Result<(), ChannelError> {
    // All reads here are unbuffered: a listener must never read ahead
    // past the bytes of the current subcommand.
    let queue = EventQueue::new(session.id(), session.creds().pid);
    session.attach_queue(Arc::clone(&queue));
    channel.register_event_queue(Arc::clone(&queue));

    wr.write_u8(EVENT_ACK_OK).await.map_err(ChannelError::from)?;
    wr.flush().await.map_err(ChannelError::from)?;
    debug!(session = session.id(), "session entered event-listener mode");

    loop {
        if channel.is_shutdown() || queue.is_shutdown() {
            session.set_flags(SessionFlags::EVQ_SHUTDOWN);
            return Err(ChannelError::ShutDown);
        }

        // Drain queued events before blocking; delivery is FIFO.
        while let Some(entry) = queue.pop() {
            let timeout = session.effective_timeout(channel.default_timeout());
            proto::with_timeout(timeout, write_event_pdu(wr, entry.event())).await?;
            debug!(
                session = session.id(),
                serial = entry.event().serial(),
                "event delivered"
            );
            if channel.is_shutdown() || queue.is_shutdown() {
                session.set_flags(SessionFlags::EVQ_SHUTDOWN);
                return Err(ChannelError::ShutDown);
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => {
                session.set_flags(SessionFlags::SHUTDOWN);
                return Err(ChannelError::ShutDown);
            }
            _ = queue.notified() => {}
            byte = rd.read_u8() => {
                let byte = byte.map_err(ChannelError::from)?;
                let op = MaskOp::from_wire(byte).ok_or_else(|| {
                    ChannelError::Protocol(format!("unknown event subcommand {byte:#04x}"))
                })?;
                let timeout = session.effective_timeout(channel.default_timeout());
                let pairs = read_mask_pairs(rd, timeout).await?;
                debug!(
                    session = session.id(),
                    ?op,
                    pairs = pairs.len(),
                    "event mask updated"
                );
                queue.apply_mask(op, &pairs);
            }
        }
    }
}

/// Read `{name length, name, mask}` pairs terminated by a zero-length
/// name.
async fn read_mask_pairs(
    rd: &mut OwnedReadHalf,
    timeout: Option<std::time::Duration>,
) -> Result<Vec<(String, u32)>, ChannelError> {
    proto::with_timeout(timeout, async {
        let mut pairs = Vec::new();
        loop {
            let name_len = rd.read_u8().await? as usize;
            if name_len == 0 {
                break;
            }
            if name_len > proto::MAX_NAME_LEN {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad mask name length {name_len}"),
                ));
            }
            if pairs.len() >= MAX_MASK_PAIRS {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "too many mask pairs in one subcommand",
                ));
            }
            let mut name_buf = vec![0u8; name_len];
            rd.read_exact(&mut name_buf).await?;
            let name = String::from_utf8(name_buf).map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, "mask name is not UTF-8")
            })?;
            if !proto::is_valid_service_name(&name) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("bad mask name {name:?}"),
                ));
            }
            let mask = rd.read_u32().await?;
            pairs.push((name, mask));
        }
        Ok(pairs)
    })
    .await
}
