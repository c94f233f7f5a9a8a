#![deny(unsafe_code)]

//! Typed client for Ferrule IPC channels.
//!
//! Connects to a channel's Unix domain socket, performs the handshake,
//! and exposes the protocol commands: [`Client::ping`],
//! [`Client::invoke`], and [`Client::into_event_listener`] for the
//! event subscription sub-protocol.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tracing::debug;

use ferrule_core::Message;
use ferrule_core::proto::{
    CMD_EVENT, CMD_INVOKE, CMD_PING, EVENT_ACK_OK, HANDSHAKE_MAGIC, HANDSHAKE_MAGIC_TOOMANY,
    Handshake, MAX_NAME_LEN, RESP_OK, RESP_UNKNOWN_SERVICE, RESULT_FATAL, SUBCMD_MASK_ADD,
    SUBCMD_MASK_DEL, SUBCMD_MASK_RESET,
};

/// Errors from the channel client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to channel socket at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("channel is not running (socket not found at {0})")]
    NotRunning(PathBuf),

    #[error("server refused the connection: too many clients")]
    TooManyClients,

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("no such service: {0:?}")]
    NoSuchService(String),

    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of one INVOKE exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvokeResult {
    /// Handler result code.
    pub result: i32,
    /// Output payload; empty when the handler signaled a fatal result.
    pub output: Message,
}

/// One event received by an [`EventListener`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventNotice {
    /// Serial assigned when the event was posted.
    pub serial: u32,
    /// Event type (0..=31).
    pub evtype: u32,
    /// Originating service name.
    pub name: String,
    /// Post-time timestamp.
    pub timestamp: SystemTime,
    /// Event payload.
    pub payload: Message,
}

/// A connected, handshaken channel client.
#[derive(Debug)]
pub struct Client {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    socket_path: PathBuf,
}

impl Client {
    /// Connect to the channel socket and perform the handshake.
    pub async fn connect(socket_path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let socket_path = socket_path.into();
        if !socket_path.exists() {
            return Err(ClientError::NotRunning(socket_path));
        }
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| ClientError::Connect {
                path: socket_path.clone(),
                source: e,
            })?;
        let (mut rd, mut wr) = stream.into_split();

        wr.write_all(&Handshake::request().to_bytes()).await?;
        wr.flush().await?;

        let mut raw = [0u8; 3];
        rd.read_exact(&mut raw).await?;
        let reply = Handshake::from_bytes(raw);
        match reply.magic {
            HANDSHAKE_MAGIC => {}
            HANDSHAKE_MAGIC_TOOMANY => return Err(ClientError::TooManyClients),
            other => {
                return Err(ClientError::Handshake(format!(
                    "unexpected reply magic {other:#04x}"
                )));
            }
        }
        debug!(path = %socket_path.display(), "channel handshake complete");
        Ok(Self {
            rd,
            wr,
            socket_path,
        })
    }

    /// Path this client is connected to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Liveness check: sends a token, expects it echoed.
    pub async fn ping(&mut self, token: u32) -> Result<(), ClientError> {
        self.wr.write_u8(CMD_PING).await?;
        self.wr.write_u32(token).await?;
        self.wr.flush().await?;
        let echoed = self.rd.read_u32().await?;
        if echoed != token {
            return Err(ClientError::Protocol(format!(
                "ping echoed {echoed:#x}, expected {token:#x}"
            )));
        }
        Ok(())
    }

    /// Invoke service `id` of the handler registered under `service`.
    pub async fn invoke(
        &mut self,
        service: &str,
        id: u32,
        args: &Message,
    ) -> Result<InvokeResult, ClientError> {
        if service.is_empty() || service.len() > MAX_NAME_LEN {
            return Err(ClientError::InvalidName(service.to_string()));
        }
        self.wr.write_u8(CMD_INVOKE).await?;
        self.wr.write_u8(service.len() as u8).await?;
        self.wr.write_u32(id).await?;
        self.wr.write_all(service.as_bytes()).await?;
        args.write_to(&mut self.wr).await?;
        self.wr.flush().await?;

        let resp_code = self.rd.read_u32().await?;
        let result = self.rd.read_i32().await?;
        let output = if result != RESULT_FATAL {
            Message::read_from(&mut self.rd).await?
        } else {
            Message::new()
        };
        match resp_code {
            RESP_OK => Ok(InvokeResult { result, output }),
            RESP_UNKNOWN_SERVICE => Err(ClientError::NoSuchService(service.to_string())),
            other => Err(ClientError::Protocol(format!(
                "unknown response code {other}"
            ))),
        }
    }

    /// Switch this connection into event-listener mode.
    ///
    /// The listener starts with an empty mask; add masks to receive
    /// events.
    pub async fn into_event_listener(mut self) -> Result<EventListener, ClientError> {
        self.wr.write_u8(CMD_EVENT).await?;
        self.wr.flush().await?;
        let ack = self.rd.read_u8().await?;
        if ack != EVENT_ACK_OK {
            return Err(ClientError::Protocol(format!(
                "event listener not acknowledged: {ack:#04x}"
            )));
        }
        Ok(EventListener {
            rd: self.rd,
            wr: self.wr,
        })
    }
}

/// A connection subscribed to the event sub-protocol.
pub struct EventListener {
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
}

impl EventListener {
    /// Merge mask bits for one service name.
    pub async fn mask_add(&mut self, name: &str, mask: u32) -> Result<(), ClientError> {
        self.send_mask(SUBCMD_MASK_ADD, &[(name, mask)]).await
    }

    /// Clear mask bits for one service name.
    pub async fn mask_del(&mut self, name: &str, mask: u32) -> Result<(), ClientError> {
        self.send_mask(SUBCMD_MASK_DEL, &[(name, mask)]).await
    }

    /// Replace the whole mask set with the given pairs.
    pub async fn mask_reset(&mut self, pairs: &[(&str, u32)]) -> Result<(), ClientError> {
        self.send_mask(SUBCMD_MASK_RESET, pairs).await
    }

    async fn send_mask(&mut self, subcmd: u8, pairs: &[(&str, u32)]) -> Result<(), ClientError> {
        for (name, _) in pairs {
            if name.is_empty() || name.len() > MAX_NAME_LEN {
                return Err(ClientError::InvalidName(name.to_string()));
            }
        }
        self.wr.write_u8(subcmd).await?;
        for (name, mask) in pairs {
            self.wr.write_u8(name.len() as u8).await?;
            self.wr.write_all(name.as_bytes()).await?;
            self.wr.write_u32(*mask).await?;
        }
        // Zero-length name terminates the pair list.
        self.wr.write_u8(0).await?;
        self.wr.flush().await?;
        Ok(())
    }

    /// Receive the next event delivered to this listener.
    ///
    /// Blocks until an event arrives; wrap in a timeout to poll.
    pub async fn next_event(&mut self) -> Result<EventNotice, ClientError> {
        let type_byte = self.rd.read_u8().await?;
        let serial = self.rd.read_u32().await?;
        let evtype = self.rd.read_u32().await?;
        if u32::from(type_byte) != evtype {
            return Err(ClientError::Protocol(format!(
                "event type mismatch: {type_byte} vs {evtype}"
            )));
        }
        let name_len = self.rd.read_u8().await? as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(ClientError::Protocol(format!(
                "bad event name length {name_len}"
            )));
        }
        let secs = self.rd.read_u64().await?;
        let nanos = self.rd.read_u32().await?;
        let mut name_buf = vec![0u8; name_len];
        self.rd.read_exact(&mut name_buf).await?;
        let name = String::from_utf8(name_buf)
            .map_err(|_| ClientError::Protocol("event name is not UTF-8".to_string()))?;
        let payload = Message::read_from(&mut self.rd).await?;

        Ok(EventNotice {
            serial,
            evtype,
            name,
            timestamp: UNIX_EPOCH + Duration::new(secs, nanos),
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.sock");
        let result = Client::connect(&path).await;
        assert!(matches!(result, Err(ClientError::NotRunning(_))));
    }
}
