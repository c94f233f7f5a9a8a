//! Error types for the channel runtime.

use std::path::PathBuf;

/// Errors produced by the channel runtime and its sub-components.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// A channel is already initialized in this process.
    #[error("channel is already initialized")]
    AlreadyInitialized,

    /// The channel has been shut down and cannot be used or re-initialized.
    #[error("channel has been shut down")]
    ShutDown,

    /// The socket path is occupied by a live listener.
    #[error("socket address already in use: {0}")]
    AddrInUse(PathBuf),

    /// Another process holds the startup lock file.
    #[error("startup lock is held by another instance: {0}")]
    Locked(PathBuf),

    /// A handler with the same service name is already registered.
    #[error("service {0:?} is already registered")]
    HandlerExists(String),

    /// No handler is registered under the given service name.
    #[error("no such service: {0:?}")]
    UnknownService(String),

    /// The service name does not satisfy the naming rules.
    #[error("invalid service name: {0:?}")]
    InvalidName(String),

    /// The event type is outside the mask word.
    #[error("invalid event type: {0}")]
    InvalidEventType(u32),

    /// The resource is busy (a waiter is already registered, or a
    /// descriptor already exists for the event).
    #[error("resource is busy")]
    Busy,

    /// The event was destroyed before delivery completed.
    #[error("event destroyed before delivery")]
    Destroyed,

    /// The operation was canceled by channel shutdown.
    #[error("operation canceled by shutdown")]
    Canceled,

    /// A wait or I/O deadline elapsed.
    #[error("operation timed out")]
    TimedOut,

    /// No live delivery descriptor has the given ID.
    #[error("no such event descriptor: {0}")]
    DescNotFound(u32),

    /// The peer violated the wire protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The peer closed or reset the connection.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// The connection was rejected because the client limit was reached.
    #[error("too many clients")]
    TooManyClients,

    /// Configuration was rejected.
    #[error(transparent)]
    Config(#[from] ferrule_config::ConfigError),

    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ChannelError {
    /// Fold peer-disconnect error kinds into [`ChannelError::ConnectionReset`]
    /// and malformed-data kinds into [`ChannelError::Protocol`], so the
    /// dispatch loop can tell a vanished client from a broken one.
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof => {
                ChannelError::ConnectionReset
            }
            ErrorKind::InvalidData => ChannelError::Protocol(e.to_string()),
            _ => ChannelError::Io(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error, ErrorKind};

    #[test]
    fn test_io_error_mapping() {
        assert!(matches!(
            ChannelError::from(Error::new(ErrorKind::UnexpectedEof, "eof")),
            ChannelError::ConnectionReset
        ));
        assert!(matches!(
            ChannelError::from(Error::new(ErrorKind::BrokenPipe, "pipe")),
            ChannelError::ConnectionReset
        ));
        assert!(matches!(
            ChannelError::from(Error::new(ErrorKind::InvalidData, "bad frame")),
            ChannelError::Protocol(_)
        ));
        assert!(matches!(
            ChannelError::from(Error::new(ErrorKind::PermissionDenied, "perm")),
            ChannelError::Io(_)
        ));
    }
}
