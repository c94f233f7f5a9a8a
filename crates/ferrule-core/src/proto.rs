//! Wire protocol constants and the handshake codec.
//!
//! All multi-byte integers on the wire are big-endian. A connection opens
//! with a three-byte handshake, after which the client drives the session
//! one command byte at a time.

use std::time::Duration;

use crate::error::ChannelError;

/// Protocol magic sent by clients and echoed by the server.
pub const HANDSHAKE_MAGIC: u8 = 0xC5;

/// Reply magic telling the client the server is at its connection limit.
pub const HANDSHAKE_MAGIC_TOOMANY: u8 = 0x3A;

/// Byte-order code: little-endian.
pub const ORDER_LITTLE: u8 = 1;

/// Byte-order code: big-endian.
pub const ORDER_BIG: u8 = 2;

/// Command byte: liveness check, echoes a 32-bit token.
pub const CMD_PING: u8 = 0;

/// Command byte: invoke a named service handler.
pub const CMD_INVOKE: u8 = 1;

/// Command byte: turn this session into an event listener.
pub const CMD_EVENT: u8 = 2;

/// Acknowledgement byte sent after a session enters event-listener mode.
pub const EVENT_ACK_OK: u8 = 1;

/// Event-listener subcommand: merge mask bits for named services.
pub const SUBCMD_MASK_ADD: u8 = 0x10;

/// Event-listener subcommand: clear mask bits for named services.
pub const SUBCMD_MASK_DEL: u8 = 0x11;

/// Event-listener subcommand: replace the whole mask set.
pub const SUBCMD_MASK_RESET: u8 = 0x12;

/// INVOKE response code: the handler ran.
pub const RESP_OK: u32 = 0;

/// INVOKE response code: unknown service name or out-of-range service ID.
pub const RESP_UNKNOWN_SERVICE: u32 = 1;

/// Handler result sentinel: fatal, no output message follows the response.
pub const RESULT_FATAL: i32 = -1;

/// Maximum length of a service name in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Highest event type; types index bits of a 32-bit mask word.
pub const MAX_EVENT_TYPE: u32 = 31;

/// Event mask accepting every event type.
pub const EVENT_MASK_ALL: u32 = u32::MAX;

/// Compute the mask bit for a single event type.
///
/// Fails if the type does not fit the mask word.
pub fn event_mask(evtype: u32) -> Result<u32, ChannelError> {
    if evtype > MAX_EVENT_TYPE {
        return Err(ChannelError::InvalidEventType(evtype));
    }
    Ok(1u32 << evtype)
}

/// Check a service name against the naming rules: a C-identifier of at
/// most [`MAX_NAME_LEN`] bytes.
pub fn is_valid_service_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// The fixed-size connection handshake.
///
/// The client states the protocol magic, its native byte order, and the
/// byte order it wants for subsequent messages; the server echoes the
/// magic (or replies [`HANDSHAKE_MAGIC_TOOMANY`]) with the negotiated
/// order fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub magic: u8,
    pub order: u8,
    pub forder: u8,
}

impl Handshake {
    /// The handshake a well-behaved client opens with.
    pub fn request() -> Self {
        Self {
            magic: HANDSHAKE_MAGIC,
            order: ORDER_BIG,
            forder: ORDER_BIG,
        }
    }

    pub fn to_bytes(self) -> [u8; 3] {
        [self.magic, self.order, self.forder]
    }

    pub fn from_bytes(bytes: [u8; 3]) -> Self {
        Self {
            magic: bytes[0],
            order: bytes[1],
            forder: bytes[2],
        }
    }

    /// Validate a client handshake: magic must match and both order codes
    /// must be known.
    pub fn validate(&self) -> Result<(), ChannelError> {
        if self.magic != HANDSHAKE_MAGIC {
            return Err(ChannelError::Protocol(format!(
                "bad handshake magic: {:#04x}",
                self.magic
            )));
        }
        for order in [self.order, self.forder] {
            if order != ORDER_LITTLE && order != ORDER_BIG {
                return Err(ChannelError::Protocol(format!(
                    "bad byte-order code: {order:#04x}"
                )));
            }
        }
        Ok(())
    }
}

/// Await `fut` under an optional deadline, mapping expiry to
/// [`ChannelError::TimedOut`]. `None` waits forever, matching a
/// configured timeout of zero.
pub async fn with_timeout<T, E, F>(limit: Option<Duration>, fut: F) -> Result<T, ChannelError>
where
    F: Future<Output = Result<T, E>>,
    ChannelError: From<E>,
{
    match limit {
        None => fut.await.map_err(ChannelError::from),
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result.map_err(ChannelError::from),
            Err(_) => Err(ChannelError::TimedOut),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_handshake_round_trip() {
        let hs = Handshake::request();
        let decoded = Handshake::from_bytes(hs.to_bytes());
        assert_eq!(hs, decoded);
        decoded.validate().unwrap();
    }

    #[test]
    fn test_handshake_rejects_bad_magic() {
        let hs = Handshake::from_bytes([0x00, ORDER_BIG, ORDER_BIG]);
        assert!(matches!(hs.validate(), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn test_handshake_rejects_bad_order() {
        let hs = Handshake::from_bytes([HANDSHAKE_MAGIC, 7, ORDER_BIG]);
        assert!(matches!(hs.validate(), Err(ChannelError::Protocol(_))));
        let hs = Handshake::from_bytes([HANDSHAKE_MAGIC, ORDER_LITTLE, 0]);
        assert!(matches!(hs.validate(), Err(ChannelError::Protocol(_))));
    }

    #[test]
    fn test_service_name_rules() {
        assert!(is_valid_service_name("svcA"));
        assert!(is_valid_service_name("_private"));
        assert!(is_valid_service_name("a1_b2"));
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("1st"));
        assert!(!is_valid_service_name("has space"));
        assert!(!is_valid_service_name("has-dash"));
        assert!(!is_valid_service_name(&"x".repeat(MAX_NAME_LEN + 1)));
        assert!(is_valid_service_name(&"x".repeat(MAX_NAME_LEN)));
    }

    #[test]
    fn test_event_mask_bits() {
        assert_eq!(event_mask(0).unwrap(), 1);
        assert_eq!(event_mask(3).unwrap(), 8);
        assert_eq!(event_mask(31).unwrap(), 1 << 31);
        assert!(matches!(
            event_mask(32),
            Err(ChannelError::InvalidEventType(32))
        ));
    }

    #[tokio::test]
    async fn test_with_timeout_elapses() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, std::io::Error>(())
        };
        let result = with_timeout(Some(Duration::from_millis(10)), slow).await;
        assert!(matches!(result, Err(ChannelError::TimedOut)));
    }

    #[tokio::test]
    async fn test_with_timeout_none_is_unbounded() {
        let quick = async { Ok::<_, std::io::Error>(42) };
        assert_eq!(with_timeout(None, quick).await.unwrap(), 42);
    }
}
