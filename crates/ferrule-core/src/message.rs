//! The opaque message codec carried by INVOKE and EVENT payloads.
//!
//! A [`Message`] is an ordered sequence of byte frames. On the wire it is
//! a frame count followed by length-prefixed frames; both bounds are
//! validated before any allocation.

use std::io;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of frames a single message may carry.
pub const MAX_FRAMES: u32 = 1024;

/// Maximum size of a single frame in bytes.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;

/// An opaque, frame-structured payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    frames: Vec<Bytes>,
}

impl Message {
    /// Create an empty message.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one frame.
    pub fn push(&mut self, frame: impl Into<Bytes>) {
        self.frames.push(frame.into());
    }

    /// The frames in order.
    pub fn frames(&self) -> &[Bytes] {
        &self.frames
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Decode a message, validating frame count and sizes before
    /// allocating.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Self> {
        let count = reader.read_u32().await?;
        if count > MAX_FRAMES {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message frame count {count} exceeds {MAX_FRAMES}"),
            ));
        }
        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let len = reader.read_u32().await?;
            if len > MAX_FRAME_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("message frame size {len} exceeds {MAX_FRAME_SIZE}"),
                ));
            }
            let mut buf = vec![0u8; len as usize];
            reader.read_exact(&mut buf).await?;
            frames.push(Bytes::from(buf));
        }
        Ok(Self { frames })
    }

    /// Encode the message. The caller is responsible for flushing.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32(self.frames.len() as u32).await?;
        for frame in &self.frames {
            writer.write_u32(frame.len() as u32).await?;
            writer.write_all(frame).await?;
        }
        Ok(())
    }
}

impl FromIterator<Bytes> for Message {
    fn from_iter<I: IntoIterator<Item = Bytes>>(iter: I) -> Self {
        Self {
            frames: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_codec_round_trip() {
        let mut msg = Message::new();
        msg.push(Bytes::from_static(b"hello"));
        msg.push(Bytes::new());
        msg.push(Bytes::from(vec![0u8; 300]));

        let mut wire = Vec::new();
        msg.write_to(&mut wire).await.unwrap();

        let decoded = Message::read_from(&mut wire.as_slice()).await.unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.len(), 3);
    }

    #[tokio::test]
    async fn test_empty_message() {
        let msg = Message::new();
        let mut wire = Vec::new();
        msg.write_to(&mut wire).await.unwrap();
        assert_eq!(wire, vec![0, 0, 0, 0]);

        let decoded = Message::read_from(&mut wire.as_slice()).await.unwrap();
        assert!(decoded.is_empty());
    }

    #[tokio::test]
    async fn test_frame_count_bound() {
        let wire = u32::MAX.to_be_bytes();
        let err = Message::read_from(&mut wire.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_frame_size_bound() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        let err = Message::read_from(&mut wire.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1u32.to_be_bytes());
        wire.extend_from_slice(&8u32.to_be_bytes());
        wire.extend_from_slice(b"shrt");
        let err = Message::read_from(&mut wire.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
