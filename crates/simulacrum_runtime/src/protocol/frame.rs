//! Length-prefixed frame codec

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::ProtocolError;

/// Largest frame accepted by a reader
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Frame types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    // Broadcast channel
    Metadata = 1,
    Payload = 2,

    // Command channel
    Request = 3,
    Reply = 4,
}

impl TryFrom<u8> for FrameType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            1 => Ok(FrameType::Metadata),
            2 => Ok(FrameType::Payload),
            3 => Ok(FrameType::Request),
            4 => Ok(FrameType::Reply),
            _ => Err(ProtocolError::UnknownFrameType(value)),
        }
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(frame_type: FrameType, payload: impl Into<Bytes>) -> Self {
        Self {
            frame_type,
            payload: payload.into(),
        }
    }

    /// Fail with a desync error unless this frame has the expected type
    pub fn expect(self, expected: FrameType) -> Result<Self, ProtocolError> {
        if self.frame_type != expected {
            return Err(ProtocolError::Desync {
                expected,
                actual: self.frame_type,
            });
        }
        Ok(self)
    }
}

fn encode_into(buf: &mut BytesMut, frame_type: FrameType, payload: &[u8]) {
    buf.put_u32((1 + payload.len()) as u32);
    buf.put_u8(frame_type as u8);
    buf.put_slice(payload);
}

// ─────────────────────────────────────────────────────────────────────────────
// Writer
// ─────────────────────────────────────────────────────────────────────────────

/// Writes frames to any async byte sink
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a single frame
    pub async fn send(&mut self, frame_type: FrameType, payload: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::with_capacity(5 + payload.len());
        encode_into(&mut buf, frame_type, payload);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Send a frame with a JSON payload
    pub async fn send_json<T: Serialize>(&mut self, frame_type: FrameType, data: &T) -> Result<(), ProtocolError> {
        let payload = serde_json::to_vec(data)?;
        self.send(frame_type, &payload).await
    }

    /// Send a metadata frame and its payload frame as one write
    pub async fn send_pair(&mut self, metadata: &[u8], payload: &[u8]) -> Result<(), ProtocolError> {
        let mut buf = BytesMut::with_capacity(10 + metadata.len() + payload.len());
        encode_into(&mut buf, FrameType::Metadata, metadata);
        encode_into(&mut buf, FrameType::Payload, payload);
        self.inner.write_all(&buf).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Reader
// ─────────────────────────────────────────────────────────────────────────────

/// Reads frames from any async byte source
pub struct FrameReader<R> {
    inner: R,
    max_len: usize,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            max_len: MAX_FRAME_LEN,
        }
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Receive the next frame. Returns `None` on a clean end of stream.
    pub async fn recv(&mut self) -> Result<Option<Frame>, ProtocolError> {
        // Read length (4 bytes, big-endian)
        let mut len_buf = [0u8; 4];
        match self.inner.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;

        if len == 0 {
            return Err(ProtocolError::EmptyFrame);
        }
        if len > self.max_len {
            return Err(ProtocolError::FrameTooLarge(len));
        }

        // Read frame type (1 byte)
        let mut type_buf = [0u8; 1];
        self.inner.read_exact(&mut type_buf).await?;
        let frame_type = FrameType::try_from(type_buf[0])?;

        // Read payload
        let mut payload = vec![0u8; len - 1];
        if !payload.is_empty() {
            self.inner.read_exact(&mut payload).await?;
        }

        Ok(Some(Frame::new(frame_type, payload)))
    }

    /// Receive the next frame, treating end of stream as an error
    pub async fn recv_required(&mut self) -> Result<Frame, ProtocolError> {
        self.recv().await?.ok_or(ProtocolError::Closed)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
