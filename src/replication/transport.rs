//! Framed Transport
//!
//! Carries wire-encoded messages over any byte stream. Each frame is
//! `u32 BE length | u32 BE crc32 | payload`.
//!
//! Uses Sans-IO pattern: framing is separated from I/O for testability.

use crate::wire::{self, CodecError, Message, ReadContext, Registry, WriteContext};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length and checksum.
pub const HEADER_LEN: usize = 8;

/// Default payload limit (16 MiB).
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("frame of {len} bytes exceeds limit of {max}")]
    TooLarge { len: usize, max: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
}

// ==================== Sans-IO Functions ====================

/// Append one frame holding `payload` to `out`.
pub fn encode_frame(payload: &[u8], max: usize, out: &mut BytesMut) -> Result<(), FrameError> {
    if payload.len() > max || u32::try_from(payload.len()).is_err() {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max,
        });
    }
    out.reserve(HEADER_LEN + payload.len());
    out.put_u32(payload.len() as u32);
    out.put_u32(crc32fast::hash(payload));
    out.put_slice(payload);
    Ok(())
}

/// Take one complete frame off the front of `buf`.
///
/// Returns `Ok(None)` and leaves `buf` untouched if the frame is not
/// complete yet.
pub fn decode_frame(buf: &mut BytesMut, max: usize) -> Result<Option<Bytes>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(4);
    let expected = buf.get_u32();
    let payload = buf.split_to(len).freeze();
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(FrameError::Checksum { expected, actual });
    }
    Ok(Some(payload))
}

// ==================== Async I/O ====================

pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max: usize) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut out = BytesMut::new();
    encode_frame(payload, max, &mut out)?;
    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max: usize) -> Result<Option<Bytes>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    let actual = crc32fast::hash(&payload);
    if actual != expected {
        return Err(FrameError::Checksum { expected, actual });
    }
    Ok(Some(Bytes::from(payload)))
}

// ==================== Message codecs ====================

/// Turns messages into frames. Class ids persist across messages, so
/// each class name is sent once per connection.
pub struct MessageEncoder {
    ctx: WriteContext,
    max_frame: usize,
}

impl MessageEncoder {
    pub fn new(registry: Arc<Registry>, max_frame: usize) -> Self {
        Self {
            ctx: WriteContext::new(registry),
            max_frame,
        }
    }

    /// Encode `message` as the payload of one frame.
    ///
    /// A message that fails to encode or exceeds the frame limit leaves the
    /// encoder as it was, so class ids it introduced are sent again with
    /// the next message.
    pub fn encode_payload(&mut self, message: &Message) -> Result<Bytes, FrameError> {
        self.ctx.clear_objects();
        let mark = self.ctx.mark();
        if let Err(e) = wire::write(&mut self.ctx, &message.clone().into_object()) {
            self.ctx.rollback(mark);
            return Err(e.into());
        }
        let len = self.ctx.out.len();
        if len > self.max_frame {
            self.ctx.rollback(mark);
            tracing::warn!(
                "message dropped kind={} len={} max={}",
                message.kind(),
                len,
                self.max_frame
            );
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame,
            });
        }
        let payload = self.ctx.take();
        tracing::trace!("encoded message kind={} bytes={}", message.kind(), payload.len());
        Ok(payload)
    }

    /// Encode `message` as a complete frame appended to `out`.
    pub fn encode(&mut self, message: &Message, out: &mut BytesMut) -> Result<(), FrameError> {
        let payload = self.encode_payload(message)?;
        encode_frame(&payload, self.max_frame, out)
    }
}

impl Default for MessageEncoder {
    fn default() -> Self {
        Self::new(Registry::standard(), DEFAULT_MAX_FRAME)
    }
}

/// Turns frames back into messages, mirroring a `MessageEncoder`.
pub struct MessageDecoder {
    ctx: ReadContext,
    max_frame: usize,
}

impl MessageDecoder {
    pub fn new(registry: Arc<Registry>, max_frame: usize) -> Self {
        Self {
            ctx: ReadContext::new(registry, Bytes::new()),
            max_frame,
        }
    }

    pub fn decode_payload(&mut self, payload: Bytes) -> Result<Message, FrameError> {
        self.ctx.clear_objects();
        self.ctx.feed(payload);
        let object = wire::read(&mut self.ctx)?;
        if !self.ctx.is_exhausted() {
            return Err(CodecError::InvalidValue("trailing bytes after message".to_string()).into());
        }
        Ok(Message::from_object(object)?)
    }

    /// Decode the next message in `buf`, if a whole frame has arrived.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, FrameError> {
        match decode_frame(buf, self.max_frame)? {
            Some(payload) => self.decode_payload(payload).map(Some),
            None => Ok(None),
        }
    }
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self::new(Registry::standard(), DEFAULT_MAX_FRAME)
    }
}

/// A message stream over one connection.
pub struct Connection<S> {
    stream: S,
    encoder: MessageEncoder,
    decoder: MessageDecoder,
    max_frame: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S, max_frame: usize) -> Self {
        let registry = Registry::standard();
        Self {
            stream,
            encoder: MessageEncoder::new(registry.clone(), max_frame),
            decoder: MessageDecoder::new(registry, max_frame),
            max_frame,
        }
    }

    pub async fn send(&mut self, message: &Message) -> Result<(), FrameError> {
        let payload = self.encoder.encode_payload(message)?;
        write_frame(&mut self.stream, &payload, self.max_frame).await?;
        tracing::debug!("sent message kind={}", message.kind());
        Ok(())
    }

    /// Next message, or `None` once the peer closes the stream.
    pub async fn recv(&mut self) -> Result<Option<Message>, FrameError> {
        let Some(payload) = read_frame(&mut self.stream, self.max_frame).await? else {
            return Ok(None);
        };
        let message = self.decoder.decode_payload(payload)?;
        tracing::debug!("received message kind={}", message.kind());
        Ok(Some(message))
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}
