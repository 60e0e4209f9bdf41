//! Multipart frame codec for the command protocol.
//!
//! Wire layout per frame: one flags byte (bit 0 = more frames follow in
//! this message), a `u32` big-endian body length, then the body. A message
//! is the run of frames up to and including the first one without the
//! more-flag.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Flags bit: more frames follow in the current message.
pub const FLAG_MORE: u8 = 0x01;

/// Flags byte plus length word.
const HEADER_SIZE: usize = 5;

/// Errors raised by the wire protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Peer closed the connection in the middle of a multipart message.
    #[error("connection closed mid-message")]
    TruncatedMessage,
}

/// One frame of a multipart message.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Whether more frames follow in this message.
    pub more: bool,
    /// Frame body.
    pub body: Bytes,
}

/// Codec turning a byte stream into [`Frame`]s and back.
#[derive(Debug, Default, Clone, Copy)]
pub struct MultipartCodec;

impl Encoder<Frame> for MultipartCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(HEADER_SIZE + frame.body.len());
        dst.put_u8(if frame.more { FLAG_MORE } else { 0 });
        dst.put_u32(frame.body.len() as u32);
        dst.put_slice(&frame.body);
        Ok(())
    }
}

impl Decoder for MultipartCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if src.len() < HEADER_SIZE + len {
            src.reserve(HEADER_SIZE + len - src.len());
            return Ok(None);
        }

        let flags = src[0];
        src.advance(HEADER_SIZE);
        let body = src.split_to(len).freeze();
        Ok(Some(Frame {
            more: flags & FLAG_MORE != 0,
            body,
        }))
    }
}

/// Receive one whole multipart message.
///
/// `None` means the peer closed the connection cleanly between messages;
/// closing inside a message is [`ProtocolError::TruncatedMessage`].
pub async fn recv_message<S>(
    framed: &mut Framed<S, MultipartCodec>,
) -> Result<Option<Vec<Bytes>>, ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut frames = Vec::new();
    loop {
        match framed.next().await {
            Some(frame) => {
                let frame = frame?;
                let more = frame.more;
                frames.push(frame.body);
                if !more {
                    return Ok(Some(frames));
                }
            }
            None if frames.is_empty() => return Ok(None),
            None => return Err(ProtocolError::TruncatedMessage),
        }
    }
}

/// Send one whole multipart message.
///
/// Every frame except the last carries the more-flag. `frames` must not be
/// empty.
pub async fn send_message<S>(
    framed: &mut Framed<S, MultipartCodec>,
    frames: Vec<Bytes>,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let last = frames.len().saturating_sub(1);
    for (i, body) in frames.into_iter().enumerate() {
        framed.feed(Frame { more: i < last, body }).await?;
    }
    framed.flush().await?;
    Ok(())
}
