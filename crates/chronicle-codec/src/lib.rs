#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-codec** – Binary framing primitives for Chronicle files.
//!
//! Every index and event file in the store is built from two framing shapes:
//! size-prefixed byte runs (8-byte big-endian length, then the bytes) and
//! fixed-width items written raw (16-byte UUIDs, 8-byte big-endian file
//! offsets). Timestamps are marshalled to an opaque, round-trippable byte
//! representation and stored as sized runs.
//!
//! Readers distinguish a clean end-of-file (the stream ends exactly on a
//! record boundary) from a short read inside a record; the latter indicates
//! disk corruption or a torn write and surfaces as [`CodecError::ShortRead`].

use chrono::{DateTime, FixedOffset, SecondsFormat};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Width of the big-endian length prefix and of file offsets.
pub const INTEGER_SIZE: usize = 8;

/// Width of a raw UUID.
pub const UUID_SIZE: usize = 16;

/// Errors raised by the framing primitives.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The stream ended inside a record.
    #[error("integrity error: expected to read {expected} bytes, got {got}")]
    ShortRead {
        /// Bytes the field required.
        expected: usize,
        /// Bytes actually available.
        got: usize,
    },

    /// Stored timestamp bytes did not round-trip.
    #[error("malformed timestamp: {0}")]
    Timestamp(String),
}

/// Fill `buf` completely, or report how the stream ended.
///
/// Returns `Ok(false)` when the reader was already at end-of-file (nothing
/// was consumed). A stream that ends after the first byte of the field is a
/// [`CodecError::ShortRead`].
async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(CodecError::ShortRead {
                expected: buf.len(),
                got: filled,
            });
        }
        filled += n;
    }
    Ok(true)
}

/// Write an 8-byte big-endian length followed by the bytes themselves.
pub async fn write_sized<W>(writer: &mut W, bytes: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(bytes.len() as u64).to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

/// Read a sized byte run, or `None` on clean end-of-file at the length field.
pub async fn read_sized_opt<R>(reader: &mut R) -> Result<Option<Vec<u8>>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; INTEGER_SIZE];
    if !read_full(reader, &mut len_bytes).await? {
        return Ok(None);
    }
    let len = u64::from_be_bytes(len_bytes) as usize;
    let mut data = vec![0u8; len];
    if !read_full(reader, &mut data).await? && len > 0 {
        return Err(CodecError::ShortRead {
            expected: len,
            got: 0,
        });
    }
    Ok(Some(data))
}

/// Read a sized byte run that must be present.
///
/// End-of-file at the length field is an integrity error here; use
/// [`read_sized_opt`] at record boundaries.
pub async fn read_sized<R>(reader: &mut R) -> Result<Vec<u8>, CodecError>
where
    R: AsyncRead + Unpin,
{
    read_sized_opt(reader).await?.ok_or(CodecError::ShortRead {
        expected: INTEGER_SIZE,
        got: 0,
    })
}

/// Write a UUID as 16 raw bytes, no length prefix.
pub async fn write_uuid<W>(writer: &mut W, id: Uuid) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(id.as_bytes()).await?;
    Ok(())
}

/// Read a raw UUID, or `None` on clean end-of-file.
pub async fn read_uuid_opt<R>(reader: &mut R) -> Result<Option<Uuid>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; UUID_SIZE];
    if !read_full(reader, &mut bytes).await? {
        return Ok(None);
    }
    Ok(Some(Uuid::from_bytes(bytes)))
}

/// Write an 8-byte big-endian file offset.
pub async fn write_offset<W>(writer: &mut W, offset: u64) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&offset.to_be_bytes()).await?;
    Ok(())
}

/// Read an 8-byte big-endian file offset; must be present.
pub async fn read_offset<R>(reader: &mut R) -> Result<u64, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = [0u8; INTEGER_SIZE];
    if !read_full(reader, &mut bytes).await? {
        return Err(CodecError::ShortRead {
            expected: INTEGER_SIZE,
            got: 0,
        });
    }
    Ok(u64::from_be_bytes(bytes))
}

/// Marshal a timestamp to opaque bytes preserving nanoseconds and offset.
pub fn encode_timestamp(timestamp: &DateTime<FixedOffset>) -> Vec<u8> {
    timestamp
        .to_rfc3339_opts(SecondsFormat::Nanos, false)
        .into_bytes()
}

/// Unmarshal timestamp bytes produced by [`encode_timestamp`].
pub fn decode_timestamp(bytes: &[u8]) -> Result<DateTime<FixedOffset>, CodecError> {
    let text =
        std::str::from_utf8(bytes).map_err(|e| CodecError::Timestamp(e.to_string()))?;
    DateTime::parse_from_rfc3339(text).map_err(|e| CodecError::Timestamp(e.to_string()))
}
