#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-core** – Core storage abstractions for Chronicle.
//!
//! This crate defines the physical event record, the index entry format
//! shared by the global and per-stream indexes, and the contract every
//! storage layout implements. Concrete layouts (daily, simple) live in
//! separate driver crates that depend on this one.

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use uuid::Uuid;

use chronicle_codec::{
    decode_timestamp, encode_timestamp, read_sized, read_uuid_opt, write_sized, write_uuid,
    CodecError,
};

//─────────────────────────────
//  Physical records
//─────────────────────────────

/// An event as the storage engine persists it.
///
/// `type_id` is an opaque string chosen by the serializer; an empty
/// `type_id` denotes an absent payload. A stored event is immutable once
/// written.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEvent {
    /// Stream (aggregate) the event belongs to.
    pub stream_id: Uuid,
    /// Commit timestamp, nanosecond precision, offset-carrying.
    pub creation_time: DateTime<FixedOffset>,
    /// Serializer-chosen payload type identifier.
    pub type_id: String,
    /// Serialized payload bytes.
    pub data: Vec<u8>,
    /// Serializer-chosen metadata type identifier.
    pub metadata_type_id: String,
    /// Serialized metadata bytes; empty when absent.
    pub metadata: Vec<u8>,
}

/// One record of the global or a per-stream index.
///
/// Record format, byte-exact: 16 raw UUID bytes, then the sized timestamp
/// bytes, then the sized type-id bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexEntry {
    /// Stream the indexed event belongs to.
    pub stream_id: Uuid,
    /// Commit timestamp of the indexed event.
    pub creation_time: DateTime<FixedOffset>,
    /// Payload type id of the indexed event.
    pub type_id: String,
}

impl IndexEntry {
    /// Build the entry describing `event`.
    pub fn for_event(event: &StoredEvent) -> Self {
        Self {
            stream_id: event.stream_id,
            creation_time: event.creation_time,
            type_id: event.type_id.clone(),
        }
    }

    /// Append this entry to `writer`.
    pub async fn encode<W>(&self, writer: &mut W) -> Result<(), StorageError>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write_uuid(writer, self.stream_id).await?;
        write_sized(writer, &encode_timestamp(&self.creation_time)).await?;
        write_sized(writer, self.type_id.as_bytes()).await?;
        Ok(())
    }

    /// Read the next entry, or `None` on clean end-of-file.
    pub async fn decode<R>(reader: &mut R) -> Result<Option<Self>, StorageError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let stream_id = match read_uuid_opt(reader).await? {
            Some(id) => id,
            None => return Ok(None),
        };
        let creation_time = decode_timestamp(&read_sized(reader).await?)?;
        let type_id = String::from_utf8(read_sized(reader).await?)
            .map_err(|e| StorageError::Integrity(format!("type id is not utf-8: {e}")))?;
        Ok(Some(Self {
            stream_id,
            creation_time,
            type_id,
        }))
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors raised by storage layouts.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The per-stream index for this stream does not exist.
    ///
    /// Callers reading a stream map this to "empty"; callers checking a
    /// version precondition map it to version 0.
    #[error("stream not found: {0}")]
    StreamNotFound(Uuid),

    /// On-disk framing did not match expectations.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// The layout does not provide this operation.
    #[error("{0} not supported by this storage layout")]
    Unsupported(&'static str),

    /// Framing-level failure from the codec.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

//─────────────────────────────
//  Storage contract
//─────────────────────────────

/// Contract implemented by every Chronicle storage layout.
///
/// Reads are fully buffered: they return a materialized sequence in the
/// order defined by the index consulted (stream index for
/// [`read_stream`](EventStorage::read_stream), global index for
/// [`read_all`](EventStorage::read_all)).
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Durably append one event. On `Ok` the event is visible to
    /// subsequent reads, including after a restart.
    async fn write(&self, event: &StoredEvent) -> Result<(), StorageError>;

    /// All events of one stream in append order.
    ///
    /// A stream that was never written to is
    /// [`StorageError::StreamNotFound`], not an empty sequence.
    async fn read_stream(&self, stream_id: Uuid) -> Result<Vec<StoredEvent>, StorageError>;

    /// All events across streams in global commit order.
    async fn read_all(&self) -> Result<Vec<StoredEvent>, StorageError>;

    /// Current event count of one stream.
    async fn stream_version(&self, stream_id: Uuid) -> Result<u32, StorageError>;

    /// Reconstruct the per-type indexes by scanning the global index.
    ///
    /// Layouts without type indexes implement this as a no-op; callers
    /// must tolerate that.
    async fn rebuild_type_indexes(&self) -> Result<(), StorageError>;
}
