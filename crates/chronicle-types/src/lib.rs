#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-types** – Logical event model for the Chronicle event store.
//!
//! This crate defines the domain-facing event shape exchanged between the
//! transport, the action handler, and the serializers. It carries no I/O
//! concerns; the physical, on-disk representation lives in
//! `chronicle-store-core`.

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value;
use uuid::Uuid;

//─────────────────────────────
//  Opaque payloads
//─────────────────────────────

/// An opaque event payload as seen by the store.
///
/// The storage engine never inspects payload contents; it persists whatever
/// `(bytes, type_id)` pair the configured serializer produces. This enum is
/// the tagged-variant bridge between the transport (raw bytes), the typed
/// JSON registry (tagged documents), and "no value at all" (metadata is
/// optional on every event).
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// No value. Serializes to `(empty, "")`.
    Absent,
    /// Raw bytes, passed through unchanged by the pass-through serializer.
    Raw(Vec<u8>),
    /// A typed JSON document handled by the registry serializer.
    Json {
        /// Stable identifier for the document schema.
        type_id: String,
        /// The document itself.
        value: Value,
    },
}

impl Payload {
    /// Build a typed JSON payload.
    pub fn json(type_id: impl Into<String>, value: Value) -> Self {
        Payload::Json {
            type_id: type_id.into(),
            value,
        }
    }

    /// Whether this payload carries no value.
    pub fn is_absent(&self) -> bool {
        matches!(self, Payload::Absent)
    }
}

//─────────────────────────────
//  Events
//─────────────────────────────

/// A domain event appended to (or read back from) an aggregate stream.
///
/// `creation_time` is assigned by the store at append time; the value on a
/// freshly constructed event is a placeholder and events retrieved from the
/// store carry the time that was actually persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// The aggregate (stream) this event belongs to.
    pub aggregate_id: Uuid,
    /// When the event was committed to the store.
    pub creation_time: DateTime<FixedOffset>,
    /// The event payload.
    pub payload: Payload,
    /// Optional metadata riding along with the payload.
    pub metadata: Payload,
}

impl Event {
    /// Create an event for `aggregate_id` with no metadata.
    pub fn new(aggregate_id: Uuid, payload: Payload) -> Self {
        Self {
            aggregate_id,
            creation_time: Utc::now().fixed_offset(),
            payload,
            metadata: Payload::Absent,
        }
    }

    /// Attach metadata to the event.
    pub fn with_metadata(mut self, metadata: Payload) -> Self {
        self.metadata = metadata;
        self
    }
}

//─────────────────────────────
//  Optimistic concurrency
//─────────────────────────────

/// Version precondition for an append.
///
/// `Exact(n)` commits only when the stream currently holds `n` events;
/// `Any` imposes no precondition. On the wire the precondition travels as a
/// 32-bit word where [`ExpectedVersion::ANY_WIRE`] is reserved for `Any`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// No precondition; append unconditionally.
    Any,
    /// The stream must currently hold exactly this many events.
    Exact(u32),
}

impl ExpectedVersion {
    /// Wire sentinel meaning "no precondition".
    pub const ANY_WIRE: u32 = 0xFFFF_FFFF;

    /// Decode the 32-bit wire representation.
    pub fn from_wire(raw: u32) -> Self {
        if raw == Self::ANY_WIRE {
            ExpectedVersion::Any
        } else {
            ExpectedVersion::Exact(raw)
        }
    }

    /// Encode to the 32-bit wire representation.
    pub fn to_wire(self) -> u32 {
        match self {
            ExpectedVersion::Any => Self::ANY_WIRE,
            ExpectedVersion::Exact(version) => version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_expected_version_wire_roundtrip() {
        assert_eq!(ExpectedVersion::from_wire(0), ExpectedVersion::Exact(0));
        assert_eq!(ExpectedVersion::from_wire(41), ExpectedVersion::Exact(41));
        assert_eq!(
            ExpectedVersion::from_wire(0xFFFF_FFFF),
            ExpectedVersion::Any
        );
        assert_eq!(ExpectedVersion::Any.to_wire(), 0xFFFF_FFFF);
        assert_eq!(ExpectedVersion::Exact(7).to_wire(), 7);
    }

    #[test]
    fn test_event_defaults_to_absent_metadata() {
        let event = Event::new(Uuid::new_v4(), Payload::Raw(b"hello".to_vec()));
        assert!(event.metadata.is_absent());

        let event = event.with_metadata(Payload::json("Meta", json!({"user": 1})));
        assert!(!event.metadata.is_absent());
    }
}
