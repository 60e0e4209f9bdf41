#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-serial** – Serializer strategies for the Chronicle store.
//!
//! The storage engine persists `(bytes, type_id)` pairs and is oblivious to
//! how they were produced. A [`Serializer`] is the strategy that maps the
//! logical [`Payload`] to that pair and back; the engine receives one at
//! construction time.
//!
//! Two strategies ship with the store: a typed JSON registry for embedded
//! use, and a pass-through for servers whose clients handle typing
//! themselves.

use std::collections::HashMap;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;

use chronicle_types::Payload;

//─────────────────────────────
//  Contract
//─────────────────────────────

/// Errors raised by serializer strategies.
#[derive(Debug, Error)]
pub enum SerializerError {
    /// Deserialize was asked for a type id nobody registered.
    #[error("type not registered in serializer: {0}")]
    TypeNotRegistered(String),

    /// Tunneling input carried no space separator.
    #[error("missing split char")]
    MissingSplit,

    /// A type id containing invalid UTF-8.
    #[error("type id is not valid utf-8")]
    InvalidTypeId,

    /// The strategy cannot handle this payload kind.
    #[error("unsupported payload kind: {0}")]
    Unsupported(&'static str),

    /// JSON encode/decode failure.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Maps payload values to `(bytes, type_id)` pairs and back.
///
/// An absent value serializes to `(empty, "")`; empty input bytes
/// deserialize to [`Payload::Absent`].
pub trait Serializer: Send + Sync {
    /// Produce the storable representation of `payload`.
    fn serialize(&self, payload: &Payload) -> Result<(Vec<u8>, String), SerializerError>;

    /// Reconstruct a payload from its storable representation.
    fn deserialize(&self, bytes: &[u8], type_id: &str) -> Result<Payload, SerializerError>;
}

//─────────────────────────────
//  Typed JSON registry
//─────────────────────────────

type ParseFn = Box<dyn Fn(&[u8]) -> Result<Value, SerializerError> + Send + Sync>;
type EmitFn = Box<dyn Fn(&Value) -> Result<Vec<u8>, SerializerError> + Send + Sync>;

struct TypeCodec {
    parse: ParseFn,
    emit: EmitFn,
}

/// JSON serializer with an explicit type registry.
///
/// Each registered type contributes a parse/emit closure pair keyed by a
/// stable type id chosen at registration. Registration happens once at
/// startup; the registry is read-only afterwards.
#[derive(Default)]
pub struct JsonSerializer {
    types: HashMap<String, TypeCodec>,
}

impl JsonSerializer {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `type_id`.
    ///
    /// Both directions go through `T`, so stored bytes are validated
    /// against the registered schema on read and on write.
    pub fn register<T>(&mut self, type_id: impl Into<String>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        let codec = TypeCodec {
            parse: Box::new(|bytes| {
                let typed: T = serde_json::from_slice(bytes)?;
                Ok(serde_json::to_value(typed)?)
            }),
            emit: Box::new(|value| {
                let typed: T = serde_json::from_value(value.clone())?;
                Ok(serde_json::to_vec(&typed)?)
            }),
        };
        self.types.insert(type_id.into(), codec);
    }

    /// Registry builder convenience for construction-site chaining.
    pub fn with<T>(mut self, type_id: impl Into<String>) -> Self
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.register::<T>(type_id);
        self
    }
}

impl Serializer for JsonSerializer {
    fn serialize(&self, payload: &Payload) -> Result<(Vec<u8>, String), SerializerError> {
        match payload {
            Payload::Absent => Ok((Vec::new(), String::new())),
            Payload::Json { type_id, value } => {
                let codec = self
                    .types
                    .get(type_id)
                    .ok_or_else(|| SerializerError::TypeNotRegistered(type_id.clone()))?;
                let bytes = (codec.emit)(value)?;
                Ok((bytes, type_id.clone()))
            }
            Payload::Raw(_) => Err(SerializerError::Unsupported("raw bytes")),
        }
    }

    fn deserialize(&self, bytes: &[u8], type_id: &str) -> Result<Payload, SerializerError> {
        if type_id.is_empty() || bytes.is_empty() {
            return Ok(Payload::Absent);
        }
        let codec = self
            .types
            .get(type_id)
            .ok_or_else(|| SerializerError::TypeNotRegistered(type_id.to_string()))?;
        let value = (codec.parse)(bytes)?;
        Ok(Payload::Json {
            type_id: type_id.to_string(),
            value,
        })
    }
}

//─────────────────────────────
//  Pass-through
//─────────────────────────────

/// Raw-bytes serializer for clients that manage typing themselves.
///
/// In verbatim mode bytes travel unchanged under an empty type id. In
/// tunneling mode the client carries the type id in-band: serialize splits
/// the input on the first ASCII space into `(type_id, payload)` and
/// deserialize re-joins them, so the wire sees exactly what the client sent.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthruSerializer {
    tunneling: bool,
}

impl PassthruSerializer {
    /// Verbatim mode: bytes through unchanged, empty type id.
    pub fn new() -> Self {
        Self { tunneling: false }
    }

    /// Tunneling mode: type id travels in-band, split on the first space.
    pub fn tunneling() -> Self {
        Self { tunneling: true }
    }
}

impl Serializer for PassthruSerializer {
    fn serialize(&self, payload: &Payload) -> Result<(Vec<u8>, String), SerializerError> {
        let bytes = match payload {
            Payload::Absent => return Ok((Vec::new(), String::new())),
            Payload::Raw(bytes) => bytes,
            Payload::Json { .. } => return Err(SerializerError::Unsupported("json document")),
        };

        if !self.tunneling {
            return Ok((bytes.clone(), String::new()));
        }

        let sep = bytes
            .iter()
            .position(|&b| b == b' ')
            .ok_or(SerializerError::MissingSplit)?;
        let type_id = std::str::from_utf8(&bytes[..sep])
            .map_err(|_| SerializerError::InvalidTypeId)?
            .to_string();
        Ok((bytes[sep + 1..].to_vec(), type_id))
    }

    fn deserialize(&self, bytes: &[u8], type_id: &str) -> Result<Payload, SerializerError> {
        if bytes.is_empty() {
            return Ok(Payload::Absent);
        }
        if !self.tunneling || type_id.is_empty() {
            return Ok(Payload::Raw(bytes.to_vec()));
        }

        let mut joined = Vec::with_capacity(type_id.len() + 1 + bytes.len());
        joined.extend_from_slice(type_id.as_bytes());
        joined.push(b' ');
        joined.extend_from_slice(bytes);
        Ok(Payload::Raw(joined))
    }
}
