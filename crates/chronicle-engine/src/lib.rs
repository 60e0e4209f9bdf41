#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-engine** – Write coordination for the Chronicle store.
//!
//! The [`ActionHandler`] is the seam between the transport and the storage
//! layer: it serializes payloads, enforces version preconditions, and keeps
//! concurrent writers to the same stream from interleaving. Storage and
//! serializer are injected at construction; the handler holds no other
//! state beyond its lock registry.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use chronicle_serial::{Serializer, SerializerError};
use chronicle_store_core::{EventStorage, StorageError, StoredEvent};
use chronicle_types::{Event, ExpectedVersion};

//─────────────────────────────
//  Stream locks
//─────────────────────────────

/// Process-wide registry of per-stream write locks.
///
/// Entries are created on first use and live for the lifetime of the
/// registry. Writers to different streams proceed in parallel; readers are
/// never gated here and observe only committed index entries.
#[derive(Debug, Default)]
pub struct StreamLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl StreamLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock handle for `stream_id`, created lazily.
    pub fn for_stream(&self, stream_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(stream_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Number of streams that have taken a lock so far.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no stream has locked yet.
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

//─────────────────────────────
//  Errors
//─────────────────────────────

/// Errors surfaced by the action handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The stream's current version did not match the precondition.
    #[error("WrongExpectedVersion: expected {expected} got {got}")]
    WrongExpectedVersion {
        /// Version the caller required.
        expected: u32,
        /// Version the stream actually held.
        got: u32,
    },

    /// Storage-layer failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Serializer failure.
    #[error(transparent)]
    Serializer(#[from] SerializerError),
}

//─────────────────────────────
//  Action handler
//─────────────────────────────

/// Orchestrates serialize → version-check → store, and the reverse on read.
pub struct ActionHandler {
    storage: Arc<dyn EventStorage>,
    serializer: Arc<dyn Serializer>,
    locks: StreamLocks,
}

impl ActionHandler {
    /// Build a handler over `storage` using `serializer` for payloads.
    pub fn new(storage: Arc<dyn EventStorage>, serializer: Arc<dyn Serializer>) -> Self {
        Self {
            storage,
            serializer,
            locks: StreamLocks::new(),
        }
    }

    /// Append `event` to its stream, optionally under a version precondition.
    ///
    /// The per-stream lock is held across the version check and the write,
    /// so check-then-write is atomic with respect to other writers on the
    /// same stream. The commit timestamp is assigned here.
    pub async fn add_event(
        &self,
        event: Event,
        expected: ExpectedVersion,
    ) -> Result<(), HandlerError> {
        let lock = self.locks.for_stream(event.aggregate_id);
        let _guard = lock.lock().await;

        let (data, type_id) = self.serializer.serialize(&event.payload)?;
        let (metadata, metadata_type_id) = self.serializer.serialize(&event.metadata)?;

        if let ExpectedVersion::Exact(expected) = expected {
            let current = match self.storage.stream_version(event.aggregate_id).await {
                Ok(version) => version,
                // A stream nobody has written to yet is at version 0.
                Err(StorageError::StreamNotFound(_)) => 0,
                Err(e) => return Err(e.into()),
            };
            if current != expected {
                return Err(HandlerError::WrongExpectedVersion {
                    expected,
                    got: current,
                });
            }
        }

        let stored = StoredEvent {
            stream_id: event.aggregate_id,
            creation_time: Utc::now().fixed_offset(),
            type_id,
            data,
            metadata_type_id,
            metadata,
        };
        self.storage.write(&stored).await?;

        debug!(stream = %event.aggregate_id, type_id = %stored.type_id, "event appended");
        Ok(())
    }

    /// All events of one stream in append order; an unknown stream is empty.
    pub async fn retrieve_for(&self, aggregate_id: Uuid) -> Result<Vec<Event>, HandlerError> {
        let stored = match self.storage.read_stream(aggregate_id).await {
            Ok(events) => events,
            Err(StorageError::StreamNotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        stored.iter().map(|event| self.hydrate(event)).collect()
    }

    /// All events across streams in global commit order.
    pub async fn retrieve_all(&self) -> Result<Vec<Event>, HandlerError> {
        let stored = self.storage.read_all().await?;
        stored.iter().map(|event| self.hydrate(event)).collect()
    }

    fn hydrate(&self, stored: &StoredEvent) -> Result<Event, HandlerError> {
        let payload = self.serializer.deserialize(&stored.data, &stored.type_id)?;
        let metadata = self
            .serializer
            .deserialize(&stored.metadata, &stored.metadata_type_id)?;
        Ok(Event {
            aggregate_id: stored.stream_id,
            creation_time: stored.creation_time,
            payload,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle_serial::JsonSerializer;
    use chronicle_store_daily::DailyDiskStorage;
    use chronicle_store_simple::SimpleDiskStorage;
    use chronicle_types::Payload;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AnEvent {
        a: i64,
        b: String,
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct AnotherEvent {
        w: i64,
        t: String,
        f: f64,
    }

    fn registry() -> Arc<JsonSerializer> {
        Arc::new(
            JsonSerializer::new()
                .with::<AnEvent>("AnEvent")
                .with::<AnotherEvent>("AnotherEvent"),
        )
    }

    async fn simple_handler(dir: &tempfile::TempDir) -> (ActionHandler, Arc<SimpleDiskStorage>) {
        let storage = Arc::new(SimpleDiskStorage::open(dir.path()).await.unwrap());
        (
            ActionHandler::new(storage.clone(), registry()),
            storage,
        )
    }

    async fn daily_handler(dir: &tempfile::TempDir) -> ActionHandler {
        let storage = Arc::new(DailyDiskStorage::open(dir.path()).await.unwrap());
        ActionHandler::new(storage, registry())
    }

    fn an_event(aggregate_id: Uuid) -> Event {
        Event::new(
            aggregate_id,
            Payload::json("AnEvent", json!({"a": 1024, "b": "Tests"})),
        )
    }

    #[tokio::test]
    async fn test_serializes_event_to_json_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, storage) = simple_handler(&dir).await;

        let aggregate_id = Uuid::new_v4();
        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Any)
            .await
            .unwrap();

        let content = tokio::fs::read(storage.history_path(aggregate_id))
            .await
            .unwrap();
        let needle = br#"{"a":1024,"b":"Tests"}"#;
        assert!(content
            .windows(needle.len())
            .any(|window| window == needle));
    }

    #[tokio::test]
    async fn test_type_information_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, storage) = simple_handler(&dir).await;

        let aggregate_id = Uuid::new_v4();
        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Any)
            .await
            .unwrap();

        let content = tokio::fs::read(storage.history_path(aggregate_id))
            .await
            .unwrap();
        assert!(content.windows(7).any(|window| window == b"AnEvent"));
    }

    #[tokio::test]
    async fn test_same_aggregate_shares_one_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, storage) = simple_handler(&dir).await;

        let aggregate_id = Uuid::new_v4();
        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Any)
            .await
            .unwrap();
        handler
            .add_event(
                Event::new(
                    aggregate_id,
                    Payload::json("AnotherEvent", json!({"w": 23456, "t": "Bob", "f": 123.45})),
                ),
                ExpectedVersion::Any,
            )
            .await
            .unwrap();

        let content = tokio::fs::read(storage.history_path(aggregate_id))
            .await
            .unwrap();
        assert!(content.windows(5).any(|w| w == b"Tests"));
        assert!(content.windows(3).any(|w| w == b"Bob"));
    }

    #[tokio::test]
    async fn test_events_can_be_retrieved_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = simple_handler(&dir).await;

        let aggregate_id = Uuid::new_v4();
        let first = an_event(aggregate_id);
        let second = Event::new(
            aggregate_id,
            Payload::json("AnotherEvent", json!({"w": 23456, "t": "Bob", "f": 123.45})),
        );
        handler
            .add_event(first.clone(), ExpectedVersion::Any)
            .await
            .unwrap();
        handler
            .add_event(second.clone(), ExpectedVersion::Any)
            .await
            .unwrap();

        let events = handler.retrieve_for(aggregate_id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].aggregate_id, aggregate_id);
        assert_eq!(events[0].payload, first.payload);
        assert_eq!(events[1].payload, second.payload);
    }

    #[tokio::test]
    async fn test_unknown_stream_retrieves_empty() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = simple_handler(&dir).await;
        let events = handler.retrieve_for(Uuid::new_v4()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_replay_preserves_global_order() {
        let dir = tempfile::tempdir().unwrap();
        let (handler, _) = simple_handler(&dir).await;

        let aggregate1 = Uuid::new_v4();
        let aggregate2 = Uuid::new_v4();
        let events = [
            Event::new(aggregate1, Payload::json("AnEvent", json!({"a": 123, "b": "Hello 1"}))),
            Event::new(aggregate2, Payload::json("AnEvent", json!({"a": 456, "b": "Hello 2"}))),
            Event::new(aggregate1, Payload::json("AnEvent", json!({"a": 789, "b": "Hello 3"}))),
        ];
        for event in &events {
            handler
                .add_event(event.clone(), ExpectedVersion::Any)
                .await
                .unwrap();
        }

        let replayed = handler.retrieve_all().await.unwrap();
        assert_eq!(replayed.len(), 3);
        for (replayed, original) in replayed.iter().zip(&events) {
            assert_eq!(replayed.aggregate_id, original.aggregate_id);
            assert_eq!(replayed.payload, original.payload);
        }
    }

    #[tokio::test]
    async fn test_version_precondition_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let handler = daily_handler(&dir).await;
        let aggregate_id = Uuid::new_v4();

        // Empty stream is at version 0.
        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Exact(0))
            .await
            .unwrap();

        let err = handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Exact(0))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "WrongExpectedVersion: expected 0 got 1"
        );

        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Exact(1))
            .await
            .unwrap();
        assert_eq!(handler.retrieve_for(aggregate_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_any_version_always_appends() {
        let dir = tempfile::tempdir().unwrap();
        let handler = daily_handler(&dir).await;
        let aggregate_id = Uuid::new_v4();

        for _ in 0..3 {
            handler
                .add_event(an_event(aggregate_id), ExpectedVersion::Any)
                .await
                .unwrap();
        }
        assert_eq!(handler.retrieve_for(aggregate_id).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_precondition_leaves_stream_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let handler = daily_handler(&dir).await;
        let aggregate_id = Uuid::new_v4();

        handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Any)
            .await
            .unwrap();
        let _ = handler
            .add_event(an_event(aggregate_id), ExpectedVersion::Exact(5))
            .await
            .unwrap_err();

        assert_eq!(handler.retrieve_for(aggregate_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_roundtrips_through_handler() {
        let dir = tempfile::tempdir().unwrap();
        let aggregate_id = Uuid::new_v4();

        // The daily layout reports metadata under a constant label, so the
        // registry serializer must see it under a registered name.
        let mut registry = JsonSerializer::new();
        registry.register::<AnEvent>("AnEvent");
        registry.register::<serde_json::Value>("Metadata");
        let storage = Arc::new(DailyDiskStorage::open(dir.path()).await.unwrap());
        let handler = ActionHandler::new(storage, Arc::new(registry));

        let event = an_event(aggregate_id)
            .with_metadata(Payload::json("Metadata", json!({"user": "bob"})));
        handler
            .add_event(event.clone(), ExpectedVersion::Any)
            .await
            .unwrap();

        let events = handler.retrieve_for(aggregate_id).await.unwrap();
        assert_eq!(events[0].metadata, event.metadata);
    }

    #[tokio::test]
    async fn test_stream_locks_are_lazily_created() {
        let locks = StreamLocks::new();
        assert!(locks.is_empty());

        let id = Uuid::new_v4();
        let first = locks.for_stream(id);
        let second = locks.for_stream(id);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(locks.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_to_one_stream_serialize() {
        let dir = tempfile::tempdir().unwrap();
        let handler = Arc::new(daily_handler(&dir).await);
        let aggregate_id = Uuid::new_v4();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let handler = handler.clone();
            tasks.push(tokio::spawn(async move {
                handler
                    .add_event(an_event(aggregate_id), ExpectedVersion::Any)
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let events = handler.retrieve_for(aggregate_id).await.unwrap();
        assert_eq!(events.len(), 8);
    }
}
