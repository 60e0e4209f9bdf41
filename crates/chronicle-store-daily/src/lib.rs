#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-daily** – Primary on-disk layout for Chronicle.
//!
//! Events land in one file per event under `YYYYMM/DD/` directories, named
//! by their commit time down to the nanosecond plus the payload type id.
//! Three index families point at them:
//!
//! - `indexes/global` — every write in commit order,
//! - `indexes/<stream-uuid>` — one index per stream in append order,
//! - `indexes/types/<type_id>` — root-relative event paths per payload
//!   type, one CRLF-terminated line each.
//!
//! An event file holds `data ‖ CRLF ‖ metadata`; a file without a CRLF is
//! all data. Every append is open-write-fsync-close, so an acknowledged
//! write is still there after a crash.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Datelike, FixedOffset, Timelike};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

use chronicle_store_core::{EventStorage, IndexEntry, StorageError, StoredEvent};

/// Separator between payload and metadata inside an event file.
const CRLF: [u8; 2] = [0x0D, 0x0A];

/// Metadata type label reported on read.
///
/// The layout does not persist the writer's metadata type id; metadata
/// deserialization is the serializer's concern.
const METADATA_TYPE_ID: &str = "Metadata";

//─────────────────────────────
//  Layout
//─────────────────────────────

/// Storage driver for the daily on-disk layout.
#[derive(Debug)]
pub struct DailyDiskStorage {
    root: PathBuf,
    indexes_dir: PathBuf,
    global_index: PathBuf,
    types_dir: PathBuf,
}

impl DailyDiskStorage {
    /// Open (or initialise) a store rooted at `root`.
    ///
    /// Creates the index directories and an empty global index, so a fresh
    /// store answers [`EventStorage::read_all`] with an empty sequence.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        let indexes_dir = root.join("indexes");
        let types_dir = indexes_dir.join("types");
        fs::create_dir_all(&types_dir).await?;

        let global_index = indexes_dir.join("global");
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&global_index)
            .await?;
        file.sync_all().await?;

        info!(root = %root.display(), "opened daily disk storage");
        Ok(Self {
            root,
            indexes_dir,
            global_index,
            types_dir,
        })
    }

    /// Path of the per-stream index for `stream_id`.
    pub fn stream_index_path(&self, stream_id: Uuid) -> PathBuf {
        self.indexes_dir.join(stream_id.to_string())
    }

    /// Path of the global index.
    pub fn global_index_path(&self) -> &Path {
        &self.global_index
    }

    /// Path of the per-type index for `type_id`.
    pub fn type_index_path(&self, type_id: &str) -> PathBuf {
        self.types_dir.join(type_id)
    }

    /// Root-relative event-file path for `(creation_time, type_id)`.
    ///
    /// Always slash-separated so index lines are portable across hosts.
    pub fn event_rel_path(creation_time: &DateTime<FixedOffset>, type_id: &str) -> String {
        format!(
            "{:04}{:02}/{:02}/{:02}{:02}{:02}{:09}_{}",
            creation_time.year(),
            creation_time.month(),
            creation_time.day(),
            creation_time.hour(),
            creation_time.minute(),
            creation_time.second(),
            creation_time.nanosecond(),
            type_id,
        )
    }

    /// Absolute event-file path for `(creation_time, type_id)`.
    pub fn event_path(&self, creation_time: &DateTime<FixedOffset>, type_id: &str) -> PathBuf {
        self.root.join(Self::event_rel_path(creation_time, type_id))
    }

    async fn append_entry(path: &Path, entry: &IndexEntry) -> Result<(), StorageError> {
        let mut file = OpenOptions::new().append(true).create(true).open(path).await?;
        entry.encode(&mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn append_type_index_line(&self, type_id: &str, rel_path: &str) -> Result<(), StorageError> {
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.type_index_path(type_id))
            .await?;
        file.write_all(rel_path.as_bytes()).await?;
        file.write_all(&CRLF).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    async fn open_index(&self, path: &Path, stream_id: Option<Uuid>) -> Result<BufReader<File>, StorageError> {
        match File::open(path).await {
            Ok(file) => Ok(BufReader::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => match stream_id {
                Some(id) => Err(StorageError::StreamNotFound(id)),
                None => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn read_event_file(&self, entry: &IndexEntry) -> Result<(Vec<u8>, Vec<u8>), StorageError> {
        let path = self.event_path(&entry.creation_time, &entry.type_id);
        let content = fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::Integrity(format!("indexed event file missing: {}", path.display()))
            } else {
                e.into()
            }
        })?;
        Ok(split_event_content(content))
    }

    async fn read_by_index(
        &self,
        index_path: &Path,
        stream_id: Option<Uuid>,
    ) -> Result<Vec<StoredEvent>, StorageError> {
        let mut reader = self.open_index(index_path, stream_id).await?;

        let mut events = Vec::new();
        while let Some(entry) = IndexEntry::decode(&mut reader).await? {
            let (data, metadata) = self.read_event_file(&entry).await?;
            events.push(StoredEvent {
                // Stream reads pass the id they were asked for; the global
                // index carries each event's own stream id.
                stream_id: stream_id.unwrap_or(entry.stream_id),
                creation_time: entry.creation_time,
                type_id: entry.type_id,
                data,
                metadata_type_id: METADATA_TYPE_ID.to_string(),
                metadata,
            });
        }
        Ok(events)
    }
}

/// Split raw event-file content on the first CRLF into `(data, metadata)`.
fn split_event_content(content: Vec<u8>) -> (Vec<u8>, Vec<u8>) {
    match content.windows(2).position(|pair| pair == CRLF) {
        Some(at) => {
            let metadata = content[at + 2..].to_vec();
            let mut data = content;
            data.truncate(at);
            (data, metadata)
        }
        None => (content, Vec::new()),
    }
}

#[async_trait]
impl EventStorage for DailyDiskStorage {
    async fn write(&self, event: &StoredEvent) -> Result<(), StorageError> {
        // Event file first: every index entry must refer to durable bytes.
        let event_path = self.event_path(&event.creation_time, &event.type_id);
        if let Some(parent) = event_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&event_path)
            .await?;
        file.write_all(&event.data).await?;
        file.write_all(&CRLF).await?;
        file.write_all(&event.metadata).await?;
        file.flush().await?;
        file.sync_all().await?;

        let entry = IndexEntry::for_event(event);
        Self::append_entry(&self.global_index, &entry).await?;
        Self::append_entry(&self.stream_index_path(event.stream_id), &entry).await?;

        let rel_path = Self::event_rel_path(&event.creation_time, &event.type_id);
        self.append_type_index_line(&event.type_id, &rel_path).await?;

        debug!(
            stream = %event.stream_id,
            type_id = %event.type_id,
            path = %rel_path,
            "event written"
        );
        Ok(())
    }

    async fn read_stream(&self, stream_id: Uuid) -> Result<Vec<StoredEvent>, StorageError> {
        self.read_by_index(&self.stream_index_path(stream_id), Some(stream_id))
            .await
    }

    async fn read_all(&self) -> Result<Vec<StoredEvent>, StorageError> {
        self.read_by_index(&self.global_index, None).await
    }

    async fn stream_version(&self, stream_id: Uuid) -> Result<u32, StorageError> {
        let mut reader = self
            .open_index(&self.stream_index_path(stream_id), Some(stream_id))
            .await?;

        let mut version: u32 = 0;
        while IndexEntry::decode(&mut reader).await?.is_some() {
            version += 1;
        }
        Ok(version)
    }

    async fn rebuild_type_indexes(&self) -> Result<(), StorageError> {
        match fs::remove_dir_all(&self.types_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fs::create_dir_all(&self.types_dir).await?;

        let mut reader = self.open_index(&self.global_index, None).await?;
        let mut rebuilt: u64 = 0;
        while let Some(entry) = IndexEntry::decode(&mut reader).await? {
            let rel_path = Self::event_rel_path(&entry.creation_time, &entry.type_id);
            self.append_type_index_line(&entry.type_id, &rel_path).await?;
            rebuilt += 1;
        }

        info!(entries = rebuilt, "type indexes rebuilt from global index");
        Ok(())
    }
}
