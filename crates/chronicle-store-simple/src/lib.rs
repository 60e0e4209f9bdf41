#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **chronicle-store-simple** – Minimal on-disk layout for Chronicle.
//!
//! All events of a stream live concatenated in one
//! `<first-2-hex>/<rest>.history` file as
//! `sized(timestamp) ‖ sized(type_id) ‖ sized(data)` records; a single
//! `eventindex` file records `(uuid, offset)` pairs in commit order so the
//! global log can be replayed without touching every stream file.
//!
//! The layout keeps the disk surface as small as possible for embedded and
//! test use. It stores no metadata, maintains no type indexes, and does not
//! support version preconditions.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncSeekExt, BufReader};
use tracing::{debug, info};
use uuid::Uuid;

use chronicle_codec::{
    decode_timestamp, encode_timestamp, read_offset, read_sized, read_sized_opt, read_uuid_opt,
    write_offset, write_sized, write_uuid,
};
use chronicle_store_core::{EventStorage, StorageError, StoredEvent};

//─────────────────────────────
//  Layout
//─────────────────────────────

/// Storage driver for the simple on-disk layout.
#[derive(Debug)]
pub struct SimpleDiskStorage {
    root: PathBuf,
    index_path: PathBuf,
}

impl SimpleDiskStorage {
    /// Open (or initialise) a store rooted at `root`.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, StorageError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;

        let index_path = root.join("eventindex");
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&index_path)
            .await?;
        file.sync_all().await?;

        info!(root = %root.display(), "opened simple disk storage");
        Ok(Self { root, index_path })
    }

    /// History-file path for `stream_id`.
    ///
    /// The first two hex digits shard streams across directories.
    pub fn history_path(&self, stream_id: Uuid) -> PathBuf {
        let name = stream_id.to_string();
        self.root
            .join(&name[..2])
            .join(format!("{}.history", &name[2..]))
    }

    async fn open_history(&self, stream_id: Uuid) -> Result<File, StorageError> {
        match File::open(self.history_path(stream_id)).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::StreamNotFound(stream_id))
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Read one history record, or `None` on clean end-of-file.
async fn read_record<R>(reader: &mut R) -> Result<Option<StoredRecord>, StorageError>
where
    R: tokio::io::AsyncRead + Unpin + Send,
{
    let timestamp_bytes = match read_sized_opt(reader).await? {
        Some(bytes) => bytes,
        None => return Ok(None),
    };
    let creation_time = decode_timestamp(&timestamp_bytes)?;
    let type_id = String::from_utf8(read_sized(reader).await?)
        .map_err(|e| StorageError::Integrity(format!("type id is not utf-8: {e}")))?;
    let data = read_sized(reader).await?;
    Ok(Some(StoredRecord {
        creation_time,
        type_id,
        data,
    }))
}

struct StoredRecord {
    creation_time: chrono::DateTime<chrono::FixedOffset>,
    type_id: String,
    data: Vec<u8>,
}

impl StoredRecord {
    fn into_event(self, stream_id: Uuid) -> StoredEvent {
        StoredEvent {
            stream_id,
            creation_time: self.creation_time,
            type_id: self.type_id,
            data: self.data,
            metadata_type_id: String::new(),
            metadata: Vec::new(),
        }
    }
}

#[async_trait]
impl EventStorage for SimpleDiskStorage {
    async fn write(&self, event: &StoredEvent) -> Result<(), StorageError> {
        let history_path = self.history_path(event.stream_id);
        if let Some(parent) = history_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut history = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&history_path)
            .await?;
        let position = history.metadata().await?.len();

        write_sized(&mut history, &encode_timestamp(&event.creation_time)).await?;
        write_sized(&mut history, event.type_id.as_bytes()).await?;
        write_sized(&mut history, &event.data).await?;
        history.sync_all().await?;

        let mut index = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.index_path)
            .await?;
        write_uuid(&mut index, event.stream_id).await?;
        write_offset(&mut index, position).await?;
        index.sync_all().await?;

        debug!(stream = %event.stream_id, offset = position, "event written");
        Ok(())
    }

    async fn read_stream(&self, stream_id: Uuid) -> Result<Vec<StoredEvent>, StorageError> {
        let mut reader = BufReader::new(self.open_history(stream_id).await?);

        let mut events = Vec::new();
        while let Some(record) = read_record(&mut reader).await? {
            events.push(record.into_event(stream_id));
        }
        Ok(events)
    }

    async fn read_all(&self) -> Result<Vec<StoredEvent>, StorageError> {
        let mut index = BufReader::new(File::open(&self.index_path).await?);

        let mut events = Vec::new();
        loop {
            let stream_id = match read_uuid_opt(&mut index).await? {
                Some(id) => id,
                None => break,
            };
            let offset = read_offset(&mut index).await?;

            let mut history = self.open_history(stream_id).await?;
            history.seek(SeekFrom::Start(offset)).await?;
            let mut reader = BufReader::new(history);
            let record = read_record(&mut reader).await?.ok_or_else(|| {
                StorageError::Integrity(format!(
                    "indexed record missing at offset {offset} of stream {stream_id}"
                ))
            })?;
            events.push(record.into_event(stream_id));
        }
        Ok(events)
    }

    async fn stream_version(&self, _stream_id: Uuid) -> Result<u32, StorageError> {
        Err(StorageError::Unsupported("stream versions"))
    }

    async fn rebuild_type_indexes(&self) -> Result<(), StorageError> {
        // No type indexes in this layout; callers tolerate the no-op.
        Ok(())
    }
}
