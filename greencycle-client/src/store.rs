//! Durable storage for the pending queue and sync cursors.
//!
//! Column families:
//! - `pending`: queued updates, keyed by big-endian sequence number
//!   (bincode envelope, JSON payload LZ4 compressed)
//! - `cursors`: last processed `syncTimestamp` per entity type
//!
//! Every mutation is written before the in-memory queue changes, so a
//! reload always resumes from what the agent last acknowledged.

use rocksdb::{ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use greencycle_core::{ChangeType, EntityType};

use crate::error::QueueStoreError;
use crate::queue::PendingUpdate;

const CF_PENDING: &str = "pending";
const CF_CURSORS: &str = "cursors";

const COLUMN_FAMILIES: &[&str] = &[CF_PENDING, CF_CURSORS];

pub trait QueueStore: Send + Sync {
    fn load_pending(&self) -> Result<Vec<PendingUpdate>, QueueStoreError>;
    fn put_pending(&self, update: &PendingUpdate) -> Result<(), QueueStoreError>;
    fn remove_pending(&self, seqs: &[u64]) -> Result<(), QueueStoreError>;
    fn clear_pending(&self) -> Result<(), QueueStoreError>;
    fn load_cursors(&self) -> Result<BTreeMap<EntityType, i64>, QueueStoreError>;
    fn save_cursor(&self, entity_type: EntityType, timestamp: i64) -> Result<(), QueueStoreError>;
}

/// On-disk form of a [`PendingUpdate`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredUpdate {
    seq: u64,
    entity_type: EntityType,
    operation: ChangeType,
    id: Option<String>,
    /// LZ4-compressed JSON
    data: Vec<u8>,
    enqueued_at: i64,
}

impl StoredUpdate {
    fn encode(update: &PendingUpdate) -> Result<Vec<u8>, QueueStoreError> {
        let json = serde_json::to_vec(&update.data)
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))?;
        let stored = StoredUpdate {
            seq: update.seq,
            entity_type: update.entity_type,
            operation: update.operation,
            id: update.id.clone(),
            data: lz4_flex::compress_prepend_size(&json),
            enqueued_at: update.enqueued_at,
        };
        bincode::serde::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| QueueStoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<PendingUpdate, QueueStoreError> {
        let (stored, _): (StoredUpdate, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| QueueStoreError::Deserialization(e.to_string()))?;
        let json = lz4_flex::decompress_size_prepended(&stored.data)
            .map_err(|e| QueueStoreError::Compression(e.to_string()))?;
        let data = serde_json::from_slice(&json)
            .map_err(|e| QueueStoreError::Deserialization(e.to_string()))?;
        Ok(PendingUpdate {
            seq: stored.seq,
            entity_type: stored.entity_type,
            operation: stored.operation,
            id: stored.id,
            data,
            enqueued_at: stored.enqueued_at,
        })
    }
}

/// RocksDB-backed queue store.
pub struct RocksQueueStore {
    db: DBWithThreadMode<SingleThreaded>,
    path: PathBuf,
}

impl RocksQueueStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, QueueStoreError> {
        let path = path.as_ref().to_path_buf();
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_keep_log_file_num(2);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| {
                let mut opts = Options::default();
                // Payloads are already LZ4 compressed
                opts.set_compression_type(DBCompressionType::None);
                ColumnFamilyDescriptor::new(*name, opts)
            })
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &path, cf_descriptors)?;
        log::debug!("Opened queue store at {}", path.display());
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, QueueStoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| QueueStoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Queue writes are synced: a confirmed enqueue must survive a crash.
    fn write(&self, batch: WriteBatch) -> Result<(), QueueStoreError> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }
}

impl QueueStore for RocksQueueStore {
    fn load_pending(&self) -> Result<Vec<PendingUpdate>, QueueStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut updates = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            updates.push(StoredUpdate::decode(&value)?);
        }
        Ok(updates)
    }

    fn put_pending(&self, update: &PendingUpdate) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, update.seq.to_be_bytes(), StoredUpdate::encode(update)?);
        self.write(batch)
    }

    fn remove_pending(&self, seqs: &[u64]) -> Result<(), QueueStoreError> {
        if seqs.is_empty() {
            return Ok(());
        }
        let cf = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        for seq in seqs {
            batch.delete_cf(&cf, seq.to_be_bytes());
        }
        self.write(batch)
    }

    fn clear_pending(&self) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_PENDING)?;
        let mut batch = WriteBatch::default();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            batch.delete_cf(&cf, key);
        }
        self.write(batch)
    }

    fn load_cursors(&self) -> Result<BTreeMap<EntityType, i64>, QueueStoreError> {
        let cf = self.cf(CF_CURSORS)?;
        let mut cursors = BTreeMap::new();
        for entity_type in EntityType::ALL {
            if let Some(bytes) = self.db.get_cf(&cf, entity_type.as_str())? {
                let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    QueueStoreError::Deserialization(format!("bad cursor for {entity_type}"))
                })?;
                cursors.insert(entity_type, i64::from_be_bytes(raw));
            }
        }
        Ok(cursors)
    }

    fn save_cursor(&self, entity_type: EntityType, timestamp: i64) -> Result<(), QueueStoreError> {
        let cf = self.cf(CF_CURSORS)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf, entity_type.as_str(), timestamp.to_be_bytes());
        self.write(batch)
    }
}

/// In-memory queue store for tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryQueueStore {
    pending: Mutex<BTreeMap<u64, PendingUpdate>>,
    cursors: Mutex<HashMap<EntityType, i64>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl QueueStore for MemoryQueueStore {
    fn load_pending(&self) -> Result<Vec<PendingUpdate>, QueueStoreError> {
        let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        Ok(pending.values().cloned().collect())
    }

    fn put_pending(&self, update: &PendingUpdate) -> Result<(), QueueStoreError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.insert(update.seq, update.clone());
        Ok(())
    }

    fn remove_pending(&self, seqs: &[u64]) -> Result<(), QueueStoreError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for seq in seqs {
            pending.remove(seq);
        }
        Ok(())
    }

    fn clear_pending(&self) -> Result<(), QueueStoreError> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).clear();
        Ok(())
    }

    fn load_cursors(&self) -> Result<BTreeMap<EntityType, i64>, QueueStoreError> {
        let cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        Ok(cursors.iter().map(|(k, v)| (*k, *v)).collect())
    }

    fn save_cursor(&self, entity_type: EntityType, timestamp: i64) -> Result<(), QueueStoreError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(|e| e.into_inner());
        cursors.insert(entity_type, timestamp);
        Ok(())
    }
}
