//! Record persistence seam for the reconciliation endpoints.
//!
//! Each entity type maps to its own table in an enum-indexed array; there
//! is no string-keyed model lookup, so an unknown entity type can only
//! exist as a parse error at the boundary.
//!
//! Every write is stamped from the shared [`MonotonicClock`] while the
//! store lock is held, which makes `updated_at` unique and lets
//! `changed_since` hand out `clock.last()` as a safe next cursor.

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use greencycle_core::{ChangeType, EntityType, MonotonicClock, Record, UpdateRequest};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("Record {0} not found")]
    NotFound(String),
    #[error("Record {0} already exists")]
    AlreadyExists(String),
    #[error("{0} requires an id")]
    MissingId(ChangeType),
}

/// Records changed after a cursor, plus the next cursor.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeSet {
    pub records: Vec<Record>,
    pub sync_timestamp: i64,
}

/// A successfully applied update.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedChange {
    pub change_type: ChangeType,
    pub record: Record,
}

pub trait RecordStore: Send + Sync {
    /// Records of `entity_type` with `updated_at > since`, oldest first.
    fn changed_since(&self, entity_type: EntityType, since: i64) -> Result<ChangeSet, StoreError>;

    /// Apply one update atomically.
    fn apply(&self, entity_type: EntityType, update: &UpdateRequest) -> Result<AppliedChange, StoreError>;

    /// Live (non-tombstoned) record count per entity type.
    fn counts(&self) -> BTreeMap<EntityType, usize>;
}

#[derive(Default)]
struct Table {
    records: HashMap<String, Record>,
}

impl Table {
    fn live(&self, id: &str) -> Option<&Record> {
        self.records.get(id).filter(|r| !r.deleted)
    }
}

/// In-memory store, one table per entity type.
pub struct MemoryStore {
    clock: Arc<MonotonicClock>,
    tables: Mutex<[Table; EntityType::COUNT]>,
}

impl MemoryStore {
    pub fn new(clock: Arc<MonotonicClock>) -> Self {
        Self {
            clock,
            tables: Mutex::new(std::array::from_fn(|_| Table::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, [Table; EntityType::COUNT]> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn require_id(update: &UpdateRequest) -> Result<String, StoreError> {
        match update.id.as_deref() {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(StoreError::MissingId(update.operation)),
        }
    }
}

impl RecordStore for MemoryStore {
    fn changed_since(&self, entity_type: EntityType, since: i64) -> Result<ChangeSet, StoreError> {
        let tables = self.lock();
        let mut records: Vec<Record> = tables[entity_type.index()]
            .records
            .values()
            .filter(|r| r.updated_at > since)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.updated_at);
        // Read under the lock: no write can land at or below this value later
        let sync_timestamp = self.clock.last().max(since);
        Ok(ChangeSet {
            records,
            sync_timestamp,
        })
    }

    fn apply(&self, entity_type: EntityType, update: &UpdateRequest) -> Result<AppliedChange, StoreError> {
        let mut tables = self.lock();
        let table = &mut tables[entity_type.index()];

        let record = match update.operation {
            ChangeType::Create => {
                let id = match update.id.as_deref() {
                    Some(id) if !id.is_empty() => id.to_string(),
                    _ => Uuid::new_v4().to_string(),
                };
                if table.live(&id).is_some() {
                    return Err(StoreError::AlreadyExists(id));
                }
                let data = match &update.data {
                    Value::Null => Value::Object(Default::default()),
                    data => data.clone(),
                };
                Record {
                    id,
                    data,
                    updated_at: self.clock.tick(),
                    deleted: false,
                }
            }
            ChangeType::Update => {
                let id = Self::require_id(update)?;
                let existing = table.live(&id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
                Record {
                    data: merge(&existing.data, &update.data),
                    updated_at: self.clock.tick(),
                    deleted: false,
                    id,
                }
            }
            ChangeType::Delete => {
                let id = Self::require_id(update)?;
                if table.live(&id).is_none() {
                    return Err(StoreError::NotFound(id));
                }
                Record {
                    id,
                    data: Value::Null,
                    updated_at: self.clock.tick(),
                    deleted: true,
                }
            }
        };

        table.records.insert(record.id.clone(), record.clone());
        Ok(AppliedChange {
            change_type: update.operation,
            record,
        })
    }

    fn counts(&self) -> BTreeMap<EntityType, usize> {
        let tables = self.lock();
        EntityType::ALL
            .iter()
            .map(|t| {
                let live = tables[t.index()].records.values().filter(|r| !r.deleted).count();
                (*t, live)
            })
            .collect()
    }
}

/// Shallow merge of object fields; anything else replaces.
fn merge(existing: &Value, patch: &Value) -> Value {
    match (existing, patch) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut merged = base.clone();
            for (k, v) in fields {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Value::Null) => existing.clone(),
        _ => patch.clone(),
    }
}
