//! Local view of synchronized records.
//!
//! Queued writes are applied optimistically; pulled records replace them
//! once the server has confirmed. Merging is idempotent by identifier, so
//! the same change arriving twice (push nudge, then pull) is harmless.

use serde_json::Value;
use std::collections::HashMap;

use greencycle_core::{ChangeType, EntityType, Record};

use crate::queue::PendingUpdate;

#[derive(Debug, Clone, PartialEq)]
pub struct LocalRecord {
    pub data: Value,
    pub updated_at: i64,
    /// `false` while the record only reflects a queued local write
    pub confirmed: bool,
}

/// Outcome of merging one pull response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: usize,
    pub removed: usize,
    pub unchanged: usize,
}

pub struct LocalState {
    tables: [HashMap<String, LocalRecord>; EntityType::COUNT],
}

impl Default for LocalState {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalState {
    pub fn new() -> Self {
        Self {
            tables: std::array::from_fn(|_| HashMap::new()),
        }
    }

    /// Reflect a queued write before the server has seen it.
    ///
    /// Creates without an id have no local key yet and show up only once
    /// pulled.
    pub fn apply_optimistic(&mut self, update: &PendingUpdate) {
        let Some(id) = update.id.clone() else {
            return;
        };
        let table = &mut self.tables[update.entity_type.index()];
        match update.operation {
            ChangeType::Delete => {
                table.remove(&id);
            }
            ChangeType::Create | ChangeType::Update => {
                let data = match table.get(&id) {
                    Some(existing) => merge(&existing.data, &update.data),
                    None => update.data.clone(),
                };
                table.insert(
                    id,
                    LocalRecord {
                        data,
                        updated_at: update.enqueued_at,
                        confirmed: false,
                    },
                );
            }
        }
    }

    /// Merge server-confirmed records.
    pub fn merge_pulled(&mut self, entity_type: EntityType, records: &[Record]) -> MergeStats {
        let table = &mut self.tables[entity_type.index()];
        let mut stats = MergeStats::default();

        for record in records {
            if record.deleted {
                if table.remove(&record.id).is_some() {
                    stats.removed += 1;
                } else {
                    stats.unchanged += 1;
                }
                continue;
            }
            match table.get(&record.id) {
                Some(existing) if existing.confirmed && existing.updated_at >= record.updated_at => {
                    stats.unchanged += 1;
                }
                _ => {
                    table.insert(
                        record.id.clone(),
                        LocalRecord {
                            data: record.data.clone(),
                            updated_at: record.updated_at,
                            confirmed: true,
                        },
                    );
                    stats.applied += 1;
                }
            }
        }
        stats
    }

    pub fn get(&self, entity_type: EntityType, id: &str) -> Option<&LocalRecord> {
        self.tables[entity_type.index()].get(id)
    }

    pub fn len(&self, entity_type: EntityType) -> usize {
        self.tables[entity_type.index()].len()
    }
}

fn merge(existing: &Value, patch: &Value) -> Value {
    match (existing, patch) {
        (Value::Object(base), Value::Object(fields)) => {
            let mut merged = base.clone();
            merged.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            Value::Object(merged)
        }
        (_, Value::Null) => existing.clone(),
        _ => patch.clone(),
    }
}
