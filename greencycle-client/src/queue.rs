//! Pending (not yet server-confirmed) local writes.
//!
//! Items leave the queue only when the server confirms them, or when the
//! queue is cleared explicitly. There is no size cap and no dead-lettering.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};

use greencycle_core::{now_millis, ChangeType, EntityType, UpdateRequest};

/// A queued local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    /// Local sequence number, strictly increasing across reloads
    pub seq: u64,
    pub entity_type: EntityType,
    pub operation: ChangeType,
    pub id: Option<String>,
    pub data: Value,
    /// Milliseconds since epoch
    pub enqueued_at: i64,
}

impl PendingUpdate {
    pub fn to_request(&self) -> UpdateRequest {
        UpdateRequest {
            id: self.id.clone(),
            data: self.data.clone(),
            operation: self.operation,
        }
    }
}

#[derive(Debug, Default)]
pub struct PendingQueue {
    items: VecDeque<PendingUpdate>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted items (any order).
    pub fn restore(mut items: Vec<PendingUpdate>) -> Self {
        items.sort_by_key(|u| u.seq);
        let next_seq = items.last().map_or(0, |u| u.seq + 1);
        Self {
            items: items.into(),
            next_seq,
        }
    }

    /// Append a new update and return it.
    pub fn push(
        &mut self,
        entity_type: EntityType,
        operation: ChangeType,
        id: Option<String>,
        data: Value,
    ) -> PendingUpdate {
        let update = PendingUpdate {
            seq: self.next_seq,
            entity_type,
            operation,
            id,
            data,
            enqueued_at: now_millis(),
        };
        self.next_seq += 1;
        self.items.push_back(update.clone());
        update
    }

    /// Undo the most recent `push` if it was `seq`.
    pub fn pop_last(&mut self, seq: u64) -> Option<PendingUpdate> {
        if self.items.back().map(|u| u.seq) == Some(seq) {
            self.items.pop_back()
        } else {
            None
        }
    }

    /// Copy of the current contents, in submission order.
    pub fn snapshot(&self) -> Vec<PendingUpdate> {
        self.items.iter().cloned().collect()
    }

    /// Remove confirmed items. Returns how many were removed.
    pub fn remove(&mut self, seqs: &[u64]) -> usize {
        let before = self.items.len();
        self.items.retain(|u| !seqs.contains(&u.seq));
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Group a snapshot by entity type, keeping submission order in each group.
pub fn group_by_entity(updates: Vec<PendingUpdate>) -> BTreeMap<EntityType, Vec<PendingUpdate>> {
    let mut groups: BTreeMap<EntityType, Vec<PendingUpdate>> = BTreeMap::new();
    for update in updates {
        groups.entry(update.entity_type).or_default().push(update);
    }
    groups
}
