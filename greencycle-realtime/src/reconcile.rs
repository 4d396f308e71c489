//! Pull-based catch-up and batched client mutations.
//!
//! ```text
//! pull(T, cursor) ──► store.changed_since(T, cursor) ──► { data, syncTimestamp }
//!
//! push(T, [u1, u2, u3]) ──► store.apply(u1) ✓
//!                           store.apply(u2) ✗  (result entry only)
//!                           store.apply(u3) ✓
//!                                 │
//!                                 └──► bus.publish(T, [u1, u3], actor)   (once per call)
//! ```

use std::sync::Arc;

use greencycle_core::{
    batch_change_type, now_millis, ChangeItem, EntityType, MonotonicClock, PullResponse,
    PushResponse, StatusResponse, UpdateRequest, UpdateResult,
};

use crate::auth::Identity;
use crate::bus::EntityChangeBus;
use crate::store::{RecordStore, StoreError};

pub struct ReconciliationService {
    store: Arc<dyn RecordStore>,
    bus: Arc<EntityChangeBus>,
    clock: Arc<MonotonicClock>,
}

impl ReconciliationService {
    pub fn new(store: Arc<dyn RecordStore>, bus: Arc<EntityChangeBus>, clock: Arc<MonotonicClock>) -> Self {
        Self { store, bus, clock }
    }

    /// Everything of `entity_type` modified strictly after `last_sync`.
    pub fn pull(&self, entity_type: EntityType, last_sync: i64) -> Result<PullResponse, StoreError> {
        let changes = self.store.changed_since(entity_type, last_sync)?;
        log::debug!(
            "Pull {entity_type} since {last_sync}: {} records, next cursor {}",
            changes.records.len(),
            changes.sync_timestamp
        );
        Ok(PullResponse {
            success: true,
            data: changes.records,
            sync_timestamp: changes.sync_timestamp,
        })
    }

    /// Apply a batch of updates in order.
    ///
    /// Each update succeeds or fails on its own. All successful changes go
    /// out as one bus publish tagged with the acting user.
    pub fn push(&self, entity_type: EntityType, updates: &[UpdateRequest], actor: &Identity) -> PushResponse {
        let mut results = Vec::with_capacity(updates.len());
        let mut applied = Vec::new();

        for update in updates {
            match self.store.apply(entity_type, update) {
                Ok(change) => {
                    results.push(UpdateResult {
                        id: Some(change.record.id.clone()),
                        success: true,
                        message: format!("{} applied", change.change_type),
                    });
                    applied.push(ChangeItem::from_record(change.change_type, &change.record));
                }
                Err(e) => {
                    log::debug!("Push {entity_type} {} failed: {e}", update.operation);
                    results.push(UpdateResult {
                        id: update.id.clone(),
                        success: false,
                        message: e.to_string(),
                    });
                }
            }
        }

        log::info!(
            "Push {entity_type} by {}: {}/{} applied",
            actor.user_id,
            applied.len(),
            updates.len()
        );

        if !applied.is_empty() {
            let change_type = batch_change_type(&applied);
            let changes = applied.iter().map(ChangeItem::to_value).collect();
            self.bus
                .publish(entity_type, change_type, changes, Some(&actor.user_id));
        }

        PushResponse {
            success: true,
            results,
            sync_timestamp: self.clock.last(),
        }
    }

    /// Liveness plus live record counts.
    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            success: true,
            status: "online".to_string(),
            last_server_sync: now_millis().max(self.clock.last()),
            statistics: self.store.counts(),
        }
    }
}
