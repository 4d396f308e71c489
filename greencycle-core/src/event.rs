//! Change events: the unit of both push and pull propagation.
//!
//! ```text
//! mutation ──► ChangeEvent { entity_type, change_type, changes, timestamp, origin }
//!                   │
//!                   ├──► push: ServerMessage::Sync (best effort)
//!                   └──► pull: record.updated_at <= timestamp (durable)
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entity::{ChangeType, EntityType};
use crate::wire::{Record, ServerMessage};

/// A create/update/delete occurrence on one entity type.
///
/// `timestamp` is server-assigned and is never lower than the stored
/// `updated_at` of any record the event describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub entity_type: EntityType,
    pub change_type: ChangeType,
    /// Affected records: full snapshots for create/update, identifiers for delete
    pub changes: Vec<Value>,
    /// Milliseconds since epoch
    pub timestamp: i64,
    /// Actor that caused the change, if known
    pub origin_user_id: Option<String>,
}

impl ChangeEvent {
    /// Transpose to the `sync` wire message.
    pub fn to_message(&self) -> ServerMessage {
        ServerMessage::Sync {
            entity_type: self.entity_type,
            change_type: self.change_type,
            changes: self.changes.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// One element of a batched `changes` array.
///
/// Each item carries its own `operation`, so a batch mixing creates and
/// updates stays unambiguous even though the enclosing frame has a single
/// `changeType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeItem {
    pub id: String,
    pub operation: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub updated_at: i64,
}

impl ChangeItem {
    /// Build from a stored record. Deletes carry only the identifier.
    pub fn from_record(operation: ChangeType, record: &Record) -> Self {
        let data = match operation {
            ChangeType::Delete => None,
            _ => Some(record.data.clone()),
        };
        Self {
            id: record.id.clone(),
            operation,
            data,
            updated_at: record.updated_at,
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// `changeType` for a batch: the shared operation, or `update` when mixed.
pub fn batch_change_type(items: &[ChangeItem]) -> ChangeType {
    match items.first() {
        Some(first) if items.iter().all(|i| i.operation == first.operation) => first.operation,
        _ => ChangeType::Update,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(id: &str, ts: i64) -> Record {
        Record {
            id: id.to_string(),
            data: json!({ "weight": 12 }),
            updated_at: ts,
            deleted: false,
        }
    }

    #[test]
    fn test_change_event_to_sync_message() {
        let event = ChangeEvent {
            entity_type: EntityType::Collections,
            change_type: ChangeType::Create,
            changes: vec![json!({ "id": "c1" })],
            timestamp: 42,
            origin_user_id: Some("u1".into()),
        };
        let wire = serde_json::to_value(event.to_message()).unwrap();
        assert_eq!(wire["type"], "sync");
        assert_eq!(wire["entityType"], "collections");
        assert_eq!(wire["changeType"], "create");
        assert_eq!(wire["changes"][0]["id"], "c1");
        assert_eq!(wire["timestamp"], 42);
        // Origin never leaks onto the wire
        assert!(wire.get("originUserId").is_none());
    }

    #[test]
    fn test_change_item_delete_has_no_data() {
        let item = ChangeItem::from_record(ChangeType::Delete, &record("x", 5));
        let value = item.to_value();
        assert_eq!(value["id"], "x");
        assert_eq!(value["operation"], "delete");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn test_batch_change_type_uniform_and_mixed() {
        let creates = vec![
            ChangeItem::from_record(ChangeType::Create, &record("a", 1)),
            ChangeItem::from_record(ChangeType::Create, &record("b", 2)),
        ];
        assert_eq!(batch_change_type(&creates), ChangeType::Create);

        let mut mixed = creates.clone();
        mixed.push(ChangeItem::from_record(ChangeType::Delete, &record("c", 3)));
        assert_eq!(batch_change_type(&mixed), ChangeType::Update);

        let deletes = vec![ChangeItem::from_record(ChangeType::Delete, &record("d", 4))];
        assert_eq!(batch_change_type(&deletes), ChangeType::Delete);
    }
}
