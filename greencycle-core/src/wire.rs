//! JSON wire protocol shared by the socket and event-stream transports and
//! by the pull/push HTTP endpoints.
//!
//! Server → client frames (both transports):
//! ```text
//! { "type": "connection",   "message": s, "timestamp"?: n, "connectionId"?: s }
//! { "type": "sync",         "entityType": s, "changeType": s, "changes": [..], "timestamp": n }
//! { "type": "notification", ...fields, "timestamp": n }
//! { "type": "error",        "message": s }
//! { "type": "pong",         "timestamp": n }            // socket only
//! ```
//!
//! Client → server frames (socket only):
//! ```text
//! { "type": "ping" }
//! { "type": "subscribe", "entityTypes": [s, ..] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::entity::{ChangeType, EntityType};
use crate::error::ProtocolError;

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    /// Handshake acknowledgement
    #[serde(rename_all = "camelCase")]
    Connection {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    /// A change event in wire form
    #[serde(rename_all = "camelCase")]
    Sync {
        entity_type: EntityType,
        change_type: ChangeType,
        changes: Vec<Value>,
        timestamp: i64,
    },
    /// Out-of-band user message
    Notification {
        #[serde(flatten)]
        fields: Map<String, Value>,
        timestamp: i64,
    },
    Error {
        message: String,
    },
    Pong {
        timestamp: i64,
    },
}

impl ServerMessage {
    /// Build a notification from arbitrary fields. Reserved keys
    /// (`type`, `timestamp`) in `fields` are dropped.
    pub fn notification(mut fields: Map<String, Value>, timestamp: i64) -> Self {
        fields.remove("type");
        fields.remove("timestamp");
        ServerMessage::Notification { fields, timestamp }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    /// Discriminant as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connection { .. } => "connection",
            ServerMessage::Sync { .. } => "sync",
            ServerMessage::Notification { .. } => "notification",
            ServerMessage::Error { .. } => "error",
            ServerMessage::Pong { .. } => "pong",
        }
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// Client → server message (socket transport only).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Ping,
    /// Replaces the connection's subscription set
    #[serde(rename_all = "camelCase")]
    Subscribe { entity_types: Vec<String> },
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedMessage(e.to_string()))
    }
}

/// A server message encoded once and shared by every recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    pub fn encode(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        Ok(Self(Arc::from(serde_json::to_string(message)?)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A synchronized record as returned by the catch-up pull.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: String,
    #[serde(default)]
    pub data: Value,
    /// Milliseconds since epoch; unique per write on the server
    pub updated_at: i64,
    /// Tombstone marker for deletes
    #[serde(default)]
    pub deleted: bool,
}

/// One item of a push batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub data: Value,
    pub operation: ChangeType,
}

/// Per-item outcome of a push batch, in submission order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub id: Option<String>,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushRequest {
    pub updates: Vec<UpdateRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResponse {
    pub success: bool,
    pub data: Vec<Record>,
    pub sync_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
    pub success: bool,
    pub results: Vec<UpdateResult>,
    pub sync_timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub success: bool,
    pub status: String,
    pub last_server_sync: i64,
    pub statistics: BTreeMap<EntityType, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// Validate a push body. Runs before any update is applied.
///
/// `updates` must be a non-empty array whose items are objects with a
/// known `operation`; anything else rejects the whole call.
pub fn parse_updates(body: &Value) -> Result<Vec<UpdateRequest>, ProtocolError> {
    let items = match body.get("updates") {
        Some(Value::Array(items)) if !items.is_empty() => items,
        _ => return Err(ProtocolError::EmptyUpdates),
    };

    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            if !item.is_object() {
                return Err(ProtocolError::InvalidUpdate {
                    index,
                    reason: "update must be an object".into(),
                });
            }
            serde_json::from_value::<UpdateRequest>(item.clone()).map_err(|e| {
                ProtocolError::InvalidUpdate {
                    index,
                    reason: e.to_string(),
                }
            })
        })
        .collect()
}
