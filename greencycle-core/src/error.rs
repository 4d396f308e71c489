//! Protocol error taxonomy.
//!
//! Protocol errors are rejected synchronously, before any side effect,
//! and are never retried automatically.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("Malformed message: {0}")]
    MalformedMessage(String),
    #[error("Updates must be a non-empty array")]
    EmptyUpdates,
    #[error("Invalid update at index {index}: {reason}")]
    InvalidUpdate { index: usize, reason: String },
}
