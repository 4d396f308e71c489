use thiserror::Error;

use greencycle_core::ProtocolError;

/// Durable queue storage errors.
#[derive(Debug, Clone, Error)]
pub enum QueueStoreError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for QueueStoreError {
    fn from(e: rocksdb::Error) -> Self {
        QueueStoreError::Database(e.to_string())
    }
}

/// Errors surfaced by the client sync agent and its transports.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Request never got a response
    #[error("Network error: {0}")]
    Network(String),
    /// Server answered with a non-success status
    #[error("Server returned {status}: {message}")]
    Server { status: u16, message: String },
    #[error("Not authenticated")]
    Unauthenticated,
    #[error("Unexpected response: {0}")]
    Decode(String),
    #[error("Push socket is not connected")]
    NotConnected,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Queue storage: {0}")]
    Storage(#[from] QueueStoreError),
}

impl ClientError {
    /// Client-side errors that will fail the same way on retry. A missing
    /// or rejected token only clears once the session changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ClientError::Server { status: 400..=499, .. }
                | ClientError::Unauthenticated
                | ClientError::Protocol(_)
        )
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}
