//! # greencycle-client — Client side of GreenCycle real-time sync
//!
//! Keeps a local copy of synchronized records current. Local writes are
//! queued durably and flushed through the push endpoint; the catch-up pull
//! is the authoritative refresh; the push socket only nudges a new cycle.
//!
//! ## Architecture
//!
//! ```text
//!   queue_update ──► PendingQueue ──► RocksQueueStore (survives reload)
//!                        │
//!   triggers ──► SyncAgent::perform_sync ──► SyncApi::push / SyncApi::pull
//!   (poll, auth,         │                          │
//!    manual, push)       ▼                          ▼
//!                    LocalState ◄─── merge ─── CursorBook
//!
//!   PushClient (/ws) ──PushEvent──► SyncAgent      ConnectionMonitor ──► UI
//! ```
//!
//! ## Modules
//!
//! - [`agent`] — Sync cycles, triggers, status
//! - [`api`] — HTTP pull/push/status client
//! - [`transport`] — Push socket with keepalive and reconnect backoff
//! - [`monitor`] — Four-state connection status and manual reconnect
//! - [`queue`] — Pending updates
//! - [`store`] — Durable queue and cursor storage
//! - [`cursor`] — Per-entity-type catch-up cursors
//! - [`local`] — Local merged records
//! - [`session`] — Shared bearer token
//! - [`config`] — Client configuration

pub mod agent;
pub mod api;
pub mod config;
pub mod cursor;
pub mod error;
pub mod local;
pub mod monitor;
pub mod queue;
pub mod session;
pub mod store;
#[cfg(test)]
mod testing;
pub mod transport;

// Re-exports for convenience
pub use agent::{SyncAgent, SyncOutcome, SyncReport, SyncStatus, SyncTriggers};
pub use api::{HttpSyncApi, SyncApi};
pub use config::ClientConfig;
pub use cursor::CursorBook;
pub use error::{ClientError, QueueStoreError};
pub use local::{LocalRecord, LocalState, MergeStats};
pub use monitor::{ConnectionMonitor, ConnectionTransport};
pub use queue::{PendingQueue, PendingUpdate};
pub use session::Session;
pub use store::{MemoryQueueStore, QueueStore, RocksQueueStore};
pub use transport::{ConnectionState, PushClient, PushEvent};
