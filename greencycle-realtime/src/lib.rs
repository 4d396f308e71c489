//! # greencycle-realtime — Server side of GreenCycle real-time sync
//!
//! Pushes entity changes to connected clients over a socket or an event
//! stream, and serves the pull/push reconciliation endpoints that make the
//! push path safe to lose.
//!
//! ## Architecture
//!
//! ```text
//!  POST /api/sync/{T}           GET /api/sync/{T}?lastSyncTimestamp=
//!        │                               │
//!        ▼                               ▼
//! ┌──────────────────────┐      ┌──────────────────┐
//! │ ReconciliationService│─────►│ RecordStore      │
//! └──────────┬───────────┘      │ (enum-indexed)   │
//!            │ publish          └──────────────────┘
//!            ▼
//! ┌──────────────────────┐      ┌──────────────────┐
//! │ EntityChangeBus      │─────►│ ConnectionRegistry│──► /ws     (socket)
//! │ (sync fan-out)       │      │ (filter + evict) │──► /events (stream)
//! └──────────────────────┘      └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`bus`] — Fire-and-forget change fan-out to listeners
//! - [`registry`] — Live connections, subscription filters, eviction on failed send
//! - [`transport`] — Socket and event-stream handshakes and pumps
//! - [`auth`] — HMAC bearer tokens for handshakes and HTTP calls
//! - [`store`] — Record store seam and in-memory implementation
//! - [`reconcile`] — Catch-up pull, batched push, status
//! - [`http`] — Router and JSON error mapping
//! - [`server`] — `SyncServer` wiring
//! - [`config`] — Server and token configuration

pub mod auth;
pub mod bus;
pub mod config;
pub mod http;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod store;
pub mod transport;

// Re-exports for convenience
pub use auth::{AuthError, Identity, IdentityVerifier, TokenPurpose, TokenService};
pub use bus::{ChangeListener, EntityChangeBus, ListenerError};
pub use config::{ServerConfig, TokenConfig};
pub use reconcile::ReconciliationService;
pub use registry::{
    BroadcastReport, ChannelSink, Connection, ConnectionId, ConnectionRegistry, DeliveryError,
    MessageSink, RegistryFanout, RegistryStats, Subscriptions, TransportKind,
};
pub use server::{ServerError, ServerStats, SyncServer};
pub use store::{MemoryStore, RecordStore, StoreError};
