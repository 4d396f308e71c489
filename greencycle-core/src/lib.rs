//! # greencycle-core — Shared model for GreenCycle real-time sync
//!
//! Types and utilities used by both the realtime server and the client
//! sync agent.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ChangeEvent    ┌──────────────────┐
//! │ greencycle-      │ ───────────────► │ greencycle-      │
//! │ realtime (server)│   wire::*  JSON  │ client (agent)   │
//! └────────┬─────────┘ ◄─────────────── └────────┬─────────┘
//!          │                                     │
//!          └────────────► greencycle-core ◄──────┘
//!                  entity · event · wire · clock
//!                  retry · cache · error
//! ```
//!
//! ## Modules
//!
//! - [`entity`] — Closed set of synchronized entity types and change kinds
//! - [`event`] — `ChangeEvent`, the unit of push and pull propagation
//! - [`wire`] — JSON message shapes for both push transports and HTTP bodies
//! - [`clock`] — Strictly increasing millisecond clock for server timestamps
//! - [`retry`] — The one retry-with-backoff utility
//! - [`cache`] — Explicit TTL cache owned by whoever needs it
//! - [`error`] — Protocol error taxonomy

pub mod entity;
pub mod event;
pub mod wire;
pub mod clock;
pub mod retry;
pub mod cache;
pub mod error;

// Re-exports for convenience
pub use entity::{ChangeType, EntityType};
pub use event::{batch_change_type, ChangeEvent, ChangeItem};
pub use wire::{
    parse_updates, ClientMessage, ErrorResponse, Frame, PullResponse, PushRequest, PushResponse,
    Record, ServerMessage, StatusResponse, UpdateRequest, UpdateResult,
};
pub use clock::{now_millis, MonotonicClock};
pub use retry::{retry_with_backoff, retry_with_backoff_if, RetryPolicy};
pub use cache::TtlCache;
pub use error::ProtocolError;
