//! Push transports: a bidirectional socket and a unidirectional event stream.
//!
//! Both variants share the same contract:
//!
//! ```text
//! GET /ws?token=T              GET /events?token=T&entities=a,b
//!        │                                │
//!        └──────── verify token ──────────┘   (before anything is registered)
//!                       │
//!          401 + { type: "error" } on failure
//!                       │
//!              register Connection ──► { type: "connection", ... }
//!                       │
//!              drain ChannelSink ──► { type: "sync" | "notification", ... }
//! ```

pub mod socket;
pub mod stream;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;

use greencycle_core::{now_millis, ServerMessage};

use crate::auth::{AuthError, Identity, IdentityVerifier};
use crate::registry::{ConnectionId, EmptySubscriptions, TransportKind};

/// Query parameters accepted by both handshakes.
#[derive(Debug, Default, Deserialize)]
pub struct HandshakeQuery {
    pub token: Option<String>,
    /// Comma-separated entity types (stream variant only)
    pub entities: Option<String>,
}

/// Verify the handshake token.
///
/// On failure the returned response is the single terminal message the
/// caller ever sees for this attempt.
pub fn authenticate(verifier: &dyn IdentityVerifier, token: Option<&str>) -> Result<Identity, Response> {
    let result = match token {
        Some(token) => verifier.verify_access(token),
        None => Err(AuthError::MissingToken),
    };
    result.map_err(|e| {
        log::warn!("Rejected push handshake: {e}");
        reject(StatusCode::UNAUTHORIZED, format!("Unauthenticated: {e}"))
    })
}

/// A handshake rejection with a JSON `error` body.
pub fn reject(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(ServerMessage::error(message))).into_response()
}

/// Handshake acknowledgement for a freshly registered connection.
pub fn connection_ack(id: ConnectionId, transport: TransportKind) -> ServerMessage {
    let default = match transport.empty_subscriptions() {
        EmptySubscriptions::ReceiveAll => "all entity types until subscribe",
        EmptySubscriptions::ReceiveNone => "no entity types unless listed at connect",
    };
    ServerMessage::Connection {
        message: format!(
            "Connected to GreenCycle sync ({} transport, empty subscriptions receive {default})",
            transport.as_str()
        ),
        timestamp: Some(now_millis()),
        connection_id: Some(id.to_string()),
    }
}
