//! Unidirectional event-stream transport (`text/event-stream`).
//!
//! Subscriptions are fixed at handshake from `entities=`; with no list the
//! connection receives notifications but no `sync` frames.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use std::convert::Infallible;
use std::sync::Arc;

use greencycle_core::Frame;

use super::{authenticate, connection_ack, reject, HandshakeQuery};
use crate::http::AppState;
use crate::registry::{ChannelSink, Connection, ConnectionId, ConnectionRegistry, Subscriptions, TransportKind};

/// Unregisters the connection when the response stream is dropped.
struct RegistrationGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.registry.unregister(&self.id);
    }
}

/// Split an `entities=` value into names, ignoring empty segments.
pub(crate) fn entity_list(raw: Option<&str>) -> Vec<&str> {
    raw.map(|s| s.split(',').map(str::trim).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

/// `GET /events?token=...&entities=a,b`
pub async fn stream_handler(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    let identity = match authenticate(state.verifier.as_ref(), query.token.as_deref()) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    let subscriptions = match Subscriptions::parse(&entity_list(query.entities.as_deref()), TransportKind::Stream) {
        Ok(subscriptions) => subscriptions,
        Err(e) => return reject(StatusCode::BAD_REQUEST, e.to_string()),
    };

    let (sink, mut outbound) = ChannelSink::channel(state.config.connection_buffer);
    let connection = Connection::new(identity, TransportKind::Stream, Arc::new(sink))
        .with_subscriptions(subscriptions);
    let id = state.registry.register(connection);
    let guard = RegistrationGuard {
        registry: state.registry.clone(),
        id,
    };
    let ack = Frame::encode(&connection_ack(id, TransportKind::Stream));

    let events = async_stream::stream! {
        let _guard = guard;
        match ack {
            Ok(ack) => yield Ok::<Event, Infallible>(Event::default().data(ack.as_str())),
            Err(e) => log::error!("Failed to encode stream ack for {id}: {e}"),
        }
        while let Some(frame) = outbound.recv().await {
            yield Ok(Event::default().data(frame.as_str()));
        }
        log::debug!("Stream connection {id} evicted, ending response");
    };

    Sse::new(events)
        .keep_alive(
            KeepAlive::new()
                .interval(state.config.sse_keep_alive)
                .text("keep-alive"),
        )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Identity;
    use crate::registry::{DeliveryError, MessageSink};

    struct NullSink;

    impl MessageSink for NullSink {
        fn deliver(&self, _frame: &Frame) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    #[test]
    fn test_entity_list_parsing() {
        assert!(entity_list(None).is_empty());
        assert!(entity_list(Some("")).is_empty());
        assert_eq!(entity_list(Some("users, collections,,")), vec!["users", "collections"]);
    }

    #[test]
    fn test_guard_unregisters_on_drop() {
        let registry = Arc::new(ConnectionRegistry::new());
        let identity = Identity {
            user_id: "u1".into(),
            role: "user".into(),
        };
        let id = registry.register(Connection::new(identity, TransportKind::Stream, Arc::new(NullSink)));
        let guard = RegistrationGuard {
            registry: registry.clone(),
            id,
        };
        assert!(registry.contains(&id));
        drop(guard);
        assert!(!registry.contains(&id));
    }
}
