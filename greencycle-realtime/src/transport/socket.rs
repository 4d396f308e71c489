//! Bidirectional socket transport.
//!
//! Subscriptions start empty (every entity type is delivered) and are
//! replaced wholesale by each `subscribe` message.

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use greencycle_core::{now_millis, ClientMessage, Frame, ServerMessage};

use super::{authenticate, connection_ack, HandshakeQuery};
use crate::auth::Identity;
use crate::http::AppState;
use crate::registry::{ChannelSink, Connection, ConnectionId, ConnectionRegistry, Subscriptions, TransportKind};

/// `GET /ws?token=...`
///
/// The token is verified before the upgrade; a rejected handshake never
/// reaches the registry.
pub async fn socket_handler(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match authenticate(state.verifier.as_ref(), query.token.as_deref()) {
        Ok(identity) => identity,
        Err(rejection) => return rejection,
    };
    ws.on_upgrade(move |socket| handle_socket(state, identity, socket))
        .into_response()
}

async fn handle_socket(state: AppState, identity: Identity, socket: WebSocket) {
    let (sink, mut outbound) = ChannelSink::channel(state.config.connection_buffer);
    let connection = Connection::new(identity, TransportKind::Socket, Arc::new(sink));
    let id = state.registry.register(connection);
    let (mut sender, mut receiver) = socket.split();

    if send_message(&mut sender, &connection_ack(id, TransportKind::Socket))
        .await
        .is_ok()
    {
        loop {
            tokio::select! {
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        // Registry dropped our sink: evicted
                        log::debug!("Connection {id} evicted, closing socket");
                        break;
                    };
                    if sender.send(Message::Text(frame.as_str().into())).await.is_err() {
                        break;
                    }
                }
                incoming = receiver.next() => {
                    let reply = match incoming {
                        Some(Ok(Message::Text(text))) => {
                            handle_client_text(&state.registry, &id, text.as_str())
                        }
                        Some(Ok(Message::Binary(_))) => {
                            Some(ServerMessage::error("Binary frames are not supported"))
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => None,
                        Some(Err(e)) => {
                            log::debug!("Socket error on connection {id}: {e}");
                            break;
                        }
                    };
                    if let Some(reply) = reply {
                        if send_message(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    state.registry.unregister(&id);
}

/// Apply one client message. Returns the direct reply, if any.
///
/// A malformed message yields an `error` reply; the connection stays open.
pub(crate) fn handle_client_text(
    registry: &ConnectionRegistry,
    id: &ConnectionId,
    text: &str,
) -> Option<ServerMessage> {
    match ClientMessage::decode(text) {
        Ok(ClientMessage::Ping) => Some(ServerMessage::Pong {
            timestamp: now_millis(),
        }),
        Ok(ClientMessage::Subscribe { entity_types }) => {
            match Subscriptions::parse(&entity_types, TransportKind::Socket) {
                Ok(subscriptions) => {
                    registry.set_subscriptions(id, subscriptions);
                    None
                }
                Err(e) => Some(ServerMessage::error(format!("Invalid subscription: {e}"))),
            }
        }
        Err(e) => {
            log::debug!("Malformed message on connection {id}: {e}");
            Some(ServerMessage::error(format!("Invalid message: {e}")))
        }
    }
}

async fn send_message(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    match Frame::encode(message) {
        Ok(frame) => sender.send(Message::Text(frame.as_str().into())).await,
        Err(e) => {
            log::error!("Failed to encode {} message: {e}", message.kind());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{DeliveryError, MessageSink};
    use greencycle_core::EntityType;

    struct NullSink;

    impl MessageSink for NullSink {
        fn deliver(&self, _frame: &Frame) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn registered() -> (ConnectionRegistry, ConnectionId) {
        let registry = ConnectionRegistry::new();
        let identity = Identity {
            user_id: "u1".into(),
            role: "user".into(),
        };
        let id = registry.register(Connection::new(identity, TransportKind::Socket, Arc::new(NullSink)));
        (registry, id)
    }

    #[test]
    fn test_ping_gets_pong() {
        let (registry, id) = registered();
        let reply = handle_client_text(&registry, &id, r#"{"type":"ping"}"#);
        assert!(matches!(reply, Some(ServerMessage::Pong { .. })));
    }

    #[test]
    fn test_subscribe_replaces_set_without_reply() {
        let (registry, id) = registered();
        assert!(handle_client_text(&registry, &id, r#"{"type":"subscribe","entityTypes":["users"]}"#).is_none());
        assert!(handle_client_text(&registry, &id, r#"{"type":"subscribe","entityTypes":["collections"]}"#).is_none());

        let subs = registry.subscriptions_of(&id).unwrap();
        assert!(subs.matches(EntityType::Collections));
        assert!(!subs.matches(EntityType::Users));
    }

    #[test]
    fn test_malformed_subscribe_keeps_previous_set() {
        let (registry, id) = registered();
        handle_client_text(&registry, &id, r#"{"type":"subscribe","entityTypes":["users"]}"#);

        let reply = handle_client_text(&registry, &id, r#"{"type":"subscribe","entityTypes":"users"}"#);
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));
        let reply = handle_client_text(&registry, &id, r#"{"type":"subscribe","entityTypes":["factories"]}"#);
        assert!(matches!(reply, Some(ServerMessage::Error { .. })));

        let subs = registry.subscriptions_of(&id).unwrap();
        assert!(subs.matches(EntityType::Users));
        assert!(registry.contains(&id));
    }

    #[test]
    fn test_unknown_message_type_is_error() {
        let (registry, id) = registered();
        let reply = handle_client_text(&registry, &id, "garbage");
        match reply {
            Some(ServerMessage::Error { message }) => assert!(message.starts_with("Invalid message")),
            other => panic!("expected error reply, got {other:?}"),
        }
    }
}
