//! Live push connections and subscription-filtered fan-out.
//!
//! ```text
//! EntityChangeBus ──► RegistryFanout ──► ConnectionRegistry::broadcast
//!                                            │  encode frame once
//!                                            ├──► conn A (socket, all)      ✓
//!                                            ├──► conn B (stream, [users])  ✗ filtered
//!                                            └──► conn C (socket, closed)   ✗ evicted
//! ```
//!
//! The registry is an explicit instance created once at startup and shared
//! by the transports and the bus listener. Every delivery is a non-blocking
//! push into the connection's outbound buffer; a full or closed buffer
//! counts as a failed send and evicts the connection.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use greencycle_core::{now_millis, ChangeEvent, EntityType, Frame, ProtocolError, ServerMessage};

use crate::auth::Identity;
use crate::bus::{ChangeListener, ListenerError};

pub type ConnectionId = Uuid;

/// Wildcard accepted in subscription lists.
pub const SUBSCRIBE_ALL: &str = "all";

/// Which push transport a connection arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Bidirectional socket; subscriptions can change via `subscribe`
    Socket,
    /// Unidirectional event stream; subscriptions fixed at handshake
    Stream,
}

/// Meaning of an empty subscription set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptySubscriptions {
    ReceiveAll,
    ReceiveNone,
}

impl TransportKind {
    /// Socket connections hear everything until they narrow it down.
    pub const SOCKET_DEFAULT: EmptySubscriptions = EmptySubscriptions::ReceiveAll;
    /// Stream connections hear nothing unless `entities=` names something.
    pub const STREAM_DEFAULT: EmptySubscriptions = EmptySubscriptions::ReceiveNone;

    pub fn empty_subscriptions(&self) -> EmptySubscriptions {
        match self {
            TransportKind::Socket => Self::SOCKET_DEFAULT,
            TransportKind::Stream => Self::STREAM_DEFAULT,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Socket => "socket",
            TransportKind::Stream => "stream",
        }
    }
}

/// Subscription filter of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriptions {
    all: bool,
    types: HashSet<EntityType>,
    when_empty: EmptySubscriptions,
}

impl Subscriptions {
    /// Empty set with the transport's default meaning.
    pub fn empty(transport: TransportKind) -> Self {
        Self {
            all: false,
            types: HashSet::new(),
            when_empty: transport.empty_subscriptions(),
        }
    }

    /// Parse entity type names (or the `all` wildcard). Any unknown name
    /// rejects the whole list.
    pub fn parse<S: AsRef<str>>(names: &[S], transport: TransportKind) -> Result<Self, ProtocolError> {
        let mut subs = Self::empty(transport);
        for name in names {
            let name = name.as_ref().trim();
            if name == SUBSCRIBE_ALL {
                subs.all = true;
            } else {
                subs.types.insert(name.parse()?);
            }
        }
        Ok(subs)
    }

    pub fn matches(&self, entity_type: EntityType) -> bool {
        if self.all || self.types.contains(&entity_type) {
            return true;
        }
        self.is_empty() && self.when_empty == EmptySubscriptions::ReceiveAll
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.types.is_empty()
    }

    /// Wire names, sorted, for acks and logs.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.iter().map(|t| t.as_str().to_string()).collect();
        names.sort();
        if self.all {
            names.insert(0, SUBSCRIBE_ALL.to_string());
        }
        names
    }
}

#[derive(Debug, Clone, Error)]
pub enum DeliveryError {
    #[error("Outbound buffer full")]
    BufferFull,
    #[error("Connection closed")]
    Closed,
    #[error("Encode failed: {0}")]
    Encode(String),
}

/// Outbound side of one physical connection.
pub trait MessageSink: Send + Sync {
    /// Hand a frame to the transport without waiting.
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError>;
}

/// Sink backed by a bounded channel drained by the transport task.
pub struct ChannelSink {
    tx: mpsc::Sender<Frame>,
}

impl ChannelSink {
    /// Create a sink and the receiver the transport task reads from.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl MessageSink for ChannelSink {
    fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
        self.tx.try_send(frame.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::BufferFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

/// A registered push connection.
pub struct Connection {
    pub id: ConnectionId,
    /// Established once at handshake; never changes
    pub identity: Identity,
    pub transport: TransportKind,
    pub subscriptions: Subscriptions,
    pub connected_at: i64,
    sink: Arc<dyn MessageSink>,
}

impl Connection {
    /// Build a connection for an already verified identity.
    pub fn new(identity: Identity, transport: TransportKind, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            transport,
            subscriptions: Subscriptions::empty(transport),
            connected_at: now_millis(),
            sink,
        }
    }

    pub fn with_subscriptions(mut self, subscriptions: Subscriptions) -> Self {
        self.subscriptions = subscriptions;
        self
    }

    pub fn user_id(&self) -> &str {
        &self.identity.user_id
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("user_id", &self.identity.user_id)
            .field("transport", &self.transport)
            .field("subscriptions", &self.subscriptions.names())
            .finish()
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub total_registered: u64,
    pub active_connections: usize,
    pub frames_delivered: u64,
    pub failed_deliveries: u64,
    pub evicted: u64,
}

#[derive(Default)]
struct AtomicRegistryStats {
    total_registered: AtomicU64,
    frames_delivered: AtomicU64,
    failed_deliveries: AtomicU64,
    evicted: AtomicU64,
}

/// Result of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub filtered: usize,
    pub evicted: Vec<ConnectionId>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    stats: AtomicRegistryStats,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a connection whose identity was verified at handshake.
    pub fn register(&self, connection: Connection) -> ConnectionId {
        let id = connection.id;
        log::info!(
            "Registered {} connection {id} for user {} (subscriptions: {:?})",
            connection.transport.as_str(),
            connection.identity.user_id,
            connection.subscriptions.names()
        );
        self.lock().insert(id, connection);
        self.stats.total_registered.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Remove a connection. Safe to call more than once.
    pub fn unregister(&self, id: &ConnectionId) -> bool {
        let removed = self.lock().remove(id);
        if let Some(conn) = &removed {
            log::info!("Unregistered connection {id} for user {}", conn.identity.user_id);
        }
        removed.is_some()
    }

    /// Replace a connection's subscription set.
    pub fn set_subscriptions(&self, id: &ConnectionId, subscriptions: Subscriptions) -> bool {
        match self.lock().get_mut(id) {
            Some(conn) => {
                log::debug!("Connection {id} subscribed to {:?}", subscriptions.names());
                conn.subscriptions = subscriptions;
                true
            }
            None => false,
        }
    }

    /// Deliver a change to every eligible connection.
    ///
    /// A connection is eligible when its subscriptions match the entity type
    /// and it is not owned by `exclude_user_id`. Connections that fail the
    /// send are evicted; the loop always continues.
    pub fn broadcast(&self, event: &ChangeEvent, exclude_user_id: Option<&str>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let frame = match Frame::encode(&event.to_message()) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} change for broadcast: {e}", event.entity_type);
                return report;
            }
        };

        let mut connections = self.lock();
        for conn in connections.values() {
            if exclude_user_id == Some(conn.user_id()) || !conn.subscriptions.matches(event.entity_type) {
                report.filtered += 1;
                continue;
            }
            match conn.sink.deliver(&frame) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    log::warn!("Evicting connection {} after failed send: {e}", conn.id);
                    report.evicted.push(conn.id);
                }
            }
        }
        for id in &report.evicted {
            connections.remove(id);
        }
        drop(connections);

        self.record(report.delivered, report.evicted.len());
        log::debug!(
            "Broadcast {} {} to {} connections ({} filtered, {} evicted)",
            event.entity_type,
            event.change_type,
            report.delivered,
            report.filtered,
            report.evicted.len()
        );
        report
    }

    /// Deliver a message to every live connection of `user_id`.
    ///
    /// Returns whether at least one delivery succeeded.
    pub fn send_to_user(&self, user_id: &str, message: &ServerMessage) -> bool {
        let frame = match Frame::encode(message) {
            Ok(frame) => frame,
            Err(e) => {
                log::error!("Failed to encode {} message for user {user_id}: {e}", message.kind());
                return false;
            }
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        let mut connections = self.lock();
        for conn in connections.values().filter(|c| c.user_id() == user_id) {
            match conn.sink.deliver(&frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    log::warn!("Evicting connection {} after failed send: {e}", conn.id);
                    failed.push(conn.id);
                }
            }
        }
        for id in &failed {
            connections.remove(id);
        }
        drop(connections);

        self.record(delivered, failed.len());
        delivered > 0
    }

    fn record(&self, delivered: usize, failed: usize) {
        self.stats
            .frames_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.stats
            .failed_deliveries
            .fetch_add(failed as u64, Ordering::Relaxed);
        self.stats.evicted.fetch_add(failed as u64, Ordering::Relaxed);
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Number of live connections owned by `user_id`.
    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.lock().values().filter(|c| c.user_id() == user_id).count()
    }

    pub fn subscriptions_of(&self, id: &ConnectionId) -> Option<Subscriptions> {
        self.lock().get(id).map(|c| c.subscriptions.clone())
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            total_registered: self.stats.total_registered.load(Ordering::Relaxed),
            active_connections: self.len(),
            frames_delivered: self.stats.frames_delivered.load(Ordering::Relaxed),
            failed_deliveries: self.stats.failed_deliveries.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Bus listener forwarding every change to the registry.
pub struct RegistryFanout {
    registry: Arc<ConnectionRegistry>,
    suppress_origin_echo: bool,
}

impl RegistryFanout {
    pub fn new(registry: Arc<ConnectionRegistry>, suppress_origin_echo: bool) -> Self {
        Self {
            registry,
            suppress_origin_echo,
        }
    }
}

impl ChangeListener for RegistryFanout {
    fn name(&self) -> &str {
        "registry-fanout"
    }

    fn on_change(&self, event: &ChangeEvent) -> Result<(), ListenerError> {
        let exclude = if self.suppress_origin_echo {
            event.origin_user_id.as_deref()
        } else {
            None
        };
        self.registry.broadcast(event, exclude);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use greencycle_core::ChangeType;
    use serde_json::json;

    /// Sink that records frames, optionally failing every send.
    #[derive(Default)]
    struct TestSink {
        frames: Mutex<Vec<Frame>>,
        broken: bool,
    }

    impl TestSink {
        fn broken() -> Self {
            Self {
                broken: true,
                ..Self::default()
            }
        }

        fn count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }
    }

    impl MessageSink for TestSink {
        fn deliver(&self, frame: &Frame) -> Result<(), DeliveryError> {
            if self.broken {
                return Err(DeliveryError::Closed);
            }
            self.frames.lock().unwrap().push(frame.clone());
            Ok(())
        }
    }

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            role: "user".to_string(),
        }
    }

    fn event(entity_type: EntityType, origin: Option<&str>) -> ChangeEvent {
        ChangeEvent {
            entity_type,
            change_type: ChangeType::Update,
            changes: vec![json!({ "id": "r1" })],
            timestamp: 1,
            origin_user_id: origin.map(str::to_string),
        }
    }

    fn add(
        registry: &ConnectionRegistry,
        user: &str,
        transport: TransportKind,
        subs: &[&str],
        sink: Arc<TestSink>,
    ) -> ConnectionId {
        let conn = Connection::new(identity(user), transport, sink)
            .with_subscriptions(Subscriptions::parse(subs, transport).unwrap());
        registry.register(conn)
    }

    #[test]
    fn test_register_unregister_idempotent() {
        let registry = ConnectionRegistry::new();
        let id = add(&registry, "u1", TransportKind::Socket, &[], Arc::new(TestSink::default()));
        assert!(registry.contains(&id));
        assert_eq!(registry.len(), 1);

        assert!(registry.unregister(&id));
        assert!(!registry.unregister(&id));
        assert!(registry.is_empty());
        assert_eq!(registry.stats().total_registered, 1);
    }

    #[test]
    fn test_broadcast_evicts_failing_connection() {
        let registry = ConnectionRegistry::new();
        let first = Arc::new(TestSink::default());
        let broken = Arc::new(TestSink::broken());
        let third = Arc::new(TestSink::default());
        add(&registry, "u1", TransportKind::Socket, &[], first.clone());
        let broken_id = add(&registry, "u2", TransportKind::Socket, &[], broken.clone());
        add(&registry, "u3", TransportKind::Socket, &[], third.clone());

        let report = registry.broadcast(&event(EntityType::Collections, None), None);

        assert_eq!(report.delivered, 2);
        assert_eq!(report.evicted, vec![broken_id]);
        assert_eq!(first.count(), 1);
        assert_eq!(third.count(), 1);
        assert!(!registry.contains(&broken_id));
        assert_eq!(registry.len(), 2);

        let stats = registry.stats();
        assert_eq!(stats.frames_delivered, 2);
        assert_eq!(stats.evicted, 1);
    }

    #[test]
    fn test_subscription_filter() {
        let registry = ConnectionRegistry::new();
        let narrowed = Arc::new(TestSink::default());
        let socket_default = Arc::new(TestSink::default());
        let stream_default = Arc::new(TestSink::default());
        let wildcard = Arc::new(TestSink::default());
        add(&registry, "u1", TransportKind::Socket, &["collections"], narrowed.clone());
        add(&registry, "u2", TransportKind::Socket, &[], socket_default.clone());
        add(&registry, "u3", TransportKind::Stream, &[], stream_default.clone());
        add(&registry, "u4", TransportKind::Stream, &["all"], wildcard.clone());

        registry.broadcast(&event(EntityType::Collections, None), None);
        registry.broadcast(&event(EntityType::Marketplace, None), None);

        assert_eq!(narrowed.count(), 1);
        let frame = narrowed.frames.lock().unwrap()[0].clone();
        assert!(frame.as_str().contains("\"entityType\":\"collections\""));
        assert_eq!(socket_default.count(), 2);
        assert_eq!(stream_default.count(), 0);
        assert_eq!(wildcard.count(), 2);
    }

    #[test]
    fn test_broadcast_excludes_user() {
        let registry = ConnectionRegistry::new();
        let own_tab = Arc::new(TestSink::default());
        let other = Arc::new(TestSink::default());
        add(&registry, "origin", TransportKind::Socket, &[], own_tab.clone());
        add(&registry, "someone", TransportKind::Socket, &[], other.clone());

        let report = registry.broadcast(&event(EntityType::Users, Some("origin")), Some("origin"));
        assert_eq!(report.delivered, 1);
        assert_eq!(report.filtered, 1);
        assert_eq!(own_tab.count(), 0);
        assert_eq!(other.count(), 1);
    }

    #[test]
    fn test_send_to_user_multiple_connections() {
        let registry = ConnectionRegistry::new();
        let tab1 = Arc::new(TestSink::default());
        let tab2 = Arc::new(TestSink::default());
        let stranger = Arc::new(TestSink::default());
        add(&registry, "u1", TransportKind::Socket, &[], tab1.clone());
        add(&registry, "u1", TransportKind::Stream, &[], tab2.clone());
        add(&registry, "u2", TransportKind::Socket, &[], stranger.clone());

        let msg = ServerMessage::notification(serde_json::Map::new(), 5);
        assert!(registry.send_to_user("u1", &msg));
        assert_eq!(tab1.count(), 1);
        assert_eq!(tab2.count(), 1);
        assert_eq!(stranger.count(), 0);

        assert!(!registry.send_to_user("nobody", &msg));
        assert_eq!(registry.user_connection_count("u1"), 2);
    }

    #[test]
    fn test_send_to_user_all_failed() {
        let registry = ConnectionRegistry::new();
        add(&registry, "u1", TransportKind::Socket, &[], Arc::new(TestSink::broken()));
        let msg = ServerMessage::error("x");
        assert!(!registry.send_to_user("u1", &msg));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_set_subscriptions_replaces() {
        let registry = ConnectionRegistry::new();
        let sink = Arc::new(TestSink::default());
        let id = add(&registry, "u1", TransportKind::Socket, &["users"], sink.clone());

        let replaced = Subscriptions::parse(&["marketplace"], TransportKind::Socket).unwrap();
        assert!(registry.set_subscriptions(&id, replaced));
        let subs = registry.subscriptions_of(&id).unwrap();
        assert!(subs.matches(EntityType::Marketplace));
        assert!(!subs.matches(EntityType::Users));

        assert!(!registry.set_subscriptions(&Uuid::new_v4(), Subscriptions::empty(TransportKind::Socket)));
    }

    #[test]
    fn test_subscriptions_parse_rejects_unknown() {
        let err = Subscriptions::parse(&["users", "factories"], TransportKind::Socket).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownEntityType("factories".into()));
    }

    #[tokio::test]
    async fn test_channel_sink_full_and_closed() {
        let (sink, mut rx) = ChannelSink::channel(1);
        let frame = Frame::encode(&ServerMessage::Pong { timestamp: 1 }).unwrap();
        sink.deliver(&frame).unwrap();
        assert!(matches!(sink.deliver(&frame), Err(DeliveryError::BufferFull)));

        assert_eq!(rx.recv().await.unwrap(), frame);
        drop(rx);
        assert!(matches!(sink.deliver(&frame), Err(DeliveryError::Closed)));
    }

    #[test]
    fn test_fanout_listener_suppresses_origin_echo() {
        let registry = Arc::new(ConnectionRegistry::new());
        let origin = Arc::new(TestSink::default());
        let other = Arc::new(TestSink::default());
        add(&registry, "origin", TransportKind::Socket, &[], origin.clone());
        add(&registry, "other", TransportKind::Socket, &[], other.clone());

        let quiet = RegistryFanout::new(registry.clone(), true);
        quiet.on_change(&event(EntityType::Users, Some("origin"))).unwrap();
        assert_eq!(origin.count(), 0);
        assert_eq!(other.count(), 1);

        let echo = RegistryFanout::new(registry, false);
        echo.on_change(&event(EntityType::Users, Some("origin"))).unwrap();
        assert_eq!(origin.count(), 1);
        assert_eq!(other.count(), 2);
    }
}
