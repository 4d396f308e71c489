//! Socket push client: connect, keepalive, subscribe, reconnect.
//!
//! ```text
//!  PushClient ──connect──► /ws?token=..
//!      │                      │
//!      │  out channel         ▼
//!      └──────────────► pump task ──► PushEvent channel ──► SyncAgent
//!                        (ping timer, reader, writer)
//! ```
//!
//! Push frames are only nudges: the agent re-pulls on `sync` rather than
//! trusting the frame contents.

use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use greencycle_core::{retry_with_backoff_if, ChangeType, ClientMessage, EntityType, ServerMessage};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::Session;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_BUFFER: usize = 256;
const OUTGOING_BUFFER: usize = 64;

/// Push socket connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the push client.
#[derive(Debug, Clone, PartialEq)]
pub enum PushEvent {
    /// Server acknowledged the handshake
    Connected { connection_id: Option<String> },
    /// A change happened on the server
    Sync {
        entity_type: EntityType,
        change_type: ChangeType,
        changes: Vec<Value>,
        timestamp: i64,
    },
    Notification {
        fields: Map<String, Value>,
        timestamp: i64,
    },
    /// Server reported an error (the socket stays open)
    Error(String),
    /// Socket closed
    Disconnected,
}

impl PushEvent {
    fn from_message(message: ServerMessage) -> Option<Self> {
        match message {
            ServerMessage::Connection { connection_id, .. } => {
                Some(PushEvent::Connected { connection_id })
            }
            ServerMessage::Sync {
                entity_type,
                change_type,
                changes,
                timestamp,
            } => Some(PushEvent::Sync {
                entity_type,
                change_type,
                changes,
                timestamp,
            }),
            ServerMessage::Notification { fields, timestamp } => {
                Some(PushEvent::Notification { fields, timestamp })
            }
            ServerMessage::Error { message } => Some(PushEvent::Error(message)),
            ServerMessage::Pong { .. } => None,
        }
    }
}

struct Link {
    outgoing: mpsc::Sender<ClientMessage>,
    task: JoinHandle<()>,
}

/// Socket client for server push.
///
/// All methods take `&self`; share it behind an `Arc` between the
/// connection supervisor and the [`ConnectionMonitor`](crate::ConnectionMonitor).
pub struct PushClient {
    config: ClientConfig,
    session: Session,
    subscriptions: Mutex<Vec<EntityType>>,
    state: Arc<watch::Sender<ConnectionState>>,
    /// Bumped per link so a stale pump never overwrites the current state
    generation: Arc<AtomicU64>,
    event_tx: mpsc::Sender<PushEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<PushEvent>>>,
    link: tokio::sync::Mutex<Option<Link>>,
}

impl PushClient {
    pub fn new(config: ClientConfig, session: Session) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            subscriptions: Mutex::new(config.entity_types.clone()),
            config,
            session,
            state: Arc::new(state),
            generation: Arc::new(AtomicU64::new(0)),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
            link: tokio::sync::Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<PushEvent>> {
        self.event_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn subscriptions(&self) -> Vec<EntityType> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Single connection attempt.
    pub async fn connect_once(&self) -> Result<(), ClientError> {
        self.state.send_replace(ConnectionState::Connecting);
        match self.open_link().await {
            Ok(()) => {
                log::info!("Push socket connected to {}", self.config.http_base());
                Ok(())
            }
            Err(e) => {
                self.state.send_replace(ConnectionState::Error);
                log::warn!("Push socket connection failed: {e}");
                Err(e)
            }
        }
    }

    /// Connect with the configured exponential backoff. A rejected or
    /// missing token ends the attempts at once.
    pub async fn connect(&self) -> Result<(), ClientError> {
        retry_with_backoff_if(
            &self.config.reconnect,
            |attempt| {
                if attempt > 0 {
                    log::info!("Reconnecting push socket (attempt {})", attempt + 1);
                }
                self.connect_once()
            },
            |e: &ClientError| !e.is_terminal(),
        )
        .await
    }

    /// Drop the current link (if any) and make exactly one new attempt.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.close_link().await;
        self.connect_once().await
    }

    pub async fn disconnect(&self) {
        self.close_link().await;
        self.state.send_replace(ConnectionState::Disconnected);
    }

    /// Replace the subscription set.
    ///
    /// Sent right away when connected and re-sent after every reconnect.
    pub async fn subscribe(&self, entity_types: Vec<EntityType>) -> Result<(), ClientError> {
        *self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()) = entity_types.clone();
        let link = self.link.lock().await;
        match link.as_ref() {
            Some(link) => link
                .outgoing
                .send(subscribe_message(&entity_types))
                .await
                .map_err(|_| ClientError::NotConnected),
            None => Ok(()),
        }
    }

    /// Keep the socket connected while a token is present, until `shutdown`
    /// flips to `true`.
    ///
    /// After the backoff is used up the next round waits `reconnect.max_delay`.
    /// A token the server rejected is not tried again until the session
    /// token changes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut state_rx = self.state.subscribe();
        let mut auth_rx = self.session.subscribe();
        let mut rejected: Option<String> = None;

        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = matches!(
                *state_rx.borrow_and_update(),
                ConnectionState::Disconnected | ConnectionState::Error
            );
            let token = auth_rx.borrow_and_update().clone();
            let mut pause = None;
            if idle && token.is_some() && token != rejected {
                match self.connect().await {
                    Ok(()) => rejected = None,
                    Err(e) => {
                        if e.is_terminal() {
                            log::warn!("Push socket waits for a new token: {e}");
                            rejected = token;
                        } else {
                            pause = Some(self.config.reconnect.max_delay);
                        }
                        // Connecting/Error flips made by the attempts themselves.
                        state_rx.mark_unchanged();
                    }
                }
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = state_rx.changed() => {}
                _ = auth_rx.changed() => {}
                _ = tokio::time::sleep(pause.unwrap_or_default()), if pause.is_some() => {}
            }
        }
        self.disconnect().await;
    }

    async fn open_link(&self) -> Result<(), ClientError> {
        let token = self.session.token().ok_or(ClientError::Unauthenticated)?;
        let (socket, _) = tokio_tungstenite::connect_async(self.config.socket_url(&token))
            .await
            .map_err(handshake_error)?;

        let (outgoing, out_rx) = mpsc::channel(OUTGOING_BUFFER);
        let subscriptions = self.subscriptions();
        if !subscriptions.is_empty() {
            outgoing
                .send(subscribe_message(&subscriptions))
                .await
                .map_err(|_| ClientError::NotConnected)?;
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.send_replace(ConnectionState::Connected);
        let task = tokio::spawn(pump(
            socket,
            out_rx,
            self.event_tx.clone(),
            PumpState {
                state: self.state.clone(),
                generation: self.generation.clone(),
                mine: generation,
            },
            self.config.ping_interval,
        ));

        if let Some(old) = self.link.lock().await.replace(Link { outgoing, task }) {
            old.task.abort();
        }
        Ok(())
    }

    async fn close_link(&self) {
        let Some(mut link) = self.link.lock().await.take() else {
            return;
        };
        self.generation.fetch_add(1, Ordering::SeqCst);
        drop(link.outgoing);
        if tokio::time::timeout(Duration::from_secs(1), &mut link.task)
            .await
            .is_err()
        {
            link.task.abort();
        }
    }
}

fn subscribe_message(entity_types: &[EntityType]) -> ClientMessage {
    ClientMessage::Subscribe {
        entity_types: entity_types.iter().map(|t| t.as_str().to_string()).collect(),
    }
}

fn handshake_error(error: tungstenite::Error) -> ClientError {
    match error {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
            ClientError::Unauthenticated
        }
        other => ClientError::Network(other.to_string()),
    }
}

struct PumpState {
    state: Arc<watch::Sender<ConnectionState>>,
    generation: Arc<AtomicU64>,
    mine: u64,
}

impl PumpState {
    fn finish(&self, end: ConnectionState) {
        if self.generation.load(Ordering::SeqCst) == self.mine {
            self.state.send_replace(end);
        }
    }
}

/// Drives one socket: keepalive pings, outgoing client messages and
/// incoming server frames.
async fn pump(
    socket: Socket,
    mut out_rx: mpsc::Receiver<ClientMessage>,
    events: mpsc::Sender<PushEvent>,
    link: PumpState,
    ping_every: Duration,
) {
    let (mut writer, mut reader) = socket.split();
    let mut ping = tokio::time::interval(ping_every.max(Duration::from_millis(1)));
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping.tick().await;

    let end = loop {
        tokio::select! {
            _ = ping.tick() => {
                if let Err(e) = send_client_message(&mut writer, &ClientMessage::Ping).await {
                    log::warn!("Keepalive ping failed: {e}");
                    break ConnectionState::Error;
                }
            }
            outgoing = out_rx.recv() => match outgoing {
                Some(message) => {
                    if let Err(e) = send_client_message(&mut writer, &message).await {
                        log::warn!("Push socket send failed: {e}");
                        break ConnectionState::Error;
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    break ConnectionState::Disconnected;
                }
            },
            incoming = reader.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerMessage::decode(text.as_str()) {
                    Ok(message) => {
                        if let Some(event) = PushEvent::from_message(message) {
                            if events.try_send(event).is_err() {
                                log::debug!("Push event dropped: consumer is behind");
                            }
                        }
                    }
                    Err(e) => log::warn!("Ignoring undecodable push frame: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break ConnectionState::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("Push socket read failed: {e}");
                    break ConnectionState::Error;
                }
            },
        }
    };

    log::info!("Push socket closed ({end})");
    link.finish(end);
    let _ = events.try_send(PushEvent::Disconnected);
}

async fn send_client_message<S>(writer: &mut S, message: &ClientMessage) -> Result<(), ClientError>
where
    S: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = message.encode()?;
    writer
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| ClientError::Network(e.to_string()))
}
