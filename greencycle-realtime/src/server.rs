//! Sync server wiring.
//!
//! ```text
//!                     MonotonicClock (shared)
//!                      │            │
//!                MemoryStore    EntityChangeBus ──► RegistryFanout ──► ConnectionRegistry
//!                      │            ▲                                       ▲
//!             ReconciliationService ┘                         /ws, /events ─┘
//! ```
//!
//! Every component is an explicit instance built once in [`SyncServer::new`]
//! and handed to the router state; nothing lives in a global.

use serde_json::{Map, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;

use greencycle_core::{now_millis, MonotonicClock, ServerMessage};

use crate::auth::{AuthError, TokenService};
use crate::bus::EntityChangeBus;
use crate::config::ServerConfig;
use crate::http::{router, AppState};
use crate::reconcile::ReconciliationService;
use crate::registry::{ConnectionRegistry, RegistryFanout, RegistryStats};
use crate::store::{MemoryStore, RecordStore};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Token service: {0}")]
    Auth(#[from] AuthError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub registry: RegistryStats,
    pub events_published: u64,
    pub listener_failures: u64,
}

/// The sync server.
pub struct SyncServer {
    config: Arc<ServerConfig>,
    tokens: TokenService,
    bus: Arc<EntityChangeBus>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    reconcile: Arc<ReconciliationService>,
}

impl SyncServer {
    /// Create a server backed by the in-memory record store.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let clock = Arc::new(MonotonicClock::new());
        let store = Arc::new(MemoryStore::new(clock.clone()));
        Self::with_store(config, store, clock)
    }

    /// Create a server over an existing record store.
    ///
    /// `clock` must be the clock `store` stamps its writes with.
    pub fn with_store(
        config: ServerConfig,
        store: Arc<dyn RecordStore>,
        clock: Arc<MonotonicClock>,
    ) -> Result<Self, ServerError> {
        let tokens = TokenService::new(&config.tokens)?;
        let bus = Arc::new(EntityChangeBus::new(clock.clone()));
        let registry = Arc::new(ConnectionRegistry::new());
        bus.subscribe(Arc::new(RegistryFanout::new(
            registry.clone(),
            config.suppress_origin_echo,
        )));
        let reconcile = Arc::new(ReconciliationService::new(store.clone(), bus.clone(), clock));

        Ok(Self {
            config: Arc::new(config),
            tokens,
            bus,
            registry,
            store,
            reconcile,
        })
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Result<Self, ServerError> {
        Self::new(ServerConfig::default())
    }

    /// Router over this server's components.
    pub fn router(&self) -> axum::Router {
        router(AppState {
            config: self.config.clone(),
            verifier: Arc::new(self.tokens.clone()),
            registry: self.registry.clone(),
            reconcile: self.reconcile.clone(),
        })
    }

    /// Bind the configured address and serve until the process stops.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let addr: SocketAddr = listener.local_addr()?;
        log::info!("Sync server listening on {addr}");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    /// Deliver an out-of-band notification to every connection of `user_id`.
    pub fn notify_user(&self, user_id: &str, fields: Map<String, Value>) -> bool {
        let message = ServerMessage::notification(fields, now_millis());
        self.registry.send_to_user(user_id, &message)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Publisher for mutations made outside the reconciliation endpoints.
    pub fn bus(&self) -> &Arc<EntityChangeBus> {
        &self.bus
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn reconciliation(&self) -> &Arc<ReconciliationService> {
        &self.reconcile
    }

    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            registry: self.registry.stats(),
            events_published: self.bus.published_count(),
            listener_failures: self.bus.listener_failures(),
        }
    }
}
