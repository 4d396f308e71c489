//! Connection status for the UI layer.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::error::ClientError;
use crate::transport::{ConnectionState, PushClient};

/// What the monitor needs from a push transport.
#[async_trait]
pub trait ConnectionTransport: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// One reconnection attempt, no backoff.
    async fn reconnect(&self) -> Result<(), ClientError>;
}

#[async_trait]
impl ConnectionTransport for PushClient {
    fn connection_state(&self) -> ConnectionState {
        self.state()
    }

    async fn reconnect(&self) -> Result<(), ClientError> {
        PushClient::reconnect(self).await
    }
}

/// Samples the transport at a fixed interval and publishes a four-state
/// status. Manual reconnects make exactly one attempt.
pub struct ConnectionMonitor {
    transport: Arc<dyn ConnectionTransport>,
    interval: Duration,
    status: watch::Sender<ConnectionState>,
}

impl ConnectionMonitor {
    pub fn new(transport: Arc<dyn ConnectionTransport>, interval: Duration) -> Self {
        let (status, _) = watch::channel(transport.connection_state());
        Self {
            transport,
            interval,
            status,
        }
    }

    pub fn status(&self) -> ConnectionState {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    /// Sample the transport once.
    pub fn poll_once(&self) -> ConnectionState {
        let state = self.transport.connection_state();
        self.status.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                log::debug!("Connection status {current} -> {state}");
                *current = state;
                true
            }
        });
        state
    }

    /// User-initiated reconnect.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        self.status.send_replace(ConnectionState::Connecting);
        match self.transport.reconnect().await {
            Ok(()) => {
                self.status.send_replace(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                log::warn!("Manual reconnect failed: {e}");
                self.status.send_replace(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Poll until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}
