//! Bearer token holder shared by the API client, the push socket and the
//! agent's auth trigger.

use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone)]
pub struct Session {
    token: Arc<watch::Sender<Option<String>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { token: Arc::new(tx) }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        let session = Self::new();
        session.set_token(Some(token.into()));
        session
    }

    /// Replace the token. `None` signs out.
    pub fn set_token(&self, token: Option<String>) {
        self.token.send_replace(token);
    }

    pub fn token(&self) -> Option<String> {
        self.token.borrow().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.borrow().is_some()
    }

    /// Watch token changes.
    pub fn subscribe(&self) -> watch::Receiver<Option<String>> {
        self.token.subscribe()
    }
}
