//! Client configuration.

use std::path::PathBuf;
use std::time::Duration;

use greencycle_core::{EntityType, RetryPolicy};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP base URL of the sync server, e.g. `http://127.0.0.1:9090`
    pub server_url: String,
    /// Entity types pulled on every sync cycle and subscribed on the socket
    pub entity_types: Vec<EntityType>,
    /// How often the pending queue is checked for work
    pub poll_interval: Duration,
    /// Client-driven keepalive on the push socket
    pub ping_interval: Duration,
    /// Backoff for push socket connection attempts
    pub reconnect: RetryPolicy,
    /// Backoff for status fetches
    pub status_retry: RetryPolicy,
    /// How long a fetched status response is reused
    pub status_cache_ttl: Duration,
    /// How often the connection monitor samples the socket state
    pub monitor_interval: Duration,
    /// Durable queue directory (default: `greencycle_client`)
    pub data_dir: PathBuf,
    /// HTTP request timeout
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9090".to_string(),
            entity_types: EntityType::ALL.to_vec(),
            poll_interval: Duration::from_secs(30),
            ping_interval: Duration::from_secs(25),
            reconnect: RetryPolicy::default(),
            status_retry: RetryPolicy::new(3, Duration::from_millis(500)),
            status_cache_ttl: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(5),
            data_dir: PathBuf::from("greencycle_client"),
            request_timeout: Duration::from_secs(15),
        }
    }
}

impl ClientConfig {
    /// Config for testing (short intervals, fast retries).
    pub fn for_testing(server_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            server_url: server_url.into(),
            poll_interval: Duration::from_millis(100),
            ping_interval: Duration::from_millis(200),
            reconnect: RetryPolicy::new(3, Duration::from_millis(10)).with_max_delay(Duration::from_millis(50)),
            status_retry: RetryPolicy::new(2, Duration::from_millis(10)),
            status_cache_ttl: Duration::from_secs(5),
            monitor_interval: Duration::from_millis(50),
            data_dir: data_dir.into(),
            request_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }

    /// HTTP base without a trailing slash.
    pub fn http_base(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }

    /// Socket transport URL for `token`.
    pub fn socket_url(&self, token: &str) -> String {
        let base = self.http_base();
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        };
        format!("{ws_base}/ws?token={token}")
    }
}
