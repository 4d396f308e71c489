//! Server configuration.

use std::time::Duration;

/// Bearer token settings.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    /// HMAC secret. `None` generates a random per-process key.
    pub secret: Option<String>,
    /// Access token lifetime in seconds
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds
    pub refresh_ttl_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            secret: None,
            access_ttl_secs: 15 * 60,
            refresh_ttl_secs: 7 * 24 * 60 * 60,
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound frames buffered per connection before it counts as failed
    pub connection_buffer: usize,
    /// Skip broadcasting a change to connections owned by its originator
    pub suppress_origin_echo: bool,
    /// Comment keep-alive interval on the event-stream transport
    pub sse_keep_alive: Duration,
    pub tokens: TokenConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            connection_buffer: 256,
            suppress_origin_echo: false,
            sse_keep_alive: Duration::from_secs(15),
            tokens: TokenConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Config for testing (ephemeral port, fixed secret).
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            connection_buffer: 64,
            sse_keep_alive: Duration::from_secs(1),
            tokens: TokenConfig {
                secret: Some("test-secret".to_string()),
                ..TokenConfig::default()
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.connection_buffer, 256);
        assert!(!config.suppress_origin_echo);
        assert!(config.tokens.secret.is_none());
        assert!(config.tokens.refresh_ttl_secs > config.tokens.access_ttl_secs);
    }

    #[test]
    fn test_server_config_for_testing() {
        let config = ServerConfig::for_testing();
        assert_eq!(config.bind_addr, "127.0.0.1:0");
        assert_eq!(config.tokens.secret.as_deref(), Some("test-secret"));
    }
}
