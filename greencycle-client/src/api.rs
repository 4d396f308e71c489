//! HTTP side of the protocol: catch-up pull, batched push and status.

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;

use greencycle_core::{
    retry_with_backoff_if, EntityType, ErrorResponse, PullResponse, PushRequest, PushResponse,
    RetryPolicy, StatusResponse, TtlCache, UpdateRequest,
};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::session::Session;

const STATUS_KEY: &str = "status";

/// Server endpoints used by the sync agent.
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Records of `entity_type` changed strictly after `since`.
    async fn pull(&self, entity_type: EntityType, since: i64) -> Result<PullResponse, ClientError>;

    /// Submit a batch. Per-item outcomes are in the response.
    async fn push(
        &self,
        entity_type: EntityType,
        updates: Vec<UpdateRequest>,
    ) -> Result<PushResponse, ClientError>;

    async fn status(&self) -> Result<StatusResponse, ClientError>;
}

/// [`SyncApi`] over reqwest.
///
/// Pull and push are not retried here; a failed cycle leaves the queue
/// intact and the next cycle tries again. Status fetches go through the
/// configured backoff and are cached for `status_cache_ttl`.
pub struct HttpSyncApi {
    http: Client,
    base_url: String,
    session: Session,
    status_cache: TtlCache<&'static str, StatusResponse>,
    status_retry: RetryPolicy,
}

impl HttpSyncApi {
    pub fn new(config: &ClientConfig, session: Session) -> Result<Self, ClientError> {
        let http = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            http,
            base_url: config.http_base().to_string(),
            session,
            status_cache: TtlCache::new(config.status_cache_ttl),
            status_retry: config.status_retry.clone(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Drop the cached status so the next call hits the server.
    pub fn invalidate_status(&self) {
        self.status_cache.invalidate(&STATUS_KEY);
    }

    fn token(&self) -> Result<String, ClientError> {
        self.session.token().ok_or(ClientError::Unauthenticated)
    }

    fn entity_url(&self, entity_type: EntityType) -> String {
        format!("{}/api/sync/{}", self.base_url, entity_type)
    }

    async fn fetch_status(&self) -> Result<StatusResponse, ClientError> {
        let response = self
            .http
            .get(format!("{}/api/sync/status", self.base_url))
            .bearer_auth(self.token()?)
            .send()
            .await?;
        read_json(response).await
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn pull(&self, entity_type: EntityType, since: i64) -> Result<PullResponse, ClientError> {
        let response = self
            .http
            .get(self.entity_url(entity_type))
            .query(&[("lastSyncTimestamp", since.to_string())])
            .bearer_auth(self.token()?)
            .send()
            .await?;
        let pulled: PullResponse = read_json(response).await?;
        log::debug!(
            "Pulled {} {} record(s) since {since}",
            pulled.data.len(),
            entity_type
        );
        Ok(pulled)
    }

    async fn push(
        &self,
        entity_type: EntityType,
        updates: Vec<UpdateRequest>,
    ) -> Result<PushResponse, ClientError> {
        let count = updates.len();
        let response = self
            .http
            .post(self.entity_url(entity_type))
            .bearer_auth(self.token()?)
            .json(&PushRequest { updates })
            .send()
            .await?;
        let pushed: PushResponse = read_json(response).await?;
        log::debug!("Pushed {count} {entity_type} update(s)");
        Ok(pushed)
    }

    async fn status(&self) -> Result<StatusResponse, ClientError> {
        if let Some(cached) = self.status_cache.get(&STATUS_KEY) {
            return Ok(cached);
        }
        let status = retry_with_backoff_if(
            &self.status_retry,
            |_| self.fetch_status(),
            |e: &ClientError| !e.is_terminal(),
        )
        .await?;
        self.status_cache.insert(STATUS_KEY, status.clone());
        Ok(status)
    }
}

/// Map non-success statuses to [`ClientError`], then decode the body.
async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED {
        return Err(ClientError::Unauthenticated);
    }
    if !status.is_success() {
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.message,
            Err(_) => status.canonical_reason().unwrap_or("request failed").to_string(),
        };
        return Err(ClientError::Server {
            status: status.as_u16(),
            message,
        });
    }
    Ok(response.json::<T>().await?)
}
