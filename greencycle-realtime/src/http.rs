//! HTTP surface: catch-up pull, batched push, status, and the two push
//! transport handshakes.
//!
//! | Method | Path                         | Handler                |
//! |--------|------------------------------|------------------------|
//! | GET    | `/api/sync/status`           | liveness + counts      |
//! | GET    | `/api/sync/{entity_type}`    | catch-up pull          |
//! | POST   | `/api/sync/{entity_type}`    | batched push           |
//! | GET    | `/ws`                        | socket transport       |
//! | GET    | `/events`                    | event-stream transport |
//!
//! Every error body is `{ "success": false, "message": ... }`.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use greencycle_core::{
    parse_updates, EntityType, ErrorResponse, ProtocolError, PullResponse, PushResponse,
    StatusResponse,
};

use crate::auth::{bearer_token, AuthError, Identity, IdentityVerifier};
use crate::config::ServerConfig;
use crate::reconcile::ReconciliationService;
use crate::registry::ConnectionRegistry;
use crate::store::StoreError;
use crate::transport::{socket, stream};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub verifier: Arc<dyn IdentityVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub reconcile: Arc<ReconciliationService>,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Unauthenticated: {0}")]
    Auth(#[from] AuthError),
    #[error("Storage failure: {0}")]
    Store(#[from] StoreError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Protocol(_) => StatusCode::BAD_REQUEST,
            ApiError::Auth(_) => StatusCode::UNAUTHORIZED,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("Request failed: {self}");
        }
        (status, Json(ErrorResponse::new(self.to_string()))).into_response()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullQuery {
    last_sync_timestamp: Option<String>,
}

impl PullQuery {
    /// Absent means "since epoch zero".
    fn cursor(&self) -> Result<i64, ProtocolError> {
        match self.last_sync_timestamp.as_deref().map(str::trim) {
            None | Some("") => Ok(0),
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                ProtocolError::MalformedMessage(format!("lastSyncTimestamp must be epoch millis, got '{raw}'"))
            }),
        }
    }
}

/// Build the router for all sync endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/sync/status", get(status))
        .route("/api/sync/{entity_type}", get(pull).post(push))
        .route("/ws", get(socket::socket_handler))
        .route("/events", get(stream::stream_handler))
        .with_state(state)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<Identity, ApiError> {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());
    let token = bearer_token(header)?;
    Ok(state.verifier.verify_access(token)?)
}

async fn pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_type): Path<String>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, ApiError> {
    authorize(&state, &headers)?;
    let entity_type: EntityType = entity_type.parse()?;
    let since = query.cursor()?;
    Ok(Json(state.reconcile.pull(entity_type, since)?))
}

async fn push(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(entity_type): Path<String>,
    body: Bytes,
) -> Result<Json<PushResponse>, ApiError> {
    let actor = authorize(&state, &headers)?;
    let entity_type: EntityType = entity_type.parse()?;
    let body: Value = serde_json::from_slice(&body)
        .map_err(|e| ProtocolError::MalformedMessage(e.to_string()))?;
    let updates = parse_updates(&body)?;
    Ok(Json(state.reconcile.push(entity_type, &updates, &actor)))
}

async fn status(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<StatusResponse>, ApiError> {
    authorize(&state, &headers)?;
    Ok(Json(state.reconcile.status()))
}
