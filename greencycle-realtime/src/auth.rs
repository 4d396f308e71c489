//! Bearer token verification for the push transports and HTTP endpoints.
//!
//! Token format: `base64url(claims_json).base64url(hmac_sha256(payload))`.
//!
//! Access and refresh tokens are signed with the same key but carry a
//! `purpose` claim; only access tokens open a connection.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use ring::{hmac, rand as ring_rand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::config::TokenConfig;

/// Verified caller identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    Access,
    Refresh,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Authentication token missing")]
    MissingToken,
    #[error("Malformed token")]
    Malformed,
    #[error("Invalid token signature")]
    BadSignature,
    #[error("Token expired")]
    Expired,
    #[error("Token not valid for this purpose")]
    WrongPurpose,
    #[error("Failed to issue token: {0}")]
    Issue(String),
}

/// Claims carried inside a token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    role: String,
    purpose: TokenPurpose,
    iat: u64,
    exp: u64,
    jti: String,
}

/// The identity collaborator as seen by the sync subsystem.
pub trait IdentityVerifier: Send + Sync {
    /// Verify an access token. Must be synchronous and side-effect free.
    fn verify_access(&self, token: &str) -> Result<Identity, AuthError>;
}

/// HMAC-SHA256 token service.
#[derive(Clone)]
pub struct TokenService {
    signing_key: Arc<hmac::Key>,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService")
            .field("access_ttl_secs", &self.access_ttl_secs)
            .field("refresh_ttl_secs", &self.refresh_ttl_secs)
            .finish()
    }
}

impl TokenService {
    pub fn new(config: &TokenConfig) -> Result<Self, AuthError> {
        let signing_key = match &config.secret {
            Some(secret) => hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes()),
            None => {
                let rng = ring_rand::SystemRandom::new();
                hmac::Key::generate(hmac::HMAC_SHA256, &rng)
                    .map_err(|_| AuthError::Issue("failed to generate signing key".into()))?
            }
        };
        Ok(Self {
            signing_key: Arc::new(signing_key),
            access_ttl_secs: config.access_ttl_secs,
            refresh_ttl_secs: config.refresh_ttl_secs,
        })
    }

    /// Issue a signed token for `user_id`.
    pub fn issue(&self, user_id: &str, role: &str, purpose: TokenPurpose) -> Result<String, AuthError> {
        let ttl = match purpose {
            TokenPurpose::Access => self.access_ttl_secs,
            TokenPurpose::Refresh => self.refresh_ttl_secs,
        };
        let now = unix_seconds();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            purpose,
            iat: now,
            exp: now + ttl,
            jti: uuid::Uuid::new_v4().to_string(),
        };

        let payload_json =
            serde_json::to_vec(&claims).map_err(|e| AuthError::Issue(e.to_string()))?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload_json);
        let signature = hmac::sign(&self.signing_key, payload_b64.as_bytes());
        Ok(format!("{}.{}", payload_b64, URL_SAFE_NO_PAD.encode(signature.as_ref())))
    }

    fn verify(&self, token: &str, expected: TokenPurpose) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let (payload_b64, signature_b64) = token.split_once('.').ok_or(AuthError::Malformed)?;
        if signature_b64.contains('.') {
            return Err(AuthError::Malformed);
        }

        let signature = URL_SAFE_NO_PAD
            .decode(signature_b64)
            .map_err(|_| AuthError::Malformed)?;
        hmac::verify(&self.signing_key, payload_b64.as_bytes(), &signature)
            .map_err(|_| AuthError::BadSignature)?;

        let payload_json = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_json).map_err(|_| AuthError::Malformed)?;

        if unix_seconds() >= claims.exp {
            return Err(AuthError::Expired);
        }
        if claims.purpose != expected {
            return Err(AuthError::WrongPurpose);
        }

        Ok(Identity {
            user_id: claims.sub,
            role: claims.role,
        })
    }
}

impl IdentityVerifier for TokenService {
    fn verify_access(&self, token: &str) -> Result<Identity, AuthError> {
        self.verify(token, TokenPurpose::Access)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let value = header.ok_or(AuthError::MissingToken)?;
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .ok_or(AuthError::Malformed)?
        .trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
