//! Credential resolution: an ordered list of strategies tried until the
//! first conclusive outcome. A present-but-invalid bearer token fails the
//! request; only an absent one falls through to the API key strategy.

pub mod api_key;
pub mod jwks;
pub mod jwt;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::decision::PrincipalType;

pub use api_key::ApiKeyAuthenticator;
pub use jwt::JwtAuthenticator;

const API_KEY_HEADER: &str = "x-api-key";
const BEARER_PREFIX: &str = "Bearer ";

/// The authenticated actor attached to every protected request.
#[derive(Debug, Clone)]
pub struct Principal {
    /// User id or API key id.
    pub id: String,
    pub principal_type: PrincipalType,
    pub organization_id: Uuid,
    pub roles: Vec<String>,
    /// Rate limiter key: the JWT subject or the raw API key.
    pub rate_key: String,
}

pub struct CredentialResolver {
    jwt: JwtAuthenticator,
    api_key: ApiKeyAuthenticator,
}

impl CredentialResolver {
    pub fn new(jwt: JwtAuthenticator, api_key: ApiKeyAuthenticator) -> Self {
        Self { jwt, api_key }
    }

    pub async fn resolve(&self, headers: &HeaderMap) -> Result<Principal, AppError> {
        if let Some(token) = bearer_token(headers) {
            return self.jwt.authenticate(token).await;
        }
        if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
            return self.api_key.authenticate(key).await;
        }
        Err(AppError::CredentialAbsent)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix(BEARER_PREFIX))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Paths that bypass credential resolution entirely.
pub fn is_public_path(path: &str) -> bool {
    path == "/actuator/health"
        || path == "/metrics"
        || path.starts_with("/v3/api-docs")
        || path.starts_with("/swagger-ui")
}
