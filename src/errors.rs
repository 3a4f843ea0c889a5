use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("no credentials presented")]
    CredentialAbsent,

    #[error("jwt signature invalid")]
    JwtSignatureInvalid,

    #[error("jwt expired")]
    JwtExpired,

    #[error("jwt audience mismatch")]
    JwtAudienceMismatch,

    #[error("jwt issuer mismatch")]
    JwtIssuerMismatch,

    #[error("jwt missing claim: {0}")]
    JwtMissingClaim(&'static str),

    #[error("api key unknown")]
    ApiKeyUnknown,

    #[error("cross-tenant request")]
    CrossTenantRequest,

    #[error("rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("storage unavailable")]
    StorageUnavailable,

    #[error("tenancy violation")]
    TenancyViolation,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Stable machine-readable kind, used as the problem `type` suffix
    /// and in logs. Never carries credential material.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::InvalidRequest(_) => "invalid_request",
            AppError::CredentialAbsent => "credential_absent",
            AppError::JwtSignatureInvalid => "jwt_signature_invalid",
            AppError::JwtExpired => "jwt_expired",
            AppError::JwtAudienceMismatch => "jwt_audience_mismatch",
            AppError::JwtIssuerMismatch => "jwt_issuer_mismatch",
            AppError::JwtMissingClaim(_) => "jwt_missing_claim",
            AppError::ApiKeyUnknown => "api_key_unknown",
            AppError::CrossTenantRequest => "cross_tenant_request",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::StorageUnavailable => "storage_unavailable",
            AppError::TenancyViolation => "tenancy_violation",
            AppError::Database(_) => "internal_error",
            AppError::Redis(_) => "internal_error",
            AppError::Internal(_) => "internal_error",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            AppError::CredentialAbsent
            | AppError::JwtSignatureInvalid
            | AppError::JwtExpired
            | AppError::JwtAudienceMismatch
            | AppError::JwtIssuerMismatch
            | AppError::JwtMissingClaim(_)
            | AppError::ApiKeyUnknown => StatusCode::UNAUTHORIZED,
            AppError::CrossTenantRequest => StatusCode::FORBIDDEN,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::StorageUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            AppError::TenancyViolation
            | AppError::Database(_)
            | AppError::Redis(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// RFC-7807 problem document. `retry_after_seconds` only appears on 429s.
#[derive(Debug, Serialize)]
pub struct ProblemDocument {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    #[serde(rename = "retryAfterSeconds", skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl ProblemDocument {
    pub fn from_error(err: &AppError) -> Self {
        let status = err.status();
        let detail = match err {
            // Invariant breach: no detail crosses the boundary.
            AppError::TenancyViolation => "internal error".to_string(),
            AppError::Database(_) | AppError::Redis(_) | AppError::Internal(_) => {
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        Self {
            problem_type: format!("urn:authzd:error:{}", err.kind()),
            title: err.kind().replace('_', " "),
            status: status.as_u16(),
            detail,
            retry_after_seconds: match err {
                AppError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
                _ => None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::TenancyViolation => {
                tracing::error!("tenancy violation on the hot path, alerting");
            }
            AppError::Database(e) => {
                tracing::error!("database error: {}", e);
            }
            AppError::Redis(e) => {
                tracing::error!("redis error: {}", e);
            }
            AppError::Internal(e) => {
                tracing::error!("internal error: {}", e);
            }
            other => {
                tracing::debug!(kind = other.kind(), "request rejected");
            }
        }

        let status = self.status();
        let body = Json(ProblemDocument::from_error(&self));
        let mut response = (status, body).into_response();

        if let AppError::RateLimited { retry_after_secs } = self {
            let value = retry_after_secs.to_string();
            if let Ok(val) = axum::http::HeaderValue::from_str(&value) {
                response.headers_mut().insert("retry-after", val.clone());
                response
                    .headers_mut()
                    .insert("x-rate-limit-retry-after-seconds", val);
            }
        }

        response
    }
}
