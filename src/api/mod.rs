//! HTTP surface. Public paths (health, docs, metrics) bypass credential
//! resolution; everything else runs the strategy chain and the rate
//! limiter before reaching a handler.

pub mod handlers;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use crate::auth::is_public_path;
use crate::errors::AppError;
use crate::metrics;
use crate::models::audit::AuditRecord;
use crate::models::decision::PrincipalType;
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/authorize", post(handlers::authorize))
        .route("/v1/authorize/batch", post(handlers::authorize_batch))
        .route("/v1/cache/stats", get(handlers::cache_stats))
        .route("/actuator/health", get(handlers::health))
        .route("/v3/api-docs", get(handlers::api_docs))
        .route("/metrics", get(handlers::metrics_endpoint))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .with_state(state)
}

/// Credential resolution + rate limiting for protected paths.
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    if is_public_path(request.uri().path()) {
        return next.run(request).await;
    }

    let principal = match state.resolver.resolve(request.headers()).await {
        Ok(principal) => principal,
        Err(err) => {
            metrics::record_auth_failure(err.kind());
            state
                .audit
                .enqueue(AuditRecord::auth_failure(None, err.kind()));
            return err.into_response();
        }
    };

    if let Err(err) = state.rate_limiter.check(&principal.rate_key) {
        let principal_type = match principal.principal_type {
            PrincipalType::User => "user",
            PrincipalType::Service => "service",
        };
        metrics::record_rate_limited(principal_type);
        return err.into_response();
    }

    request.extensions_mut().insert(principal);
    next.run(request).await
}

/// Shared 404 shape for unmatched routes.
pub async fn not_found() -> Response {
    AppError::InvalidRequest("no such route".to_string()).into_response()
}
