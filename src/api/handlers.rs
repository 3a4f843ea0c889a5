use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};

use crate::auth::Principal;
use crate::cache::CacheStats;
use crate::errors::{AppError, ProblemDocument};
use crate::metrics;
use crate::models::decision::{AuthorizationResponse, DecisionRequest};
use crate::AppState;

// ── Request / Response DTOs ──────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub requests: Vec<DecisionRequest>,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub results: Vec<BatchEntry>,
}

/// One slot per input request, order preserved. A per-element failure is
/// reported in place as a problem document.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum BatchEntry {
    Decision(AuthorizationResponse),
    Problem(ProblemDocument),
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /v1/authorize: single decision.
pub async fn authorize(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(request): Json<DecisionRequest>,
) -> Result<Json<AuthorizationResponse>, AppError> {
    let response = state.engine.authorize(&principal, &request).await?;
    Ok(Json(response))
}

/// POST /v1/authorize/batch: order-preserving batch decision.
pub async fn authorize_batch(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(batch): Json<BatchRequest>,
) -> Json<BatchResponse> {
    let results = state
        .engine
        .authorize_batch(&principal, &batch.requests)
        .await
        .into_iter()
        .map(|result| match result {
            Ok(response) => BatchEntry::Decision(response),
            Err(err) => BatchEntry::Problem(ProblemDocument::from_error(&err)),
        })
        .collect();
    Json(BatchResponse { results })
}

/// GET /v1/cache/stats: decision cache statistics.
pub async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.engine.cache().stats())
}

/// GET /actuator/health: liveness.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "UP"}))
}

/// GET /metrics: Prometheus scrape endpoint.
pub async fn metrics_endpoint(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::set_audit_dropped(state.audit.dropped());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::encode_metrics(),
    )
}

/// GET /v3/api-docs: OpenAPI description of the decision surface.
pub async fn api_docs() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "openapi": "3.0.3",
        "info": {
            "title": "authzd",
            "description": "Multi-tenant authorization decision service",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": {
            "/v1/authorize": {
                "post": {
                    "summary": "Single authorization decision",
                    "responses": {"200": {"description": "Decision"}}
                }
            },
            "/v1/authorize/batch": {
                "post": {
                    "summary": "Batch authorization decisions, order preserving",
                    "responses": {"200": {"description": "Decisions"}}
                }
            },
            "/actuator/health": {
                "get": {"summary": "Liveness", "responses": {"200": {"description": "UP"}}}
            }
        }
    }))
}
