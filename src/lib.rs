//! authzd: multi-tenant authorization decision service.
//!
//! Library crate: everything the binary wires together, re-exported for
//! the integration tests in `tests/`.

pub mod admin;
pub mod api;
pub mod audit;
pub mod auth;
pub mod authz;
pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod store;
pub mod tenancy;

use audit::AuditPipeline;
use auth::CredentialResolver;
use authz::engine::DecisionEngine;
use rate_limit::RateLimiter;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub resolver: CredentialResolver,
    pub engine: DecisionEngine,
    pub rate_limiter: RateLimiter,
    pub audit: AuditPipeline,
}
