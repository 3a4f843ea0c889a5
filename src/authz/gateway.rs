//! Policy engine gateway. Translates a decision request into the external
//! evaluator's `{input: {...}}` shape, retries transient transport errors
//! with jittered backoff (≤2 retries), and maps everything that still
//! fails to an unavailability signal. Caching happens a layer above.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::Principal;
use crate::models::decision::DecisionRequest;

use super::breaker::{CircuitBreaker, CircuitBreakerConfig};

const MAX_RETRIES: u32 = 2;
const BASE_BACKOFF_MS: u64 = 5;
const JITTER_MS: u64 = 5;

/// The gateway's only failure mode visible to callers. The decision core
/// turns this into a fail-closed DENY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PolicyEngineUnavailable;

/// What the evaluator said.
#[derive(Debug, Clone)]
pub struct PolicyVerdict {
    pub allow: bool,
    pub reasons: Vec<String>,
    pub matched_policies: Vec<String>,
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Serialize)]
struct EvalRequest<'a> {
    input: EvalInput<'a>,
}

#[derive(Serialize)]
struct EvalInput<'a> {
    principal: EvalPrincipal<'a>,
    action: &'a str,
    resource: &'a crate::models::decision::ResourceRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    context: Option<&'a serde_json::Map<String, serde_json::Value>>,
}

#[derive(Serialize)]
struct EvalPrincipal<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    principal_type: &'a crate::models::decision::PrincipalType,
    #[serde(rename = "organizationId")]
    organization_id: Uuid,
    roles: &'a [String],
}

#[derive(Deserialize)]
struct EvalResponse {
    result: EvalResult,
}

#[derive(Deserialize)]
struct EvalResult {
    allow: bool,
    #[serde(default)]
    reasons: Vec<String>,
    #[serde(default)]
    matched_policies: Vec<String>,
    #[serde(default)]
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

pub struct PolicyEngineClient {
    http: reqwest::Client,
    url: String,
    breaker: CircuitBreaker,
}

impl PolicyEngineClient {
    pub fn new(url: String, timeout: Duration, breaker_config: CircuitBreakerConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            url,
            breaker: CircuitBreaker::new(breaker_config),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub async fn evaluate(
        &self,
        principal: &Principal,
        request: &DecisionRequest,
    ) -> Result<PolicyVerdict, PolicyEngineUnavailable> {
        if !self.breaker.try_acquire() {
            tracing::debug!("policy engine circuit open, short-circuiting");
            return Err(PolicyEngineUnavailable);
        }

        let body = EvalRequest {
            input: EvalInput {
                principal: EvalPrincipal {
                    id: &request.principal.id,
                    principal_type: &request.principal.principal_type,
                    organization_id: principal.organization_id,
                    roles: &principal.roles,
                },
                action: &request.action,
                resource: &request.resource,
                context: request.context.as_ref(),
            },
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_once(&body).await {
                Ok(verdict) => {
                    self.breaker.on_success();
                    return Ok(verdict);
                }
                Err(retryable) => {
                    if !retryable || attempt > MAX_RETRIES {
                        self.breaker.on_failure();
                        return Err(PolicyEngineUnavailable);
                    }
                    tokio::time::sleep(backoff(attempt)).await;
                }
            }
        }
    }

    /// One attempt. `Err(true)` is retryable (transport, 5xx), `Err(false)`
    /// is not (a 4xx means the contract is broken, retrying won't help).
    async fn try_once(&self, body: &EvalRequest<'_>) -> Result<PolicyVerdict, bool> {
        let response = match self.http.post(&self.url).json(body).send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!("policy engine transport error: {}", e);
                return Err(true);
            }
        };
        let status = response.status();
        if status.is_server_error() {
            tracing::debug!(status = %status, "policy engine server error");
            return Err(true);
        }
        if !status.is_success() {
            tracing::warn!(status = %status, "policy engine rejected evaluation request");
            return Err(false);
        }
        let parsed: EvalResponse = response.json().await.map_err(|e| {
            tracing::warn!("policy engine response malformed: {}", e);
            false
        })?;
        Ok(PolicyVerdict {
            allow: parsed.result.allow,
            reasons: parsed.result.reasons,
            matched_policies: parsed.result.matched_policies,
            metadata: parsed.result.metadata,
        })
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = BASE_BACKOFF_MS.saturating_mul(1 << (attempt - 1).min(8));
    let jitter = rand::thread_rng().gen_range(0..=JITTER_MS);
    Duration::from_millis(exp + jitter)
}
