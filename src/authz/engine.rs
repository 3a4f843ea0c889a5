//! Decision core. Orchestrates cache → role resolution → policy
//! evaluation → response assembly, fingerprints requests for caching, and
//! emits one audit event per decision.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::audit::AuditPipeline;
use crate::auth::Principal;
use crate::cache::DecisionCache;
use crate::errors::AppError;
use crate::metrics;
use crate::models::audit::AuditRecord;
use crate::models::decision::{AuthorizationResponse, Decision, DecisionRequest};
use crate::models::permission::PermissionEffect;
use crate::models::role::ResourceScope;
use crate::store::AuthzStore;
use crate::tenancy::RequestContext;

use super::gateway::PolicyEngineClient;
use super::resolver::effective_permissions;

pub const REASON_DENY_PERMISSION: &str = "permission:deny matched";
pub const REASON_ALLOW_PERMISSION: &str = "permission:allow matched";
pub const REASON_ENGINE_UNAVAILABLE: &str = "policy_engine_unavailable";
pub const REASON_TIMEOUT: &str = "timeout";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fold context attributes into the fingerprint. Off by default; turn
    /// on when policies evaluate context, or cached decisions can go stale.
    pub fingerprint_context: bool,
    /// ALLOW instead of DENY when the policy engine is unreachable.
    pub policy_fail_open: bool,
    /// Hard ceiling for one decision.
    pub request_deadline: Duration,
    /// Per-hop budget for role resolution.
    pub storage_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            fingerprint_context: false,
            policy_fail_open: false,
            request_deadline: Duration::from_millis(200),
            storage_timeout: Duration::from_millis(50),
        }
    }
}

/// What the cache stores per fingerprint. Latency and the cached flag are
/// per-response, so they stay out of the cached value.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedDecision {
    decision: Decision,
    reason: String,
    evaluated_policies: Vec<String>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

struct Evaluated {
    decision: Decision,
    reason: String,
    evaluated_policies: Vec<String>,
    metadata: Option<serde_json::Map<String, serde_json::Value>>,
    cached: bool,
    /// Unavailability and timeout outcomes are never written back.
    cacheable: bool,
}

pub struct DecisionEngine {
    store: Arc<dyn AuthzStore>,
    cache: Arc<DecisionCache>,
    policy: Arc<PolicyEngineClient>,
    audit: AuditPipeline,
    config: EngineConfig,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn AuthzStore>,
        cache: Arc<DecisionCache>,
        policy: Arc<PolicyEngineClient>,
        audit: AuditPipeline,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            cache,
            policy,
            audit,
            config,
        }
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    /// One decision, start to finish. Validation and the tenant gate run
    /// before any state is consulted; everything after runs under the
    /// request deadline and fails closed on expiry.
    pub async fn authorize(
        &self,
        principal: &Principal,
        request: &DecisionRequest,
    ) -> Result<AuthorizationResponse, AppError> {
        let started = Instant::now();

        request
            .validate()
            .map_err(AppError::InvalidRequest)?;

        let ctx = RequestContext::for_principal(principal);
        if let Err(err) = ctx.require_tenant(request.organization_id) {
            self.audit
                .enqueue(AuditRecord::auth_failure(Some(principal.organization_id), err.kind()));
            return Err(err);
        }

        let fingerprint = request.fingerprint(self.config.fingerprint_context);

        let evaluated = match tokio::time::timeout(
            self.config.request_deadline,
            self.evaluate(principal, request, &fingerprint),
        )
        .await
        {
            Ok(Ok(evaluated)) => evaluated,
            Ok(Err(err)) => return Err(err),
            Err(_) => Evaluated {
                decision: Decision::Deny,
                reason: REASON_TIMEOUT.to_string(),
                evaluated_policies: vec![],
                metadata: None,
                cached: false,
                cacheable: false,
            },
        };

        if evaluated.cacheable && !evaluated.cached {
            self.cache
                .put(
                    &fingerprint,
                    &CachedDecision {
                        decision: evaluated.decision,
                        reason: evaluated.reason.clone(),
                        evaluated_policies: evaluated.evaluated_policies.clone(),
                        metadata: evaluated.metadata.clone(),
                    },
                )
                .await;
        }

        let latency = started.elapsed();
        let response = AuthorizationResponse {
            decision: evaluated.decision,
            reason: evaluated.reason,
            evaluated_policies: evaluated.evaluated_policies,
            metadata: evaluated.metadata,
            latency_ms: latency.as_secs_f64() * 1e3,
            cached: evaluated.cached,
        };

        self.audit.enqueue(AuditRecord::decision(
            request.organization_id,
            principal.id.clone(),
            request.resource.resource_type.clone(),
            request.resource.id.clone(),
            request.action.clone(),
            response.decision.is_allow(),
            response.reason.clone(),
            request.digest(),
        ));
        metrics::record_decision(
            if response.decision.is_allow() { "ALLOW" } else { "DENY" },
            response.cached,
            latency.as_secs_f64(),
        );

        Ok(response)
    }

    /// Order-preserving; a validation failure in one element never fails
    /// its neighbors.
    pub async fn authorize_batch(
        &self,
        principal: &Principal,
        requests: &[DecisionRequest],
    ) -> Vec<Result<AuthorizationResponse, AppError>> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.authorize(principal, request).await);
        }
        results
    }

    async fn evaluate(
        &self,
        principal: &Principal,
        request: &DecisionRequest,
        fingerprint: &str,
    ) -> Result<Evaluated, AppError> {
        if let Some(hit) = self.cache.get::<CachedDecision>(fingerprint).await {
            return Ok(Evaluated {
                decision: hit.decision,
                reason: hit.reason,
                evaluated_policies: hit.evaluated_policies,
                metadata: hit.metadata,
                cached: true,
                cacheable: false,
            });
        }

        let scope = ResourceScope {
            resource_type: request.resource.resource_type.clone(),
            resource_id: request.resource.id.clone(),
        };
        let permissions = self.resolve_with_budget(request, &scope).await?;

        let matching: Vec<_> = permissions
            .iter()
            .filter(|p| p.matches(&request.resource.resource_type, &request.action))
            .collect();

        // Explicit deny is terminal; an allow with no deny is terminal;
        // otherwise the policy engine decides.
        if matching.iter().any(|p| p.effect == PermissionEffect::Deny) {
            return Ok(Evaluated {
                decision: Decision::Deny,
                reason: REASON_DENY_PERMISSION.to_string(),
                evaluated_policies: vec![],
                metadata: None,
                cached: false,
                cacheable: true,
            });
        }
        if !matching.is_empty() {
            return Ok(Evaluated {
                decision: Decision::Allow,
                reason: REASON_ALLOW_PERMISSION.to_string(),
                evaluated_policies: vec![],
                metadata: None,
                cached: false,
                cacheable: true,
            });
        }

        match self.policy.evaluate(principal, request).await {
            Ok(verdict) => {
                let decision = if verdict.allow {
                    Decision::Allow
                } else {
                    Decision::Deny
                };
                let reason = if verdict.reasons.is_empty() {
                    if verdict.allow { "policy:allow" } else { "policy:deny" }.to_string()
                } else {
                    verdict.reasons.join("; ")
                };
                Ok(Evaluated {
                    decision,
                    reason,
                    evaluated_policies: verdict.matched_policies,
                    metadata: verdict.metadata,
                    cached: false,
                    cacheable: true,
                })
            }
            Err(_) => {
                let decision = if self.config.policy_fail_open {
                    Decision::Allow
                } else {
                    Decision::Deny
                };
                Ok(Evaluated {
                    decision,
                    reason: REASON_ENGINE_UNAVAILABLE.to_string(),
                    evaluated_policies: vec![],
                    metadata: None,
                    cached: false,
                    cacheable: false,
                })
            }
        }
    }

    /// Role resolution under the storage budget, retried once before
    /// surfacing 503. Resolution is for the principal named in the
    /// request: the authenticated caller may be a service asking about
    /// one of its organization's users.
    async fn resolve_with_budget(
        &self,
        request: &DecisionRequest,
        scope: &ResourceScope,
    ) -> Result<Vec<crate::models::permission::Permission>, AppError> {
        for attempt in 0..2 {
            let resolved = tokio::time::timeout(
                self.config.storage_timeout,
                effective_permissions(
                    self.store.as_ref(),
                    request.organization_id,
                    &request.principal.id,
                    Some(scope),
                ),
            )
            .await;
            match resolved {
                Ok(Ok(permissions)) => return Ok(permissions),
                Ok(Err(AppError::StorageUnavailable)) | Err(_) if attempt == 0 => {
                    tracing::warn!("role resolution exceeded its budget, retrying once");
                }
                Ok(Err(err)) => return Err(err),
                Err(_) => return Err(AppError::StorageUnavailable),
            }
        }
        Err(AppError::StorageUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::authz::breaker::{BreakerState, CircuitBreakerConfig};
    use crate::models::decision::{PrincipalRef, PrincipalType, ResourceRef};
    use crate::store::memory::MemoryStore;
    use crate::store::{AuthzStore, NewRoleAssignment};
    use crate::models::user::NewUser;
    use uuid::Uuid;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Fixture {
        store: Arc<MemoryStore>,
        engine: DecisionEngine,
        org: Uuid,
        user: Uuid,
    }

    async fn fixture_with(policy_url: String, config: EngineConfig) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let org = store.create_organization("acme").await.unwrap().id;
        let user = store
            .create_user(NewUser {
                organization_id: org,
                email: Some("u@acme.test".to_string()),
                external_subject_id: None,
                attributes: serde_json::json!({}),
            })
            .await
            .unwrap()
            .id;

        let cache = Arc::new(DecisionCache::local_only(1024, Duration::from_secs(10)));
        let policy = Arc::new(PolicyEngineClient::new(
            policy_url,
            Duration::from_millis(200),
            CircuitBreakerConfig {
                failure_threshold: 3,
                recovery_cooldown: Duration::from_secs(30),
                half_open_max_requests: 1,
            },
        ));
        let audit = AuditPipeline::spawn(
            store.clone(),
            1024,
            1,
            8,
            Duration::from_millis(5),
        );
        let engine = DecisionEngine::new(store.clone(), cache, policy, audit, config);
        Fixture {
            store,
            engine,
            org,
            user,
        }
    }

    fn principal(fixture: &Fixture) -> Principal {
        Principal {
            id: fixture.user.to_string(),
            principal_type: PrincipalType::User,
            organization_id: fixture.org,
            roles: vec![],
            rate_key: fixture.user.to_string(),
        }
    }

    fn request(org: Uuid, user: Uuid, action: &str) -> DecisionRequest {
        DecisionRequest {
            organization_id: org,
            principal: PrincipalRef {
                id: user.to_string(),
                principal_type: PrincipalType::User,
            },
            action: action.to_string(),
            resource: ResourceRef {
                resource_type: "document".to_string(),
                id: "d1".to_string(),
                attributes: None,
            },
            context: None,
        }
    }

    async fn grant(fixture: &Fixture, action: &str, effect: PermissionEffect) -> Uuid {
        let role = fixture
            .store
            .create_role(fixture.org, &format!("granting-{action}-{effect:?}"), None, false)
            .await
            .unwrap();
        let perm = fixture
            .store
            .create_permission(
                fixture.org,
                &format!("document-{action}-{effect:?}"),
                "document",
                action,
                effect,
            )
            .await
            .unwrap();
        fixture
            .store
            .bind_permission(fixture.org, role.id, perm.id)
            .await
            .unwrap();
        fixture
            .store
            .assign_role(
                fixture.org,
                NewRoleAssignment {
                    user_id: fixture.user,
                    role_id: role.id,
                    scope: None,
                    expires_at: None,
                    granted_by: fixture.user,
                },
            )
            .await
            .unwrap();
        role.id
    }

    #[tokio::test]
    async fn role_allow_then_cache_hit() {
        let fixture = fixture_with("http://127.0.0.1:1/".to_string(), EngineConfig::default()).await;
        grant(&fixture, "read", PermissionEffect::Allow).await;

        let p = principal(&fixture);
        let req = request(fixture.org, fixture.user, "read");

        let first = fixture.engine.authorize(&p, &req).await.unwrap();
        assert_eq!(first.decision, Decision::Allow);
        assert!(!first.cached);
        assert_eq!(first.reason, REASON_ALLOW_PERMISSION);

        let second = fixture.engine.authorize(&p, &req).await.unwrap();
        assert_eq!(second.decision, Decision::Allow);
        assert!(second.cached);
    }

    #[tokio::test]
    async fn explicit_deny_beats_allow_and_skips_the_policy_engine() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {"allow": true, "reasons": [], "matched_policies": []}
            })))
            .expect(0)
            .mount(&server)
            .await;

        let fixture = fixture_with(server.uri(), EngineConfig::default()).await;
        grant(&fixture, "read", PermissionEffect::Allow).await;
        grant(&fixture, "read", PermissionEffect::Deny).await;

        let response = fixture
            .engine
            .authorize(&principal(&fixture), &request(fixture.org, fixture.user, "read"))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Deny);
        assert_eq!(response.reason, REASON_DENY_PERMISSION);
    }

    #[tokio::test]
    async fn unmatched_request_falls_through_to_policy_engine() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "result": {
                    "allow": true,
                    "reasons": ["allowed by data.documents.read"],
                    "matched_policies": ["documents-read"]
                }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let fixture = fixture_with(server.uri(), EngineConfig::default()).await;
        let response = fixture
            .engine
            .authorize(&principal(&fixture), &request(fixture.org, fixture.user, "read"))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Allow);
        assert_eq!(response.evaluated_policies, vec!["documents-read"]);
        assert_eq!(response.reason, "allowed by data.documents.read");
    }

    #[tokio::test]
    async fn cross_tenant_request_is_rejected_before_any_lookup() {
        let fixture = fixture_with("http://127.0.0.1:1/".to_string(), EngineConfig::default()).await;
        let p = principal(&fixture);
        let foreign = Uuid::new_v4();

        let err = fixture
            .engine
            .authorize(&p, &request(foreign, fixture.user, "read"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::CrossTenantRequest));
        // Neither tenant's cache was consulted.
        assert_eq!(fixture.engine.cache().stats().requests, 0);
    }

    #[tokio::test]
    async fn engine_outage_fails_closed_and_is_not_cached() {
        let fixture = fixture_with("http://127.0.0.1:1/".to_string(), EngineConfig::default()).await;
        let p = principal(&fixture);
        let req = request(fixture.org, fixture.user, "read");

        for _ in 0..4 {
            let response = fixture.engine.authorize(&p, &req).await.unwrap();
            assert_eq!(response.decision, Decision::Deny);
            assert_eq!(response.reason, REASON_ENGINE_UNAVAILABLE);
            assert!(!response.cached);
        }
        // Three failed calls tripped the breaker; later calls short-circuit.
        assert_eq!(
            fixture.engine.policy.breaker().state(),
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn fail_open_configuration_allows_on_outage() {
        let fixture = fixture_with(
            "http://127.0.0.1:1/".to_string(),
            EngineConfig {
                policy_fail_open: true,
                ..EngineConfig::default()
            },
        )
        .await;

        let response = fixture
            .engine
            .authorize(&principal(&fixture), &request(fixture.org, fixture.user, "read"))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Allow);
        assert_eq!(response.reason, REASON_ENGINE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn deadline_expiry_denies_with_timeout_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_delay(Duration::from_millis(200))
                    .set_body_json(serde_json::json!({
                        "result": {"allow": true, "reasons": [], "matched_policies": []}
                    })),
            )
            .mount(&server)
            .await;

        let fixture = fixture_with(
            server.uri(),
            EngineConfig {
                request_deadline: Duration::from_millis(30),
                ..EngineConfig::default()
            },
        )
        .await;

        let response = fixture
            .engine
            .authorize(&principal(&fixture), &request(fixture.org, fixture.user, "read"))
            .await
            .unwrap();
        assert_eq!(response.decision, Decision::Deny);
        assert_eq!(response.reason, REASON_TIMEOUT);
        assert!(!response.cached);
    }

    #[tokio::test]
    async fn invalid_request_is_rejected_per_element_in_batch() {
        let fixture = fixture_with("http://127.0.0.1:1/".to_string(), EngineConfig::default()).await;
        grant(&fixture, "read", PermissionEffect::Allow).await;

        let p = principal(&fixture);
        let good = request(fixture.org, fixture.user, "read");
        let mut bad = request(fixture.org, fixture.user, "read");
        bad.action = String::new();

        let results = fixture
            .engine
            .authorize_batch(&p, &[good.clone(), bad, good])
            .await;
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(AppError::InvalidRequest(_))));
        assert!(results[2].is_ok());
    }

    #[tokio::test]
    async fn every_decision_is_audited_with_the_request_digest() {
        let fixture = fixture_with("http://127.0.0.1:1/".to_string(), EngineConfig::default()).await;
        grant(&fixture, "read", PermissionEffect::Allow).await;

        let p = principal(&fixture);
        let req = request(fixture.org, fixture.user, "read");
        fixture.engine.authorize(&p, &req).await.unwrap();

        for _ in 0..50 {
            if !fixture.store.audit_records().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = fixture.store.audit_records();
        let decision_record = records
            .iter()
            .find(|r| r.event_type == "authz.decision")
            .expect("decision audit record");
        assert_eq!(decision_record.request_digest.as_deref(), Some(req.digest()).as_deref());
        assert_eq!(decision_record.organization_id, fixture.org);
    }
}
