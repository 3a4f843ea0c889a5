//! Shared test harness: a full AppState wired onto the in-memory store,
//! with the policy engine pointed wherever the test wants.

use std::sync::Arc;
use std::time::Duration;

use authzd::admin::AdminService;
use authzd::audit::AuditPipeline;
use authzd::auth::{jwks::JwkKeystore, ApiKeyAuthenticator, CredentialResolver, JwtAuthenticator};
use authzd::authz::breaker::CircuitBreakerConfig;
use authzd::authz::engine::{DecisionEngine, EngineConfig};
use authzd::authz::gateway::PolicyEngineClient;
use authzd::cache::DecisionCache;
use authzd::models::decision::{DecisionRequest, PrincipalRef, PrincipalType, ResourceRef};
use authzd::models::permission::PermissionEffect;
use authzd::models::user::NewUser;
use authzd::rate_limit::RateLimiter;
use authzd::store::memory::MemoryStore;
use authzd::store::{AuthzStore, NewRoleAssignment};
use authzd::AppState;
use uuid::Uuid;

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub state: Arc<AppState>,
    pub admin: AdminService,
    pub org: Uuid,
    pub user: Uuid,
}

pub struct HarnessOptions {
    pub policy_url: String,
    pub rate_limit_capacity: u64,
    pub rate_limit_refill: u64,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            // Nothing listens here: the policy engine is "down" unless a
            // test points at a mock server.
            policy_url: "http://127.0.0.1:1/".to_string(),
            rate_limit_capacity: 1_000,
            rate_limit_refill: 1_000,
        }
    }
}

pub async fn harness(options: HarnessOptions) -> Harness {
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

    let cache = Arc::new(DecisionCache::local_only(4096, Duration::from_secs(10)));
    let policy = Arc::new(PolicyEngineClient::new(
        options.policy_url,
        Duration::from_millis(200),
        CircuitBreakerConfig {
            failure_threshold: 3,
            recovery_cooldown: Duration::from_millis(100),
            half_open_max_requests: 1,
        },
    ));
    let audit = AuditPipeline::spawn(store.clone(), 4096, 1, 16, Duration::from_millis(5));

    let engine = DecisionEngine::new(
        store.clone(),
        cache.clone(),
        policy,
        audit.clone(),
        EngineConfig::default(),
    );
    let admin = AdminService::new(store.clone(), cache, audit.clone());

    let keystore = Arc::new(JwkKeystore::new(
        "http://127.0.0.1:1/jwks".to_string(),
        Duration::from_secs(3600),
        Duration::from_millis(50),
    ));
    let resolver = CredentialResolver::new(
        JwtAuthenticator::new(
            keystore,
            "https://idp.example.com".to_string(),
            "authzd".to_string(),
            store.clone(),
        ),
        ApiKeyAuthenticator::new(store.clone()),
    );

    let state = Arc::new(AppState {
        resolver,
        engine,
        rate_limiter: RateLimiter::new(
            options.rate_limit_capacity,
            options.rate_limit_refill,
            Duration::from_secs(1),
        ),
        audit,
    });

    Harness {
        store,
        state,
        admin,
        org,
        user,
    }
}

pub fn decision_request(org: Uuid, principal: &str, action: &str, resource_id: &str) -> DecisionRequest {
    DecisionRequest {
        organization_id: org,
        principal: PrincipalRef {
            id: principal.to_string(),
            principal_type: PrincipalType::User,
        },
        action: action.to_string(),
        resource: ResourceRef {
            resource_type: "document".to_string(),
            id: resource_id.to_string(),
            attributes: None,
        },
        context: None,
    }
}

/// Role R granting (action, effect) on `document`, assigned to `user`.
pub async fn grant_role(
    harness: &Harness,
    action: &str,
    effect: PermissionEffect,
) -> Uuid {
    let role = harness
        .admin
        .create_role("test-admin", harness.org, &format!("{action}-{effect:?}"), None)
        .await
        .unwrap();
    let permission = harness
        .admin
        .create_permission(
            "test-admin",
            harness.org,
            &format!("document-{action}-{effect:?}"),
            "document",
            action,
            effect,
        )
        .await
        .unwrap();
    harness
        .admin
        .bind_permission("test-admin", harness.org, role.id, permission.id)
        .await
        .unwrap();
    harness
        .admin
        .assign_role(
            "test-admin",
            harness.org,
            NewRoleAssignment {
                user_id: harness.user,
                role_id: role.id,
                scope: None,
                expires_at: None,
                granted_by: harness.user,
            },
        )
        .await
        .unwrap();
    role.id
}
