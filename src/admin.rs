//! Administrative mutations. Every write follows the same sequence:
//! storage commit, then the cache invalidation the change requires, then
//! an audit event. Invalidation strictly after commit keeps visibility
//! monotonic; a change that affects one user invalidates that principal,
//! anything broader invalidates the organization.

use std::sync::Arc;

use uuid::Uuid;

use crate::audit::AuditPipeline;
use crate::cache::DecisionCache;
use crate::errors::AppError;
use crate::models::audit::AuditRecord;
use crate::models::permission::{Permission, PermissionEffect};
use crate::models::policy::{Policy, PolicyVersion};
use crate::models::role::{ResourceScope, Role, RoleAssignment};
use crate::models::tenant::Organization;
use crate::models::user::{NewUser, User};
use crate::store::{ApiKey, AuthzStore, NewRoleAssignment};

pub struct AdminService {
    store: Arc<dyn AuthzStore>,
    cache: Arc<DecisionCache>,
    audit: AuditPipeline,
}

impl AdminService {
    pub fn new(store: Arc<dyn AuthzStore>, cache: Arc<DecisionCache>, audit: AuditPipeline) -> Self {
        Self {
            store,
            cache,
            audit,
        }
    }

    fn record(&self, org: Uuid, actor: &str, event: &str, resource_type: &str, id: String, ok: bool) {
        self.audit.enqueue(AuditRecord::admin(
            org,
            actor.to_string(),
            event,
            resource_type,
            id,
            ok,
        ));
    }

    // ── Organizations / users / keys ─────────────────────────

    pub async fn create_organization(&self, actor: &str, name: &str) -> Result<Organization, AppError> {
        let result = self.store.create_organization(name).await;
        match &result {
            Ok(org) => self.record(org.id, actor, "organization.create", "organization", org.id.to_string(), true),
            Err(_) => tracing::warn!(name, "organization create failed"),
        }
        Ok(result?)
    }

    pub async fn create_user(&self, actor: &str, new: NewUser) -> Result<User, AppError> {
        let org = new.organization_id;
        let result = self.store.create_user(new).await;
        let ok = result.is_ok();
        let id = result
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "user.create", "user", id, ok);
        Ok(result?)
    }

    pub async fn issue_api_key(
        &self,
        actor: &str,
        org: Uuid,
        name: &str,
        key_hash: &str,
    ) -> Result<ApiKey, AppError> {
        let result = self.store.insert_api_key(org, name, key_hash).await;
        let ok = result.is_ok();
        let id = result
            .as_ref()
            .map(|k| k.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "api_key.issue", "api_key", id, ok);
        Ok(result?)
    }

    // ── Roles ────────────────────────────────────────────────

    pub async fn create_role(
        &self,
        actor: &str,
        org: Uuid,
        name: &str,
        parent_role_id: Option<Uuid>,
    ) -> Result<Role, AppError> {
        let result = self.store.create_role(org, name, parent_role_id, false).await;
        let ok = result.is_ok();
        let id = result
            .as_ref()
            .map(|r| r.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "role.create", "role", id, ok);
        Ok(result?)
    }

    pub async fn set_role_parent(
        &self,
        actor: &str,
        org: Uuid,
        role: Uuid,
        new_parent: Option<Uuid>,
    ) -> Result<Role, AppError> {
        let result = self.store.update_role_parent(org, role, new_parent).await;
        let ok = result.is_ok();
        if ok {
            // Inheritance changed under every user holding this role.
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "role.reparent", "role", role.to_string(), ok);
        Ok(result?)
    }

    pub async fn delete_role(&self, actor: &str, org: Uuid, role: Uuid) -> Result<(), AppError> {
        let result = self.store.delete_role(org, role).await;
        let ok = result.is_ok();
        if ok {
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "role.delete", "role", role.to_string(), ok);
        Ok(result?)
    }

    // ── Permissions ──────────────────────────────────────────

    pub async fn create_permission(
        &self,
        actor: &str,
        org: Uuid,
        name: &str,
        resource_type: &str,
        action: &str,
        effect: PermissionEffect,
    ) -> Result<Permission, AppError> {
        let result = self
            .store
            .create_permission(org, name, resource_type, action, effect)
            .await;
        let ok = result.is_ok();
        if ok {
            self.cache.invalidate_organization(org).await;
        }
        let id = result
            .as_ref()
            .map(|p| p.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "permission.create", "permission", id, ok);
        Ok(result?)
    }

    pub async fn delete_permission(&self, actor: &str, org: Uuid, id: Uuid) -> Result<(), AppError> {
        let result = self.store.delete_permission(org, id).await;
        let ok = result.is_ok();
        if ok {
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "permission.delete", "permission", id.to_string(), ok);
        Ok(result?)
    }

    pub async fn bind_permission(
        &self,
        actor: &str,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<(), AppError> {
        let result = self.store.bind_permission(org, role, permission).await;
        let ok = result.is_ok();
        if ok {
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "role_permission.bind", "role", role.to_string(), ok);
        Ok(result?)
    }

    pub async fn unbind_permission(
        &self,
        actor: &str,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<bool, AppError> {
        let result = self.store.unbind_permission(org, role, permission).await;
        let ok = result.is_ok();
        if ok {
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "role_permission.unbind", "role", role.to_string(), ok);
        Ok(result?)
    }

    // ── Role assignments ─────────────────────────────────────

    pub async fn assign_role(
        &self,
        actor: &str,
        org: Uuid,
        assignment: NewRoleAssignment,
    ) -> Result<RoleAssignment, AppError> {
        let user = assignment.user_id;
        let result = self.store.assign_role(org, assignment).await;
        let ok = result.is_ok();
        if ok {
            // Only this user's decisions can change.
            self.cache
                .invalidate_principal(org, &user.to_string())
                .await;
        }
        let id = result
            .as_ref()
            .map(|a| a.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "role_assignment.create", "role_assignment", id, ok);
        Ok(result?)
    }

    pub async fn revoke_role(
        &self,
        actor: &str,
        org: Uuid,
        user: Uuid,
        role: Uuid,
        scope: Option<&ResourceScope>,
    ) -> Result<bool, AppError> {
        let result = self.store.revoke_role(org, user, role, scope).await;
        let ok = result.is_ok();
        if ok {
            self.cache
                .invalidate_principal(org, &user.to_string())
                .await;
        }
        self.record(org, actor, "role_assignment.revoke", "role_assignment", format!("{user}:{role}"), ok);
        Ok(result?)
    }

    // ── Policies ─────────────────────────────────────────────

    pub async fn create_policy(&self, actor: &str, org: Uuid, name: &str) -> Result<Policy, AppError> {
        let result = self.store.create_policy(org, name).await;
        let ok = result.is_ok();
        let id = result
            .as_ref()
            .map(|p| p.id.to_string())
            .unwrap_or_default();
        self.record(org, actor, "policy.create", "policy", id, ok);
        Ok(result?)
    }

    pub async fn publish_policy_version(
        &self,
        actor: &str,
        org: Uuid,
        policy: Uuid,
        content: &str,
        published_by: Uuid,
    ) -> Result<PolicyVersion, AppError> {
        let result = self
            .store
            .publish_policy_version(org, policy, content, published_by)
            .await;
        let ok = result.is_ok();
        if ok {
            // Published policy content can flip any decision in the tenant.
            self.cache.invalidate_organization(org).await;
        }
        self.record(org, actor, "policy.publish", "policy", policy.to_string(), ok);
        Ok(result?)
    }
}
