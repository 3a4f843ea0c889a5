//! In-memory [`AuthzStore`] used by tests. Enforces the same uniqueness
//! and tenancy invariants as the Postgres store so tests exercise real
//! write-time rejection paths.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::models::audit::AuditRecord;
use crate::models::permission::{Permission, PermissionEffect};
use crate::models::policy::{content_checksum, Policy, PolicyStatus, PolicyVersion, ValidationStatus};
use crate::models::role::{ResourceScope, Role, RoleAssignment, MAX_ROLE_DEPTH};
use crate::models::tenant::{Organization, OrganizationStatus};
use crate::models::user::{NewUser, User, UserStatus};

use super::{ApiKey, AuditSink, AuthzStore, NewRoleAssignment, StoreError};

#[derive(Default)]
struct Inner {
    organizations: HashMap<Uuid, Organization>,
    users: HashMap<Uuid, User>,
    api_keys: HashMap<Uuid, ApiKey>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    role_permissions: Vec<(Uuid, Uuid)>,
    assignments: HashMap<Uuid, RoleAssignment>,
    policies: HashMap<Uuid, Policy>,
    policy_versions: Vec<PolicyVersion>,
    audit: Vec<AuditRecord>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Audit rows captured via [`AuditSink`], for test assertions.
    pub fn audit_records(&self) -> Vec<AuditRecord> {
        self.inner.read().unwrap().audit.clone()
    }

    fn role_depth(inner: &Inner, org: Uuid, mut parent: Option<Uuid>) -> Result<u8, StoreError> {
        let mut depth: u8 = 0;
        while let Some(pid) = parent {
            let role = inner
                .roles
                .get(&pid)
                .ok_or(StoreError::NotFound("role"))?;
            if role.organization_id != org {
                return Err(StoreError::TenancyViolation);
            }
            depth += 1;
            if depth > MAX_ROLE_DEPTH {
                return Err(StoreError::Conflict(format!(
                    "role chain exceeds depth {MAX_ROLE_DEPTH}"
                )));
            }
            parent = role.parent_role_id;
        }
        Ok(depth)
    }

    fn is_descendant(inner: &Inner, ancestor: Uuid, candidate: Uuid) -> bool {
        let mut current = Some(candidate);
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = inner.roles.get(&id).and_then(|r| r.parent_role_id);
        }
        false
    }
}

#[async_trait]
impl AuthzStore for MemoryStore {
    async fn organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError> {
        Ok(self.inner.read().unwrap().organizations.get(&id).cloned())
    }

    async fn create_organization(&self, name: &str) -> Result<Organization, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner.organizations.values().any(|o| o.name == name) {
            return Err(StoreError::Conflict(format!(
                "organization name '{name}' already in use"
            )));
        }
        let org = Organization {
            id: Uuid::new_v4(),
            name: name.to_string(),
            status: OrganizationStatus::Active,
            created_at: Utc::now(),
        };
        inner.organizations.insert(org.id, org.clone());
        Ok(org)
    }

    async fn user(&self, org: Uuid, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .users
            .get(&id)
            .filter(|u| u.organization_id == org)
            .cloned())
    }

    async fn user_by_subject(&self, subject: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.external_subject_id.as_deref() == Some(subject))
            .cloned())
    }

    async fn user_by_email(&self, org: Uuid, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .users
            .values()
            .find(|u| u.organization_id == org && u.email.as_deref() == Some(email))
            .cloned())
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.organizations.contains_key(&new.organization_id) {
            return Err(StoreError::NotFound("organization"));
        }
        if let Some(email) = &new.email {
            if inner
                .users
                .values()
                .any(|u| u.organization_id == new.organization_id && u.email.as_deref() == Some(email))
            {
                return Err(StoreError::Conflict(format!(
                    "email '{email}' already in use within organization"
                )));
            }
        }
        if let Some(subject) = &new.external_subject_id {
            if inner
                .users
                .values()
                .any(|u| u.external_subject_id.as_deref() == Some(subject))
            {
                return Err(StoreError::Conflict("subject id already in use".to_string()));
            }
        }
        let user = User {
            id: Uuid::new_v4(),
            organization_id: new.organization_id,
            email: new.email,
            external_subject_id: new.external_subject_id,
            status: UserStatus::Active,
            attributes: new.attributes,
            created_at: Utc::now(),
        };
        inner.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn attach_external_subject(
        &self,
        org: Uuid,
        user: Uuid,
        subject: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .users
            .values()
            .any(|u| u.external_subject_id.as_deref() == Some(subject))
        {
            return Err(StoreError::Conflict("subject id already in use".to_string()));
        }
        let record = inner
            .users
            .get_mut(&user)
            .filter(|u| u.organization_id == org)
            .ok_or(StoreError::NotFound("user"))?;
        if record.external_subject_id.is_some() {
            return Err(StoreError::Conflict(
                "user already linked to an external subject".to_string(),
            ));
        }
        record.external_subject_id = Some(subject.to_string());
        Ok(())
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .api_keys
            .values()
            .find(|k| k.key_hash == key_hash && k.is_active)
            .cloned())
    }

    async fn insert_api_key(
        &self,
        org: Uuid,
        name: &str,
        key_hash: &str,
    ) -> Result<ApiKey, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.organizations.contains_key(&org) {
            return Err(StoreError::NotFound("organization"));
        }
        let key = ApiKey {
            id: Uuid::new_v4(),
            organization_id: org,
            name: name.to_string(),
            key_hash: key_hash.to_string(),
            is_active: true,
            created_at: Utc::now(),
        };
        inner.api_keys.insert(key.id, key.clone());
        Ok(key)
    }

    async fn role(&self, org: Uuid, id: Uuid) -> Result<Option<Role>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .roles
            .get(&id)
            .filter(|r| r.organization_id == org)
            .cloned())
    }

    async fn create_role(
        &self,
        org: Uuid,
        name: &str,
        parent_role_id: Option<Uuid>,
        is_system: bool,
    ) -> Result<Role, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner.organizations.contains_key(&org) {
            return Err(StoreError::NotFound("organization"));
        }
        if inner
            .roles
            .values()
            .any(|r| r.organization_id == org && r.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "role name '{name}' already in use within organization"
            )));
        }
        let depth = Self::role_depth(&inner, org, parent_role_id)?;
        let role = Role {
            id: Uuid::new_v4(),
            organization_id: org,
            name: name.to_string(),
            parent_role_id,
            depth,
            is_system,
            created_at: Utc::now(),
        };
        inner.roles.insert(role.id, role.clone());
        Ok(role)
    }

    async fn update_role_parent(
        &self,
        org: Uuid,
        role: Uuid,
        new_parent: Option<Uuid>,
    ) -> Result<Role, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner
            .roles
            .get(&role)
            .map(|r| r.organization_id == org)
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound("role"));
        }
        if let Some(parent) = new_parent {
            if Self::is_descendant(&inner, role, parent) {
                return Err(StoreError::Conflict(
                    "new parent is the role itself or one of its descendants".to_string(),
                ));
            }
        }
        let depth = Self::role_depth(&inner, org, new_parent)?;
        let record = inner.roles.get_mut(&role).unwrap();
        record.parent_role_id = new_parent;
        record.depth = depth;
        Ok(record.clone())
    }

    async fn delete_role(&self, org: Uuid, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let role = inner
            .roles
            .get(&id)
            .filter(|r| r.organization_id == org)
            .ok_or(StoreError::NotFound("role"))?;
        if role.is_system {
            return Err(StoreError::Conflict("system roles cannot be deleted".to_string()));
        }
        if inner.roles.values().any(|r| r.parent_role_id == Some(id)) {
            return Err(StoreError::Conflict(
                "role has child roles and cannot be deleted".to_string(),
            ));
        }
        inner.roles.remove(&id);
        inner.role_permissions.retain(|(rid, _)| *rid != id);
        inner.assignments.retain(|_, a| a.role_id != id);
        Ok(())
    }

    async fn create_permission(
        &self,
        org: Uuid,
        name: &str,
        resource_type: &str,
        action: &str,
        effect: PermissionEffect,
    ) -> Result<Permission, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .permissions
            .values()
            .any(|p| p.organization_id == org && p.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "permission name '{name}' already in use within organization"
            )));
        }
        if inner.permissions.values().any(|p| {
            p.organization_id == org
                && p.resource_type == resource_type
                && p.action == action
                && p.effect == effect
        }) {
            return Err(StoreError::Conflict(format!(
                "permission ({resource_type}, {action}, {}) already defined",
                effect.as_str()
            )));
        }
        let permission = Permission {
            id: Uuid::new_v4(),
            organization_id: org,
            name: name.to_string(),
            resource_type: resource_type.to_string(),
            action: action.to_string(),
            effect,
            created_at: Utc::now(),
        };
        inner.permissions.insert(permission.id, permission.clone());
        Ok(permission)
    }

    async fn delete_permission(&self, org: Uuid, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        inner
            .permissions
            .get(&id)
            .filter(|p| p.organization_id == org)
            .ok_or(StoreError::NotFound("permission"))?;
        inner.permissions.remove(&id);
        inner.role_permissions.retain(|(_, pid)| *pid != id);
        Ok(())
    }

    async fn permissions_for_roles(
        &self,
        org: Uuid,
        role_ids: &[Uuid],
    ) -> Result<Vec<Permission>, StoreError> {
        let inner = self.inner.read().unwrap();
        let mut out = Vec::new();
        for (role_id, permission_id) in &inner.role_permissions {
            if !role_ids.contains(role_id) {
                continue;
            }
            if let Some(p) = inner.permissions.get(permission_id) {
                if p.organization_id == org {
                    out.push(p.clone());
                }
            }
        }
        Ok(out)
    }

    async fn bind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().unwrap();
        let role_org = inner
            .roles
            .get(&role)
            .map(|r| r.organization_id)
            .ok_or(StoreError::NotFound("role"))?;
        let perm_org = inner
            .permissions
            .get(&permission)
            .map(|p| p.organization_id)
            .ok_or(StoreError::NotFound("permission"))?;
        if role_org != org || perm_org != org || role_org != perm_org {
            return Err(StoreError::TenancyViolation);
        }
        if inner
            .role_permissions
            .iter()
            .any(|(r, p)| *r == role && *p == permission)
        {
            return Ok(());
        }
        inner.role_permissions.push((role, permission));
        Ok(())
    }

    async fn unbind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner
            .roles
            .get(&role)
            .map(|r| r.organization_id == org)
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound("role"));
        }
        let before = inner.role_permissions.len();
        inner
            .role_permissions
            .retain(|(r, p)| !(*r == role && *p == permission));
        Ok(inner.role_permissions.len() < before)
    }

    async fn assignments_for_user(
        &self,
        org: Uuid,
        user: Uuid,
    ) -> Result<Vec<RoleAssignment>, StoreError> {
        let now = Utc::now();
        let inner = self.inner.read().unwrap();
        Ok(inner
            .assignments
            .values()
            .filter(|a| a.user_id == user)
            .filter(|a| {
                inner
                    .roles
                    .get(&a.role_id)
                    .map(|r| r.organization_id == org)
                    .unwrap_or(false)
            })
            .filter(|a| a.is_live(now))
            .cloned()
            .collect())
    }

    async fn assign_role(
        &self,
        org: Uuid,
        new: NewRoleAssignment,
    ) -> Result<RoleAssignment, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let user_org = inner
            .users
            .get(&new.user_id)
            .map(|u| u.organization_id)
            .ok_or(StoreError::NotFound("user"))?;
        let role_org = inner
            .roles
            .get(&new.role_id)
            .map(|r| r.organization_id)
            .ok_or(StoreError::NotFound("role"))?;
        if user_org != org || role_org != org || user_org != role_org {
            return Err(StoreError::TenancyViolation);
        }
        if inner.assignments.values().any(|a| {
            a.user_id == new.user_id && a.role_id == new.role_id && a.scope == new.scope
        }) {
            return Err(StoreError::Conflict("assignment already exists".to_string()));
        }
        let assignment = RoleAssignment {
            id: Uuid::new_v4(),
            user_id: new.user_id,
            role_id: new.role_id,
            scope: new.scope,
            expires_at: new.expires_at,
            granted_by: new.granted_by,
            granted_at: Utc::now(),
        };
        inner.assignments.insert(assignment.id, assignment.clone());
        Ok(assignment)
    }

    async fn revoke_role(
        &self,
        org: Uuid,
        user: Uuid,
        role: Uuid,
        scope: Option<&ResourceScope>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if !inner
            .roles
            .get(&role)
            .map(|r| r.organization_id == org)
            .unwrap_or(false)
        {
            return Err(StoreError::NotFound("role"));
        }
        let before = inner.assignments.len();
        inner.assignments.retain(|_, a| {
            !(a.user_id == user && a.role_id == role && a.scope.as_ref() == scope)
        });
        Ok(inner.assignments.len() < before)
    }

    async fn create_policy(&self, org: Uuid, name: &str) -> Result<Policy, StoreError> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .policies
            .values()
            .any(|p| p.organization_id == org && p.name == name)
        {
            return Err(StoreError::Conflict(format!(
                "policy name '{name}' already in use within organization"
            )));
        }
        let policy = Policy {
            id: Uuid::new_v4(),
            organization_id: org,
            name: name.to_string(),
            status: PolicyStatus::Draft,
            current_version: 0,
            created_at: Utc::now(),
        };
        inner.policies.insert(policy.id, policy.clone());
        Ok(policy)
    }

    async fn publish_policy_version(
        &self,
        org: Uuid,
        policy: Uuid,
        content: &str,
        published_by: Uuid,
    ) -> Result<PolicyVersion, StoreError> {
        let mut inner = self.inner.write().unwrap();
        let record = inner
            .policies
            .get_mut(&policy)
            .filter(|p| p.organization_id == org)
            .ok_or(StoreError::NotFound("policy"))?;
        record.current_version += 1;
        record.status = PolicyStatus::Active;
        let version = PolicyVersion {
            policy_id: policy,
            version: record.current_version,
            content: content.to_string(),
            checksum: content_checksum(content),
            validation_status: ValidationStatus::Valid,
            published_at: Some(Utc::now()),
            published_by: Some(published_by),
        };
        inner.policy_versions.push(version.clone());
        Ok(version)
    }

    async fn active_policies(&self, org: Uuid) -> Result<Vec<Policy>, StoreError> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .policies
            .values()
            .filter(|p| p.organization_id == org && p.status == PolicyStatus::Active)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditSink for MemoryStore {
    async fn insert_audit_batch(&self, records: &[AuditRecord]) -> anyhow::Result<()> {
        self.inner.write().unwrap().audit.extend_from_slice(records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> (MemoryStore, Uuid) {
        let store = MemoryStore::new();
        let org = store.create_organization("acme").await.unwrap().id;
        (store, org)
    }

    #[tokio::test]
    async fn organization_names_are_unique() {
        let (store, _) = seeded().await;
        assert!(matches!(
            store.create_organization("acme").await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn email_unique_within_org_only() {
        let (store, org_a) = seeded().await;
        let org_b = store.create_organization("globex").await.unwrap().id;

        let user = |org| NewUser {
            organization_id: org,
            email: Some("ada@example.com".to_string()),
            external_subject_id: None,
            attributes: serde_json::json!({}),
        };
        store.create_user(user(org_a)).await.unwrap();
        // Same email in another organization is fine.
        store.create_user(user(org_b)).await.unwrap();
        assert!(matches!(
            store.create_user(user(org_a)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn subject_attaches_at_most_once() {
        let (store, org) = seeded().await;
        let user = store
            .create_user(NewUser {
                organization_id: org,
                email: Some("ada@example.com".to_string()),
                external_subject_id: None,
                attributes: serde_json::json!({}),
            })
            .await
            .unwrap();

        store
            .attach_external_subject(org, user.id, "idp|123")
            .await
            .unwrap();
        assert!(matches!(
            store.attach_external_subject(org, user.id, "idp|456").await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn role_depth_is_bounded() {
        let (store, org) = seeded().await;
        let mut parent = None;
        for i in 0..=MAX_ROLE_DEPTH {
            let role = store
                .create_role(org, &format!("role-{i}"), parent, false)
                .await
                .unwrap();
            assert_eq!(role.depth, i);
            parent = Some(role.id);
        }
        assert!(matches!(
            store.create_role(org, "one-too-deep", parent, false).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn reparenting_onto_descendant_is_rejected() {
        let (store, org) = seeded().await;
        let root = store.create_role(org, "root", None, false).await.unwrap();
        let child = store
            .create_role(org, "child", Some(root.id), false)
            .await
            .unwrap();

        assert!(matches!(
            store.update_role_parent(org, root.id, Some(child.id)).await,
            Err(StoreError::Conflict(_))
        ));
        assert!(matches!(
            store.update_role_parent(org, root.id, Some(root.id)).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn role_with_children_cannot_be_deleted() {
        let (store, org) = seeded().await;
        let root = store.create_role(org, "root", None, false).await.unwrap();
        store
            .create_role(org, "child", Some(root.id), false)
            .await
            .unwrap();
        assert!(matches!(
            store.delete_role(org, root.id).await,
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn cross_org_binding_is_a_tenancy_violation() {
        let (store, org_a) = seeded().await;
        let org_b = store.create_organization("globex").await.unwrap().id;
        let role = store.create_role(org_a, "reader", None, false).await.unwrap();
        let perm = store
            .create_permission(org_b, "doc-read", "document", "read", PermissionEffect::Allow)
            .await
            .unwrap();

        assert!(matches!(
            store.bind_permission(org_a, role.id, perm.id).await,
            Err(StoreError::TenancyViolation | StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn expired_assignments_are_filtered() {
        let (store, org) = seeded().await;
        let user = store
            .create_user(NewUser {
                organization_id: org,
                email: None,
                external_subject_id: None,
                attributes: serde_json::json!({}),
            })
            .await
            .unwrap();
        let role = store.create_role(org, "reader", None, false).await.unwrap();
        store
            .assign_role(
                org,
                NewRoleAssignment {
                    user_id: user.id,
                    role_id: role.id,
                    scope: None,
                    expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
                    granted_by: user.id,
                },
            )
            .await
            .unwrap();

        let live = store.assignments_for_user(org, user.id).await.unwrap();
        assert!(live.is_empty());
    }

    #[tokio::test]
    async fn duplicate_assignment_tuple_is_rejected() {
        let (store, org) = seeded().await;
        let user = store
            .create_user(NewUser {
                organization_id: org,
                email: None,
                external_subject_id: None,
                attributes: serde_json::json!({}),
            })
            .await
            .unwrap();
        let role = store.create_role(org, "reader", None, false).await.unwrap();
        let new = || NewRoleAssignment {
            user_id: user.id,
            role_id: role.id,
            scope: None,
            expires_at: None,
            granted_by: user.id,
        };
        store.assign_role(org, new()).await.unwrap();
        assert!(matches!(
            store.assign_role(org, new()).await,
            Err(StoreError::Conflict(_))
        ));
    }
}
