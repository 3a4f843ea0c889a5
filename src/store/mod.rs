//! Storage seam. The decision engine, credential resolver, and admin
//! service all talk to [`AuthzStore`]; production wires in
//! [`postgres::PgStore`], tests wire in [`memory::MemoryStore`].
//!
//! Every tenant-scoped method takes the organization id as its first
//! argument; implementations must include it in their predicate. That is
//! the tenancy gate at the storage boundary.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::audit::AuditRecord;
use crate::models::permission::{Permission, PermissionEffect};
use crate::models::policy::{Policy, PolicyVersion};
use crate::models::role::{ResourceScope, Role, RoleAssignment};
use crate::models::tenant::Organization;
use crate::models::user::{NewUser, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Uniqueness or referential constraint failed.
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    /// A write referenced rows from two different organizations.
    #[error("tenancy violation")]
    TenancyViolation,

    #[error("invalid reference: {0}")]
    InvalidReference(String),
}

impl From<StoreError> for crate::errors::AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::TenancyViolation => crate::errors::AppError::TenancyViolation,
            StoreError::Unavailable(_) => crate::errors::AppError::StorageUnavailable,
            StoreError::Conflict(msg) | StoreError::InvalidReference(msg) => {
                crate::errors::AppError::InvalidRequest(msg)
            }
            StoreError::NotFound(what) => {
                crate::errors::AppError::InvalidRequest(format!("{what} not found"))
            }
        }
    }
}

/// A stored API credential. Only the SHA-256 of the key material is kept.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub key_hash: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRoleAssignment {
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub scope: Option<ResourceScope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: Uuid,
}

#[async_trait]
pub trait AuthzStore: Send + Sync {
    // ── Organizations ────────────────────────────────────────

    async fn organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError>;
    async fn create_organization(&self, name: &str) -> Result<Organization, StoreError>;

    // ── Users ────────────────────────────────────────────────

    async fn user(&self, org: Uuid, id: Uuid) -> Result<Option<User>, StoreError>;
    /// Subject ids are globally unique; this lookup is the JIT fast path.
    async fn user_by_subject(&self, subject: &str) -> Result<Option<User>, StoreError>;
    async fn user_by_email(&self, org: Uuid, email: &str) -> Result<Option<User>, StoreError>;
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;
    /// Sets `external_subject_id` iff it is currently unset.
    async fn attach_external_subject(
        &self,
        org: Uuid,
        user: Uuid,
        subject: &str,
    ) -> Result<(), StoreError>;

    // ── API keys ─────────────────────────────────────────────

    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError>;
    async fn insert_api_key(
        &self,
        org: Uuid,
        name: &str,
        key_hash: &str,
    ) -> Result<ApiKey, StoreError>;

    // ── Roles ────────────────────────────────────────────────

    async fn role(&self, org: Uuid, id: Uuid) -> Result<Option<Role>, StoreError>;
    async fn create_role(
        &self,
        org: Uuid,
        name: &str,
        parent_role_id: Option<Uuid>,
        is_system: bool,
    ) -> Result<Role, StoreError>;
    /// Rejects when the new parent is the role itself or one of its
    /// descendants, or when the resulting chain exceeds the depth bound.
    async fn update_role_parent(
        &self,
        org: Uuid,
        role: Uuid,
        new_parent: Option<Uuid>,
    ) -> Result<Role, StoreError>;
    /// Rejects system roles and roles that still have children.
    async fn delete_role(&self, org: Uuid, id: Uuid) -> Result<(), StoreError>;

    // ── Permissions ──────────────────────────────────────────

    async fn create_permission(
        &self,
        org: Uuid,
        name: &str,
        resource_type: &str,
        action: &str,
        effect: PermissionEffect,
    ) -> Result<Permission, StoreError>;
    async fn delete_permission(&self, org: Uuid, id: Uuid) -> Result<(), StoreError>;
    async fn permissions_for_roles(
        &self,
        org: Uuid,
        role_ids: &[Uuid],
    ) -> Result<Vec<Permission>, StoreError>;
    async fn bind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<(), StoreError>;
    async fn unbind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<bool, StoreError>;

    // ── Role assignments ─────────────────────────────────────

    /// Live (non-expired) assignments only.
    async fn assignments_for_user(
        &self,
        org: Uuid,
        user: Uuid,
    ) -> Result<Vec<RoleAssignment>, StoreError>;
    async fn assign_role(
        &self,
        org: Uuid,
        assignment: NewRoleAssignment,
    ) -> Result<RoleAssignment, StoreError>;
    async fn revoke_role(
        &self,
        org: Uuid,
        user: Uuid,
        role: Uuid,
        scope: Option<&ResourceScope>,
    ) -> Result<bool, StoreError>;

    // ── Policies ─────────────────────────────────────────────

    async fn create_policy(&self, org: Uuid, name: &str) -> Result<Policy, StoreError>;
    async fn publish_policy_version(
        &self,
        org: Uuid,
        policy: Uuid,
        content: &str,
        published_by: Uuid,
    ) -> Result<PolicyVersion, StoreError>;
    async fn active_policies(&self, org: Uuid) -> Result<Vec<Policy>, StoreError>;
}

/// Where the audit pipeline drains to.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn insert_audit_batch(&self, records: &[AuditRecord]) -> anyhow::Result<()>;
}
