//! Postgres [`AuthzStore`]. Every tenant-scoped statement carries an
//! `organization_id` predicate, and runs inside a transaction whose
//! `app.current_tenant` setting backs the row-level-security policies in
//! the schema. A query that escapes the predicate is stopped by RLS.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::audit::AuditRecord;
use crate::models::permission::{Permission, PermissionEffect};
use crate::models::policy::{content_checksum, Policy, PolicyStatus, PolicyVersion, ValidationStatus};
use crate::models::role::{ResourceScope, Role, RoleAssignment, MAX_ROLE_DEPTH};
use crate::models::tenant::{Organization, OrganizationStatus};
use crate::models::user::{NewUser, User, UserStatus};

use super::{ApiKey, AuditSink, AuthzStore, NewRoleAssignment, StoreError};

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(32)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Begin a transaction with the session tenant set for RLS.
    async fn tenant_tx(&self, org: Uuid) -> Result<Transaction<'_, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db)?;
        sqlx::query("SELECT set_config('app.current_tenant', $1::text, true)")
            .bind(org.to_string())
            .execute(&mut *tx)
            .await
            .map_err(map_db)?;
        Ok(tx)
    }
}

fn map_db(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db) = err {
        match db.code().as_deref() {
            // unique_violation
            Some("23505") => return StoreError::Conflict(db.message().to_string()),
            // foreign_key_violation
            Some("23503") => return StoreError::InvalidReference(db.message().to_string()),
            // check_violation (depth bound, status domains)
            Some("23514") => return StoreError::Conflict(db.message().to_string()),
            // insufficient_privilege: an RLS policy stopped the statement
            Some("42501") => return StoreError::TenancyViolation,
            _ => {}
        }
    }
    StoreError::Unavailable(err.to_string())
}

// ── Row types ────────────────────────────────────────────────

#[derive(sqlx::FromRow)]
struct OrganizationRow {
    id: Uuid,
    name: String,
    status: String,
    created_at: DateTime<Utc>,
}

impl From<OrganizationRow> for Organization {
    fn from(row: OrganizationRow) -> Self {
        Organization {
            id: row.id,
            name: row.name,
            status: OrganizationStatus::parse(&row.status),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: Uuid,
    organization_id: Uuid,
    email: Option<String>,
    external_subject_id: Option<String>,
    status: String,
    attributes: serde_json::Value,
    created_at: DateTime<Utc>,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: row.id,
            organization_id: row.organization_id,
            email: row.email,
            external_subject_id: row.external_subject_id,
            status: UserStatus::parse(&row.status),
            attributes: row.attributes,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ApiKeyRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    key_hash: String,
    is_active: bool,
    created_at: DateTime<Utc>,
}

impl From<ApiKeyRow> for ApiKey {
    fn from(row: ApiKeyRow) -> Self {
        ApiKey {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            key_hash: row.key_hash,
            is_active: row.is_active,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    parent_role_id: Option<Uuid>,
    depth: i16,
    is_system: bool,
    created_at: DateTime<Utc>,
}

impl From<RoleRow> for Role {
    fn from(row: RoleRow) -> Self {
        Role {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            parent_role_id: row.parent_role_id,
            depth: row.depth.clamp(0, MAX_ROLE_DEPTH as i16) as u8,
            is_system: row.is_system,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PermissionRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    resource_type: String,
    action: String,
    effect: String,
    created_at: DateTime<Utc>,
}

impl From<PermissionRow> for Permission {
    fn from(row: PermissionRow) -> Self {
        Permission {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            resource_type: row.resource_type,
            action: row.action,
            effect: PermissionEffect::parse(&row.effect),
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AssignmentRow {
    id: Uuid,
    user_id: Uuid,
    role_id: Uuid,
    resource_type: Option<String>,
    resource_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    granted_by: Uuid,
    granted_at: DateTime<Utc>,
}

impl From<AssignmentRow> for RoleAssignment {
    fn from(row: AssignmentRow) -> Self {
        let scope = match (row.resource_type, row.resource_id) {
            (Some(resource_type), Some(resource_id)) => Some(ResourceScope {
                resource_type,
                resource_id,
            }),
            _ => None,
        };
        RoleAssignment {
            id: row.id,
            user_id: row.user_id,
            role_id: row.role_id,
            scope,
            expires_at: row.expires_at,
            granted_by: row.granted_by,
            granted_at: row.granted_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    organization_id: Uuid,
    name: String,
    status: String,
    current_version: i32,
    created_at: DateTime<Utc>,
}

impl From<PolicyRow> for Policy {
    fn from(row: PolicyRow) -> Self {
        Policy {
            id: row.id,
            organization_id: row.organization_id,
            name: row.name,
            status: PolicyStatus::parse(&row.status),
            current_version: row.current_version,
            created_at: row.created_at,
        }
    }
}

// ── AuthzStore ───────────────────────────────────────────────

#[async_trait]
impl AuthzStore for PgStore {
    async fn organization(&self, id: Uuid) -> Result<Option<Organization>, StoreError> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            "SELECT id, name, status, created_at FROM organizations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn create_organization(&self, name: &str) -> Result<Organization, StoreError> {
        let row = sqlx::query_as::<_, OrganizationRow>(
            r#"INSERT INTO organizations (id, name, status)
               VALUES (gen_random_uuid(), $1, 'active')
               RETURNING id, name, status, created_at"#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(row.into())
    }

    async fn user(&self, org: Uuid, id: Uuid) -> Result<Option<User>, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, organization_id, email, external_subject_id, status, attributes, created_at
               FROM users WHERE organization_id = $1 AND id = $2"#,
        )
        .bind(org)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn user_by_subject(&self, subject: &str) -> Result<Option<User>, StoreError> {
        // Subject ids are globally unique; this runs before the tenant is known.
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, organization_id, email, external_subject_id, status, attributes, created_at
               FROM users WHERE external_subject_id = $1"#,
        )
        .bind(subject)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn user_by_email(&self, org: Uuid, email: &str) -> Result<Option<User>, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"SELECT id, organization_id, email, external_subject_id, status, attributes, created_at
               FROM users WHERE organization_id = $1 AND email = $2"#,
        )
        .bind(org)
        .bind(email)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn create_user(&self, new: NewUser) -> Result<User, StoreError> {
        let mut tx = self.tenant_tx(new.organization_id).await?;
        let row = sqlx::query_as::<_, UserRow>(
            r#"INSERT INTO users (id, organization_id, email, external_subject_id, status, attributes)
               VALUES (gen_random_uuid(), $1, $2, $3, 'active', $4)
               RETURNING id, organization_id, email, external_subject_id, status, attributes, created_at"#,
        )
        .bind(new.organization_id)
        .bind(&new.email)
        .bind(&new.external_subject_id)
        .bind(&new.attributes)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn attach_external_subject(
        &self,
        org: Uuid,
        user: Uuid,
        subject: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let result = sqlx::query(
            r#"UPDATE users SET external_subject_id = $3
               WHERE organization_id = $1 AND id = $2 AND external_subject_id IS NULL"#,
        )
        .bind(org)
        .bind(user)
        .bind(subject)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(
                "user already linked to an external subject".to_string(),
            ));
        }
        Ok(())
    }

    async fn api_key_by_hash(&self, key_hash: &str) -> Result<Option<ApiKey>, StoreError> {
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"SELECT id, organization_id, name, key_hash, is_active, created_at
               FROM api_keys WHERE key_hash = $1 AND is_active = true"#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn insert_api_key(
        &self,
        org: Uuid,
        name: &str,
        key_hash: &str,
    ) -> Result<ApiKey, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, ApiKeyRow>(
            r#"INSERT INTO api_keys (id, organization_id, name, key_hash, is_active)
               VALUES (gen_random_uuid(), $1, $2, $3, true)
               RETURNING id, organization_id, name, key_hash, is_active, created_at"#,
        )
        .bind(org)
        .bind(name)
        .bind(key_hash)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn role(&self, org: Uuid, id: Uuid) -> Result<Option<Role>, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, RoleRow>(
            r#"SELECT id, organization_id, name, parent_role_id, depth, is_system, created_at
               FROM roles WHERE organization_id = $1 AND id = $2"#,
        )
        .bind(org)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.map(Into::into))
    }

    async fn create_role(
        &self,
        org: Uuid,
        name: &str,
        parent_role_id: Option<Uuid>,
        is_system: bool,
    ) -> Result<Role, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let depth: i16 = match parent_role_id {
            None => 0,
            Some(parent) => {
                let parent_depth: Option<i16> = sqlx::query_scalar(
                    "SELECT depth FROM roles WHERE organization_id = $1 AND id = $2",
                )
                .bind(org)
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db)?;
                match parent_depth {
                    None => return Err(StoreError::NotFound("role")),
                    Some(d) if d as u8 >= MAX_ROLE_DEPTH => {
                        return Err(StoreError::Conflict(format!(
                            "role chain exceeds depth {MAX_ROLE_DEPTH}"
                        )))
                    }
                    Some(d) => d + 1,
                }
            }
        };
        let row = sqlx::query_as::<_, RoleRow>(
            r#"INSERT INTO roles (id, organization_id, name, parent_role_id, depth, is_system)
               VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
               RETURNING id, organization_id, name, parent_role_id, depth, is_system, created_at"#,
        )
        .bind(org)
        .bind(name)
        .bind(parent_role_id)
        .bind(depth)
        .bind(is_system)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn update_role_parent(
        &self,
        org: Uuid,
        role: Uuid,
        new_parent: Option<Uuid>,
    ) -> Result<Role, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        if let Some(parent) = new_parent {
            // The new parent must not be the role itself or any descendant.
            let is_descendant: bool = sqlx::query_scalar(
                r#"WITH RECURSIVE subtree AS (
                       SELECT id FROM roles WHERE organization_id = $1 AND id = $2
                       UNION ALL
                       SELECT r.id FROM roles r
                       JOIN subtree s ON r.parent_role_id = s.id
                       WHERE r.organization_id = $1
                   )
                   SELECT EXISTS(SELECT 1 FROM subtree WHERE id = $3)"#,
            )
            .bind(org)
            .bind(role)
            .bind(parent)
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db)?;
            if is_descendant {
                return Err(StoreError::Conflict(
                    "new parent is the role itself or one of its descendants".to_string(),
                ));
            }
        }
        let depth: i16 = match new_parent {
            None => 0,
            Some(parent) => {
                let parent_depth: Option<i16> = sqlx::query_scalar(
                    "SELECT depth FROM roles WHERE organization_id = $1 AND id = $2",
                )
                .bind(org)
                .bind(parent)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_db)?;
                match parent_depth {
                    None => return Err(StoreError::NotFound("role")),
                    Some(d) if d as u8 >= MAX_ROLE_DEPTH => {
                        return Err(StoreError::Conflict(format!(
                            "role chain exceeds depth {MAX_ROLE_DEPTH}"
                        )))
                    }
                    Some(d) => d + 1,
                }
            }
        };
        let row = sqlx::query_as::<_, RoleRow>(
            r#"UPDATE roles SET parent_role_id = $3, depth = $4
               WHERE organization_id = $1 AND id = $2
               RETURNING id, organization_id, name, parent_role_id, depth, is_system, created_at"#,
        )
        .bind(org)
        .bind(role)
        .bind(new_parent)
        .bind(depth)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?
        .ok_or(StoreError::NotFound("role"))?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn delete_role(&self, org: Uuid, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row: Option<(bool, bool)> = sqlx::query_as(
            r#"SELECT r.is_system,
                      EXISTS(SELECT 1 FROM roles c
                             WHERE c.organization_id = $1 AND c.parent_role_id = r.id)
               FROM roles r WHERE r.organization_id = $1 AND r.id = $2"#,
        )
        .bind(org)
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?;
        match row {
            None => return Err(StoreError::NotFound("role")),
            Some((true, _)) => {
                return Err(StoreError::Conflict("system roles cannot be deleted".to_string()))
            }
            Some((_, true)) => {
                return Err(StoreError::Conflict(
                    "role has child roles and cannot be deleted".to_string(),
                ))
            }
            Some((false, false)) => {}
        }
        sqlx::query("DELETE FROM roles WHERE organization_id = $1 AND id = $2")
            .bind(org)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
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
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, PermissionRow>(
            r#"INSERT INTO permissions (id, organization_id, name, resource_type, action, effect)
               VALUES (gen_random_uuid(), $1, $2, $3, $4, $5)
               RETURNING id, organization_id, name, resource_type, action, effect, created_at"#,
        )
        .bind(org)
        .bind(name)
        .bind(resource_type)
        .bind(action)
        .bind(effect.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn delete_permission(&self, org: Uuid, id: Uuid) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let result = sqlx::query("DELETE FROM permissions WHERE organization_id = $1 AND id = $2")
            .bind(org)
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("permission"));
        }
        Ok(())
    }

    async fn permissions_for_roles(
        &self,
        org: Uuid,
        role_ids: &[Uuid],
    ) -> Result<Vec<Permission>, StoreError> {
        if role_ids.is_empty() {
            return Ok(vec![]);
        }
        let mut tx = self.tenant_tx(org).await?;
        let rows = sqlx::query_as::<_, PermissionRow>(
            r#"SELECT p.id, p.organization_id, p.name, p.resource_type, p.action, p.effect, p.created_at
               FROM permissions p
               JOIN role_permissions rp ON rp.permission_id = p.id
               WHERE p.organization_id = $1 AND rp.role_id = ANY($2)"#,
        )
        .bind(org)
        .bind(role_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn bind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<(), StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        // Both rows must exist within the tenant or the insert is refused.
        let ok: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM roles WHERE organization_id = $1 AND id = $2)
                  AND EXISTS(SELECT 1 FROM permissions WHERE organization_id = $1 AND id = $3)"#,
        )
        .bind(org)
        .bind(role)
        .bind(permission)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        if !ok {
            return Err(StoreError::TenancyViolation);
        }
        sqlx::query(
            r#"INSERT INTO role_permissions (role_id, permission_id)
               VALUES ($1, $2) ON CONFLICT DO NOTHING"#,
        )
        .bind(role)
        .bind(permission)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(())
    }

    async fn unbind_permission(
        &self,
        org: Uuid,
        role: Uuid,
        permission: Uuid,
    ) -> Result<bool, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let result = sqlx::query(
            r#"DELETE FROM role_permissions rp
               USING roles r
               WHERE rp.role_id = r.id AND r.organization_id = $1
                 AND rp.role_id = $2 AND rp.permission_id = $3"#,
        )
        .bind(org)
        .bind(role)
        .bind(permission)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn assignments_for_user(
        &self,
        org: Uuid,
        user: Uuid,
    ) -> Result<Vec<RoleAssignment>, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let rows = sqlx::query_as::<_, AssignmentRow>(
            r#"SELECT a.id, a.user_id, a.role_id, a.resource_type, a.resource_id,
                      a.expires_at, a.granted_by, a.granted_at
               FROM role_assignments a
               JOIN roles r ON r.id = a.role_id
               WHERE r.organization_id = $1 AND a.user_id = $2
                 AND (a.expires_at IS NULL OR a.expires_at > now())"#,
        )
        .bind(org)
        .bind(user)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn assign_role(
        &self,
        org: Uuid,
        new: NewRoleAssignment,
    ) -> Result<RoleAssignment, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        // user.organizationId must equal role.organizationId.
        let ok: bool = sqlx::query_scalar(
            r#"SELECT EXISTS(SELECT 1 FROM users WHERE organization_id = $1 AND id = $2)
                  AND EXISTS(SELECT 1 FROM roles WHERE organization_id = $1 AND id = $3)"#,
        )
        .bind(org)
        .bind(new.user_id)
        .bind(new.role_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        if !ok {
            return Err(StoreError::TenancyViolation);
        }
        let (resource_type, resource_id) = match &new.scope {
            Some(scope) => (Some(scope.resource_type.clone()), Some(scope.resource_id.clone())),
            None => (None, None),
        };
        let row = sqlx::query_as::<_, AssignmentRow>(
            r#"INSERT INTO role_assignments
                   (id, user_id, role_id, resource_type, resource_id, expires_at, granted_by)
               VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6)
               RETURNING id, user_id, role_id, resource_type, resource_id,
                         expires_at, granted_by, granted_at"#,
        )
        .bind(new.user_id)
        .bind(new.role_id)
        .bind(&resource_type)
        .bind(&resource_id)
        .bind(new.expires_at)
        .bind(new.granted_by)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn revoke_role(
        &self,
        org: Uuid,
        user: Uuid,
        role: Uuid,
        scope: Option<&ResourceScope>,
    ) -> Result<bool, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let (resource_type, resource_id) = match scope {
            Some(s) => (Some(s.resource_type.as_str()), Some(s.resource_id.as_str())),
            None => (None, None),
        };
        let result = sqlx::query(
            r#"DELETE FROM role_assignments a
               USING roles r
               WHERE a.role_id = r.id AND r.organization_id = $1
                 AND a.user_id = $2 AND a.role_id = $3
                 AND a.resource_type IS NOT DISTINCT FROM $4
                 AND a.resource_id IS NOT DISTINCT FROM $5"#,
        )
        .bind(org)
        .bind(user)
        .bind(role)
        .bind(resource_type)
        .bind(resource_id)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_policy(&self, org: Uuid, name: &str) -> Result<Policy, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let row = sqlx::query_as::<_, PolicyRow>(
            r#"INSERT INTO policies (id, organization_id, name, status, current_version)
               VALUES (gen_random_uuid(), $1, $2, 'draft', 0)
               RETURNING id, organization_id, name, status, current_version, created_at"#,
        )
        .bind(org)
        .bind(name)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(row.into())
    }

    async fn publish_policy_version(
        &self,
        org: Uuid,
        policy: Uuid,
        content: &str,
        published_by: Uuid,
    ) -> Result<PolicyVersion, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let version: Option<i32> = sqlx::query_scalar(
            r#"UPDATE policies SET current_version = current_version + 1, status = 'active'
               WHERE organization_id = $1 AND id = $2
               RETURNING current_version"#,
        )
        .bind(org)
        .bind(policy)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db)?;
        let version = version.ok_or(StoreError::NotFound("policy"))?;
        let checksum = content_checksum(content);
        sqlx::query(
            r#"INSERT INTO policy_versions
                   (policy_id, version, content, checksum, validation_status, published_at, published_by)
               VALUES ($1, $2, $3, $4, 'valid', now(), $5)"#,
        )
        .bind(policy)
        .bind(version)
        .bind(content)
        .bind(&checksum)
        .bind(published_by)
        .execute(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(PolicyVersion {
            policy_id: policy,
            version,
            content: content.to_string(),
            checksum,
            validation_status: ValidationStatus::Valid,
            published_at: Some(Utc::now()),
            published_by: Some(published_by),
        })
    }

    async fn active_policies(&self, org: Uuid) -> Result<Vec<Policy>, StoreError> {
        let mut tx = self.tenant_tx(org).await?;
        let rows = sqlx::query_as::<_, PolicyRow>(
            r#"SELECT id, organization_id, name, status, current_version, created_at
               FROM policies WHERE organization_id = $1 AND status = 'active'"#,
        )
        .bind(org)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db)?;
        tx.commit().await.map_err(map_db)?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// ── AuditSink ────────────────────────────────────────────────

#[async_trait]
impl AuditSink for PgStore {
    async fn insert_audit_batch(&self, records: &[AuditRecord]) -> anyhow::Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;

        // The audit table is range-partitioned by month; make sure every
        // month touched by this batch has its partition.
        let mut months: Vec<DateTime<Utc>> = records
            .iter()
            .map(|r| {
                r.timestamp
                    .with_day(1)
                    .and_then(|d| d.with_time(chrono::NaiveTime::MIN).single())
                    .unwrap_or(r.timestamp)
            })
            .collect();
        months.sort();
        months.dedup();
        for month in months {
            sqlx::query("SELECT ensure_audit_partition($1)")
                .bind(month)
                .execute(&mut *tx)
                .await?;
        }

        for record in records {
            sqlx::query(
                r#"INSERT INTO audit_records
                       (id, organization_id, event_type, actor, resource_type, resource_id,
                        action, decision, decision_reason, ip_address, user_agent,
                        request_digest, timestamp)
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"#,
            )
            .bind(record.id)
            .bind(record.organization_id)
            .bind(&record.event_type)
            .bind(&record.actor)
            .bind(&record.resource_type)
            .bind(&record.resource_id)
            .bind(&record.action)
            .bind(record.decision.as_str())
            .bind(&record.decision_reason)
            .bind(&record.ip_address)
            .bind(&record.user_agent)
            .bind(&record.request_digest)
            .bind(record.timestamp)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
