use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum depth of a role inheritance chain.
pub const MAX_ROLE_DEPTH: u8 = 10;

/// Named grant scope inside an organization, optionally inheriting from a
/// parent role in the same organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub parent_role_id: Option<Uuid>,
    /// Length of the parent chain; 0 for root roles, capped at [`MAX_ROLE_DEPTH`].
    pub depth: u8,
    /// Deletion-protected.
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

/// Optional resource scope on a role assignment. An assignment without a
/// scope is global within the organization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceScope {
    pub resource_type: String,
    pub resource_id: String,
}

/// Grant of a role to a user, optionally scoped and optionally expiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub scope: Option<ResourceScope>,
    pub expires_at: Option<DateTime<Utc>>,
    pub granted_by: Uuid,
    pub granted_at: DateTime<Utc>,
}

impl RoleAssignment {
    /// Expired assignments are silently ignored during resolution.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|exp| exp > now).unwrap_or(true)
    }

    /// A global assignment applies everywhere; a scoped one only to its
    /// exact (resource_type, resource_id) pair.
    pub fn applies_to(&self, scope: Option<&ResourceScope>) -> bool {
        match (&self.scope, scope) {
            (None, _) => true,
            (Some(own), Some(query)) => own == query,
            (Some(_), None) => false,
        }
    }
}

/// Binding of a permission to a role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: Uuid,
    pub permission_id: Uuid,
}
