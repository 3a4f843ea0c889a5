//! Role resolver: computes the effective permission set for a user by
//! walking assigned roles up through their parents. Cycles are forbidden
//! at write time; the walk still carries a visited set and the depth bound
//! so a corrupted graph cannot wedge the hot path.

use std::collections::HashSet;

use uuid::Uuid;

use crate::errors::AppError;
use crate::models::permission::Permission;
use crate::models::role::{ResourceScope, MAX_ROLE_DEPTH};
use crate::store::AuthzStore;

/// Union of the user's directly-assigned role permissions with those
/// inherited from ancestor roles, filtered by non-expired assignments and
/// matching resource scope. An unknown user resolves to no permissions.
pub async fn effective_permissions(
    store: &dyn AuthzStore,
    org: Uuid,
    principal_id: &str,
    scope: Option<&ResourceScope>,
) -> Result<Vec<Permission>, AppError> {
    // Service principals (API keys) have no user record and no role rows;
    // their decisions come from the policy engine.
    let user_id: Uuid = match principal_id.parse() {
        Ok(id) => id,
        Err(_) => return Ok(vec![]),
    };
    if store.user(org, user_id).await?.is_none() {
        return Ok(vec![]);
    }

    let assignments = store.assignments_for_user(org, user_id).await?;
    let mut role_ids: HashSet<Uuid> = HashSet::new();

    for assignment in assignments {
        if !assignment.applies_to(scope) {
            continue;
        }
        collect_role_chain(store, org, assignment.role_id, &mut role_ids).await?;
    }

    if role_ids.is_empty() {
        return Ok(vec![]);
    }
    let role_ids: Vec<Uuid> = role_ids.into_iter().collect();
    Ok(store.permissions_for_roles(org, &role_ids).await?)
}

/// Walk upward from `role_id` to the organization-rooted root, adding every
/// role on the chain to `collected`.
async fn collect_role_chain(
    store: &dyn AuthzStore,
    org: Uuid,
    role_id: Uuid,
    collected: &mut HashSet<Uuid>,
) -> Result<(), AppError> {
    let mut current = Some(role_id);
    let mut depth: u8 = 0;

    while let Some(id) = current {
        if !collected.insert(id) {
            // Already collected via another assignment; ancestors are too.
            return Ok(());
        }
        let role = store
            .role(org, id)
            .await?
            // An assignment pointing at a role outside this organization is
            // prevented at write time; seeing one is an invariant breach.
            .ok_or(AppError::TenancyViolation)?;
        if depth >= MAX_ROLE_DEPTH {
            tracing::error!(role_id = %id, "role chain exceeds depth bound, truncating");
            return Ok(());
        }
        depth += 1;
        current = role.parent_role_id;
    }
    Ok(())
}
