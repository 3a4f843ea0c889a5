use uuid::Uuid;

use crate::auth::Principal;
use crate::errors::AppError;

/// Per-request tenant context, threaded explicitly through every call in
/// the request lifetime. The storage layer derives its tenant predicate
/// from this value; nothing reads tenant identity from ambient state.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub organization_id: Uuid,
    /// User id or API key id of the authenticated actor.
    pub principal_id: String,
}

impl RequestContext {
    pub fn new(organization_id: Uuid, principal_id: impl Into<String>) -> Self {
        Self {
            organization_id,
            principal_id: principal_id.into(),
        }
    }

    pub fn for_principal(principal: &Principal) -> Self {
        Self {
            organization_id: principal.organization_id,
            principal_id: principal.id.clone(),
        }
    }

    /// The authenticated tenant must equal the tenant named in the request.
    /// Nothing else (roles, policies, caches) is consulted on mismatch.
    pub fn require_tenant(&self, requested: Uuid) -> Result<(), AppError> {
        if self.organization_id != requested {
            return Err(AppError::CrossTenantRequest);
        }
        Ok(())
    }
}
