use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// One authorization question: may `principal` perform `action` on `resource`?
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub organization_id: Uuid,
    pub principal: PrincipalRef,
    pub action: String,
    pub resource: ResourceRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrincipalRef {
    pub id: String,
    #[serde(rename = "type")]
    pub principal_type: PrincipalType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attributes: Option<serde_json::Map<String, serde_json::Value>>,
}

/// The answer, with enough reasoning to act on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationResponse {
    pub decision: Decision,
    pub reason: String,
    pub evaluated_policies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    pub latency_ms: f64,
    pub cached: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl DecisionRequest {
    /// Rejects requests with empty top-level fields before any state is
    /// consulted.
    pub fn validate(&self) -> Result<(), String> {
        if self.organization_id.is_nil() {
            return Err("organizationId must be a non-nil uuid".to_string());
        }
        if self.principal.id.trim().is_empty() {
            return Err("principal.id must be non-empty".to_string());
        }
        if self.action.trim().is_empty() {
            return Err("action must be non-empty".to_string());
        }
        if self.resource.resource_type.trim().is_empty() {
            return Err("resource.type must be non-empty".to_string());
        }
        if self.resource.id.trim().is_empty() {
            return Err("resource.id must be non-empty".to_string());
        }
        Ok(())
    }

    /// Deterministic cache key: `org:principal:action:resourceType:resourceId`,
    /// optionally extended with context keys in sorted order. Context folding
    /// is off by default; a deployment that lets policies evaluate context
    /// must turn it on or cached decisions can go stale.
    pub fn fingerprint(&self, fold_context: bool) -> String {
        let mut key = format!(
            "{}:{}:{}:{}:{}",
            self.organization_id,
            self.principal.id,
            self.action,
            self.resource.resource_type,
            self.resource.id
        );
        if fold_context {
            if let Some(ctx) = &self.context {
                let mut keys: Vec<&String> = ctx.keys().collect();
                keys.sort();
                for k in keys {
                    let v = serde_json::to_string(&ctx[k.as_str()]).unwrap_or_default();
                    key.push_str(&format!(":{}={}", k, v));
                }
            }
        }
        key
    }

    /// Non-reversible digest of the full request, recorded in audit rows.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}
