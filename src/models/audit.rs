use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit record. Partitioned by timestamp month in storage;
/// never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// e.g. "authz.decision", "role.assign", "auth.failure"
    pub event_type: String,
    /// User id or principal identifier (API key id, JWT subject).
    pub actor: String,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub action: Option<String>,
    pub decision: AuditDecision,
    pub decision_reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Non-reversible hash of the request. The raw request is never stored.
    pub request_digest: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditDecision {
    Allow,
    Deny,
    Error,
    Success,
    Failure,
}

impl AuditDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditDecision::Allow => "allow",
            AuditDecision::Deny => "deny",
            AuditDecision::Error => "error",
            AuditDecision::Success => "success",
            AuditDecision::Failure => "failure",
        }
    }
}

impl AuditRecord {
    /// Record for one authorization decision.
    pub fn decision(
        organization_id: Uuid,
        actor: String,
        resource_type: String,
        resource_id: String,
        action: String,
        allowed: bool,
        reason: String,
        request_digest: String,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            event_type: "authz.decision".to_string(),
            actor,
            resource_type: Some(resource_type),
            resource_id: Some(resource_id),
            action: Some(action),
            decision: if allowed {
                AuditDecision::Allow
            } else {
                AuditDecision::Deny
            },
            decision_reason: Some(reason),
            ip_address: None,
            user_agent: None,
            request_digest: Some(request_digest),
            timestamp: Utc::now(),
        }
    }

    /// Record for an administrative mutation.
    pub fn admin(
        organization_id: Uuid,
        actor: String,
        event_type: &str,
        resource_type: &str,
        resource_id: String,
        ok: bool,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id,
            event_type: event_type.to_string(),
            actor,
            resource_type: Some(resource_type.to_string()),
            resource_id: Some(resource_id),
            action: None,
            decision: if ok {
                AuditDecision::Success
            } else {
                AuditDecision::Failure
            },
            decision_reason: None,
            ip_address: None,
            user_agent: None,
            request_digest: None,
            timestamp: Utc::now(),
        }
    }

    /// Record for a credential-related failure.
    pub fn auth_failure(organization_id: Option<Uuid>, kind: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.unwrap_or(Uuid::nil()),
            event_type: "auth.failure".to_string(),
            actor: "anonymous".to_string(),
            resource_type: None,
            resource_id: None,
            action: None,
            decision: AuditDecision::Failure,
            decision_reason: Some(kind.to_string()),
            ip_address: None,
            user_agent: None,
            request_digest: None,
            timestamp: Utc::now(),
        }
    }
}
