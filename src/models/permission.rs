use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// (resourceType, action, effect) triple scoped to an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub resource_type: String,
    pub action: String,
    pub effect: PermissionEffect,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn matches(&self, resource_type: &str, action: &str) -> bool {
        self.resource_type == resource_type && self.action == action
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionEffect {
    Allow,
    Deny,
}

impl PermissionEffect {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionEffect::Allow => "allow",
            PermissionEffect::Deny => "deny",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "deny" => PermissionEffect::Deny,
            _ => PermissionEffect::Allow,
        }
    }
}
