use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Authenticated subject, scoped to exactly one organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Unique within the organization when present.
    pub email: Option<String>,
    /// The IdP `sub` claim. Set at most once per user and never reused.
    pub external_subject_id: Option<String>,
    pub status: UserStatus,
    /// Free-form attribute bag.
    pub attributes: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_active(&self) -> bool {
        self.status == UserStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Inactive,
    Suspended,
    Deleted,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Active => "active",
            UserStatus::Inactive => "inactive",
            UserStatus::Suspended => "suspended",
            UserStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "inactive" => UserStatus::Inactive,
            "suspended" => UserStatus::Suspended,
            "deleted" => UserStatus::Deleted,
            _ => UserStatus::Active,
        }
    }
}

/// Input for user creation, admin-driven or just-in-time.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub organization_id: Uuid,
    pub email: Option<String>,
    pub external_subject_id: Option<String>,
    pub attributes: serde_json::Value,
}
