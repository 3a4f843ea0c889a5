//! API key strategy. Keys are issued as `azk_<uuid>` and stored as SHA-256
//! hashes; the raw key never touches storage or logs.

use std::sync::Arc;

use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::decision::PrincipalType;
use crate::store::AuthzStore;

use super::Principal;

/// Role granted to every API-key principal.
pub const API_CLIENT_ROLE: &str = "API_CLIENT";

pub struct ApiKeyAuthenticator {
    store: Arc<dyn AuthzStore>,
}

impl ApiKeyAuthenticator {
    pub fn new(store: Arc<dyn AuthzStore>) -> Self {
        Self { store }
    }

    pub async fn authenticate(&self, raw_key: &str) -> Result<Principal, AppError> {
        let hash = hash_key(raw_key);
        let record = self
            .store
            .api_key_by_hash(&hash)
            .await?
            .ok_or_else(|| {
                tracing::warn!(key = %mask_key(raw_key), "unknown api key");
                AppError::ApiKeyUnknown
            })?;

        // The lookup was by hash; re-compare in constant time anyway.
        if record.key_hash.as_bytes().ct_eq(hash.as_bytes()).unwrap_u8() != 1 {
            return Err(AppError::ApiKeyUnknown);
        }

        Ok(Principal {
            id: record.id.to_string(),
            principal_type: PrincipalType::Service,
            organization_id: record.organization_id,
            roles: vec![API_CLIENT_ROLE.to_string()],
            rate_key: raw_key.to_string(),
        })
    }
}

pub fn hash_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fresh key material for issuance. Returns (raw, hash); only the hash is
/// persisted.
pub fn generate_key() -> (String, String) {
    let raw = format!("azk_{}", Uuid::new_v4().simple());
    let hash = hash_key(&raw);
    (raw, hash)
}

/// For logs: first 8 characters, rest elided.
pub fn mask_key(raw_key: &str) -> String {
    let visible: String = raw_key.chars().take(8).collect();
    format!("{visible}…")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn known_key_resolves_to_service_principal() {
        let store = Arc::new(MemoryStore::new());
        let org = store.create_organization("acme").await.unwrap().id;
        let (raw, hash) = generate_key();
        let record = store.insert_api_key(org, "ci-bot", &hash).await.unwrap();

        let auth = ApiKeyAuthenticator::new(store);
        let principal = auth.authenticate(&raw).await.unwrap();
        assert_eq!(principal.organization_id, org);
        assert_eq!(principal.id, record.id.to_string());
        assert_eq!(principal.principal_type, PrincipalType::Service);
        assert_eq!(principal.roles, vec![API_CLIENT_ROLE.to_string()]);
    }

    #[tokio::test]
    async fn unknown_key_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let auth = ApiKeyAuthenticator::new(store);
        let err = auth.authenticate("azk_does_not_exist").await.unwrap_err();
        assert!(matches!(err, AppError::ApiKeyUnknown));
    }

    #[test]
    fn generated_keys_are_prefixed_and_hashed() {
        let (raw, hash) = generate_key();
        assert!(raw.starts_with("azk_"));
        assert_eq!(hash, hash_key(&raw));
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn masked_key_hides_the_tail() {
        let masked = mask_key("azk_0123456789abcdef");
        assert_eq!(masked, "azk_0123…");
        assert!(!masked.contains("456789abcdef"));
    }
}
