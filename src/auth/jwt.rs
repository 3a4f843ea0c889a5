//! Bearer JWT strategy. Signature under a JWKS key, issuer/audience/expiry
//! checks with ≤30s clock skew, the required `organization_id` claim, and
//! just-in-time user provisioning.

use std::sync::Arc;

use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::decision::PrincipalType;
use crate::models::user::{NewUser, User};
use crate::store::AuthzStore;

use super::jwks::{extract_kid, JwkKeystore};
use super::Principal;

const CLOCK_SKEW_SECS: u64 = 30;

/// Claims consumed from a validated token. `iss`/`aud`/`exp`/`nbf` are
/// checked by the verifier itself; these fields carry the identity.
#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: Option<String>,
    pub email: Option<String>,
    pub organization_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

pub struct JwtAuthenticator {
    keystore: Arc<JwkKeystore>,
    issuer: String,
    audience: String,
    store: Arc<dyn AuthzStore>,
}

impl JwtAuthenticator {
    pub fn new(
        keystore: Arc<JwkKeystore>,
        issuer: String,
        audience: String,
        store: Arc<dyn AuthzStore>,
    ) -> Self {
        Self {
            keystore,
            issuer,
            audience,
            store,
        }
    }

    pub async fn authenticate(&self, token: &str) -> Result<Principal, AppError> {
        let kid = extract_kid(token).ok_or(AppError::JwtSignatureInvalid)?;
        let key = self.keystore.decoding_key(&kid).await?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.validate_nbf = true;
        validation.set_audience(&[&self.audience]);
        validation.set_issuer(&[&self.issuer]);

        let claims = verify_token(token, &key, &validation)?;
        let organization_id = organization_claim(&claims)?;

        let user = provision_user(
            self.store.as_ref(),
            organization_id,
            claims.sub.as_deref(),
            claims.email.as_deref(),
        )
        .await?;

        let rate_key = claims.sub.clone().unwrap_or_else(|| user.id.to_string());
        Ok(Principal {
            id: user.id.to_string(),
            principal_type: PrincipalType::User,
            organization_id,
            roles: claims.roles,
            rate_key,
        })
    }
}

/// Decode and validate; translates the verifier's failure modes into the
/// stable error kinds. Only the kind is ever logged, never the token.
pub(crate) fn verify_token(
    token: &str,
    key: &DecodingKey,
    validation: &Validation,
) -> Result<Claims, AppError> {
    jsonwebtoken::decode::<Claims>(token, key, validation)
        .map(|data| data.claims)
        .map_err(map_jwt_error)
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> AppError {
    use jsonwebtoken::errors::ErrorKind;
    match err.kind() {
        ErrorKind::ExpiredSignature => AppError::JwtExpired,
        ErrorKind::InvalidAudience => AppError::JwtAudienceMismatch,
        ErrorKind::InvalidIssuer => AppError::JwtIssuerMismatch,
        ErrorKind::MissingRequiredClaim(name) => match name.as_str() {
            "exp" => AppError::JwtMissingClaim("exp"),
            "aud" => AppError::JwtMissingClaim("aud"),
            "iss" => AppError::JwtMissingClaim("iss"),
            _ => AppError::JwtSignatureInvalid,
        },
        _ => AppError::JwtSignatureInvalid,
    }
}

fn organization_claim(claims: &Claims) -> Result<Uuid, AppError> {
    let raw = claims
        .organization_id
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or(AppError::JwtMissingClaim("organization_id"))?;
    raw.parse()
        .map_err(|_| AppError::JwtMissingClaim("organization_id"))
}

/// Resolve or create the user behind a validated token:
/// match by subject; failing that, match by email and attach the subject;
/// failing that, create an active user.
pub(crate) async fn provision_user(
    store: &dyn AuthzStore,
    organization_id: Uuid,
    subject: Option<&str>,
    email: Option<&str>,
) -> Result<User, AppError> {
    if let Some(sub) = subject {
        if let Some(user) = store.user_by_subject(sub).await? {
            if user.organization_id != organization_id {
                return Err(AppError::TenancyViolation);
            }
            return Ok(user);
        }
    }

    if let Some(email) = email {
        if let Some(user) = store.user_by_email(organization_id, email).await? {
            if let Some(sub) = subject {
                store
                    .attach_external_subject(organization_id, user.id, sub)
                    .await?;
            }
            return Ok(user);
        }
    }

    let user = store
        .create_user(NewUser {
            organization_id,
            email: email.map(String::from),
            external_subject_id: subject.map(String::from),
            attributes: serde_json::json!({}),
        })
        .await?;
    tracing::info!(user_id = %user.id, org_id = %organization_id, "user provisioned just-in-time");
    Ok(user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims {
        iss: String,
        aud: String,
        exp: i64,
        #[serde(skip_serializing_if = "Option::is_none")]
        nbf: Option<i64>,
        sub: String,
        organization_id: String,
    }

    const SECRET: &[u8] = b"unit-test-secret";

    fn sign(claims: &TestClaims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(SECRET),
        )
        .unwrap()
    }

    fn hs_validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = CLOCK_SKEW_SECS;
        validation.validate_nbf = true;
        validation.set_audience(&["authzd"]);
        validation.set_issuer(&["https://idp.example.com"]);
        validation
    }

    fn base_claims() -> TestClaims {
        TestClaims {
            iss: "https://idp.example.com".to_string(),
            aud: "authzd".to_string(),
            exp: chrono::Utc::now().timestamp() + 600,
            nbf: None,
            sub: "idp|u-1".to_string(),
            organization_id: Uuid::new_v4().to_string(),
        }
    }

    fn decode_hs(token: &str) -> Result<Claims, AppError> {
        verify_token(token, &DecodingKey::from_secret(SECRET), &hs_validation())
    }

    #[test]
    fn valid_token_yields_claims() {
        let claims = decode_hs(&sign(&base_claims())).unwrap();
        assert_eq!(claims.sub.as_deref(), Some("idp|u-1"));
        assert!(claims.organization_id.is_some());
    }

    #[test]
    fn expired_token_maps_to_jwt_expired() {
        let mut c = base_claims();
        c.exp = chrono::Utc::now().timestamp() - 120;
        assert!(matches!(decode_hs(&sign(&c)), Err(AppError::JwtExpired)));
    }

    #[test]
    fn expiry_within_clock_skew_is_tolerated() {
        let mut c = base_claims();
        c.exp = chrono::Utc::now().timestamp() - 10;
        assert!(decode_hs(&sign(&c)).is_ok());
    }

    #[test]
    fn wrong_audience_maps_to_audience_mismatch() {
        let mut c = base_claims();
        c.aud = "someone-else".to_string();
        assert!(matches!(
            decode_hs(&sign(&c)),
            Err(AppError::JwtAudienceMismatch)
        ));
    }

    #[test]
    fn wrong_issuer_maps_to_issuer_mismatch() {
        let mut c = base_claims();
        c.iss = "https://evil.example.com".to_string();
        assert!(matches!(
            decode_hs(&sign(&c)),
            Err(AppError::JwtIssuerMismatch)
        ));
    }

    #[test]
    fn future_nbf_is_rejected() {
        let mut c = base_claims();
        c.nbf = Some(chrono::Utc::now().timestamp() + 600);
        assert!(matches!(
            decode_hs(&sign(&c)),
            Err(AppError::JwtSignatureInvalid)
        ));
    }

    #[test]
    fn garbage_signature_is_rejected() {
        let mut token = sign(&base_claims());
        token.push_str("AAAA");
        assert!(matches!(
            decode_hs(&token),
            Err(AppError::JwtSignatureInvalid)
        ));
    }

    #[test]
    fn empty_organization_claim_is_missing() {
        let claims = Claims {
            sub: None,
            email: None,
            organization_id: Some("  ".to_string()),
            roles: vec![],
        };
        assert!(matches!(
            organization_claim(&claims),
            Err(AppError::JwtMissingClaim("organization_id"))
        ));
    }

    #[tokio::test]
    async fn provisioning_creates_user_on_first_login() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme").await.unwrap().id;

        let user = provision_user(&store, org, Some("idp|42"), Some("ada@example.com"))
            .await
            .unwrap();
        assert_eq!(user.organization_id, org);
        assert_eq!(user.external_subject_id.as_deref(), Some("idp|42"));

        // Second login resolves the same user, no duplicate.
        let again = provision_user(&store, org, Some("idp|42"), Some("ada@example.com"))
            .await
            .unwrap();
        assert_eq!(again.id, user.id);
    }

    #[tokio::test]
    async fn provisioning_attaches_subject_to_existing_email() {
        let store = MemoryStore::new();
        let org = store.create_organization("acme").await.unwrap().id;
        let existing = store
            .create_user(NewUser {
                organization_id: org,
                email: Some("ada@example.com".to_string()),
                external_subject_id: None,
                attributes: serde_json::json!({}),
            })
            .await
            .unwrap();

        let user = provision_user(&store, org, Some("idp|42"), Some("ada@example.com"))
            .await
            .unwrap();
        assert_eq!(user.id, existing.id);

        let linked = store.user_by_subject("idp|42").await.unwrap().unwrap();
        assert_eq!(linked.id, existing.id);
    }

    #[tokio::test]
    async fn subject_in_wrong_organization_is_a_tenancy_violation() {
        let store = MemoryStore::new();
        let org_a = store.create_organization("acme").await.unwrap().id;
        let org_b = store.create_organization("globex").await.unwrap().id;
        provision_user(&store, org_a, Some("idp|42"), None)
            .await
            .unwrap();

        let err = provision_user(&store, org_b, Some("idp|42"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TenancyViolation));
    }
}
