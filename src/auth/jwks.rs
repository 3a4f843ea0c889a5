//! JWK keystore: fetches and caches the identity provider's public keys.
//!
//! Keys are indexed by `kid` and retained for a configurable TTL (default
//! 1 hour). Verification failures on an unknown `kid` trigger exactly one
//! refresh; concurrent refreshes collapse into a single in-flight fetch.

use std::sync::RwLock;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use jsonwebtoken::DecodingKey;
use serde::Deserialize;

use crate::errors::AppError;

/// JSON Web Key Set.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: Option<String>,
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    pub alg: Option<String>,
    pub n: Option<String>,
    pub e: Option<String>,
}

pub struct JwkKeystore {
    url: String,
    ttl: Duration,
    http: reqwest::Client,
    keys: DashMap<String, DecodingKey>,
    fetched_at: RwLock<Option<Instant>>,
    refresh: tokio::sync::Mutex<()>,
}

impl JwkKeystore {
    pub fn new(url: String, ttl: Duration, fetch_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .build()
            .unwrap_or_default();
        Self {
            url,
            ttl,
            http,
            keys: DashMap::new(),
            fetched_at: RwLock::new(None),
            refresh: tokio::sync::Mutex::new(()),
        }
    }

    /// Verifier for `kid`. A miss (or a stale key set) triggers one
    /// single-flight refresh; a `kid` still unknown after that fails the
    /// verification.
    pub async fn decoding_key(&self, kid: &str) -> Result<DecodingKey, AppError> {
        if self.is_fresh() {
            if let Some(key) = self.keys.get(kid) {
                return Ok(key.clone());
            }
        }
        self.refresh_once().await?;
        self.keys
            .get(kid)
            .map(|k| k.clone())
            .ok_or(AppError::JwtSignatureInvalid)
    }

    fn is_fresh(&self) -> bool {
        self.fetched_at
            .read()
            .unwrap()
            .map(|at| at.elapsed() < self.ttl)
            .unwrap_or(false)
    }

    /// Single-flight: the first caller fetches, everyone queued behind the
    /// lock re-checks freshness and skips the network round trip.
    async fn refresh_once(&self) -> Result<(), AppError> {
        let _flight = self.refresh.lock().await;
        if let Some(at) = *self.fetched_at.read().unwrap() {
            if at.elapsed() < Duration::from_secs(1) {
                return Ok(());
            }
        }

        tracing::info!(jwks_url = %self.url, "fetching JWK set");
        let jwks: Jwks = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("jwks fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("jwks parse failed: {e}")))?;

        self.keys.clear();
        for jwk in &jwks.keys {
            if let Some(key) = decoding_key_for(jwk) {
                if let Some(kid) = &jwk.kid {
                    self.keys.insert(kid.clone(), key);
                }
            }
        }
        *self.fetched_at.write().unwrap() = Some(Instant::now());
        tracing::debug!(count = self.keys.len(), "JWK set refreshed");
        Ok(())
    }

    #[cfg(test)]
    fn known_kids(&self) -> Vec<String> {
        self.keys.iter().map(|e| e.key().clone()).collect()
    }
}

fn decoding_key_for(jwk: &Jwk) -> Option<DecodingKey> {
    if jwk.kty != "RSA" {
        return None;
    }
    if let Some(key_use) = &jwk.key_use {
        if key_use != "sig" {
            return None;
        }
    }
    let (n, e) = (jwk.n.as_deref()?, jwk.e.as_deref()?);
    DecodingKey::from_rsa_components(n, e).ok()
}

/// Key id from the JWT header, without verifying anything.
pub fn extract_kid(token: &str) -> Option<String> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return None;
    }

    use base64::Engine;
    let engine = base64::engine::general_purpose::URL_SAFE_NO_PAD;
    let header_bytes = engine.decode(parts[0]).ok()?;
    let header: serde_json::Value = serde_json::from_slice(&header_bytes).ok()?;
    header.get("kid").and_then(|v| v.as_str()).map(String::from)
}
