use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,

    /// Expected `iss` claim on bearer tokens.
    pub jwt_issuer: String,
    /// Expected `aud` claim on bearer tokens.
    pub jwt_audience: String,
    /// JWK Set endpoint of the identity provider.
    pub jwks_url: String,
    /// Budget for one JWKS fetch, in milliseconds.
    pub jwks_timeout_ms: u64,
    /// How long fetched keys are retained.
    pub jwks_ttl_secs: u64,

    /// External policy evaluator endpoint.
    pub policy_engine_url: String,
    pub policy_engine_timeout_ms: u64,
    /// When true, an unreachable policy engine yields ALLOW instead of DENY.
    /// Default false (fail-closed).
    pub policy_fail_open: bool,

    /// L1 decision cache soft TTL in seconds.
    pub cache_l1_ttl_secs: u64,
    /// L1 decision cache capacity (entries).
    pub cache_l1_capacity: usize,
    /// L2 (Redis) decision cache TTL in seconds.
    pub cache_l2_ttl_secs: u64,
    pub cache_l2_timeout_ms: u64,
    /// Fold context attributes into the decision fingerprint.
    pub fingerprint_context: bool,

    /// Token bucket capacity per credential.
    pub rate_limit_capacity: u64,
    /// Tokens refilled per period.
    pub rate_limit_refill: u64,
    /// Refill period in seconds.
    pub rate_limit_period_secs: u64,

    pub audit_queue_capacity: usize,
    pub audit_workers: usize,
    pub audit_batch_size: usize,
    pub audit_flush_interval_ms: u64,

    /// Hard ceiling for one inbound request, in milliseconds.
    pub request_deadline_ms: u64,
    pub storage_timeout_ms: u64,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let jwt_issuer = env_or("AUTHZD_JWT_ISSUER", "");
    if jwt_issuer.is_empty() {
        let env_mode = std::env::var("AUTHZD_ENV").unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "AUTHZD_JWT_ISSUER is not set. Bearer authentication cannot \
                 verify tokens without a configured issuer."
            );
        }
        eprintln!("AUTHZD_JWT_ISSUER is not set; bearer tokens will be rejected.");
    }

    Ok(Config {
        port: env_parsed("AUTHZD_PORT", 8443),
        database_url: env_or("DATABASE_URL", "postgres://localhost/authzd"),
        redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
        jwt_issuer,
        jwt_audience: env_or("AUTHZD_JWT_AUDIENCE", "authzd"),
        jwks_url: env_or("AUTHZD_JWKS_URL", ""),
        jwks_timeout_ms: env_parsed("AUTHZD_JWKS_TIMEOUT_MS", 50),
        jwks_ttl_secs: env_parsed("AUTHZD_JWKS_TTL_SECS", 3600),
        policy_engine_url: env_or(
            "AUTHZD_POLICY_ENGINE_URL",
            "http://127.0.0.1:8181/v1/data/authz",
        ),
        policy_engine_timeout_ms: env_parsed("AUTHZD_POLICY_ENGINE_TIMEOUT_MS", 50),
        policy_fail_open: env_parsed("AUTHZD_POLICY_FAIL_OPEN", false),
        cache_l1_ttl_secs: env_parsed("AUTHZD_CACHE_L1_TTL_SECS", 10),
        cache_l1_capacity: env_parsed("AUTHZD_CACHE_L1_CAPACITY", 100_000),
        cache_l2_ttl_secs: env_parsed("AUTHZD_CACHE_L2_TTL_SECS", 300),
        cache_l2_timeout_ms: env_parsed("AUTHZD_CACHE_L2_TIMEOUT_MS", 20),
        fingerprint_context: env_parsed("AUTHZD_FINGERPRINT_CONTEXT", false),
        rate_limit_capacity: env_parsed("AUTHZD_RATE_LIMIT_CAPACITY", 100),
        rate_limit_refill: env_parsed("AUTHZD_RATE_LIMIT_REFILL", 100),
        rate_limit_period_secs: env_parsed("AUTHZD_RATE_LIMIT_PERIOD_SECS", 1),
        audit_queue_capacity: env_parsed("AUTHZD_AUDIT_QUEUE_CAPACITY", 10_000),
        audit_workers: env_parsed("AUTHZD_AUDIT_WORKERS", 2),
        audit_batch_size: env_parsed("AUTHZD_AUDIT_BATCH_SIZE", 128),
        audit_flush_interval_ms: env_parsed("AUTHZD_AUDIT_FLUSH_INTERVAL_MS", 250),
        request_deadline_ms: env_parsed("AUTHZD_REQUEST_DEADLINE_MS", 200),
        storage_timeout_ms: env_parsed("AUTHZD_STORAGE_TIMEOUT_MS", 50),
    })
}
