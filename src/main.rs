use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;

use authzd::api;
use authzd::audit::AuditPipeline;
use authzd::auth::{api_key, jwks::JwkKeystore, ApiKeyAuthenticator, CredentialResolver, JwtAuthenticator};
use authzd::authz::breaker::CircuitBreakerConfig;
use authzd::authz::engine::{DecisionEngine, EngineConfig};
use authzd::authz::gateway::PolicyEngineClient;
use authzd::cache::DecisionCache;
use authzd::config::{self, Config};
use authzd::models::user::NewUser;
use authzd::rate_limit::RateLimiter;
use authzd::store::postgres::PgStore;
use authzd::store::AuthzStore;
use authzd::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "authzd=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Org { command }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            handle_org_command(&store, command).await
        }
        Some(cli::Commands::User { command }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            handle_user_command(&store, command).await
        }
        Some(cli::Commands::ApiKey { command }) => {
            let store = PgStore::connect(&cfg.database_url).await?;
            handle_apikey_command(&store, command).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let store = Arc::new(PgStore::connect(&cfg.database_url).await?);

    tracing::info!("Running migrations...");
    store.migrate().await?;

    tracing::info!("Connecting to Redis...");
    let redis_client = redis::Client::open(cfg.redis_url.as_str())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;

    let cache = Arc::new(DecisionCache::new(
        Some(redis_conn),
        cfg.cache_l1_capacity,
        Duration::from_secs(cfg.cache_l1_ttl_secs),
        Duration::from_secs(cfg.cache_l2_ttl_secs),
        Duration::from_millis(cfg.cache_l2_timeout_ms),
    ));

    let keystore = Arc::new(JwkKeystore::new(
        cfg.jwks_url.clone(),
        Duration::from_secs(cfg.jwks_ttl_secs),
        Duration::from_millis(cfg.jwks_timeout_ms),
    ));
    let resolver = CredentialResolver::new(
        JwtAuthenticator::new(
            keystore,
            cfg.jwt_issuer.clone(),
            cfg.jwt_audience.clone(),
            store.clone(),
        ),
        ApiKeyAuthenticator::new(store.clone()),
    );

    let policy = Arc::new(PolicyEngineClient::new(
        cfg.policy_engine_url.clone(),
        Duration::from_millis(cfg.policy_engine_timeout_ms),
        CircuitBreakerConfig::default(),
    ));

    let audit = AuditPipeline::spawn(
        store.clone(),
        cfg.audit_queue_capacity,
        cfg.audit_workers,
        cfg.audit_batch_size,
        Duration::from_millis(cfg.audit_flush_interval_ms),
    );

    let engine = DecisionEngine::new(
        store.clone(),
        cache,
        policy,
        audit.clone(),
        EngineConfig {
            fingerprint_context: cfg.fingerprint_context,
            policy_fail_open: cfg.policy_fail_open,
            request_deadline: Duration::from_millis(cfg.request_deadline_ms),
            storage_timeout: Duration::from_millis(cfg.storage_timeout_ms),
        },
    );

    let rate_limiter = RateLimiter::new(
        cfg.rate_limit_capacity,
        cfg.rate_limit_refill,
        Duration::from_secs(cfg.rate_limit_period_secs),
    );

    let state = Arc::new(AppState {
        resolver,
        engine,
        rate_limiter,
        audit,
    });

    let app = api::router(state)
        .fallback(api::not_found)
        .layer(DefaultBodyLimit::max(1024 * 1024))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(request_id_middleware));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("authzd listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response so
/// clients can correlate errors with server logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn handle_org_command(store: &PgStore, cmd: cli::OrgCommands) -> anyhow::Result<()> {
    match cmd {
        cli::OrgCommands::Create { name } => {
            let org = store
                .create_organization(&name)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!("Organization created:\n  Name: {}\n  ID:   {}", org.name, org.id);
        }
    }
    Ok(())
}

async fn handle_user_command(store: &PgStore, cmd: cli::UserCommands) -> anyhow::Result<()> {
    match cmd {
        cli::UserCommands::Create { org_id, email } => {
            let org = org_id.parse().context("Invalid org_id")?;
            let user = store
                .create_user(NewUser {
                    organization_id: org,
                    email: Some(email),
                    external_subject_id: None,
                    attributes: serde_json::json!({}),
                })
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "User created:\n  Email: {}\n  ID:    {}",
                user.email.as_deref().unwrap_or("-"),
                user.id
            );
        }
    }
    Ok(())
}

async fn handle_apikey_command(store: &PgStore, cmd: cli::ApiKeyCommands) -> anyhow::Result<()> {
    match cmd {
        cli::ApiKeyCommands::Issue { org_id, name } => {
            let org = org_id.parse().context("Invalid org_id")?;
            let (raw, hash) = api_key::generate_key();
            let key = store
                .insert_api_key(org, &name, &hash)
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
            println!(
                "API key issued:\n  Name: {}\n  ID:   {}\n  Key:  {}\n  Use:  X-API-Key: {}",
                key.name, key.id, raw, raw
            );
            println!("Store the key now; only its hash is kept.");
        }
    }
    Ok(())
}
