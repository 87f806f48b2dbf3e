use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

use guardrail::audit::{AuditSink, BufferedAuditSink, PgAuditSink};
use guardrail::config::{self, StoreBackend};
use guardrail::keys::{KeyRotationService, PgKeyStore, PgRecordStore};
use guardrail::ratelimit::{DistributedRateLimiter, MemoryWindowStore, RedisWindowStore, WindowStore};
use guardrail::redis_pool::RedisPool;
use guardrail::scheduler::{
    ConcurrencyGate, MemoryConcurrencyGate, RedisConcurrencyGate, RotationScheduler,
};
use guardrail::{router, AppServices, SecurityConfig};

const AUDIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

async fn root() -> &'static str {
    "Guardrail"
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret or the key encryption key is missing
    let _ = config::JWT_SECRET.as_str();
    let master_key = match config::master_key_from_env() {
        Ok(key) => key,
        Err(error) => {
            tracing::error!(%error, "key encryption key rejected");
            return Err(error.into());
        }
    };
    let security = SecurityConfig::from_env().context("invalid security configuration")?;
    tracing::info!(
        environment = %security.environment,
        failure_mode = security.rate_limit.failure_mode.as_str(),
        store_backend = ?security.store_backend,
        "security configuration loaded"
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await
        .context("failed to connect to postgres")?;

    if let Err(error) = sqlx::migrate!("./migrations").run(&pool).await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(
                ?error,
                "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
            );
        } else {
            return Err(error.into());
        }
    }

    let (windows, gate): (Arc<dyn WindowStore>, Arc<dyn ConcurrencyGate>) =
        match security.store_backend {
            StoreBackend::Redis => {
                let redis = Arc::new(RedisPool::open(
                    config::REDIS_URL.as_str(),
                    security.rate_limit.store_timeout,
                )?);
                (
                    Arc::new(RedisWindowStore::new(redis.clone())),
                    Arc::new(RedisConcurrencyGate::new(
                        redis,
                        &security.rate_limit.key_prefix,
                    )),
                )
            }
            StoreBackend::Memory => {
                tracing::warn!("in-memory stores selected; limits and rotation slots are not shared across instances");
                (
                    Arc::new(MemoryWindowStore::new()),
                    Arc::new(MemoryConcurrencyGate::new()),
                )
            }
        };

    let audit: Arc<dyn AuditSink> = Arc::new(PgAuditSink::new(pool.clone()));
    // Denials are recorded off the request path.
    let (denial_audit, audit_writer) =
        BufferedAuditSink::spawn(audit.clone(), security.rate_limit.audit_buffer);
    let limiter = Arc::new(DistributedRateLimiter::new(
        windows,
        denial_audit.clone(),
        security.rate_limit.clone(),
    ));
    let keys = Arc::new(KeyRotationService::new(
        Arc::new(PgKeyStore::new(pool.clone(), master_key)),
        Arc::new(PgRecordStore::new(pool.clone())),
        audit.clone(),
        security.rotation.clone(),
    ));
    let created = keys
        .ensure_initialized(Utc::now())
        .await
        .context("failed to initialize key material")?;
    if !created.is_empty() {
        tracing::info!(count = created.len(), "initial keys created");
    }

    let scheduler = Arc::new(RotationScheduler::new(
        keys.clone(),
        gate,
        audit.clone(),
        security.scheduler.clone(),
    ));
    let scheduler_handle = scheduler.spawn()?;

    let services = AppServices {
        limiter,
        keys,
        scheduler,
        audit,
    };
    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(router(&services))
        .layer(prometheus_layer);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .context("invalid bind address")?;
    tracing::info!(%addr, "Listening for incoming connections");
    let served = axum::Server::bind(&addr)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await;
    if let Err(error) = &served {
        tracing::error!(%error, "server stopped with an error");
    }

    scheduler_handle.shutdown().await;
    denial_audit.close();
    if tokio::time::timeout(AUDIT_DRAIN_TIMEOUT, audit_writer).await.is_err() {
        tracing::warn!(
            dropped = denial_audit.dropped(),
            "audit writer did not drain before shutdown"
        );
    }
    served?;
    Ok(())
}
