//! Carrier request queue service.
//!
//! Main entry point. Initializes the durable store, the redis queue
//! index, and the dispatch engine, then runs until a shutdown signal
//! arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use carrier_core::RealClock;
use carrier_queue::{
    PostgresQueueStorage, QueueConfig, QueueEngine, RateLimiterConfig, RedisIndexStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("starting carrier request queue service");

    let config = Config::from_env()?;
    info!(
        database_url = %config.database_url_masked(),
        redis_url = %config.redis_url,
        worker_count = config.worker_count,
        max_concurrency = config.max_concurrency,
        "configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("database connection pool established");

    run_migrations(&db_pool).await?;
    info!("database migrations completed");

    let storage = Arc::new(carrier_core::storage::Storage::new(db_pool.clone()));
    let index = Arc::new(
        RedisIndexStore::connect(&config.redis_url, config.key_prefix.clone())
            .await
            .context("failed to connect to redis index store")?,
    );

    let queue_config = config.to_queue_config();
    let engine = QueueEngine::new(
        index,
        Arc::new(PostgresQueueStorage::new(storage)),
        queue_config,
        Arc::new(RealClock),
    )
    .context("failed to construct queue engine")?;

    engine.start().await.context("failed to start queue engine")?;
    info!("carrier is ready to dispatch requests");

    shutdown_signal().await;
    info!("shutdown signal received, starting graceful shutdown");

    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "engine shutdown reported an error");
    }

    db_pool.close().await;
    info!("carrier shutdown complete");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,carrier=debug"))
        .expect("invalid RUST_LOG environment variable");

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    let mut retries = 0;

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(2)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(600))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("failed to verify database connection")?;

                return Ok(pool);
            },
            Err(_e) if retries < MAX_RETRIES => {
                retries += 1;
                info!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    "database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("failed to create database connection pool after retries");
            },
        }
    }
}

/// Ensures the schema exists. Idempotent.
async fn run_migrations(pool: &sqlx::PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS requests (
            id TEXT PRIMARY KEY,
            url TEXT NOT NULL,
            method TEXT NOT NULL,
            headers JSONB NOT NULL DEFAULT '{}'::jsonb,
            body BYTEA,
            priority INTEGER NOT NULL DEFAULT 50,
            max_retries INTEGER NOT NULL DEFAULT 3,
            timeout_ms BIGINT NOT NULL DEFAULT 30000,
            scheduled_for TIMESTAMPTZ,
            metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
            status TEXT NOT NULL DEFAULT 'pending',
            attempts INTEGER NOT NULL DEFAULT 0,
            last_attempt_at TIMESTAMPTZ,
            next_retry_at TIMESTAMPTZ,
            completed_at TIMESTAMPTZ,
            error TEXT,
            response JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            CHECK (priority BETWEEN 0 AND 100),
            CHECK (max_retries >= 0),
            CHECK (timeout_ms >= 0)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create requests table")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS request_attempts (
            id UUID PRIMARY KEY,
            request_id TEXT NOT NULL REFERENCES requests(id) ON DELETE CASCADE,
            attempt_number INTEGER NOT NULL,
            status_code INTEGER,
            duration_ms BIGINT NOT NULL,
            error TEXT,
            response_headers JSONB,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            UNIQUE (request_id, attempt_number)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create request_attempts table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_status ON requests(status)")
        .execute(pool)
        .await
        .context("failed to create requests status index")?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_requests_scheduled_for
        ON requests(scheduled_for)
        WHERE status IN ('pending', 'scheduled')
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create requests scheduled index")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_requests_created_at ON requests(created_at)")
        .execute(pool)
        .await
        .context("failed to create requests created_at index")?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_request_attempts_request
         ON request_attempts(request_id)",
    )
    .execute(pool)
    .await
    .context("failed to create request_attempts index")?;

    sqlx::query(
        r#"
        CREATE OR REPLACE FUNCTION refresh_updated_at() RETURNS trigger AS $$
        BEGIN
            NEW.updated_at = NOW();
            RETURN NEW;
        END;
        $$ LANGUAGE plpgsql
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create updated_at trigger function")?;

    sqlx::query(
        r#"
        DO $$
        BEGIN
            IF NOT EXISTS (
                SELECT 1 FROM pg_trigger WHERE tgname = 'requests_refresh_updated_at'
            ) THEN
                CREATE TRIGGER requests_refresh_updated_at
                BEFORE UPDATE ON requests
                FOR EACH ROW EXECUTE FUNCTION refresh_updated_at();
            END IF;
        END
        $$
        "#,
    )
    .execute(pool)
    .await
    .context("failed to create updated_at trigger")?;

    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received CTRL+C signal");
        },
        _ = terminate => {
            info!("received SIGTERM signal");
        },
    }
}

/// Service configuration loaded from environment variables.
struct Config {
    /// PostgreSQL connection string.
    database_url: String,
    /// Maximum database connections.
    database_max_connections: u32,
    /// Redis connection string for the queue index.
    redis_url: String,
    /// Prefix applied to every index key.
    key_prefix: String,
    /// Number of dispatch workers.
    worker_count: usize,
    /// Maximum concurrently executing requests in this process.
    max_concurrency: usize,
    /// Optional per-host concurrency ceiling.
    per_host_concurrency: Option<usize>,
    /// Global sustained dispatch rate.
    requests_per_second: u32,
}

impl Config {
    /// Loads configuration from environment variables.
    fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable not set")?;

        let redis_url =
            std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());

        let key_prefix = std::env::var("KEY_PREFIX")
            .unwrap_or_else(|_| carrier_queue::DEFAULT_KEY_PREFIX.to_string());

        let database_max_connections = env_parsed("DATABASE_MAX_CONNECTIONS", 10);
        let worker_count = env_parsed("WORKER_COUNT", carrier_queue::DEFAULT_WORKER_COUNT);
        let max_concurrency =
            env_parsed("MAX_CONCURRENCY", carrier_queue::DEFAULT_MAX_CONCURRENCY);
        let per_host_concurrency =
            std::env::var("PER_HOST_CONCURRENCY").ok().and_then(|s| s.parse().ok());
        let requests_per_second = env_parsed("REQUESTS_PER_SECOND", 50);

        Ok(Self {
            database_url,
            database_max_connections,
            redis_url,
            key_prefix,
            worker_count,
            max_concurrency,
            per_host_concurrency,
            requests_per_second,
        })
    }

    /// Converts to the engine's configuration type.
    fn to_queue_config(&self) -> QueueConfig {
        QueueConfig {
            worker_count: self.worker_count,
            max_concurrency: self.max_concurrency,
            per_host_concurrency: self.per_host_concurrency,
            rate_limiter: RateLimiterConfig {
                requests_per_second: self.requests_per_second,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Database URL with the password masked for logging.
    fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}
