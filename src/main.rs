//! Outbox relay service.
//!
//! Main entry point for the relay. Connects to the outbox database, wires the
//! Postgres-backed delivery components, and runs the delivery engine until a
//! shutdown signal arrives.

mod config;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_core::{models::Platform, storage::Storage, Clock, RealClock};
use relay_delivery::{
    adapter::{AdapterRegistry, LoggingSendAdapter, PostgresDestinationDirectory},
    lock::PostgresChannelLock,
    store::PostgresOutboxStore,
    DeliveryEngine, EngineComponents,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};

use crate::config::{Config, LogFormat};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(config.log_format);

    info!("Starting outbox relay");
    info!(
        database_url = %config.database_url_masked(),
        max_connections = config.database_max_connections,
        broker_enabled = config.broker_enabled,
        worker_concurrency = config.worker_concurrency,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(db_pool.clone()));
    storage.bootstrap_schema().await.context("Failed to bootstrap relay schema")?;
    info!("Relay schema ready");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let components = EngineComponents {
        store: Arc::new(PostgresOutboxStore::new(storage.clone(), clock.clone())),
        lock: Arc::new(PostgresChannelLock::new(storage.clone(), clock.clone())),
        directory: Arc::new(PostgresDestinationDirectory::new(storage.clone(), clock.clone())),
        adapters: dry_run_adapters(),
    };

    let mut engine = DeliveryEngine::new(config.to_delivery_config(), components, clock)
        .context("Failed to create delivery engine")?;
    engine.start().await.context("Failed to start delivery engine")?;

    info!("Outbox relay is delivering messages");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    let stats = engine.stats().await;
    if let Err(e) = engine.shutdown().await {
        error!(error = %e, "Delivery engine did not shut down cleanly");
    }
    info!(
        sent = stats.sent,
        retried = stats.retried,
        failed = stats.failed,
        deferred = stats.deferred,
        "Delivery engine stopped"
    );

    db_pool.close().await;
    info!("Database connections closed");

    info!("Outbox relay shutdown complete");
    Ok(())
}

/// Registers a logging adapter for every platform.
///
/// Platform clients are owned by the chat integration services; the relay
/// binary ships with dry-run adapters only.
fn dry_run_adapters() -> AdapterRegistry {
    Platform::ALL.into_iter().fold(AdapterRegistry::new(), |registry, platform| {
        registry.with_adapter(platform, Arc::new(LoggingSendAdapter::new(platform)))
    })
}

/// Initializes tracing with environment-based configuration.
fn init_tracing(format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,outbox_relay=debug,relay_delivery=debug"));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => {
            registry.with(fmt::layer().json().with_current_span(true)).init();
        },
        LogFormat::Text => {
            let fmt_layer = fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true)
                .with_file(true)
                .with_line_number(true);
            registry.with(fmt_layer).init();
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .fetch_one(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Waits for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
