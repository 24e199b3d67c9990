use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use tally_api::{app, AppState, AuthConfig};
use tally_ledger::{AccountService, AccrualPoller, LoyaltyService, OrderLedger, PollerOptions, RetryPolicy};
use tally_store::app_config::{Config, PollerConfig};
use tally_store::{DbClient, HttpAccrualClient, PgStore};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally_api=debug,tally_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;

    let db = DbClient::new(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")?;
    db.migrate().await.context("Failed to run migrations")?;
    let store = Arc::new(PgStore::new(db.pool.clone()));

    let accrual = HttpAccrualClient::new(&config.accrual.address, config.accrual.request_timeout())
        .context("Failed to build accrual client")?;
    tracing::info!("Polling accrual service at {}", accrual.base_url());

    let ledger = OrderLedger::new(store.clone());
    let poller = AccrualPoller::new(
        Arc::new(accrual),
        ledger.clone(),
        store.clone(),
        poller_options(&config.poller),
    )
    .start();

    let app_state = AppState {
        service: LoyaltyService::new(
            AccountService::new(store.clone()),
            ledger,
            store.clone(),
            poller.queue(),
        ),
        auth: AuthConfig {
            secret: config.auth.jwt_secret.clone(),
            expiration: config.auth.jwt_expiration_seconds,
        },
    };

    let listener = tokio::net::TcpListener::bind(&config.server.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.address))?;
    tracing::info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app(app_state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    poller.shutdown().await;
    Ok(())
}

fn poller_options(config: &PollerConfig) -> PollerOptions {
    PollerOptions {
        workers: config.workers,
        queue_capacity: config.queue_capacity,
        poll_timeout: Duration::from_millis(config.poll_timeout_ms),
        retry: RetryPolicy {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        },
        resync_interval: Duration::from_secs(config.resync_interval_secs),
        resync_batch: config.queue_capacity,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received");
}
