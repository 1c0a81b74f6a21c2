use std::{future::IntoFuture, sync::Arc, time::Duration};

use db::{DBService, DbStore};
use idempotency::{
    IdempotencyConfig, IdempotencyError, IdempotencyService, IdempotencyStore, MemoryStore,
};
use server::{AppState, http};
use thiserror::Error;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, prelude::*};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
const SWEEP_INTERVAL_ENV: &str = "RG_IDEMPOTENCY_SWEEP_INTERVAL_SECS";
const STORE_ENV: &str = "RG_STORE";
const DATABASE_URL_ENV: &str = "RG_DATABASE_URL";
const DEFAULT_DATABASE_URL: &str = "sqlite://replay-gate.sqlite?mode=rwc";

#[derive(Debug, Error)]
enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Database(#[from] db::DbErr),
    #[error(transparent)]
    Idempotency(#[from] IdempotencyError),
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let filter_string = format!(
        "warn,server={level},idempotency={level},db={level}",
        level = log_level
    );
    let env_filter = EnvFilter::try_new(filter_string).expect("Failed to create tracing filter");
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(env_filter))
        .init();

    let config = IdempotencyConfig::from_env();
    let store = build_store().await?;
    let service = Arc::new(IdempotencyService::new(config, store));

    spawn_sweep_task(service.clone());

    let app_router = http::router(AppState::new(service));

    let port = std::env::var("BACKEND_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .unwrap_or_else(|| {
            tracing::info!("No PORT environment variable set, using port 0 for auto-assignment");
            0
        });
    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let listener = tokio::net::TcpListener::bind(format!("{host}:{port}")).await?;
    let actual_port = listener.local_addr()?.port();

    tracing::info!("Server running on http://{host}:{actual_port}");

    let (shutdown_rx, force_exit_rx) = spawn_shutdown_watchers();

    let server = axum::serve(listener, app_router)
        .with_graceful_shutdown(wait_for_watch_true(shutdown_rx.clone()))
        .into_future();
    tokio::pin!(server);

    let serve_result = tokio::select! {
        res = &mut server => res,
        _ = wait_for_watch_true(force_exit_rx) => {
            tracing::warn!("Force shutdown requested (second signal), exiting immediately");
            std::process::exit(130);
        }
        _ = shutdown_deadline(shutdown_rx.clone(), GRACEFUL_SHUTDOWN_TIMEOUT) => {
            tracing::warn!(
                "Graceful shutdown timed out after {:?}, exiting immediately",
                GRACEFUL_SHUTDOWN_TIMEOUT
            );
            std::process::exit(130);
        }
    };
    serve_result?;

    Ok(())
}

async fn build_store() -> Result<Arc<dyn IdempotencyStore>, ServerError> {
    let backend = std::env::var(STORE_ENV).unwrap_or_else(|_| "memory".to_string());
    match backend.trim().to_ascii_lowercase().as_str() {
        "memory" => {
            tracing::info!("Using in-memory idempotency store (single-instance deduplication)");
            Ok(Arc::new(MemoryStore::new()))
        }
        "sqlite" | "database" => {
            let url =
                std::env::var(DATABASE_URL_ENV).unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
            tracing::info!(url, "Using database-backed idempotency store");
            let db = DBService::connect(&url).await?;
            Ok(Arc::new(DbStore::new(db.conn)))
        }
        other => {
            tracing::warn!(value = other, "Unknown {STORE_ENV}; falling back to memory");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Periodic sweep reclaims memory held by expired records. The lazy sweep
/// inside lookups already keeps the layer correct without it.
fn spawn_sweep_task(service: Arc<IdempotencyService>) {
    let interval = sweep_interval();
    let Some(interval) = interval else {
        tracing::info!("Idempotency sweep task disabled");
        return;
    };
    tracing::info!(interval_secs = interval.as_secs(), "Starting idempotency sweep task");
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(interval).await;
            match service.sweep_expired().await {
                Ok(removed) if removed > 0 => {
                    tracing::info!(removed, "Swept expired idempotency records");
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to sweep idempotency records");
                }
            }
        }
    });
}

fn sweep_interval() -> Option<Duration> {
    let raw = match std::env::var(SWEEP_INTERVAL_ENV) {
        Ok(value) => value,
        Err(_) => return Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS)),
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => None,
        Ok(secs) => Some(Duration::from_secs(secs)),
        Err(err) => {
            tracing::warn!(value = raw.trim(), error = %err, "Invalid {SWEEP_INTERVAL_ENV}; using default");
            Some(Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS))
        }
    }
}

/// First signal starts a graceful drain; a second one forces exit.
fn spawn_shutdown_watchers() -> (watch::Receiver<bool>, watch::Receiver<bool>) {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (force_exit_tx, force_exit_rx) = watch::channel(false);

    tokio::spawn(async move {
        let mut shutdown_sent = false;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(sig) => sig,
                Err(e) => {
                    tracing::error!("Failed to install SIGINT handler: {e}");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    tracing::error!("Failed to install SIGTERM handler: {e}");
                    None
                }
            };

            loop {
                tokio::select! {
                    _ = sigint.recv() => {},
                    _ = async {
                        if let Some(sigterm) = sigterm.as_mut() {
                            sigterm.recv().await;
                        } else {
                            std::future::pending::<()>().await;
                        }
                    } => {},
                }

                if !shutdown_sent {
                    shutdown_sent = true;
                    tracing::info!(
                        "Shutdown signal received, starting graceful shutdown (press Ctrl+C again to force)"
                    );
                    let _ = shutdown_tx.send(true);
                } else {
                    tracing::warn!("Second shutdown signal received, forcing exit");
                    let _ = force_exit_tx.send(true);
                    break;
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                return;
            }
            tracing::info!(
                "Shutdown signal received, starting graceful shutdown (press Ctrl+C again to force)"
            );
            let _ = shutdown_tx.send(true);

            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to install Ctrl+C handler: {e}");
                return;
            }
            tracing::warn!("Second shutdown signal received, forcing exit");
            let _ = force_exit_tx.send(true);
        }
    });

    (shutdown_rx, force_exit_rx)
}

async fn wait_for_watch_true(mut rx: watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn shutdown_deadline(rx: watch::Receiver<bool>, timeout: Duration) {
    wait_for_watch_true(rx).await;
    tokio::time::sleep(timeout).await;
}
