// Metrics collector service
//
// Accepts metric updates over HTTP and keeps them in memory, in a JSON
// snapshot file, or in Postgres, depending on configuration.
//
// # Usage
// server [-a <host:port>] [-f <snapshot.json>] [-d <postgres dsn>] [-k <key>]
//
// Example:
// server -a 0.0.0.0:8080 -f /var/lib/metrics/metrics.json -r -i 60s

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use metrics_service::config::{mask_credentials, ServerConfig};
use metrics_service::logging::init_logging;
use metrics_service::security::load_private_key;
use metrics_service::server::{build_router, run_save_loop, AppState, SecurityConfig};
use metrics_service::storage;
use metrics_service::{shutdown_signal, RetryPolicy, Retryer, StorageError};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::load().context("Failed to load server configuration")?;
    init_logging(config.log_level.as_deref());

    info!("=== Metrics Server Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    if let Some(dsn) = &config.database_dsn {
        info!("Database: {}", mask_credentials(dsn));
    }

    let private_key = match &config.crypto_key {
        Some(path) => {
            info!("Decrypting payloads with {}", path.display());
            Some(load_private_key(path).context("Failed to load private key")?)
        }
        None => None,
    };
    let security = SecurityConfig {
        hash_key: config.key.clone().into_bytes(),
        private_key,
    };

    let storage = storage::open(&config.storage_settings())
        .await
        .context("Failed to open storage")?;
    let retryer: Retryer<StorageError> = Retryer::transient(RetryPolicy::default());

    {
        let target = storage.as_ref();
        retryer
            .retry(move || target.bootstrap())
            .await
            .context("Failed to bootstrap storage")?;
    }
    info!("Storage backend '{}' ready", storage.name());

    let cancel = CancellationToken::new();
    let save_task = if config.sync_save() {
        info!("Saving after every update");
        None
    } else {
        Some(tokio::spawn(run_save_loop(
            storage.clone(),
            retryer.clone(),
            config.store_interval,
            cancel.clone(),
        )))
    };

    let router = build_router(
        AppState {
            storage: storage.clone(),
            retryer: retryer.clone(),
            sync_save: config.sync_save(),
        },
        security,
    );

    let listener = TcpListener::bind(&config.address)
        .await
        .with_context(|| format!("Failed to bind {}", config.address))?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, router)
        .with_graceful_shutdown({
            let cancel = cancel.clone();
            async move {
                shutdown_signal().await;
                info!("Shutdown signal received, draining connections");
                cancel.cancel();
            }
        })
        .await
        .context("HTTP server failed")?;

    cancel.cancel();
    if let Some(handle) = save_task {
        if let Err(e) = handle.await {
            error!("Save task panicked: {}", e);
        }
    }

    let target = storage.as_ref();
    if let Err(e) = retryer.retry(move || target.save()).await {
        error!("Final save failed: {}", e);
    }
    storage.close().await.context("Failed to close storage")?;

    info!("=== Metrics Server Stopped ===");
    Ok(())
}
