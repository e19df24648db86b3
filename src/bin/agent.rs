// Metrics agent
//
// Samples system metrics on a fixed interval and reports them to the
// collector service until interrupted.
//
// # Usage
// agent -a <host:port> [-p <poll>] [-r <report>] [-k <key>] [--crypto-key <pem>]
//
// Example:
// agent -a localhost:8080 -p 2s -r 10s --mode worker-pool -l 4

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use metrics_service::agent::{
    create_all_collectors, HttpSender, MetricScheduler, SchedulerSettings,
};
use metrics_service::config::AgentConfig;
use metrics_service::logging::init_logging;
use metrics_service::security::load_public_key;
use metrics_service::shutdown_signal;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AgentConfig::load().context("Failed to load agent configuration")?;
    init_logging(config.log_level.as_deref());

    info!("=== Metrics Agent Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Collector address: {}", config.address);

    let public_key = match &config.crypto_key {
        Some(path) => {
            info!("Encrypting payloads with {}", path.display());
            Some(load_public_key(path).context("Failed to load public key")?)
        }
        None => None,
    };

    let sender = HttpSender::new(&config.address, config.key.as_bytes(), public_key)
        .context("Failed to build HTTP client")?;

    let collectors = create_all_collectors();
    info!("Created {} metric collector(s)", collectors.len());

    let scheduler = MetricScheduler::new(
        SchedulerSettings {
            poll_interval: config.poll_interval,
            report_interval: config.report_interval,
            mode: config.mode,
            rate_limit: config.rate_limit,
        },
        collectors,
        Arc::new(sender),
    );

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            cancel.cancel();
        }
    });

    info!("Press Ctrl+C to stop");
    scheduler.run(cancel).await;

    info!("=== Metrics Agent Stopped ===");
    Ok(())
}
