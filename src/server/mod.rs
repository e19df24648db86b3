// Collector service: HTTP surface and snapshot persistence.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::StorageError;
use crate::retry::Retryer;
use crate::storage::Storage;

pub mod app;
pub mod handlers;
pub mod middleware;

pub use app::build_router;
pub use handlers::AppState;
pub use middleware::SecurityConfig;

/// Saves the storage every `period` until cancelled.
///
/// Failed saves are logged and retried on the next tick. Does not perform
/// the final save; the caller does that once the HTTP server has drained.
pub async fn run_save_loop(
    storage: Arc<dyn Storage>,
    retryer: Retryer<StorageError>,
    period: Duration,
    cancel: CancellationToken,
) {
    info!("Saving metrics every {:?}", period);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let target = storage.as_ref();
        match retryer.retry(move || target.save()).await {
            Ok(()) => debug!("Periodic save complete"),
            Err(e) => error!("Periodic save failed: {}", e),
        }
    }
    debug!("Save loop exited");
}
