// Storage module - one contract, three interchangeable backends
//
// - memory:   two maps behind independent locks, nothing persisted
// - file:     the memory backend plus JSON snapshots written on Save
// - postgres: a single table, upserted in one transaction per batch
//
// Every backend applies the same accumulation rule (counters add, gauges
// replace) and produces identical Get/GetMetrics output for the same
// sequence of updates. The backend is picked once at startup by `open`;
// callers only ever see `Arc<dyn Storage>`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::error::StorageError;
use crate::model::{Metric, MetricKind};

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileStorage;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Uniform interface over every storage backend.
///
/// Update methods return the canonical (post-accumulation) value so
/// handlers can echo it back to the client.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Applies a plain-text update from `/update/{type}/{name}/{value}`.
    async fn update(&self, kind: &str, id: &str, raw_value: &str) -> Result<Metric, StorageError> {
        let metric = Metric::parse(kind, id, raw_value)?;
        self.update_json(metric).await
    }

    /// Applies a single already-decoded metric.
    async fn update_json(&self, metric: Metric) -> Result<Metric, StorageError> {
        let mut updated = self.update_batch(std::slice::from_ref(&metric)).await?;
        updated
            .pop()
            .ok_or_else(|| StorageError::Server(format!("update of '{}' returned nothing", metric.id)))
    }

    /// Applies every metric atomically with respect to other batches on the
    /// same key and returns the canonical value of each distinct `(id, type)`.
    async fn update_batch(&self, metrics: &[Metric]) -> Result<Vec<Metric>, StorageError>;

    /// Looks up a metric and renders its canonical text value.
    async fn get(&self, kind: &str, id: &str) -> Result<String, StorageError> {
        let kind: MetricKind = kind.parse()?;
        Ok(self.get_json(kind, id).await?.value.to_string())
    }

    async fn get_json(&self, kind: MetricKind, id: &str) -> Result<Metric, StorageError>;

    /// Every stored metric as `(name, value)` pairs, sorted by name then type.
    async fn get_metrics(&self) -> Result<Vec<(String, String)>, StorageError>;

    /// Liveness probe of the backing dependency.
    async fn ping(&self) -> Result<(), StorageError>;

    /// Prepares the backend schema, if it has one.
    async fn bootstrap(&self) -> Result<(), StorageError>;

    /// Flushes buffered state to the durable medium, if there is one.
    async fn save(&self) -> Result<(), StorageError>;

    async fn close(&self) -> Result<(), StorageError>;
}

/// Which backend to build and how.
#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    /// Postgres DSN; takes priority over everything else
    pub database_dsn: Option<String>,

    /// Snapshot file for the file backend
    pub file_path: Option<PathBuf>,

    /// Reload the snapshot file before serving
    pub restore: bool,
}

/// Builds the backend selected by `settings`.
///
/// # Selection
/// 1. `database_dsn` set -> Postgres (connects lazily)
/// 2. `file_path` set -> file snapshots, optionally restored now
/// 3. otherwise -> plain memory
pub async fn open(settings: &StorageSettings) -> Result<Arc<dyn Storage>, StorageError> {
    if let Some(dsn) = settings.database_dsn.as_deref().filter(|d| !d.is_empty()) {
        info!("Using postgres storage");
        return Ok(Arc::new(PostgresStorage::connect(dsn)?));
    }

    if let Some(path) = &settings.file_path {
        info!("Using file storage at {}", path.display());
        let storage = FileStorage::new(path.clone());
        if settings.restore {
            let restored = storage.load().await?;
            info!("Restored {} metric(s) from {}", restored, path.display());
        }
        return Ok(Arc::new(storage));
    }

    info!("Using in-memory storage");
    Ok(Arc::new(MemoryStorage::new()))
}

/// Folds a batch so each `(id, type)` appears once, applying the
/// accumulation rule between duplicates. First-appearance order is kept.
pub fn merge_batch(metrics: &[Metric]) -> Vec<Metric> {
    let mut merged: Vec<Metric> = Vec::with_capacity(metrics.len());
    let mut positions: HashMap<(&str, MetricKind), usize> = HashMap::new();

    for metric in metrics {
        match positions.get(&(metric.id.as_str(), metric.kind())) {
            Some(&pos) => merged[pos].value.accumulate(metric.value),
            None => {
                positions.insert((metric.id.as_str(), metric.kind()), merged.len());
                merged.push(metric.clone());
            }
        }
    }
    merged
}

/// Orders metrics by `(name, type)` and renders them as listing rows.
pub fn to_listing(mut metrics: Vec<Metric>) -> Vec<(String, String)> {
    metrics.sort_by(|a, b| (a.id.as_str(), a.kind()).cmp(&(b.id.as_str(), b.kind())));
    metrics
        .into_iter()
        .map(|m| {
            let value = m.value.to_string();
            (m.id, value)
        })
        .collect()
}

/// Update sequence every backend must agree on.
#[cfg(test)]
pub(crate) async fn check_conformance(storage: &dyn Storage) {
    use crate::error::MetricError;

    // gauge replacement is idempotent
    storage.update("gauge", "Alloc", "1.5").await.unwrap();
    storage.update("gauge", "Alloc", "2.25").await.unwrap();
    assert_eq!(storage.get("gauge", "Alloc").await.unwrap(), "2.25");

    // counters accumulate the same way singly or batched
    storage.update("counter", "PollCount", "2").await.unwrap();
    let echoed = storage
        .update_json(Metric::counter("PollCount", 3))
        .await
        .unwrap();
    assert_eq!(echoed, Metric::counter("PollCount", 5));

    let canonical = storage
        .update_batch(&[
            Metric::counter("PollCount", 10),
            Metric::gauge("Alloc", 7.0),
            Metric::counter("PollCount", -1),
            Metric::gauge("Alloc", 8.5),
        ])
        .await
        .unwrap();
    assert_eq!(canonical.len(), 2);
    assert!(canonical.contains(&Metric::counter("PollCount", 14)));
    assert!(canonical.contains(&Metric::gauge("Alloc", 8.5)));

    // same name, different type: separate namespaces
    storage.update("gauge", "PollCount", "0.5").await.unwrap();
    assert_eq!(storage.get("counter", "PollCount").await.unwrap(), "14");
    assert_eq!(
        storage
            .get_json(MetricKind::Gauge, "PollCount")
            .await
            .unwrap(),
        Metric::gauge("PollCount", 0.5)
    );

    // invalid input never mutates
    assert!(matches!(
        storage.update("histogram", "Alloc", "1").await,
        Err(StorageError::Metric(MetricError::InvalidMetricType(_)))
    ));
    assert!(matches!(
        storage.update("counter", "PollCount", "abc").await,
        Err(StorageError::Metric(MetricError::WrongMetricValue(_)))
    ));
    assert!(matches!(
        storage.get("counter", "Missing").await,
        Err(StorageError::MetricNotExist)
    ));
    assert!(matches!(
        storage.get("histogram", "Alloc").await,
        Err(StorageError::Metric(MetricError::InvalidMetricType(_)))
    ));

    assert_eq!(storage.update_batch(&[]).await.unwrap(), Vec::new());

    assert_eq!(
        storage.get_metrics().await.unwrap(),
        vec![
            ("Alloc".to_string(), "8.5".to_string()),
            ("PollCount".to_string(), "14".to_string()),
            ("PollCount".to_string(), "0.5".to_string()),
        ]
    );

    // counters clamp at the i64 bounds instead of failing
    storage
        .update_json(Metric::counter("Overflow", i64::MAX))
        .await
        .unwrap();
    let clamped = storage
        .update_json(Metric::counter("Overflow", 1))
        .await
        .unwrap();
    assert_eq!(clamped, Metric::counter("Overflow", i64::MAX));
    assert_eq!(
        storage.get("counter", "Overflow").await.unwrap(),
        i64::MAX.to_string()
    );

    storage
        .update_json(Metric::counter("Underflow", i64::MIN))
        .await
        .unwrap();
    let clamped = storage
        .update_batch(&[
            Metric::counter("Underflow", -1),
            Metric::counter("Underflow", -1),
        ])
        .await
        .unwrap();
    assert_eq!(clamped, vec![Metric::counter("Underflow", i64::MIN)]);
}
