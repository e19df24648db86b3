// In-memory storage backend
//
// Gauges and counters live in two separate maps, each behind its own
// RwLock, so gauge traffic never waits on counter traffic and vice versa.
// A batch holds the locks it needs until every metric in it is applied.
// Nothing is persisted; see `file.rs` for the snapshot-backed variant.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::{merge_batch, to_listing, Storage};
use crate::error::StorageError;
use crate::model::{Metric, MetricKind, MetricValue};

/// Process-lifetime metric store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    /// Gauge name -> last reported value
    gauges: RwLock<HashMap<String, f64>>,

    /// Counter name -> accumulated total
    counters: RwLock<HashMap<String, i64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored metric, gauges first, in no particular order.
    pub async fn all_metrics(&self) -> Vec<Metric> {
        let gauges = self.gauges.read().await;
        let counters = self.counters.read().await;

        let mut metrics = Vec::with_capacity(gauges.len() + counters.len());
        metrics.extend(gauges.iter().map(|(id, v)| Metric::gauge(id.clone(), *v)));
        metrics.extend(counters.iter().map(|(id, d)| Metric::counter(id.clone(), *d)));
        metrics
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn update_batch(&self, metrics: &[Metric]) -> Result<Vec<Metric>, StorageError> {
        let merged = merge_batch(metrics);
        let has_kind = |kind: MetricKind| merged.iter().any(|m| m.kind() == kind);

        // Lock order is gauges, then counters, same as `all_metrics`.
        let mut gauges = if has_kind(MetricKind::Gauge) {
            Some(self.gauges.write().await)
        } else {
            None
        };
        let mut counters = if has_kind(MetricKind::Counter) {
            Some(self.counters.write().await)
        } else {
            None
        };

        let mut canonical = Vec::with_capacity(merged.len());
        for metric in &merged {
            let applied = match (metric.value, gauges.as_mut(), counters.as_mut()) {
                (MetricValue::Counter(delta), _, Some(counters)) => {
                    let total = counters.entry(metric.id.clone()).or_insert(0);
                    *total = total.saturating_add(delta);
                    Metric::counter(metric.id.clone(), *total)
                }
                (MetricValue::Gauge(value), Some(gauges), _) => {
                    gauges.insert(metric.id.clone(), value);
                    Metric::gauge(metric.id.clone(), value)
                }
                _ => continue,
            };
            canonical.push(applied);
        }
        debug!("Applied {} metric update(s)", canonical.len());
        Ok(canonical)
    }

    async fn get_json(&self, kind: MetricKind, id: &str) -> Result<Metric, StorageError> {
        let found = match kind {
            MetricKind::Counter => self
                .counters
                .read()
                .await
                .get(id)
                .map(|d| Metric::counter(id, *d)),
            MetricKind::Gauge => self
                .gauges
                .read()
                .await
                .get(id)
                .map(|v| Metric::gauge(id, *v)),
        };
        found.ok_or(StorageError::MetricNotExist)
    }

    async fn get_metrics(&self) -> Result<Vec<(String, String)>, StorageError> {
        Ok(to_listing(self.all_metrics().await))
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Err(StorageError::PingUnsupported)
    }

    async fn bootstrap(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Transient;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_memory_conformance() {
        super::super::check_conformance(&MemoryStorage::new()).await;
    }

    #[tokio::test]
    async fn test_ping_is_a_permanent_failure() {
        let err = MemoryStorage::new().ping().await.unwrap_err();
        assert!(matches!(err, StorageError::PingUnsupported));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_concurrent_counter_updates_do_not_lose_deltas() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();

        for i in 0..16 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                for _ in 0..100 {
                    storage
                        .update_json(Metric::counter("hits", 1))
                        .await
                        .unwrap();
                    storage
                        .update_json(Metric::gauge("last", i as f64))
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(storage.get("counter", "hits").await.unwrap(), "1600");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_a_partial_batch() {
        let storage = Arc::new(MemoryStorage::new());
        let batch: Vec<Metric> = (0..500)
            .flat_map(|i| {
                [
                    Metric::gauge(format!("g{}", i), i as f64),
                    Metric::counter(format!("c{}", i), 1),
                ]
            })
            .collect();

        let writer = {
            let storage = Arc::clone(&storage);
            tokio::spawn(async move { storage.update_batch(&batch).await.unwrap() })
        };

        while !writer.is_finished() {
            let seen = storage.all_metrics().await.len();
            assert!(seen == 0 || seen == 1000, "saw {} of 1000 metrics", seen);
            tokio::task::yield_now().await;
        }
        assert_eq!(writer.await.unwrap().len(), 1000);
        assert_eq!(storage.all_metrics().await.len(), 1000);
    }
}
