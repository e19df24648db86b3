// File-snapshot storage backend
//
// Serves traffic from the in-memory backend and persists the full metric set
// as a JSON array whenever `save` is called. Writes go to a sibling temp file
// that is then renamed over the snapshot, so a crash mid-write never leaves a
// truncated file behind.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{MemoryStorage, Storage};
use crate::error::StorageError;
use crate::model::{Metric, MetricKind};

pub struct FileStorage {
    inner: MemoryStorage,

    /// Snapshot location
    path: PathBuf,

    /// Serializes concurrent saves so they don't race on the temp file
    save_lock: Mutex<()>,
}

impl FileStorage {
    pub fn new(path: PathBuf) -> Self {
        FileStorage {
            inner: MemoryStorage::new(),
            path,
            save_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Reloads the last snapshot into memory.
    ///
    /// # Returns
    /// Number of metrics restored. A missing or empty file restores nothing
    /// and is not an error.
    pub async fn load(&self) -> Result<usize, StorageError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting empty", self.path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };

        if data.iter().all(u8::is_ascii_whitespace) {
            return Ok(0);
        }

        let metrics: Vec<Metric> = serde_json::from_slice(&data)?;
        self.inner.update_batch(&metrics).await?;
        Ok(metrics.len())
    }
}

#[async_trait]
impl Storage for FileStorage {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn update_batch(&self, metrics: &[Metric]) -> Result<Vec<Metric>, StorageError> {
        self.inner.update_batch(metrics).await
    }

    async fn get_json(&self, kind: MetricKind, id: &str) -> Result<Metric, StorageError> {
        self.inner.get_json(kind, id).await
    }

    async fn get_metrics(&self) -> Result<Vec<(String, String)>, StorageError> {
        self.inner.get_metrics().await
    }

    /// The snapshot file is not an external dependency, so there is nothing
    /// meaningful to probe.
    async fn ping(&self) -> Result<(), StorageError> {
        Err(StorageError::PingUnsupported)
    }

    async fn bootstrap(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save(&self) -> Result<(), StorageError> {
        let _guard = self.save_lock.lock().await;

        let mut metrics = self.inner.all_metrics().await;
        metrics.sort_by(|a, b| (a.id.as_str(), a.kind()).cmp(&(b.id.as_str(), b.kind())));
        let data = serde_json::to_vec(&metrics)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = self.temp_path();
        tokio::fs::write(&temp, &data).await?;
        tokio::fs::rename(&temp, &self.path).await?;

        debug!(
            "Saved {} metric(s) to {} ({} bytes)",
            metrics.len(),
            self.path.display(),
            data.len()
        );
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_conformance() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::new(dir.path().join("metrics.json"));
        super::super::check_conformance(&storage).await;
    }

    #[tokio::test]
    async fn test_save_then_restore_reproduces_listing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("metrics.json");

        let storage = FileStorage::new(path.clone());
        storage
            .update_batch(&[
                Metric::gauge("nameG", 10.0),
                Metric::counter("nameC", 2),
                Metric::counter("nameC", 3),
            ])
            .await
            .unwrap();
        storage.save().await.unwrap();
        assert!(!storage.temp_path().exists());

        let saved: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(
            saved,
            serde_json::json!([
                {"id": "nameC", "type": "counter", "delta": 5},
                {"id": "nameG", "type": "gauge", "value": 10.0}
            ])
        );

        let restored = FileStorage::new(path);
        assert_eq!(restored.load().await.unwrap(), 2);
        assert_eq!(
            restored.get_metrics().await.unwrap(),
            storage.get_metrics().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_load_tolerates_missing_and_empty_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileStorage::new(dir.path().join("missing.json"));
        assert_eq!(missing.load().await.unwrap(), 0);

        let empty_path = dir.path().join("empty.json");
        std::fs::write(&empty_path, "\n").unwrap();
        assert_eq!(FileStorage::new(empty_path).load().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_load_rejects_corrupt_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, r#"[{"id":"x","type":"histogram","value":1}]"#).unwrap();

        let storage = FileStorage::new(path);
        assert!(matches!(
            storage.load().await,
            Err(StorageError::Encoding(_))
        ));
        assert!(storage.get_metrics().await.unwrap().is_empty());
    }
}
