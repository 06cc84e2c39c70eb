//! Boundary to the application's record store.
//!
//! The engine never owns the classroom records. It reads a snapshot before a
//! round and commits the merged result through one transactional call, so a
//! failed round leaves the store untouched.

use async_trait::async_trait;
use classsync_core::MergedDelta;
use classsync_types::{now_millis, Dataset};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::StoreError;

/// Transactional access to the local records.
#[async_trait]
pub trait DataStore: Send + Sync {
    /// Read-only copy of every record with field timestamps and dots.
    async fn snapshot(&self) -> Result<Dataset, StoreError>;

    /// Apply every write in `delta` atomically, or none of them.
    async fn apply(&self, delta: &MergedDelta) -> Result<(), StoreError>;

    /// Replace all records with `dataset`, archiving the previous data.
    async fn replace_all(&self, dataset: Dataset) -> Result<(), StoreError>;
}

// ===========================================
// In-memory store
// ===========================================

/// In-memory store with failure injection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryStoreInner>>,
}

#[derive(Debug, Default)]
struct MemoryStoreInner {
    dataset: Dataset,
    archives: Vec<Dataset>,
    commits: usize,
    fail_next_apply: Option<String>,
    fail_next_replace: Option<String>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding `dataset`.
    pub fn with_dataset(dataset: Dataset) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().dataset = dataset;
        store
    }

    /// Current records.
    pub fn dataset(&self) -> Dataset {
        self.inner.lock().unwrap().dataset.clone()
    }

    /// Datasets replaced by [`DataStore::replace_all`], oldest first.
    pub fn archives(&self) -> Vec<Dataset> {
        self.inner.lock().unwrap().archives.clone()
    }

    /// Number of successful `apply`/`replace_all` calls.
    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    /// Cause the next apply() to fail with the given error.
    pub fn fail_next_apply(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_apply = Some(error.to_string());
    }

    /// Cause the next replace_all() to fail with the given error.
    pub fn fail_next_replace(&self, error: &str) {
        self.inner.lock().unwrap().fail_next_replace = Some(error.to_string());
    }
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn snapshot(&self) -> Result<Dataset, StoreError> {
        Ok(self.dataset())
    }

    async fn apply(&self, delta: &MergedDelta) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_apply.take() {
            return Err(StoreError::Rejected(error));
        }
        delta.apply_to(&mut inner.dataset);
        inner.commits += 1;
        Ok(())
    }

    async fn replace_all(&self, dataset: Dataset) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.fail_next_replace.take() {
            return Err(StoreError::Rejected(error));
        }
        let previous = std::mem::replace(&mut inner.dataset, dataset);
        if !previous.is_empty() {
            inner.archives.push(previous);
        }
        inner.commits += 1;
        Ok(())
    }
}

// ===========================================
// JSON file store
// ===========================================

/// Write `bytes` to `path` via a temp file and rename.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);
    tokio::fs::write(&temp, bytes).await?;
    tokio::fs::rename(&temp, path).await
}

/// Records kept in one JSON file, used by the CLI.
///
/// Replaced datasets are kept next to it as
/// `<name>.archive-<millis>.json`.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: tokio::sync::Mutex<()>,
}

impl JsonFileStore {
    /// Store backed by `path` (created on first write).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }

    async fn read(&self) -> Result<Dataset, StoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Format {
                path: self.path.clone(),
                source,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Dataset::new()),
            Err(e) => Err(self.io_error(e)),
        }
    }

    async fn write(&self, dataset: &Dataset) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(dataset).map_err(|source| StoreError::Format {
            path: self.path.clone(),
            source,
        })?;
        write_atomic(&self.path, &json)
            .await
            .map_err(|e| self.io_error(e))
    }

    fn archive_path(&self) -> PathBuf {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "dataset".to_string());
        self.path
            .with_file_name(format!("{stem}.archive-{}.json", now_millis()))
    }
}

#[async_trait]
impl DataStore for JsonFileStore {
    async fn snapshot(&self) -> Result<Dataset, StoreError> {
        let _guard = self.lock.lock().await;
        self.read().await
    }

    async fn apply(&self, delta: &MergedDelta) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut dataset = self.read().await?;
        delta.apply_to(&mut dataset);
        self.write(&dataset).await?;
        tracing::debug!(path = %self.path.display(), writes = delta.len(), "Committed delta");
        Ok(())
    }

    async fn replace_all(&self, dataset: Dataset) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let previous = self.read().await?;
        if !previous.is_empty() {
            let archive = self.archive_path();
            tokio::fs::copy(&self.path, &archive)
                .await
                .map_err(|e| self.io_error(e))?;
            tracing::info!(archive = %archive.display(), records = previous.len(), "Archived replaced dataset");
        }
        self.write(&dataset).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use classsync_core::FieldUpdate;
    use classsync_types::{Collection, DeviceId, Dot, FieldValue, Record, RecordKey};
    use serde_json::json;

    fn class(id: &str, name: &str) -> Record {
        let dot = Dot::new(DeviceId::random(), 1);
        Record::new(Collection::Classes, id).with_field("name", FieldValue::new(json!(name), 1, dot))
    }

    fn rename(id: &str, name: &str) -> MergedDelta {
        MergedDelta {
            updates: vec![FieldUpdate {
                key: RecordKey::new(Collection::Classes, id),
                field: "name".into(),
                value: FieldValue::new(json!(name), 2, Dot::new(DeviceId::random(), 2)),
            }],
        }
    }

    // ===========================================
    // MemoryStore Tests
    // ===========================================

    #[tokio::test]
    async fn memory_apply_and_replace() {
        let store = MemoryStore::with_dataset(Dataset::from_records([class("c1", "Math")]));
        store.apply(&rename("c1", "Algebra")).await.unwrap();
        let snapshot = store.snapshot().await.unwrap();
        let key = RecordKey::new(Collection::Classes, "c1");
        assert_eq!(snapshot.get_field(&key, "name").unwrap().value, json!("Algebra"));

        store
            .replace_all(Dataset::from_records([class("c9", "Art")]))
            .await
            .unwrap();
        assert_eq!(store.archives().len(), 1);
        assert_eq!(store.dataset().len(), 1);
        assert_eq!(store.commits(), 2);
    }

    #[tokio::test]
    async fn memory_failed_apply_changes_nothing() {
        let store = MemoryStore::with_dataset(Dataset::from_records([class("c1", "Math")]));
        let before = store.dataset();
        store.fail_next_apply("disk full");

        assert!(matches!(
            store.apply(&rename("c1", "Algebra")).await,
            Err(StoreError::Rejected(_))
        ));
        assert_eq!(store.dataset(), before);
        assert_eq!(store.commits(), 0);
    }

    // ===========================================
    // JsonFileStore Tests
    // ===========================================

    #[tokio::test]
    async fn json_store_starts_empty_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("records.json"));
        assert!(store.snapshot().await.unwrap().is_empty());

        store
            .replace_all(Dataset::from_records([class("c1", "Math")]))
            .await
            .unwrap();
        store.apply(&rename("c1", "Algebra")).await.unwrap();

        let reopened = JsonFileStore::new(dir.path().join("records.json"));
        let snapshot = reopened.snapshot().await.unwrap();
        let key = RecordKey::new(Collection::Classes, "c1");
        assert_eq!(snapshot.get_field(&key, "name").unwrap().value, json!("Algebra"));
        assert!(!dir.path().join("records.json.tmp").exists());
    }

    #[tokio::test]
    async fn json_store_archives_replaced_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("records.json"));
        store
            .replace_all(Dataset::from_records([class("c1", "Math")]))
            .await
            .unwrap();
        store
            .replace_all(Dataset::from_records([class("c2", "Art")]))
            .await
            .unwrap();

        let archives: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".archive-"))
            .collect();
        assert_eq!(archives.len(), 1);
    }

    #[tokio::test]
    async fn json_store_reports_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.json");
        std::fs::write(&path, "{").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(
            store.snapshot().await,
            Err(StoreError::Format { .. })
        ));
    }
}
