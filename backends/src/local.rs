use crate::backend::{Backend, BackendType, BatchOutcome, HealthStatus};
use async_trait::async_trait;
use blobkeep_core::{Error, Result, StorageKey};
use bytes::Bytes;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Blobs on a local or mounted filesystem, sharded as `<root>/aa/bb/<hex key>`.
pub struct LocalBackend {
    name: String,
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(name: impl Into<String>, base_path: P) -> Self {
        Self {
            name: name.into(),
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn blob_path(&self, key: &StorageKey) -> PathBuf {
        let hex = key.to_hex();
        self.base_path.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    fn classify(&self, action: &str, key: &StorageKey, err: std::io::Error) -> Error {
        let message = format!("{action} {}: {err}", key.short_string());
        match err.kind() {
            ErrorKind::NotFound => Error::NotFound(format!("{} on backend {}", key.to_hex(), self.name)),
            ErrorKind::PermissionDenied
            | ErrorKind::StorageFull
            | ErrorKind::ReadOnlyFilesystem
            | ErrorKind::InvalidInput => Error::permanent(&self.name, message),
            _ => Error::transient(&self.name, message),
        }
    }

    /// Write to a unique temp file beside the target, then rename over it.
    async fn write_blob(&self, key: &StorageKey, data: &[u8]) -> std::io::Result<()> {
        let path = self.blob_path(key);
        let parent = path.parent().unwrap_or(self.base_path.as_path());
        fs::create_dir_all(parent).await?;

        let temp = parent.join(format!(".{}.{}.tmp", key.to_hex(), uuid::Uuid::new_v4()));
        if let Err(e) = fs::write(&temp, data).await {
            _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        if let Err(e) = fs::rename(&temp, &path).await {
            _ = fs::remove_file(&temp).await;
            return Err(e);
        }
        Ok(())
    }

    async fn read_dir_names(path: &Path) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        Ok(names)
    }
}

fn is_shard(name: &str) -> bool {
    name.len() == 2 && name.bytes().all(|b| b.is_ascii_hexdigit())
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Local
    }

    async fn store(&self, items: Vec<(StorageKey, Bytes)>) -> Result<BatchOutcome<()>> {
        let mut outcome = HashMap::with_capacity(items.len());
        for (key, data) in items {
            let result = self
                .write_blob(&key, &data)
                .await
                .map_err(|e| self.classify("write", &key, e));
            if let Err(e) = &result {
                warn!(backend = %self.name, storage_key = %key.short_string(), error = %e, "Store failed");
            } else {
                debug!(backend = %self.name, storage_key = %key.short_string(), bytes = data.len(), "Stored blob");
            }
            outcome.insert(key, result);
        }
        Ok(outcome)
    }

    async fn retrieve(&self, keys: &[StorageKey]) -> Result<BatchOutcome<Bytes>> {
        let mut outcome = HashMap::with_capacity(keys.len());
        for key in keys {
            let result = fs::read(self.blob_path(key))
                .await
                .map(Bytes::from)
                .map_err(|e| self.classify("read", key, e));
            outcome.insert(*key, result);
        }
        Ok(outcome)
    }

    async fn delete(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, bool>> {
        let mut outcome = HashMap::with_capacity(keys.len());
        for key in keys {
            let removed = match fs::remove_file(self.blob_path(key)).await {
                Ok(()) => true,
                Err(e) if e.kind() == ErrorKind::NotFound => false,
                Err(e) => {
                    warn!(backend = %self.name, storage_key = %key.short_string(), error = %e, "Delete failed");
                    false
                }
            };
            outcome.insert(*key, removed);
        }
        Ok(outcome)
    }

    async fn health_check(&self) -> HealthStatus {
        if let Err(e) = fs::create_dir_all(&self.base_path).await {
            return HealthStatus::Unavailable(format!("{}: {e}", self.base_path.display()));
        }
        match fs::metadata(&self.base_path).await {
            Ok(meta) if !meta.is_dir() => {
                HealthStatus::Unavailable(format!("{} is not a directory", self.base_path.display()))
            }
            Ok(meta) if meta.permissions().readonly() => {
                HealthStatus::Degraded(format!("{} is read-only", self.base_path.display()))
            }
            Ok(_) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unavailable(format!("{}: {e}", self.base_path.display())),
        }
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StorageKey>> {
        let prefix = prefix.unwrap_or("").to_ascii_lowercase();
        let mut keys = Vec::new();

        for outer in Self::read_dir_names(&self.base_path).await? {
            if !is_shard(&outer) || !(prefix.starts_with(&outer) || outer.starts_with(&prefix)) {
                continue;
            }
            let outer_path = self.base_path.join(&outer);
            for inner in Self::read_dir_names(&outer_path).await? {
                if !is_shard(&inner) {
                    continue;
                }
                for name in Self::read_dir_names(&outer_path.join(&inner)).await? {
                    if !name.starts_with(&prefix) {
                        continue;
                    }
                    // Temp files and strays do not parse.
                    if let Ok(key) = name.parse::<StorageKey>() {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_store_uses_sharded_layout() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", dir.path());
        let key = StorageKey::from_data(b"a:1");
        let hex = key.to_hex();

        backend.store_one(key, Bytes::from_static(b"blob")).await.unwrap();
        let expected = dir.path().join(&hex[0..2]).join(&hex[2..4]).join(&hex);
        assert_eq!(std::fs::read(expected).unwrap(), b"blob");
        assert_eq!(backend.retrieve_one(&key).await.unwrap(), Bytes::from_static(b"blob"));
    }

    #[tokio::test]
    async fn test_repeated_identical_writes_are_harmless() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", dir.path());
        let key = StorageKey::from_data(b"same");

        let writes = (0..8).map(|_| backend.store_one(key, Bytes::from_static(b"identical")));
        for result in futures::future::join_all(writes).await {
            result.unwrap();
        }
        assert_eq!(backend.list(None).await.unwrap(), vec![key]);
    }

    #[tokio::test]
    async fn test_retrieve_reports_missing_keys_individually() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", dir.path());
        let present = StorageKey::from_data(b"present");
        let missing = StorageKey::from_data(b"missing");
        backend.store_one(present, Bytes::from_static(b"x")).await.unwrap();

        let outcome = backend.retrieve(&[present, missing]).await.unwrap();
        assert!(outcome[&present].is_ok());
        assert!(matches!(outcome[&missing], Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_prefix_and_delete() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", dir.path());
        let keys: Vec<StorageKey> = (0..20u8).map(|i| StorageKey::from_data(&[i])).collect();
        for key in &keys {
            backend.store_one(*key, Bytes::from_static(b"x")).await.unwrap();
        }
        std::fs::write(dir.path().join("README"), b"not a blob").unwrap();

        assert_eq!(backend.list(None).await.unwrap().len(), 20);
        let prefix = &keys[0].to_hex()[..3];
        let narrowed = backend.list(Some(prefix)).await.unwrap();
        assert!(narrowed.contains(&keys[0]));
        assert!(narrowed.iter().all(|k| k.to_hex().starts_with(prefix)));

        let deleted = backend.delete(&keys[..2]).await.unwrap();
        assert!(deleted.values().all(|d| *d));
        assert!(!backend.delete(&keys[..1]).await.unwrap()[&keys[0]]);
        assert_eq!(backend.list(None).await.unwrap().len(), 18);
    }

    #[tokio::test]
    async fn test_health_check_creates_root() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new("local", dir.path().join("nested/root"));
        assert!(backend.health_check().await.is_healthy());
        assert!(backend.base_path().is_dir());
    }
}
