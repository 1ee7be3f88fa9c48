use async_trait::async_trait;
use blobkeep_core::{Error, Result, StorageKey};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    Memory,
    S3,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => f.write_str("local"),
            BackendType::Memory => f.write_str("memory"),
            BackendType::S3 => f.write_str("s3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    /// Reachable but misbehaving.
    Degraded(String),
    Unavailable(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Per-key results of a batch call. A batch may partially succeed.
pub type BatchOutcome<T> = HashMap<StorageKey, Result<T>>;

/// Raw byte storage addressed by storage key.
///
/// Every data method takes a batch; a single item is a batch of one. The
/// outer `Result` fails only when the whole call could not be made.
/// Implementations must accept concurrent writes of identical bytes to the
/// same key.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Unique name used in backend status records and logs.
    fn name(&self) -> &str;

    fn backend_type(&self) -> BackendType;

    async fn store(&self, items: Vec<(StorageKey, Bytes)>) -> Result<BatchOutcome<()>>;

    async fn retrieve(&self, keys: &[StorageKey]) -> Result<BatchOutcome<Bytes>>;

    /// `true` when the object existed and is now gone.
    async fn delete(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, bool>>;

    async fn health_check(&self) -> HealthStatus;

    /// Keys whose hex form starts with `prefix`, or every key.
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StorageKey>>;

    async fn store_one(&self, key: StorageKey, data: Bytes) -> Result<()> {
        let mut outcome = self.store(vec![(key, data)]).await?;
        outcome.remove(&key).unwrap_or_else(|| Err(missing_outcome(self.name(), &key)))
    }

    async fn retrieve_one(&self, key: &StorageKey) -> Result<Bytes> {
        let mut outcome = self.retrieve(std::slice::from_ref(key)).await?;
        outcome.remove(key).unwrap_or_else(|| Err(missing_outcome(self.name(), key)))
    }
}

fn missing_outcome(backend: &str, key: &StorageKey) -> Error {
    Error::transient(backend, format!("no outcome reported for {}", key.short_string()))
}
