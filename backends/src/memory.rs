use crate::backend::{Backend, BackendType, BatchOutcome, HealthStatus};
use async_trait::async_trait;
use blobkeep_core::{Error, Result, StorageKey};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// Process-local blob map. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBackend {
    name: String,
    objects: RwLock<BTreeMap<StorageKey, Bytes>>,
}

impl MemoryBackend {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: RwLock::new(BTreeMap::new()),
        }
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn get(&self, key: &StorageKey) -> Option<Bytes> {
        self.objects.read().await.get(key).cloned()
    }

    /// Overwrite an object directly, bypassing `store`.
    pub async fn put_raw(&self, key: StorageKey, data: Bytes) {
        self.objects.write().await.insert(key, data);
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    async fn store(&self, items: Vec<(StorageKey, Bytes)>) -> Result<BatchOutcome<()>> {
        let mut objects = self.objects.write().await;
        Ok(items
            .into_iter()
            .map(|(key, data)| {
                objects.insert(key, data);
                (key, Ok(()))
            })
            .collect())
    }

    async fn retrieve(&self, keys: &[StorageKey]) -> Result<BatchOutcome<Bytes>> {
        let objects = self.objects.read().await;
        Ok(keys
            .iter()
            .map(|key| {
                let result = objects
                    .get(key)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("{} on backend {}", key.to_hex(), self.name)));
                (*key, result)
            })
            .collect())
    }

    async fn delete(&self, keys: &[StorageKey]) -> Result<HashMap<StorageKey, bool>> {
        let mut objects = self.objects.write().await;
        Ok(keys.iter().map(|key| (*key, objects.remove(key).is_some())).collect())
    }

    async fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<StorageKey>> {
        let prefix = prefix.unwrap_or("").to_ascii_lowercase();
        Ok(self
            .objects
            .read()
            .await
            .keys()
            .filter(|key| key.to_hex().starts_with(&prefix))
            .copied()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_outcomes_are_per_key() {
        let backend = MemoryBackend::new("mem");
        let a = StorageKey::from_data(b"a");
        let b = StorageKey::from_data(b"b");

        let stored = backend
            .store(vec![(a, Bytes::from_static(b"1")), (b, Bytes::from_static(b"2"))])
            .await
            .unwrap();
        assert!(stored.values().all(|r| r.is_ok()));
        assert_eq!(backend.len().await, 2);

        let removed = backend.delete(&[a]).await.unwrap();
        assert!(removed[&a]);
        let fetched = backend.retrieve(&[a, b]).await.unwrap();
        assert!(fetched[&a].is_err());
        assert_eq!(fetched[&b].as_ref().unwrap(), &Bytes::from_static(b"2"));
        assert_eq!(backend.list(None).await.unwrap(), vec![b]);
    }
}
