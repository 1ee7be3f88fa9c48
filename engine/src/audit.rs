//! Compare what the manifest believes is durable with what a backend holds.

use blobkeep_backends::Backend;
use blobkeep_core::{BlobCodec, Error, ManifestStore, Result, StorageKey};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

const PAGE_SIZE: usize = 128;

#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub backend: String,
    pub committed: u64,
    pub stored: u64,
    /// Committed in the manifest, absent from the backend.
    pub missing: Vec<StorageKey>,
    /// On the backend, unknown to the manifest.
    pub orphaned: Vec<StorageKey>,
    /// Present but failing decode or verification. Only filled by a deep audit.
    pub corrupt: Vec<(StorageKey, String)>,
    pub deep: bool,
}

impl AuditReport {
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.corrupt.is_empty()
    }
}

/// With a codec the audit is deep: every committed blob is downloaded and
/// opened, which needs the passphrase.
pub async fn audit(
    manifest: &ManifestStore,
    backend: &dyn Backend,
    codec: Option<&Arc<BlobCodec>>,
) -> Result<AuditReport> {
    let committed = manifest.committed_keys().await?;
    let stored: BTreeSet<StorageKey> = backend.list(None).await?.into_iter().collect();

    let mut report = AuditReport {
        backend: backend.name().to_string(),
        committed: committed.len() as u64,
        stored: stored.len() as u64,
        missing: committed.difference(&stored).copied().collect(),
        orphaned: stored.difference(&committed).copied().collect(),
        corrupt: Vec::new(),
        deep: codec.is_some(),
    };

    if let Some(codec) = codec {
        let present: Vec<StorageKey> = committed.intersection(&stored).copied().collect();
        for page in present.chunks(PAGE_SIZE) {
            let mut outcome = backend.retrieve(page).await?;
            for key in page {
                let verdict = match outcome.remove(key) {
                    Some(Ok(data)) => {
                        let codec = codec.clone();
                        let storage_key = *key;
                        tokio::task::spawn_blocking(move || codec.open_bytes(&storage_key, &data).map(|_| ()))
                            .await
                            .map_err(|e| Error::Other(format!("codec task failed: {e}")))?
                    }
                    Some(Err(Error::NotFound(_))) | None => {
                        report.missing.push(*key);
                        continue;
                    }
                    Some(Err(e)) => return Err(e),
                };
                if let Err(e) = verdict {
                    warn!(storage_key = %key.short_string(), error = %e, "Blob failed verification");
                    report.corrupt.push((*key, e.to_string()));
                }
            }
        }
    }

    info!(
        backend = %report.backend,
        committed = report.committed,
        missing = report.missing.len(),
        orphaned = report.orphaned.len(),
        corrupt = report.corrupt.len(),
        deep = report.deep,
        "Audit finished"
    );
    Ok(report)
}

/// Invalidate missing and corrupt groups so the next run re-creates them
/// from source. Returns the number of records reset.
pub async fn repair(manifest: &ManifestStore, report: &AuditReport) -> Result<u64> {
    let keys: BTreeSet<&StorageKey> = report
        .missing
        .iter()
        .chain(report.corrupt.iter().map(|(key, _)| key))
        .collect();
    let mut reset = 0;
    for key in keys {
        reset += manifest.invalidate(key).await?;
    }
    Ok(reset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{BackendSlot, CoordinatorConfig, UploadCoordinator};
    use blobkeep_backends::{MemoryBackend, RetryConfig};
    use blobkeep_core::{ChangesetRequest, DiscoveredFile, FsSource, KdfParams, UploadState};
    use bytes::Bytes;
    use tempfile::TempDir;

    const KDF: KdfParams = KdfParams { iterations: 8 };

    #[tokio::test]
    async fn test_audit_finds_missing_orphaned_and_corrupt() {
        let dir = TempDir::new().unwrap();
        for name in ["a.txt", "b.txt", "c.txt"] {
            std::fs::write(dir.path().join(name), name.as_bytes()).unwrap();
        }
        let manifest = ManifestStore::connect_in_memory().await.unwrap();
        let backend = Arc::new(MemoryBackend::new("mem"));
        let coordinator = UploadCoordinator::new(
            manifest.clone(),
            vec![BackendSlot::new(backend.clone()).with_retry(RetryConfig::immediate(1))],
            Arc::new(FsSource::new(dir.path())),
            "audit",
            CoordinatorConfig {
                kdf: KDF,
                ..Default::default()
            },
        )
        .unwrap();
        let request = ChangesetRequest::new(
            "audited",
            vec![
                DiscoveredFile::new("a.txt", 1, 1),
                DiscoveredFile::new("b.txt", 1, 2),
                DiscoveredFile::new("c.txt", 1, 3),
            ],
        );
        let id = coordinator.submit(&request).await.unwrap();
        coordinator.run_changeset(&id).await.unwrap();

        let records = manifest.list_files(&id, None).await.unwrap();
        let key_of = |path: &str| records.iter().find(|r| r.path == path).unwrap().storage_key;
        let (a, b) = (key_of("a.txt"), key_of("b.txt"));
        backend.delete(&[a]).await.unwrap();
        backend.put_raw(b, Bytes::from_static(b"{\"garbage\": true}")).await;
        let stray = StorageKey::from_data(b"stray");
        backend.put_raw(stray, Bytes::from_static(b"stray")).await;

        let shallow = audit(&manifest, backend.as_ref(), None).await.unwrap();
        assert_eq!(shallow.missing, vec![a]);
        assert_eq!(shallow.orphaned, vec![stray]);
        assert!(shallow.corrupt.is_empty());

        let codec = Arc::new(BlobCodec::with_kdf_params("audit", KDF));
        let deep = audit(&manifest, backend.as_ref(), Some(&codec)).await.unwrap();
        assert_eq!(deep.corrupt.len(), 1);
        assert_eq!(deep.corrupt[0].0, b);
        assert!(!deep.is_clean());

        assert_eq!(repair(&manifest, &deep).await.unwrap(), 2);
        let pending = manifest.list_files(&id, Some(UploadState::NotStarted)).await.unwrap();
        assert_eq!(pending.len(), 2);

        // A fresh run re-creates both groups from source.
        coordinator.run_changeset(&id).await.unwrap();
        let after = audit(&manifest, backend.as_ref(), Some(&codec)).await.unwrap();
        assert!(after.is_clean());
    }
}
