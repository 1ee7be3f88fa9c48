//! Rebuild state straight from backend contents, without the manifest.
//!
//! Metadata is plaintext, so an inventory needs no passphrase. Content needs
//! the passphrase and the KDF parameters the blobs were written with.
//! Hardlink relationships cannot be recovered: only canonical members were
//! ever written as blobs.

use blobkeep_backends::Backend;
use blobkeep_core::changeset::{changeset_id, content_signature};
use blobkeep_core::codec::storage_key_for;
use blobkeep_core::{
    Blob, BlobCodec, BlobMetadata, Changeset, ChangesetId, ChangesetStatus, Error, FileRecord, ManifestStore, Result,
    StorageKey,
};
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tracing::{debug, info, warn};

pub const DEFAULT_PAGE_SIZE: usize = 128;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveredBlob {
    pub storage_key: StorageKey,
    pub metadata: BlobMetadata,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Inventory {
    pub blobs: Vec<RecoveredBlob>,
    /// Objects that could not be fetched or whose metadata did not parse.
    pub unreadable: Vec<(StorageKey, String)>,
}

impl Inventory {
    /// One blob per path: the newest timestamp wins, ties go to the higher key.
    pub fn latest_by_path(&self) -> Vec<&RecoveredBlob> {
        let mut latest: BTreeMap<&str, &RecoveredBlob> = BTreeMap::new();
        for blob in &self.blobs {
            latest
                .entry(blob.metadata.path.as_str())
                .and_modify(|current| {
                    let newer = (blob.metadata.timestamp, blob.storage_key)
                        > (current.metadata.timestamp, current.storage_key);
                    if newer {
                        *current = blob;
                    }
                })
                .or_insert(blob);
        }
        latest.into_values().collect()
    }

    pub fn total_size(&self) -> u64 {
        self.blobs.iter().map(|b| b.metadata.size).sum()
    }
}

#[derive(Debug, Clone)]
pub struct RecoveredFile {
    pub storage_key: StorageKey,
    pub metadata: BlobMetadata,
    /// File bytes, or the link target for symlinks.
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RestoreOptions {
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RestoreReport {
    pub files: u64,
    pub symlinks: u64,
    pub bytes: u64,
    /// Older blobs for a path that a newer blob replaced.
    pub superseded: u64,
    pub skipped_existing: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub changeset_id: ChangesetId,
    pub records: u64,
    /// `false` when an identical changeset was already in the manifest.
    pub created: bool,
    /// Blobs whose metadata does not hash to the key they are stored under.
    pub mismatched: Vec<StorageKey>,
}

pub struct Reconstructor {
    backend: Arc<dyn Backend>,
    page_size: usize,
}

impl Reconstructor {
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Read the plaintext metadata of every object on the backend.
    pub async fn reconstruct_metadata(&self) -> Result<Inventory> {
        let keys = self.backend.list(None).await?;
        let mut inventory = Inventory::default();

        for page in keys.chunks(self.page_size) {
            let mut outcome = self.backend.retrieve(page).await?;
            for key in page {
                let parsed = match outcome.remove(key) {
                    Some(Ok(data)) => Blob::read_metadata(&data),
                    Some(Err(e)) => Err(e),
                    None => Err(Error::NotFound(format!("no data returned for {}", key.short_string()))),
                };
                match parsed {
                    Ok(metadata) => inventory.blobs.push(RecoveredBlob {
                        storage_key: *key,
                        metadata,
                    }),
                    Err(e) => {
                        warn!(storage_key = %key.short_string(), error = %e, "Unreadable object");
                        inventory.unreadable.push((*key, e.to_string()));
                    }
                }
            }
            debug!(page = page.len(), total = inventory.blobs.len(), "Read metadata page");
        }

        info!(
            backend = self.backend.name(),
            blobs = inventory.blobs.len(),
            unreadable = inventory.unreadable.len(),
            "Reconstructed metadata"
        );
        Ok(inventory)
    }

    /// Fetch, decrypt and verify one blob.
    pub async fn reconstruct_file(&self, key: &StorageKey, codec: &Arc<BlobCodec>) -> Result<RecoveredFile> {
        let data = self.backend.retrieve_one(key).await?;
        let codec = codec.clone();
        let storage_key = *key;
        let (metadata, content) = tokio::task::spawn_blocking(move || codec.open_bytes(&storage_key, &data))
            .await
            .map_err(|e| Error::Other(format!("codec task failed: {e}")))?
            .map_err(|e| match e {
                Error::Codec(detail) => Error::Corruption {
                    key: storage_key.to_hex(),
                    detail,
                },
                other => other,
            })?;

        Ok(RecoveredFile {
            storage_key,
            metadata,
            content,
        })
    }

    /// Write the newest version of every path below `target`.
    ///
    /// Regular files go first and symlinks last. A destination with a
    /// symlinked ancestor below `target` is refused.
    pub async fn restore_all(
        &self,
        target: &Path,
        codec: &Arc<BlobCodec>,
        options: RestoreOptions,
    ) -> Result<RestoreReport> {
        let inventory = self.reconstruct_metadata().await?;
        let latest = inventory.latest_by_path();
        let mut report = RestoreReport {
            superseded: (inventory.blobs.len() - latest.len()) as u64,
            ..Default::default()
        };
        fs::create_dir_all(target).await?;

        let (links, files): (Vec<_>, Vec<_>) = latest.into_iter().partition(|b| b.metadata.blob_type.is_symlink());
        for blob in files.into_iter().chain(links) {
            let path = &blob.metadata.path;
            let Some(relative) = safe_relative(path) else {
                warn!(path = %path, "Refusing to restore path outside the target");
                report.failed.push((path.clone(), "unsafe path".to_string()));
                continue;
            };
            if let Some(ancestor) = symlinked_ancestor(target, &relative).await {
                warn!(path = %path, ancestor = %ancestor.display(), "Refusing to restore through a symlink");
                report
                    .failed
                    .push((path.clone(), format!("symlinked ancestor {}", ancestor.display())));
                continue;
            }
            let destination = target.join(relative);

            let exists = fs::symlink_metadata(&destination).await.is_ok();
            if exists && !options.overwrite {
                report.skipped_existing.push(path.clone());
                continue;
            }

            // Decode before touching anything on disk.
            let restored = match self.reconstruct_file(&blob.storage_key, codec).await {
                Ok(file) if exists => match fs::remove_file(&destination).await {
                    Ok(()) => write_restored(&destination, &file).await,
                    Err(e) => Err(e.into()),
                },
                Ok(file) => write_restored(&destination, &file).await,
                Err(e) => Err(e),
            };
            match restored {
                Ok(()) if blob.metadata.blob_type.is_symlink() => report.symlinks += 1,
                Ok(()) => {
                    report.files += 1;
                    report.bytes += blob.metadata.size;
                }
                Err(e) => {
                    warn!(path = %path, error = %e, "Restore failed");
                    report.failed.push((path.clone(), e.to_string()));
                }
            }
        }

        info!(
            target = %target.display(),
            files = report.files,
            symlinks = report.symlinks,
            failed = report.failed.len(),
            "Restore finished"
        );
        Ok(report)
    }

    /// Insert the backend's contents as a completed changeset named `name`.
    pub async fn rebuild_manifest(&self, manifest: &ManifestStore, name: &str) -> Result<RebuildReport> {
        let inventory = self.reconstruct_metadata().await?;
        let mut mismatched = Vec::new();
        let verified: Vec<&RecoveredBlob> = inventory
            .latest_by_path()
            .into_iter()
            .filter(|blob| {
                let ok = storage_key_for(&blob.metadata.path, &blob.metadata.file_hash) == blob.storage_key;
                if !ok {
                    mismatched.push(blob.storage_key);
                }
                ok
            })
            .collect();
        if verified.is_empty() {
            return Err(Error::InvalidInput("backend holds no recoverable blobs".to_string()));
        }

        let id = changeset_id(name, verified.iter().map(|b| b.metadata.path.as_str()));
        let now = Utc::now();
        let records: Vec<FileRecord> = verified
            .iter()
            .map(|blob| FileRecord {
                path: blob.metadata.path.clone(),
                changeset_id: id,
                device_id: None,
                inode_id: None,
                size: blob.metadata.size,
                mod_time: blob.metadata.modified(),
                content_hash: blob.metadata.file_hash,
                storage_key: blob.storage_key,
                is_canonical: true,
                is_symlink: blob.metadata.blob_type.is_symlink(),
                upload_started_at: Some(now),
                upload_finished_at: Some(now),
                hold: None,
                last_error: None,
            })
            .collect();

        let changeset = Changeset {
            changeset_id: id,
            name: name.to_string(),
            content_signature: content_signature(records.iter().map(|r| &r.storage_key)),
            created_at: now,
            file_count: records.len() as u64,
            total_size: records.iter().map(|r| r.size).sum(),
            status: ChangesetStatus::Completed,
        };
        let created = manifest.insert_changeset(&changeset, &records).await?;

        info!(
            changeset = %id.short_string(),
            records = records.len(),
            mismatched = mismatched.len(),
            created,
            "Rebuilt manifest from backend"
        );
        Ok(RebuildReport {
            changeset_id: id,
            records: records.len() as u64,
            created,
            mismatched,
        })
    }
}

/// Only plain relative components; no root, no `..`.
fn safe_relative(path: &str) -> Option<PathBuf> {
    let candidate = Path::new(path);
    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!relative.as_os_str().is_empty()).then_some(relative)
}

/// First existing prefix of `relative` below `target` that is a symlink.
async fn symlinked_ancestor(target: &Path, relative: &Path) -> Option<PathBuf> {
    let mut current = target.to_path_buf();
    let parent = relative.parent()?;
    for component in parent.components() {
        current.push(component);
        match fs::symlink_metadata(&current).await {
            Ok(meta) if meta.file_type().is_symlink() => return Some(current),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

async fn write_restored(destination: &Path, file: &RecoveredFile) -> Result<()> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).await?;
    }

    if file.metadata.blob_type.is_symlink() {
        return create_symlink(&file.content, destination).await;
    }

    fs::write(destination, &file.content).await?;
    let modified: std::time::SystemTime = file.metadata.modified().into();
    let handle = fs::OpenOptions::new().write(true).open(destination).await?.into_std().await;
    tokio::task::spawn_blocking(move || handle.set_modified(modified))
        .await
        .map_err(|e| Error::Other(format!("set mtime task failed: {e}")))??;
    Ok(())
}

#[cfg(unix)]
async fn create_symlink(target: &[u8], destination: &Path) -> Result<()> {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;
    fs::symlink(OsStr::from_bytes(target), destination).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn create_symlink(target: &[u8], destination: &Path) -> Result<()> {
    // No portable symlink; keep the target text so nothing is lost.
    fs::write(destination, target).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use blobkeep_backends::MemoryBackend;
    use blobkeep_core::{BlobType, KdfParams};
    use bytes::Bytes;
    use chrono::{DateTime, TimeZone};
    use tempfile::TempDir;

    fn codec() -> Arc<BlobCodec> {
        Arc::new(BlobCodec::with_kdf_params("recovery", KdfParams { iterations: 8 }))
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    async fn put(backend: &MemoryBackend, codec: &BlobCodec, path: &str, content: &[u8], kind: BlobType, secs: i64) -> StorageKey {
        let sealed = codec.seal(path, content, kind, at(secs)).unwrap();
        backend.store_one(sealed.storage_key, sealed.bytes).await.unwrap();
        sealed.storage_key
    }

    #[tokio::test]
    async fn test_inventory_without_passphrase() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        for i in 0..5 {
            put(&backend, &codec, &format!("f{i}"), b"data", BlobType::File, 1_700_000_000).await;
        }
        backend.put_raw(StorageKey::from_data(b"junk"), Bytes::from_static(b"not json")).await;

        let inventory = Reconstructor::new(backend).with_page_size(2).reconstruct_metadata().await.unwrap();
        assert_eq!(inventory.blobs.len(), 5);
        assert_eq!(inventory.unreadable.len(), 1);
        assert_eq!(inventory.total_size(), 20);
    }

    #[tokio::test]
    async fn test_corrupted_blob_is_reported_as_corruption() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        let key = put(&backend, &codec, "a.txt", b"precious", BlobType::File, 1_700_000_000).await;

        let stored = backend.get(&key).await.unwrap();
        let mut blob = Blob::from_bytes(&stored).unwrap();
        let mut payload = blob.payload().unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xff;
        blob.encrypted_content = BASE64.encode(payload);
        backend.put_raw(key, blob.to_bytes().unwrap()).await;

        let err = Reconstructor::new(backend).reconstruct_file(&key, &codec).await.unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));
    }

    #[tokio::test]
    async fn test_restore_newest_wins_and_restores_mtime() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        put(&backend, &codec, "docs/report.txt", b"old draft", BlobType::File, 1_600_000_000).await;
        put(&backend, &codec, "docs/report.txt", b"final", BlobType::File, 1_700_000_000).await;
        put(&backend, &codec, "top.txt", b"top", BlobType::File, 1_650_000_000).await;
        #[cfg(unix)]
        put(&backend, &codec, "link", b"top.txt", BlobType::Symlink, 1_650_000_000).await;

        let target = TempDir::new().unwrap();
        let report = Reconstructor::new(backend)
            .restore_all(target.path(), &codec, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.files, 2);
        assert_eq!(report.superseded, 1);
        assert!(report.failed.is_empty());

        let restored = target.path().join("docs/report.txt");
        assert_eq!(std::fs::read(&restored).unwrap(), b"final");
        let mtime: DateTime<Utc> = std::fs::metadata(&restored).unwrap().modified().unwrap().into();
        assert_eq!(mtime.timestamp(), 1_700_000_000);

        #[cfg(unix)]
        {
            assert_eq!(report.symlinks, 1);
            let link = std::fs::read_link(target.path().join("link")).unwrap();
            assert_eq!(link, Path::new("top.txt"));
        }
    }

    #[tokio::test]
    async fn test_metadata_path_rewrite_is_corruption() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        let key = put(&backend, &codec, "a.txt", b"precious", BlobType::File, 1_700_000_000).await;

        let stored = backend.get(&key).await.unwrap();
        let text = std::str::from_utf8(&stored).unwrap().replace("\"a.txt\"", "\"b.txt\"");
        backend.put_raw(key, Bytes::from(text)).await;

        let reconstructor = Reconstructor::new(backend);
        let err = reconstructor.reconstruct_file(&key, &codec).await.unwrap_err();
        assert!(matches!(err, Error::Corruption { .. }));

        let target = TempDir::new().unwrap();
        let report = reconstructor
            .restore_all(target.path(), &codec, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(!target.path().join("b.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_never_writes_through_a_restored_symlink() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        let outside = TempDir::new().unwrap();
        let outside_path = outside.path().to_str().unwrap().to_string();
        put(&backend, &codec, "dir/file.txt", b"inside", BlobType::File, 1_600_000_000).await;
        put(&backend, &codec, "dir", outside_path.as_bytes(), BlobType::Symlink, 1_700_000_000).await;

        let target = TempDir::new().unwrap();
        let report = Reconstructor::new(backend)
            .restore_all(target.path(), &codec, RestoreOptions::default())
            .await
            .unwrap();

        assert!(!outside.path().join("file.txt").exists());
        assert_eq!(report.files, 1);
        assert_eq!(std::fs::read(target.path().join("dir/file.txt")).unwrap(), b"inside");
        // `dir` is already a real directory, so the symlink is left out.
        assert_eq!(report.symlinks, 0);
        assert_eq!(report.skipped_existing, ["dir"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_refuses_existing_symlinked_ancestor() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        put(&backend, &codec, "dir/file.txt", b"inside", BlobType::File, 1_700_000_000).await;

        let outside = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), target.path().join("dir")).unwrap();

        let report = Reconstructor::new(backend)
            .restore_all(target.path(), &codec, RestoreOptions { overwrite: true })
            .await
            .unwrap();
        assert_eq!(report.files, 0);
        assert_eq!(report.failed.len(), 1);
        assert!(!outside.path().join("file.txt").exists());
    }

    #[tokio::test]
    async fn test_restore_keeps_existing_files_unless_asked() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        put(&backend, &codec, "a.txt", b"from backup", BlobType::File, 1_700_000_000).await;
        let target = TempDir::new().unwrap();
        std::fs::write(target.path().join("a.txt"), b"local edit").unwrap();

        let reconstructor = Reconstructor::new(backend);
        let report = reconstructor
            .restore_all(target.path(), &codec, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.skipped_existing, ["a.txt"]);
        assert_eq!(std::fs::read(target.path().join("a.txt")).unwrap(), b"local edit");

        reconstructor
            .restore_all(target.path(), &codec, RestoreOptions { overwrite: true })
            .await
            .unwrap();
        assert_eq!(std::fs::read(target.path().join("a.txt")).unwrap(), b"from backup");
    }

    #[tokio::test]
    async fn test_unsafe_paths_are_refused() {
        assert_eq!(safe_relative("a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(safe_relative("../etc/passwd"), None);
        assert_eq!(safe_relative("/etc/passwd"), None);
        assert_eq!(safe_relative(""), None);

        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        put(&backend, &codec, "../escape", b"x", BlobType::File, 1_700_000_000).await;
        let target = TempDir::new().unwrap();
        let report = Reconstructor::new(backend)
            .restore_all(target.path(), &codec, RestoreOptions::default())
            .await
            .unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(!target.path().parent().unwrap().join("escape").exists());
    }

    #[tokio::test]
    async fn test_rebuild_manifest_marks_everything_committed() {
        let backend = Arc::new(MemoryBackend::new("mem"));
        let codec = codec();
        let a = put(&backend, &codec, "a.txt", b"alpha", BlobType::File, 1_700_000_000).await;
        let b = put(&backend, &codec, "b.txt", b"beta", BlobType::File, 1_700_000_000).await;
        let manifest = ManifestStore::connect_in_memory().await.unwrap();

        let reconstructor = Reconstructor::new(backend);
        let report = reconstructor.rebuild_manifest(&manifest, "recovered").await.unwrap();
        assert!(report.created);
        assert_eq!(report.records, 2);
        assert!(manifest.is_committed(&a).await.unwrap());
        assert!(manifest.is_committed(&b).await.unwrap());

        let changeset = manifest.get_changeset(&report.changeset_id).await.unwrap().unwrap();
        assert_eq!(changeset.status, ChangesetStatus::Completed);

        let again = reconstructor.rebuild_manifest(&manifest, "recovered").await.unwrap();
        assert!(!again.created);
    }
}
