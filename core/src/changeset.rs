use crate::canonical::{DiscoveredFile, HardlinkGroup, resolve};
use crate::codec::identify;
use crate::{Changeset, ChangesetId, ChangesetStatus, ContentHash, Error, FileRecord, Result, StorageKey};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// What a discovery client hands over: a name and the files to push together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesetRequest {
    pub name: String,
    pub files: Vec<DiscoveredFile>,
}

impl ChangesetRequest {
    pub fn new(name: impl Into<String>, files: Vec<DiscoveredFile>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }
}

/// BLAKE3 over the name followed by every path in sorted order, newline separated.
pub fn changeset_id<'a>(name: &str, paths: impl IntoIterator<Item = &'a str>) -> ChangesetId {
    let sorted: BTreeSet<&str> = paths.into_iter().collect();
    let mut hasher = blake3::Hasher::new();
    hasher.update(name.as_bytes());
    for path in sorted {
        hasher.update(b"\n");
        hasher.update(path.as_bytes());
    }
    ChangesetId::from(hasher.finalize())
}

/// BLAKE3 over the distinct storage keys in sorted order.
pub fn content_signature<'a>(keys: impl IntoIterator<Item = &'a StorageKey>) -> String {
    let sorted: BTreeSet<&StorageKey> = keys.into_iter().collect();
    let mut hasher = blake3::Hasher::new();
    for key in sorted {
        hasher.update(key.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

/// Bytes of a source file, or the target of a symlink.
#[derive(Debug, Clone)]
pub struct SourceContent {
    pub bytes: Vec<u8>,
    pub modified: DateTime<Utc>,
}

/// Read-only access to the files a changeset was discovered from.
#[async_trait]
pub trait SourceReader: Send + Sync {
    async fn read(&self, path: &str, is_symlink: bool) -> Result<SourceContent>;
}

/// Sources below a root directory; manifest paths are relative to it.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl SourceReader for FsSource {
    async fn read(&self, path: &str, is_symlink: bool) -> Result<SourceContent> {
        let full_path = self.root.join(path);
        let metadata = fs::symlink_metadata(&full_path).await?;
        let modified: DateTime<Utc> = metadata.modified()?.into();

        let bytes = if is_symlink {
            let target = fs::read_link(&full_path).await?;
            path_bytes(&target)
        } else {
            fs::read(&full_path).await?
        };

        Ok(SourceContent { bytes, modified })
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes().to_vec()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// A changeset with every record computed, ready for the manifest.
#[derive(Debug, Clone)]
pub struct ChangesetPlan {
    pub changeset: Changeset,
    pub records: Vec<FileRecord>,
    pub groups: usize,
}

impl ChangesetPlan {
    pub fn canonical_records(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.iter().filter(|r| r.is_canonical)
    }
}

/// Resolve hardlink groups, identify each canonical member from its own
/// bytes, and give every sibling the canonical member's identity unread.
pub async fn plan(request: &ChangesetRequest, source: &dyn SourceReader) -> Result<ChangesetPlan> {
    if request.name.trim().is_empty() {
        return Err(Error::InvalidInput("changeset name must not be empty".to_string()));
    }

    let groups = resolve(request.files.iter().cloned());
    if groups.is_empty() {
        return Err(Error::InvalidInput("changeset has no files".to_string()));
    }

    let id = changeset_id(
        &request.name,
        groups.iter().flat_map(|g| g.members().map(|m| m.path.as_str())),
    );

    let mut records = Vec::new();
    for group in &groups {
        let content = source.read(&group.canonical.path, group.canonical.is_symlink).await?;
        let (content_hash, storage_key) = identify(&group.canonical.path, &content.bytes);
        debug!(
            path = %group.canonical.path,
            storage_key = %storage_key.short_string(),
            siblings = group.siblings.len(),
            "Identified canonical file"
        );
        records.extend(group_records(
            id,
            group,
            content.bytes.len() as u64,
            content.modified,
            content_hash,
            storage_key,
        ));
    }

    let changeset = Changeset {
        changeset_id: id,
        name: request.name.clone(),
        content_signature: content_signature(records.iter().map(|r| &r.storage_key)),
        created_at: Utc::now(),
        file_count: records.len() as u64,
        total_size: records.iter().map(|r| r.size).sum(),
        status: ChangesetStatus::Pending,
    };

    Ok(ChangesetPlan {
        changeset,
        records,
        groups: groups.len(),
    })
}

fn group_records(
    changeset_id: ChangesetId,
    group: &HardlinkGroup,
    size: u64,
    modified: DateTime<Utc>,
    content_hash: ContentHash,
    storage_key: StorageKey,
) -> Vec<FileRecord> {
    group
        .members()
        .map(|member| FileRecord {
            path: member.path.clone(),
            changeset_id,
            device_id: member.device_id,
            inode_id: member.inode_id,
            size,
            mod_time: modified,
            content_hash,
            storage_key,
            is_canonical: member.path == group.canonical.path,
            is_symlink: member.is_symlink,
            upload_started_at: None,
            upload_finished_at: None,
            hold: None,
            last_error: None,
        })
        .collect()
}
