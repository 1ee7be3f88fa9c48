//! Discovery clients decide *what* goes into a changeset.

use blobkeep_core::{ChangesetRequest, DiscoveredFile, Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

pub trait DiscoveryClient: Send + Sync {
    fn discover(&self) -> Result<Vec<DiscoveredFile>>;

    fn request(&self, name: &str) -> Result<ChangesetRequest> {
        Ok(ChangesetRequest::new(name, self.discover()?))
    }
}

/// Walks a directory tree. Symlinks are reported, never followed; paths are
/// relative to the root with `/` separators.
#[derive(Debug, Clone)]
pub struct TreeScanner {
    root: PathBuf,
    excludes: Vec<PathBuf>,
}

impl TreeScanner {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            excludes: Vec::new(),
        }
    }

    /// Skip these absolute paths and everything below them.
    pub fn exclude<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.excludes.push(path.as_ref().to_path_buf());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// [`DiscoveryClient::request`] on the blocking pool.
    pub async fn scan(&self, name: &str) -> Result<ChangesetRequest> {
        let scanner = self.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || scanner.request(&name))
            .await
            .map_err(|e| Error::Other(format!("scan task failed: {e}")))?
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Option<Vec<&str>> = relative.components().map(|c| c.as_os_str().to_str()).collect();
        Some(parts?.join("/"))
    }
}

impl DiscoveryClient for TreeScanner {
    fn discover(&self) -> Result<Vec<DiscoveredFile>> {
        if !self.root.is_dir() {
            return Err(Error::InvalidInput(format!("{} is not a directory", self.root.display())));
        }

        let mut files = Vec::new();
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| !self.excludes.iter().any(|x| e.path().starts_with(x)));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            let file_type = entry.file_type();
            if !file_type.is_file() && !file_type.is_symlink() {
                continue;
            }
            let Some(path) = self.relative(entry.path()) else {
                warn!(path = %entry.path().display(), "Skipping path that is not valid UTF-8");
                continue;
            };

            let metadata = entry.metadata().map_err(std::io::Error::from)?;
            let mut file = inode_of(path, &metadata);
            file.is_symlink = file_type.is_symlink();
            files.push(file);
        }

        debug!(root = %self.root.display(), files = files.len(), "Scanned tree");
        Ok(files)
    }
}

#[cfg(unix)]
fn inode_of(path: String, metadata: &std::fs::Metadata) -> DiscoveredFile {
    use std::os::unix::fs::MetadataExt;
    DiscoveredFile::new(path, metadata.dev(), metadata.ino())
}

#[cfg(not(unix))]
fn inode_of(path: String, _metadata: &std::fs::Metadata) -> DiscoveredFile {
    DiscoveredFile::detached(path)
}
