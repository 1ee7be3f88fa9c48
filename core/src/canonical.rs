//! Hardlink-aware grouping of discovered files.
//!
//! Files sharing `(device, inode)` collapse into one group whose canonical
//! member is the lexicographically smallest path. Only the canonical member is
//! ever read and uploaded; siblings inherit its storage key.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One entry handed over by a discovery client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiscoveredFile {
    pub path: String,
    pub device_id: Option<u64>,
    pub inode_id: Option<u64>,
    pub is_symlink: bool,
}

impl DiscoveredFile {
    pub fn new(path: impl Into<String>, device_id: u64, inode_id: u64) -> Self {
        Self {
            path: path.into(),
            device_id: Some(device_id),
            inode_id: Some(inode_id),
            is_symlink: false,
        }
    }

    /// An entry without inode information; always its own group.
    pub fn detached(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            device_id: None,
            inode_id: None,
            is_symlink: false,
        }
    }

    pub fn symlink(mut self) -> Self {
        self.is_symlink = true;
        self
    }

    fn group_key(&self) -> GroupKey {
        match (self.device_id, self.inode_id) {
            (Some(device), Some(inode)) => GroupKey::Inode {
                device,
                inode,
                is_symlink: self.is_symlink,
            },
            _ => GroupKey::Singleton(self.path.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Inode { device: u64, inode: u64, is_symlink: bool },
    Singleton(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardlinkGroup {
    pub canonical: DiscoveredFile,
    /// Sorted by path; never contains the canonical member.
    pub siblings: Vec<DiscoveredFile>,
}

impl HardlinkGroup {
    pub fn member_count(&self) -> usize {
        1 + self.siblings.len()
    }

    pub fn members(&self) -> impl Iterator<Item = &DiscoveredFile> {
        std::iter::once(&self.canonical).chain(self.siblings.iter())
    }
}

/// Group a changeset's entries. Output is ordered by canonical path, so the
/// result does not depend on input order. Repeated paths collapse to one entry.
pub fn resolve(files: impl IntoIterator<Item = DiscoveredFile>) -> Vec<HardlinkGroup> {
    let mut by_key: BTreeMap<GroupKey, BTreeMap<String, DiscoveredFile>> = BTreeMap::new();
    let mut seen = HashSet::new();
    for file in files {
        if !seen.insert(file.path.clone()) {
            continue;
        }
        by_key
            .entry(file.group_key())
            .or_default()
            .entry(file.path.clone())
            .or_insert(file);
    }

    let mut groups: Vec<HardlinkGroup> = by_key
        .into_values()
        .filter_map(|members| {
            let mut members = members.into_values();
            let canonical = members.next()?;
            Some(HardlinkGroup {
                canonical,
                siblings: members.collect(),
            })
        })
        .collect();

    groups.sort_by(|a, b| a.canonical.path.cmp(&b.canonical.path));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_singletons_are_their_own_canonical() {
        let groups = resolve(vec![
            DiscoveredFile::new("b.txt", 1, 20),
            DiscoveredFile::new("a.txt", 1, 10),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].canonical.path, "a.txt");
        assert!(groups[0].siblings.is_empty());
    }

    #[test]
    fn test_hardlinks_pick_smallest_path_regardless_of_order() {
        let forward = vec![
            DiscoveredFile::new("snap/2024-01-02/data.bin", 7, 99),
            DiscoveredFile::new("snap/2024-01-01/data.bin", 7, 99),
            DiscoveredFile::new("current/data.bin", 7, 99),
        ];
        let mut backward = forward.clone();
        backward.reverse();

        for input in [forward, backward] {
            let groups = resolve(input);
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].canonical.path, "current/data.bin");
            assert_eq!(groups[0].member_count(), 3);
            assert_eq!(groups[0].siblings[0].path, "snap/2024-01-01/data.bin");
        }
    }

    #[test]
    fn test_same_inode_on_other_device_is_separate() {
        let groups = resolve(vec![
            DiscoveredFile::new("a", 1, 5),
            DiscoveredFile::new("b", 2, 5),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_symlinks_never_group_with_files() {
        let groups = resolve(vec![
            DiscoveredFile::new("file", 1, 5),
            DiscoveredFile::new("link", 1, 5).symlink(),
        ]);
        assert_eq!(groups.len(), 2);
        assert!(groups.iter().any(|g| g.canonical.is_symlink));
    }

    #[test]
    fn test_missing_inode_is_singleton() {
        let groups = resolve(vec![
            DiscoveredFile::detached("remote/a"),
            DiscoveredFile::detached("remote/b"),
        ]);
        assert_eq!(groups.len(), 2);
    }

    #[test]
    fn test_duplicate_paths_collapse() {
        let groups = resolve(vec![DiscoveredFile::new("a", 1, 5), DiscoveredFile::new("a", 1, 5)]);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_count(), 1);
    }
}
