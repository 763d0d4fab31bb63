use std::collections::HashMap;
use std::path::{Path, PathBuf};

use rfuse3::Inode;

pub const ROOT_INODE: Inode = 1;

/// Bidirectional inode ↔ source-path table.
///
/// The raw FUSE protocol addresses everything by inode while the underlying
/// tree is path-addressed, so the filesystem allocates an inode the first
/// time a path is seen (lookup/readdirplus/create) and keeps the pair until
/// the path is unlinked or renamed away. Inodes are never reused within a
/// mount.
pub struct InodeTable {
    next: Inode,
    paths: HashMap<Inode, PathBuf>,
    inodes: HashMap<PathBuf, Inode>,
}

impl InodeTable {
    pub fn new(root: PathBuf) -> Self {
        let mut table = InodeTable {
            next: ROOT_INODE + 1,
            paths: HashMap::new(),
            inodes: HashMap::new(),
        };
        table.paths.insert(ROOT_INODE, root.clone());
        table.inodes.insert(root, ROOT_INODE);
        table
    }

    /// Source path for an inode, if the kernel ever learned about it.
    pub fn path_of(&self, inode: Inode) -> Option<PathBuf> {
        self.paths.get(&inode).cloned()
    }

    /// Inode for a path, allocating on first sight.
    pub fn assign(&mut self, path: PathBuf) -> Inode {
        if let Some(&inode) = self.inodes.get(&path) {
            return inode;
        }
        let inode = self.next;
        self.next += 1;
        self.paths.insert(inode, path.clone());
        self.inodes.insert(path, inode);
        inode
    }

    /// Drop the mapping for a removed path. The inode itself is retired.
    pub fn forget_path(&mut self, path: &Path) {
        if let Some(inode) = self.inodes.remove(path) {
            self.paths.remove(&inode);
        }
    }

    /// Rewrite mappings after a rename, including every descendant of a
    /// renamed directory.
    pub fn rename(&mut self, old: &Path, new: &Path) {
        // A rename over an existing target replaces it.
        self.forget_path(new);

        let moved: Vec<(PathBuf, Inode)> = self
            .inodes
            .iter()
            .filter(|(path, _)| path.starts_with(old))
            .map(|(path, &inode)| (path.clone(), inode))
            .collect();

        for (path, inode) in moved {
            self.inodes.remove(&path);
            let suffix = path.strip_prefix(old).unwrap_or(&path);
            let relocated = if suffix.as_os_str().is_empty() {
                new.to_path_buf()
            } else {
                new.join(suffix)
            };
            self.paths.insert(inode, relocated.clone());
            self.inodes.insert(relocated, inode);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new(PathBuf::from("/src"));
        assert_eq!(table.path_of(ROOT_INODE), Some(PathBuf::from("/src")));
    }

    #[test]
    fn assign_is_stable_per_path() {
        let mut table = InodeTable::new(PathBuf::from("/src"));
        let a = table.assign(PathBuf::from("/src/a"));
        let b = table.assign(PathBuf::from("/src/b"));
        assert_ne!(a, b);
        assert_eq!(table.assign(PathBuf::from("/src/a")), a);
        assert_eq!(table.path_of(a), Some(PathBuf::from("/src/a")));
    }

    #[test]
    fn forget_path_retires_the_inode() {
        let mut table = InodeTable::new(PathBuf::from("/src"));
        let a = table.assign(PathBuf::from("/src/a"));
        table.forget_path(Path::new("/src/a"));
        assert_eq!(table.path_of(a), None);
        assert_ne!(table.assign(PathBuf::from("/src/a")), a);
    }

    #[test]
    fn rename_moves_the_whole_subtree() {
        let mut table = InodeTable::new(PathBuf::from("/src"));
        let dir = table.assign(PathBuf::from("/src/d"));
        let child = table.assign(PathBuf::from("/src/d/f"));
        let nested = table.assign(PathBuf::from("/src/d/e/g"));
        let other = table.assign(PathBuf::from("/src/dx"));

        table.rename(Path::new("/src/d"), Path::new("/src/r"));

        assert_eq!(table.path_of(dir), Some(PathBuf::from("/src/r")));
        assert_eq!(table.path_of(child), Some(PathBuf::from("/src/r/f")));
        assert_eq!(table.path_of(nested), Some(PathBuf::from("/src/r/e/g")));
        // Sibling with a common name prefix is untouched.
        assert_eq!(table.path_of(other), Some(PathBuf::from("/src/dx")));
    }

    #[test]
    fn rename_over_existing_target_replaces_it() {
        let mut table = InodeTable::new(PathBuf::from("/src"));
        let a = table.assign(PathBuf::from("/src/a"));
        let b = table.assign(PathBuf::from("/src/b"));

        table.rename(Path::new("/src/a"), Path::new("/src/b"));

        assert_eq!(table.path_of(a), Some(PathBuf::from("/src/b")));
        assert_eq!(table.path_of(b), None);
    }
}
