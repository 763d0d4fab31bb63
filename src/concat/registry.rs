use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::file::VirtualFile;

/// Concurrent map from FUSE file handle to its materialized virtual file.
///
/// Structural mutation is serialized by one mutex scoped to the map
/// operation itself; the lock is never held across I/O. Lookups hand out an
/// `Arc` so a read in flight survives a concurrent `remove` of the same
/// handle: the entry disappears from the map immediately and the chunk
/// handles are released when the last in-flight reference drops. Entries are
/// never shared between two opens, so this is a lock-scope device rather
/// than a sharing mechanism.
#[derive(Default)]
pub struct OpenFileRegistry {
    files: Mutex<HashMap<u64, Arc<VirtualFile>>>,
}

impl OpenFileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn files(&self) -> MutexGuard<'_, HashMap<u64, Arc<VirtualFile>>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a freshly materialized virtual file under its handle.
    /// Handles are unique at any instant; inserting a duplicate replaces the
    /// stale entry.
    pub fn insert(&self, fh: u64, file: VirtualFile) {
        self.files().insert(fh, Arc::new(file));
    }

    /// Non-owning lookup for read serving.
    pub fn find(&self, fh: u64) -> Option<Arc<VirtualFile>> {
        self.files().get(&fh).cloned()
    }

    /// Detach an entry for destruction. Removing an absent handle is not an
    /// error.
    pub fn remove(&self, fh: u64) -> Option<Arc<VirtualFile>> {
        self.files().remove(&fh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn descriptor(dir: &Path, lines: &str) -> std::path::PathBuf {
        let mut f = File::create(dir.join("part.bin")).unwrap();
        f.write_all(b"0123456789").unwrap();
        let path = dir.join("x-concat-y");
        std::fs::write(&path, lines).unwrap();
        path
    }

    fn materialize(path: &Path) -> VirtualFile {
        VirtualFile::open(path, File::open(path).unwrap()).unwrap()
    }

    #[test]
    fn insert_find_remove_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = OpenFileRegistry::new();

        let desc = descriptor(dir.path(), "part.bin\n");
        registry.insert(7, materialize(&desc));
        assert_eq!(registry.find(7).unwrap().size(), 10);
        assert_eq!(registry.remove(7).unwrap().size(), 10);
        assert!(registry.find(7).is_none());
        assert!(registry.remove(7).is_none());
    }

    #[test]
    fn read_in_flight_survives_concurrent_close() {
        let dir = tempfile::tempdir().unwrap();
        let registry = OpenFileRegistry::new();
        let desc = descriptor(dir.path(), "part.bin:5:3\n");
        registry.insert(1, materialize(&desc));

        let file = registry.find(1).unwrap();
        registry.remove(1);

        // The handle is gone from the map, but the materialization we hold
        // still serves reads.
        assert!(registry.find(1).is_none());
        let mut buf = [0u8; 3];
        assert_eq!(file.read_at(&mut buf, 0).unwrap(), 3);
        assert_eq!(&buf, b"567");
    }

    #[test]
    fn concurrent_handles_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(OpenFileRegistry::new());
        let desc = descriptor(dir.path(), "part.bin\n");
        let next = AtomicU64::new(1);

        // Each open independently reparses and reopens; closing one handle
        // must not disturb reads on the others.
        std::thread::scope(|scope| {
            for _ in 0..8 {
                let registry = Arc::clone(&registry);
                let desc = desc.as_path();
                let fh = next.fetch_add(1, Ordering::Relaxed);
                scope.spawn(move || {
                    registry.insert(fh, materialize(desc));
                    let file = registry.find(fh).unwrap();
                    let mut buf = [0u8; 10];
                    assert_eq!(file.read_at(&mut buf, 0).unwrap(), 10);
                    assert_eq!(&buf, b"0123456789");
                    assert!(registry.remove(fh).is_some());
                });
            }
        });

        assert!(registry.find(1).is_none());
    }
}
