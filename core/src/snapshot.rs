//! On-disk pre-image store.
//!
//! Snapshots live under `tasks/<task>/snapshots/<tx id>/<path hash>.bak`.
//! Writes go through a temp file plus rename so a crash mid-write can never
//! leave a corrupt snapshot behind a journal reference.

use std::io;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;

use crate::util::path_hash;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Store the pre-image bytes of `path` for transaction `tx_id`.
    /// Idempotent per `(tx, path)`: a second write replaces the first with
    /// identical content, since backups are taken before the first write.
    pub fn put(&self, tx_id: &str, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = self.root.join(tx_id);
        std::fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{}.bak", path_hash(path)));
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn get(&self, tx_id: &str, path: &Path) -> io::Result<Vec<u8>> {
        let target = self.root.join(tx_id).join(format!("{}.bak", path_hash(path)));
        std::fs::read(target)
    }

    pub fn contains(&self, tx_id: &str, path: &Path) -> bool {
        self.root
            .join(tx_id)
            .join(format!("{}.bak", path_hash(path)))
            .exists()
    }

    /// Delete every snapshot taken by `tx_id`. Missing directories are fine;
    /// eviction may race a rollback that already cleaned up.
    pub fn forget(&self, tx_id: &str) -> io::Result<()> {
        let dir = self.root.join(tx_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove the whole store (task termination).
    pub fn reap(&self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn put_get_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let path = Path::new("/ws/src/a.rs");
        store.put("tx1", path, b"before").unwrap();
        assert_eq!(store.get("tx1", path).unwrap(), b"before");
        assert!(store.contains("tx1", path));
        assert!(!store.contains("tx2", path));
    }

    #[test]
    fn forget_removes_only_that_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::new(dir.path().join("snapshots"));
        let path = Path::new("/ws/a.txt");
        store.put("tx1", path, b"one").unwrap();
        store.put("tx2", path, b"two").unwrap();
        store.forget("tx1").unwrap();
        assert!(store.get("tx1", path).is_err());
        assert_eq!(store.get("tx2", path).unwrap(), b"two");
        // Forgetting twice is not an error.
        store.forget("tx1").unwrap();
    }
}
