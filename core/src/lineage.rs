//! File-lineage tracking: a stable, opaque identity per file that survives
//! moves and renames. The token codec uses it to accept tokens issued against
//! prior paths, and smart undo uses it to find where a file went.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use ignore::WalkBuilder;
use uuid::Uuid;

use crate::util::unix_ts;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone)]
pub struct MoveRecord {
    pub from: PathBuf,
    pub to: PathBuf,
    pub ts: i64,
}

#[derive(Debug, Clone)]
struct IdentityRecord {
    current_path: PathBuf,
    history: Vec<MoveRecord>,
    last_known_crc: Option<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    by_path: HashMap<PathBuf, FileId>,
    by_id: HashMap<FileId, IdentityRecord>,
}

/// Per-task tracker. A path maps to at most one identity at a time; an
/// identity keeps the full move history since registration.
#[derive(Debug, Default)]
pub struct LineageTracker {
    inner: Mutex<Inner>,
}

impl LineageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `path`, returning its identity. Idempotent: re-registering a
    /// live path returns the existing id.
    pub fn register_file(&self, path: &Path) -> FileId {
        let mut inner = self.lock();
        if let Some(id) = inner.by_path.get(path) {
            return id.clone();
        }
        let id = FileId(Uuid::new_v4().simple().to_string());
        inner.by_path.insert(path.to_path_buf(), id.clone());
        inner.by_id.insert(
            id.clone(),
            IdentityRecord {
                current_path: path.to_path_buf(),
                history: Vec::new(),
                last_known_crc: None,
            },
        );
        id
    }

    /// Record a move. The destination takes over the source's identity; a
    /// previously unregistered source is registered first so the history is
    /// still anchored somewhere.
    pub fn record_move(&self, from: &Path, to: &Path) {
        let id = self.register_file(from);
        let mut inner = self.lock();
        inner.by_path.remove(from);
        inner.by_path.insert(to.to_path_buf(), id.clone());
        if let Some(record) = inner.by_id.get_mut(&id) {
            record.current_path = to.to_path_buf();
            record.history.push(MoveRecord {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                ts: unix_ts(),
            });
        }
    }

    pub fn file_id(&self, path: &Path) -> Option<FileId> {
        self.lock().by_path.get(path).cloned()
    }

    pub fn current_path(&self, id: &FileId) -> Option<PathBuf> {
        self.lock().by_id.get(id).map(|r| r.current_path.clone())
    }

    /// Every path the identity now at `path` has previously lived at, most
    /// recent first. Empty when the path has no recorded identity.
    pub fn prior_paths(&self, path: &Path) -> Vec<PathBuf> {
        let inner = self.lock();
        let Some(id) = inner.by_path.get(path) else {
            return Vec::new();
        };
        let Some(record) = inner.by_id.get(id) else {
            return Vec::new();
        };
        let mut out: Vec<PathBuf> = record
            .history
            .iter()
            .rev()
            .map(|m| m.from.clone())
            .collect();
        out.dedup();
        out
    }

    pub fn record_crc(&self, path: &Path, crc: u32) {
        let mut inner = self.lock();
        let Some(id) = inner.by_path.get(path).cloned() else {
            return;
        };
        if let Some(record) = inner.by_id.get_mut(&id) {
            record.last_known_crc = Some(crc);
        }
    }

    /// Paths whose identity last recorded `crc`.
    pub fn find_by_crc(&self, crc: u32) -> Vec<PathBuf> {
        let inner = self.lock();
        inner
            .by_id
            .values()
            .filter(|r| r.last_known_crc == Some(crc))
            .map(|r| r.current_path.clone())
            .collect()
    }

    /// Drop the identity currently living at `path` (file deleted).
    pub fn forget(&self, path: &Path) {
        let mut inner = self.lock();
        if let Some(id) = inner.by_path.remove(path) {
            inner.by_id.remove(&id);
        }
    }

    /// Where the identity that used to live at `path` lives now, if it moved.
    pub fn resolve_moved(&self, path: &Path) -> Option<PathBuf> {
        let inner = self.lock();
        for record in inner.by_id.values() {
            if record.current_path != path
                && record.history.iter().any(|m| m.from == path)
            {
                return Some(record.current_path.clone());
            }
        }
        None
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Walk `root` looking for a file whose whole-content CRC32C equals `crc`,
/// visiting at most `budget` files. Used by undo as a last resort when a file
/// vanished without a recorded move. Respects ignore files so build output
/// does not burn the budget.
pub fn deep_search_by_crc(crc: u32, root: &Path, budget: usize) -> Option<PathBuf> {
    let mut visited = 0usize;
    for entry in WalkBuilder::new(root).build().flatten() {
        if visited >= budget {
            return None;
        }
        let path = entry.path();
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        visited += 1;
        match std::fs::read(path) {
            Ok(bytes) => {
                if crc32c::crc32c(&bytes) == crc {
                    return Some(path.to_path_buf());
                }
            }
            Err(e) => {
                tracing::debug!("deep search skipping {}: {e}", path.display());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registration_is_idempotent() {
        let tracker = LineageTracker::new();
        let a = tracker.register_file(Path::new("/ws/a.txt"));
        let b = tracker.register_file(Path::new("/ws/a.txt"));
        assert_eq!(a, b);
    }

    #[test]
    fn a_path_never_maps_to_two_identities() {
        let tracker = LineageTracker::new();
        let id = tracker.register_file(Path::new("/ws/a.txt"));
        tracker.record_move(Path::new("/ws/a.txt"), Path::new("/ws/b.txt"));
        // The old path is free again; a new file there gets a new identity.
        let id2 = tracker.register_file(Path::new("/ws/a.txt"));
        assert_ne!(id, id2);
        assert_eq!(
            tracker.current_path(&id).unwrap(),
            PathBuf::from("/ws/b.txt")
        );
    }

    #[test]
    fn prior_paths_accumulate_across_chained_moves() {
        let tracker = LineageTracker::new();
        tracker.register_file(Path::new("/ws/a"));
        tracker.record_move(Path::new("/ws/a"), Path::new("/ws/b"));
        tracker.record_move(Path::new("/ws/b"), Path::new("/ws/c"));
        assert_eq!(
            tracker.prior_paths(Path::new("/ws/c")),
            vec![PathBuf::from("/ws/b"), PathBuf::from("/ws/a")]
        );
    }

    #[test]
    fn resolve_moved_finds_the_new_home() {
        let tracker = LineageTracker::new();
        tracker.register_file(Path::new("/ws/x/a.txt"));
        tracker.record_move(Path::new("/ws/x/a.txt"), Path::new("/ws/y/a.txt"));
        assert_eq!(
            tracker.resolve_moved(Path::new("/ws/x/a.txt")).unwrap(),
            PathBuf::from("/ws/y/a.txt")
        );
        assert_eq!(tracker.resolve_moved(Path::new("/ws/other")), None);
    }

    #[test]
    fn crc_index_finds_current_paths() {
        let tracker = LineageTracker::new();
        tracker.register_file(Path::new("/ws/a"));
        tracker.record_crc(Path::new("/ws/a"), 0xDEAD);
        assert_eq!(tracker.find_by_crc(0xDEAD), vec![PathBuf::from("/ws/a")]);
        assert!(tracker.find_by_crc(0xBEEF).is_empty());
    }

    #[test]
    fn deep_search_finds_file_by_content_crc() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("sub").join("needle.txt");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"needle-bytes").unwrap();
        std::fs::write(dir.path().join("hay.txt"), b"hay").unwrap();

        let crc = crc32c::crc32c(b"needle-bytes");
        let found = deep_search_by_crc(crc, dir.path(), 100).unwrap();
        assert_eq!(found, target);
        assert_eq!(deep_search_by_crc(crc, dir.path(), 0), None);
    }
}
