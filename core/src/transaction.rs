//! Nestable, atomic, rollbackable transactions over workspace files.
//!
//! One transaction may be open per task at a time; nested `begin` calls
//! increment a counter and only the outermost `commit` flushes a journal
//! entry. Rollback restores every touched path from its pre-image and is the
//! one place in the core where a failure leaves the filesystem in a state we
//! cannot vouch for — such transactions flip to `STUCK` and stay visible in
//! the journal.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::path::PathBuf;

use uuid::Uuid;

use crate::error::Result;
use crate::error::TxError;
use crate::journal;
use crate::journal::Journal;
use crate::lineage::LineageTracker;
use crate::snapshot::SnapshotStore;
use crate::undo;
use crate::undo::UndoOutcome;
use crate::undo::UndoResult;
use crate::util::is_inside_git_repo;
use crate::util::unix_ts;

/// What a path looked like before the transaction touched it. `Missing`
/// means "did not exist"; restoring it means delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreImage {
    Missing,
    Saved,
}

#[derive(Debug, Clone)]
pub struct FileStat {
    pub path: PathBuf,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub diff: String,
}

#[derive(Debug)]
pub struct Transaction {
    pub id: String,
    pub description: String,
    pub instruction: Option<String>,
    pub snapshots: BTreeMap<PathBuf, PreImage>,
    pub created_paths: BTreeSet<PathBuf>,
    pub accessed_paths: BTreeSet<PathBuf>,
    pub moved_paths: Vec<(PathBuf, PathBuf)>,
    pub stats: Vec<FileStat>,
    pub timestamp: i64,
}

/// The durable residue of an outer commit: everything undo needs.
#[derive(Debug, Clone)]
pub struct CommittedTx {
    pub id: String,
    pub description: String,
    pub snapshots: BTreeMap<PathBuf, PreImage>,
    pub created: BTreeSet<PathBuf>,
    pub moved: Vec<(PathBuf, PathBuf)>,
    pub timestamp: i64,
    pub stats: Vec<FileStat>,
}

/// An undone transaction plus the post-images captured at undo time, so it
/// can be replayed by `redo`.
#[derive(Debug)]
struct RedoTx {
    committed: CommittedTx,
    post_images: BTreeMap<PathBuf, Option<Vec<u8>>>,
}

pub struct TxManager {
    workspace_root: PathBuf,
    store: SnapshotStore,
    journal: Journal,
    current: Option<Transaction>,
    depth: u32,
    undo_stack: Vec<CommittedTx>,
    redo_stack: Vec<RedoTx>,
    checkpoints: Vec<(String, usize)>,
    deep_search_budget: usize,
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("depth", &self.depth)
            .field("undo", &self.undo_stack.len())
            .field("redo", &self.redo_stack.len())
            .finish()
    }
}

impl TxManager {
    /// Open the manager for a task, rebuilding the undo stack from the
    /// persisted journal so a restarted server can still undo prior work.
    pub fn open(
        workspace_root: PathBuf,
        task_dir: &Path,
        ring: usize,
        deep_search_budget: usize,
    ) -> Result<Self> {
        let store = SnapshotStore::new(task_dir.join("snapshots"));
        let journal = Journal::open(&task_dir.join("journal.db"), ring)?;
        let mut manager = Self {
            workspace_root,
            store,
            journal,
            current: None,
            depth: 0,
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            checkpoints: Vec::new(),
            deep_search_budget,
        };
        manager.rebuild_undo_stack()?;
        Ok(manager)
    }

    fn rebuild_undo_stack(&mut self) -> Result<()> {
        for (tx_id, description) in self.journal.committed_edit_ids()? {
            let mut snapshots = BTreeMap::new();
            for file in self.journal.files_for(&tx_id)? {
                let pre = if file.existed_before {
                    PreImage::Saved
                } else {
                    PreImage::Missing
                };
                snapshots.insert(PathBuf::from(file.path), pre);
            }
            self.undo_stack.push(CommittedTx {
                id: tx_id,
                description,
                snapshots,
                created: BTreeSet::new(),
                moved: Vec::new(),
                timestamp: 0,
                stats: Vec::new(),
            });
        }
        Ok(())
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn snapshot_store(&self) -> &SnapshotStore {
        &self.store
    }

    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }

    /// Open a transaction, or deepen the one already open.
    pub fn begin(&mut self, description: &str, instruction: Option<String>) {
        if self.current.is_some() {
            self.depth += 1;
            return;
        }
        self.depth = 1;
        self.current = Some(Transaction {
            id: Uuid::new_v4().to_string(),
            description: description.to_string(),
            instruction,
            snapshots: BTreeMap::new(),
            created_paths: BTreeSet::new(),
            accessed_paths: BTreeSet::new(),
            moved_paths: Vec::new(),
            stats: Vec::new(),
            timestamp: unix_ts(),
        });
    }

    fn current_mut(&mut self) -> std::result::Result<&mut Transaction, TxError> {
        self.current.as_mut().ok_or(TxError::NotOpen)
    }

    /// Snapshot `path` before its first write in this transaction.
    /// Idempotent per `(tx, path)`.
    pub fn backup(&mut self, path: &Path) -> Result<()> {
        let tx_id = {
            let tx = self.current_mut()?;
            if tx.snapshots.contains_key(path) {
                return Ok(());
            }
            tx.id.clone()
        };
        if path.exists() {
            let bytes = std::fs::read(path)?;
            self.store.put(&tx_id, path, &bytes)?;
            self.current_mut()?
                .snapshots
                .insert(path.to_path_buf(), PreImage::Saved);
        } else {
            self.current_mut()?
                .snapshots
                .insert(path.to_path_buf(), PreImage::Missing);
        }
        Ok(())
    }

    pub fn mark_created(&mut self, path: &Path) -> Result<()> {
        self.current_mut()?.created_paths.insert(path.to_path_buf());
        Ok(())
    }

    pub fn mark_accessed(&mut self, path: &Path) -> Result<()> {
        self.current_mut()?
            .accessed_paths
            .insert(path.to_path_buf());
        Ok(())
    }

    pub fn record_move(&mut self, from: &Path, to: &Path) -> Result<()> {
        self.current_mut()?
            .moved_paths
            .push((from.to_path_buf(), to.to_path_buf()));
        Ok(())
    }

    pub fn add_stat(&mut self, stat: FileStat) -> Result<()> {
        self.current_mut()?.stats.push(stat);
        Ok(())
    }

    /// Close one nesting level; on the outermost level, persist the journal
    /// entry, push onto the undo stack, clear the redo stack, and evict past
    /// the ring bound. Returns the committed transaction id when the outer
    /// level closed.
    pub fn commit(&mut self) -> Result<Option<String>> {
        if self.current.is_none() {
            return Err(TxError::NotOpen.into());
        }
        self.depth = self.depth.saturating_sub(1);
        if self.depth > 0 {
            return Ok(None);
        }
        let Some(tx) = self.current.take() else {
            return Err(TxError::NotOpen.into());
        };
        let committed = CommittedTx {
            id: tx.id,
            description: tx.description,
            snapshots: tx.snapshots,
            created: tx.created_paths,
            moved: tx.moved_paths,
            timestamp: tx.timestamp,
            stats: tx.stats,
        };

        // Journal first; only then are evicted snapshots safe to delete.
        let evicted = self.journal.append_committed(&committed)?;
        for tx_id in &evicted {
            if let Err(e) = self.store.forget(tx_id) {
                tracing::warn!("failed to drop evicted snapshots for {tx_id}: {e}");
            }
        }
        let committed_id = committed.id.clone();
        self.undo_stack.push(committed);
        self.redo_stack.clear();
        if !evicted.is_empty() {
            let before = self.undo_stack.len();
            self.undo_stack.retain(|tx| !evicted.contains(&tx.id));
            let dropped = before - self.undo_stack.len();
            for (_, idx) in &mut self.checkpoints {
                *idx = idx.saturating_sub(dropped);
            }
        }
        Ok(Some(committed_id))
    }

    /// Abort the open transaction and restore every touched path from its
    /// pre-image. Nesting collapses to zero: an inner failure aborts the
    /// whole unit.
    pub fn rollback(&mut self) -> Result<()> {
        let Some(tx) = self.current.take() else {
            return Err(TxError::NotOpen.into());
        };
        self.depth = 0;

        let mut failed: Vec<(PathBuf, std::io::Error)> = Vec::new();
        for (path, pre) in &tx.snapshots {
            let result = match pre {
                PreImage::Missing => remove_file_and_prune(path, &self.workspace_root),
                PreImage::Saved => self
                    .store
                    .get(&tx.id, path)
                    .and_then(|bytes| write_creating_parents(path, &bytes)),
            };
            if let Err(e) = result {
                failed.push((path.clone(), e));
            }
        }

        if failed.is_empty() {
            if let Err(e) = self.store.forget(&tx.id) {
                tracing::warn!("failed to drop snapshots for rolled-back {}: {e}", tx.id);
            }
            return Ok(());
        }

        // Partial restore: persist the transaction as STUCK so the journal
        // records which paths are suspect, and surface a recovery hint.
        let committed = CommittedTx {
            id: tx.id.clone(),
            description: tx.description,
            snapshots: tx.snapshots,
            created: tx.created_paths,
            moved: tx.moved_paths,
            timestamp: tx.timestamp,
            stats: tx.stats,
        };
        if let Err(e) = self.journal.append_committed(&committed) {
            tracing::warn!("failed to journal stuck transaction {}: {e}", tx.id);
        }
        if let Err(e) = self.journal.set_status(&tx.id, journal::STATUS_STUCK) {
            tracing::warn!("failed to mark {} stuck: {e}", tx.id);
        }
        let paths: Vec<PathBuf> = failed.iter().map(|(p, _)| p.clone()).collect();
        Err(TxError::Stuck {
            id: tx.id,
            hint: recovery_hint(&self.workspace_root, &paths),
        }
        .into())
    }

    /// Reverse the most recent committed transaction via the smart undo
    /// engine and move it to the redo stack.
    pub fn undo(&mut self, lineage: &LineageTracker) -> Result<UndoResult> {
        let tx = self.undo_stack.pop().ok_or(TxError::NothingToUndo)?;

        // Capture post-images first so the undo can be replayed.
        let mut post_images: BTreeMap<PathBuf, Option<Vec<u8>>> = BTreeMap::new();
        for path in tx.snapshots.keys() {
            let bytes = std::fs::read(path).ok();
            post_images.insert(path.clone(), bytes);
        }

        let result = undo::smart_undo(
            &self.store,
            &tx,
            lineage,
            &self.workspace_root,
            self.deep_search_budget,
        );

        match result.outcome {
            UndoOutcome::Stuck => {
                if let Err(e) = self.journal.set_status(&tx.id, journal::STATUS_STUCK) {
                    tracing::warn!("failed to mark {} stuck: {e}", tx.id);
                }
                // Leave it off both stacks; manual recovery is required.
            }
            _ => {
                if let Err(e) = self.journal.set_status(&tx.id, journal::STATUS_UNDONE) {
                    tracing::warn!("failed to mark {} undone: {e}", tx.id);
                }
                self.redo_stack.push(RedoTx {
                    committed: tx,
                    post_images,
                });
            }
        }
        Ok(result)
    }

    /// Re-apply the most recently undone transaction from its post-images.
    pub fn redo(&mut self) -> Result<String> {
        let redo = self.redo_stack.pop().ok_or(TxError::NothingToRedo)?;
        for (path, post) in &redo.post_images {
            match post {
                Some(bytes) => write_creating_parents(path, bytes)?,
                None => remove_file_and_prune(path, &self.workspace_root)?,
            }
        }
        self.journal
            .set_status(&redo.committed.id, journal::STATUS_COMMITTED)?;
        let id = redo.committed.id.clone();
        self.undo_stack.push(redo.committed);
        Ok(id)
    }

    pub fn create_checkpoint(&mut self, name: &str) {
        self.checkpoints.retain(|(n, _)| n != name);
        self.checkpoints
            .push((name.to_string(), self.undo_stack.len()));
    }

    /// Undo every committed transaction above the checkpoint, newest first.
    pub fn rollback_to_checkpoint(
        &mut self,
        name: &str,
        lineage: &LineageTracker,
    ) -> Result<Vec<UndoResult>> {
        let Some((_, target)) = self.checkpoints.iter().find(|(n, _)| n == name).cloned() else {
            return Err(TxError::CheckpointNotFound(name.to_string()).into());
        };
        let mut results = Vec::new();
        while self.undo_stack.len() > target {
            let result = self.undo(lineage)?;
            let stuck = result.outcome == UndoOutcome::Stuck;
            results.push(result);
            if stuck {
                break;
            }
        }
        Ok(results)
    }
}

fn write_creating_parents(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    std::fs::write(path, bytes)
}

/// Delete `path` (file or directory) and prune now-empty ancestors, stopping
/// at `root`. Missing files are fine; rollback may race the agent.
fn remove_file_and_prune(path: &Path, root: &Path) -> std::io::Result<()> {
    if path.exists() {
        if path.is_dir() {
            std::fs::remove_dir_all(path)?;
        } else {
            std::fs::remove_file(path)?;
        }
    }
    let mut dir = path.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == *root || !d.starts_with(root) {
            break;
        }
        match std::fs::remove_dir(&d) {
            Ok(()) => {}
            Err(_) => break, // not empty, or already gone
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    Ok(())
}

pub(crate) fn recovery_hint(workspace_root: &Path, paths: &[PathBuf]) -> String {
    if is_inside_git_repo(workspace_root) {
        let list = paths
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
            .join(" ");
        format!("Inspect with `git status` and recover with `git checkout -- {list}`.")
    } else {
        "The workspace is not under version control; inspect the listed paths manually.".to_string()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn manager(root: &Path) -> TxManager {
        TxManager::open(root.to_path_buf(), &root.join(".scribe/tasks/t"), 50, 100).unwrap()
    }

    #[test]
    fn rollback_restores_bit_identical_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"original").unwrap();

        let mut tx = manager(dir.path());
        tx.begin("edit a.txt", None);
        tx.backup(&file).unwrap();
        std::fs::write(&file, b"mangled").unwrap();
        tx.rollback().unwrap();

        assert_eq!(std::fs::read(&file).unwrap(), b"original");
        assert!(!tx.is_open());
    }

    #[test]
    fn rollback_deletes_files_created_in_transaction() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("sub").join("new.txt");

        let mut tx = manager(dir.path());
        tx.begin("create new.txt", None);
        tx.backup(&file).unwrap(); // records Missing
        std::fs::create_dir_all(file.parent().unwrap()).unwrap();
        std::fs::write(&file, b"fresh").unwrap();
        tx.rollback().unwrap();

        assert!(!file.exists());
        // The empty parent directory was pruned too.
        assert!(!file.parent().unwrap().exists());
    }

    #[test]
    fn nested_begin_commits_only_at_the_outer_level() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"x").unwrap();

        let mut tx = manager(dir.path());
        tx.begin("outer", None);
        tx.backup(&file).unwrap();
        tx.begin("inner", None);
        assert_eq!(tx.commit().unwrap(), None);
        assert!(tx.is_open());
        let id = tx.commit().unwrap();
        assert!(id.is_some());
        assert!(!tx.is_open());
        assert_eq!(tx.undo_depth(), 1);
    }

    #[test]
    fn undo_then_redo_round_trips_file_content() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"before").unwrap();
        let lineage = LineageTracker::new();

        let mut tx = manager(dir.path());
        tx.begin("edit", None);
        tx.backup(&file).unwrap();
        std::fs::write(&file, b"after").unwrap();
        tx.commit().unwrap();

        let result = tx.undo(&lineage).unwrap();
        assert_eq!(result.outcome, UndoOutcome::Success);
        assert_eq!(std::fs::read(&file).unwrap(), b"before");

        tx.redo().unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), b"after");
        assert_eq!(tx.undo_depth(), 1);
        assert_eq!(tx.redo_depth(), 0);
    }

    #[test]
    fn checkpoint_rollback_unwinds_in_lifo_order() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"v0").unwrap();
        let lineage = LineageTracker::new();

        let mut tx = manager(dir.path());
        tx.create_checkpoint("clean");
        for v in ["v1", "v2"] {
            tx.begin(v, None);
            tx.backup(&file).unwrap();
            std::fs::write(&file, v.as_bytes()).unwrap();
            tx.commit().unwrap();
        }

        let results = tx.rollback_to_checkpoint("clean", &lineage).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(std::fs::read(&file).unwrap(), b"v0");

        let err = tx.rollback_to_checkpoint("missing", &lineage).unwrap_err();
        assert!(matches!(
            err,
            crate::ScribeErr::Tx(TxError::CheckpointNotFound(_))
        ));
    }

    #[test]
    fn commit_clears_the_redo_stack() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"v0").unwrap();
        let lineage = LineageTracker::new();

        let mut tx = manager(dir.path());
        tx.begin("first", None);
        tx.backup(&file).unwrap();
        std::fs::write(&file, b"v1").unwrap();
        tx.commit().unwrap();
        tx.undo(&lineage).unwrap();
        assert_eq!(tx.redo_depth(), 1);

        tx.begin("second", None);
        tx.backup(&file).unwrap();
        std::fs::write(&file, b"v2").unwrap();
        tx.commit().unwrap();
        assert_eq!(tx.redo_depth(), 0);
        assert!(matches!(
            tx.redo().unwrap_err(),
            crate::ScribeErr::Tx(TxError::NothingToRedo)
        ));
    }

    #[test]
    fn undo_stack_rebuilds_from_the_journal_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        std::fs::write(&file, b"before").unwrap();

        {
            let mut tx = manager(dir.path());
            tx.begin("edit", None);
            tx.backup(&file).unwrap();
            std::fs::write(&file, b"after").unwrap();
            tx.commit().unwrap();
        }

        let mut tx = manager(dir.path());
        assert_eq!(tx.undo_depth(), 1);
        let lineage = LineageTracker::new();
        let result = tx.undo(&lineage).unwrap();
        assert_eq!(result.outcome, UndoOutcome::Success);
        assert_eq!(std::fs::read(&file).unwrap(), b"before");
    }
}
