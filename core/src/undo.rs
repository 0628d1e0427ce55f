//! Smart undo: reverse a committed transaction using its pre-image
//! snapshots plus file lineage.
//!
//! Undo never throws on a recoverable per-file issue. Each file is
//! classified, restored if possible, and the aggregate outcome reports what
//! a caller can rely on: `Success` (pre-state holds everywhere),
//! `ResolvedMove` (pre-state holds, but at a relocated path), `Partial`
//! (some paths skipped or conflicted), or `Stuck` (nothing restorable).

use std::path::Path;
use std::path::PathBuf;

use crate::lineage;
use crate::lineage::LineageTracker;
use crate::snapshot::SnapshotStore;
use crate::transaction::CommittedTx;
use crate::transaction::PreImage;
use crate::transaction::recovery_hint;
use crate::util::is_inside_git_repo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoOutcome {
    Success,
    ResolvedMove,
    Partial,
    Stuck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileOutcome {
    Restored,
    Relocated,
    SkippedDirty,
    Conflict,
}

#[derive(Debug, Clone)]
pub struct FileUndoDetail {
    /// Path as recorded by the transaction.
    pub path: PathBuf,
    /// Where the pre-image actually landed, when it differs from `path`.
    pub restored_to: Option<PathBuf>,
    pub outcome: FileOutcome,
    pub note: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UndoResult {
    pub outcome: UndoOutcome,
    pub files: Vec<FileUndoDetail>,
    pub hints: Vec<String>,
}

enum Target {
    /// Restore at the original path.
    Original,
    /// The file now lives elsewhere; restore there.
    Relocated(PathBuf),
    /// The snapshot bytes cannot be read; nothing can be done.
    Unresolvable(String),
}

pub fn smart_undo(
    store: &SnapshotStore,
    tx: &CommittedTx,
    lineage_tracker: &LineageTracker,
    workspace_root: &Path,
    deep_search_budget: usize,
) -> UndoResult {
    // Pre-validate every path before touching the filesystem.
    let mut plan: Vec<(&PathBuf, &PreImage, Target)> = Vec::new();
    for (path, pre) in &tx.snapshots {
        let target = classify(store, tx, path, pre, lineage_tracker, workspace_root, deep_search_budget);
        plan.push((path, pre, target));
    }

    let all_unresolvable =
        !plan.is_empty() && plan.iter().all(|(_, _, t)| matches!(t, Target::Unresolvable(_)));
    if all_unresolvable {
        let paths: Vec<PathBuf> = tx.snapshots.keys().cloned().collect();
        return UndoResult {
            outcome: UndoOutcome::Stuck,
            files: plan
                .into_iter()
                .map(|(path, _, t)| FileUndoDetail {
                    path: path.clone(),
                    restored_to: None,
                    outcome: FileOutcome::Conflict,
                    note: match t {
                        Target::Unresolvable(why) => Some(why),
                        _ => None,
                    },
                })
                .collect(),
            hints: vec![recovery_hint(workspace_root, &paths)],
        };
    }

    let mut files: Vec<FileUndoDetail> = Vec::new();
    for (path, pre, target) in plan {
        files.push(restore_one(store, tx, path, pre, target, workspace_root));
    }

    let any_skipped = files.iter().any(|f| f.outcome == FileOutcome::SkippedDirty);
    let any_conflict = files.iter().any(|f| f.outcome == FileOutcome::Conflict);
    let any_relocated = files.iter().any(|f| f.outcome == FileOutcome::Relocated);
    let outcome = if any_skipped || any_conflict {
        UndoOutcome::Partial
    } else if any_relocated {
        UndoOutcome::ResolvedMove
    } else {
        UndoOutcome::Success
    };

    let mut hints = Vec::new();
    if outcome == UndoOutcome::Partial && is_inside_git_repo(workspace_root) {
        for file in &files {
            match file.outcome {
                FileOutcome::SkippedDirty => hints.push(format!(
                    "{} was kept because it holds files this task did not create; review with `git status {}`",
                    file.path.display(),
                    file.path.display()
                )),
                FileOutcome::Conflict => hints.push(format!(
                    "{} could not be restored; try `git checkout -- {}`",
                    file.path.display(),
                    file.path.display()
                )),
                _ => {}
            }
        }
    }

    UndoResult {
        outcome,
        files,
        hints,
    }
}

fn classify(
    store: &SnapshotStore,
    tx: &CommittedTx,
    path: &Path,
    pre: &PreImage,
    lineage_tracker: &LineageTracker,
    workspace_root: &Path,
    deep_search_budget: usize,
) -> Target {
    match pre {
        PreImage::Missing => Target::Original,
        PreImage::Saved => {
            let bytes = match store.get(&tx.id, path) {
                Ok(bytes) => bytes,
                Err(e) => return Target::Unresolvable(format!("snapshot unreadable: {e}")),
            };
            if path.exists() {
                return Target::Original;
            }
            // The file is gone from its recorded path. Prefer a recorded
            // move; fall back to hunting for the bytes we last wrote.
            if let Some(current) = lineage_tracker.resolve_moved(path) {
                if current.exists() {
                    return Target::Relocated(current);
                }
            }
            let crc = crc32c::crc32c(&bytes);
            for candidate in lineage_tracker.find_by_crc(crc) {
                if candidate != path && candidate.exists() {
                    return Target::Relocated(candidate);
                }
            }
            if let Some(found) =
                lineage::deep_search_by_crc(crc, workspace_root, deep_search_budget)
            {
                if found != path {
                    return Target::Relocated(found);
                }
            }
            // Deleted with no lineage: recreate at the original path.
            Target::Original
        }
    }
}

fn restore_one(
    store: &SnapshotStore,
    tx: &CommittedTx,
    path: &Path,
    pre: &PreImage,
    target: Target,
    workspace_root: &Path,
) -> FileUndoDetail {
    let detail = |outcome, restored_to: Option<PathBuf>, note: Option<String>| FileUndoDetail {
        path: path.to_path_buf(),
        restored_to,
        outcome,
        note,
    };

    match (pre, target) {
        (_, Target::Unresolvable(why)) => detail(FileOutcome::Conflict, None, Some(why)),
        (PreImage::Missing, _) => {
            if !path.exists() {
                return detail(FileOutcome::Restored, None, None);
            }
            if path.is_dir() && directory_is_occupied(path) {
                return detail(
                    FileOutcome::SkippedDirty,
                    None,
                    Some("directory contains files this transaction did not create".to_string()),
                );
            }
            match remove_and_prune(path, workspace_root) {
                Ok(()) => detail(FileOutcome::Restored, None, None),
                Err(e) => detail(FileOutcome::Conflict, None, Some(e.to_string())),
            }
        }
        (PreImage::Saved, target) => {
            let destination = match &target {
                Target::Relocated(p) => p.clone(),
                _ => path.to_path_buf(),
            };
            let bytes = match store.get(&tx.id, path) {
                Ok(bytes) => bytes,
                Err(e) => return detail(FileOutcome::Conflict, None, Some(e.to_string())),
            };
            let write = || -> std::io::Result<()> {
                if let Some(parent) = destination.parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)?;
                    }
                }
                std::fs::write(&destination, &bytes)
            };
            match write() {
                Ok(()) => {
                    if matches!(target, Target::Relocated(_)) {
                        detail(FileOutcome::Relocated, Some(destination), None)
                    } else {
                        detail(FileOutcome::Restored, None, None)
                    }
                }
                Err(e) => detail(FileOutcome::Conflict, None, Some(e.to_string())),
            }
        }
    }
}

fn directory_is_occupied(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(true)
}

fn remove_and_prune(path: &Path, root: &Path) -> std::io::Result<()> {
    if path.is_dir() {
        std::fs::remove_dir(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    let mut dir = path.parent().map(Path::to_path_buf);
    while let Some(d) = dir {
        if d == *root || !d.starts_with(root) {
            break;
        }
        if std::fs::remove_dir(&d).is_err() {
            break;
        }
        dir = d.parent().map(Path::to_path_buf);
    }
    Ok(())
}
