//! `file.manage`: create, copy, delete, move, rename. Every action runs in
//! its own transaction so the journal can reverse it, and every touched path
//! flows through the sandbox's writability policy first.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::EditError;
use crate::error::Result;
use crate::error::ScribeErr;
use crate::external::FileSnapshot;
use crate::task::TaskContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManageRequest {
    pub action: String,
    pub path: String,
    /// Initial file content for `create`. Absent means "create a directory".
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub target_path: Option<String>,
    #[serde(default)]
    pub new_name: Option<String>,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Clone)]
pub struct ManageReport {
    pub action: String,
    pub path: PathBuf,
    pub target: Option<PathBuf>,
    pub summary: String,
}

pub fn manage(task: &TaskContext, request: ManageRequest) -> Result<ManageReport> {
    let action = request.action.clone();
    let description = format!("{} {}", action, request.path);
    task.with_tx(|tx| {
        tx.begin(&description, None);
        Ok(())
    })?;
    let result = match action.as_str() {
        "create" => create(task, &request),
        "copy" => copy(task, &request),
        "delete" => delete(task, &request),
        "move" => relocate(task, &request, MoveKind::Move),
        "rename" => relocate(task, &request, MoveKind::Rename),
        other => Err(ScribeErr::UnknownAction(other.to_string())),
    };
    match result {
        Ok(report) => {
            task.with_tx(|tx| tx.commit())?;
            task.hud.record_edits(1);
            Ok(report)
        }
        Err(err) => {
            task.with_tx(|tx| tx.rollback())?;
            Err(err)
        }
    }
}

fn already_exists(path: &Path) -> ScribeErr {
    ScribeErr::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("{} already exists", path.display()),
    ))
}

fn create(task: &TaskContext, request: &ManageRequest) -> Result<ManageReport> {
    let path = task.sandbox.sanitize(&request.path, false)?;
    task.sandbox.ensure_writable(&path)?;
    if path.exists() {
        return Err(already_exists(&path));
    }
    task.with_tx(|tx| {
        tx.backup(&path)?;
        tx.mark_created(&path)
    })?;

    match &request.content {
        None => {
            std::fs::create_dir_all(&path)?;
        }
        Some(content) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, content.as_bytes())?;
            task.registry.mark_created(&path);
            task.lineage.register_file(&path);
            task.lineage.record_crc(&path, crc32c::crc32c(content.as_bytes()));
            task.tracker.record(
                &path,
                FileSnapshot::new(
                    content.replace("\r\n", "\n"),
                    "UTF-8".to_string(),
                    line_count_of(content),
                ),
            );
        }
    }

    Ok(ManageReport {
        action: "create".to_string(),
        path: path.clone(),
        target: None,
        summary: format!("created {}", path.display()),
    })
}

fn copy(task: &TaskContext, request: &ManageRequest) -> Result<ManageReport> {
    let src = task.sandbox.sanitize(&request.path, true)?;
    let Some(target) = &request.target_path else {
        return Err(EditError::MissingField("targetPath").into());
    };
    let dest = task.sandbox.sanitize(target, false)?;
    task.sandbox.ensure_writable(&dest)?;
    if dest.exists() {
        return Err(already_exists(&dest));
    }

    if src.is_dir() {
        if !request.recursive {
            return Err(ScribeErr::Io(std::io::Error::other(format!(
                "{} is a directory; pass recursive to copy it",
                src.display()
            ))));
        }
        task.with_tx(|tx| {
            tx.backup(&dest)?;
            tx.mark_created(&dest)
        })?;
        copy_tree(&src, &dest)?;
    } else {
        task.with_tx(|tx| {
            tx.backup(&dest)?;
            tx.mark_created(&dest)
        })?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(&src, &dest)?;
    }

    // A copy is a fresh file, not an alias of the source's identity.
    task.registry.mark_created(&dest);
    task.lineage.register_file(&dest);

    Ok(ManageReport {
        action: "copy".to_string(),
        path: src.clone(),
        target: Some(dest.clone()),
        summary: format!("copied {} -> {}", src.display(), dest.display()),
    })
}

fn delete(task: &TaskContext, request: &ManageRequest) -> Result<ManageReport> {
    let path = task.sandbox.sanitize(&request.path, true)?;
    task.sandbox.ensure_writable(&path)?;

    if path.is_dir() {
        let files = files_under(&path)?;
        if !files.is_empty() && !request.recursive {
            return Err(ScribeErr::Io(std::io::Error::other(format!(
                "{} is not empty; pass recursive to delete it",
                path.display()
            ))));
        }
        task.with_tx(|tx| {
            for file in &files {
                tx.backup(file)?;
            }
            Ok(())
        })?;
        std::fs::remove_dir_all(&path)?;
        for file in &files {
            task.registry.invalidate_file(file);
            task.lineage.forget(file);
            task.tracker.forget(file);
        }
    } else {
        task.with_tx(|tx| tx.backup(&path))?;
        std::fs::remove_file(&path)?;
        task.registry.invalidate_file(&path);
        task.lineage.forget(&path);
        task.tracker.forget(&path);
    }

    Ok(ManageReport {
        action: "delete".to_string(),
        path: path.clone(),
        target: None,
        summary: format!("deleted {}", path.display()),
    })
}

enum MoveKind {
    Move,
    Rename,
}

fn relocate(task: &TaskContext, request: &ManageRequest, kind: MoveKind) -> Result<ManageReport> {
    let src = task.sandbox.sanitize(&request.path, true)?;
    task.sandbox.ensure_writable(&src)?;
    let dest = match kind {
        MoveKind::Move => {
            let Some(target) = &request.target_path else {
                return Err(EditError::MissingField("targetPath").into());
            };
            task.sandbox.sanitize(target, false)?
        }
        MoveKind::Rename => {
            let Some(new_name) = &request.new_name else {
                return Err(EditError::MissingField("newName").into());
            };
            let parent = src
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            parent.join(new_name)
        }
    };
    task.sandbox.ensure_writable(&dest)?;
    if dest.exists() {
        return Err(already_exists(&dest));
    }

    task.with_tx(|tx| {
        if src.is_dir() {
            for file in files_under(&src)? {
                tx.backup(&file)?;
            }
        } else {
            tx.backup(&src)?;
        }
        tx.backup(&dest)?;
        tx.record_move(&src, &dest)
    })?;

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::rename(&src, &dest)?;

    // Identity, tokens, and the change baseline all follow the file.
    task.lineage.register_file(&src);
    task.lineage.record_move(&src, &dest);
    task.registry.move_tokens(&src, &dest);
    task.tracker.move_snapshot(&src, &dest);

    let action = match kind {
        MoveKind::Move => "move",
        MoveKind::Rename => "rename",
    };
    Ok(ManageReport {
        action: action.to_string(),
        path: src.clone(),
        target: Some(dest.clone()),
        summary: format!("{action}d {} -> {}", src.display(), dest.display()),
    })
}

fn line_count_of(content: &str) -> u32 {
    let normalized = content.replace("\r\n", "\n");
    let mut count = normalized.split('\n').count();
    if count > 1 && normalized.ends_with('\n') {
        count -= 1;
    }
    count as u32
}

fn files_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    Ok(files)
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            std::fs::copy(&from, &to)?;
        }
    }
    Ok(())
}
