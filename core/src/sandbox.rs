//! Workspace confinement. Every path supplied by the agent is resolved and
//! normalized here before any other component sees it.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

use crate::config::SANDBOX_DIR_NAME;
use crate::error::SandboxErr;

/// File names the mutation tools refuse to touch regardless of location:
/// version-control metadata and build wrapper scripts.
const PROTECTED_NAMES: &[&str] = &["gradlew", "gradlew.bat", "mvnw", "mvnw.cmd"];

/// Directory names that mark protected infrastructure anywhere on a path.
const PROTECTED_DIRS: &[&str] = &[".git", SANDBOX_DIR_NAME];

/// Process-wide path sandbox shared by all tasks.
#[derive(Debug, Clone)]
pub struct PathSandbox {
    roots: Vec<PathBuf>,
}

impl PathSandbox {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        let roots = roots.iter().map(|r| normalize(r)).collect();
        Self { roots }
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolve `input` against the first workspace root and verify it stays
    /// under one of the configured roots. With `must_exist`, additionally
    /// require the file to be present on disk.
    pub fn sanitize(&self, input: &str, must_exist: bool) -> Result<PathBuf, SandboxErr> {
        let raw = Path::new(input);
        let abs = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            match self.roots.first() {
                Some(root) => root.join(raw),
                None => return Err(SandboxErr::Escape(input.to_string())),
            }
        };
        let abs = normalize(&abs);

        if !self.roots.iter().any(|root| abs.starts_with(root)) {
            return Err(SandboxErr::Escape(input.to_string()));
        }
        if must_exist && !abs.exists() {
            return Err(SandboxErr::NotFound(abs.display().to_string()));
        }
        Ok(abs)
    }

    /// Reject writes to protected infrastructure: anything under a
    /// version-control metadata directory or the server's own state
    /// directory, and build wrapper scripts by name.
    pub fn ensure_writable(&self, path: &Path) -> Result<(), SandboxErr> {
        for comp in path.components() {
            if let Component::Normal(name) = comp {
                let name = name.to_string_lossy();
                if PROTECTED_DIRS.iter().any(|d| *d == name) {
                    return Err(SandboxErr::Protected(path.display().to_string()));
                }
            }
        }
        if let Some(file_name) = path.file_name() {
            let file_name = file_name.to_string_lossy();
            if PROTECTED_NAMES.iter().any(|n| *n == file_name) {
                return Err(SandboxErr::Protected(path.display().to_string()));
            }
        }
        Ok(())
    }
}

/// Remove `.` and resolve `..` lexically, without touching the filesystem.
/// Works for paths that do not exist yet, which matters for file creation.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}
