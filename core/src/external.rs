//! External-change tracking.
//!
//! A content snapshot is recorded after every successful read and after
//! every committed write, so the stored CRC always reflects the last state
//! this task authored or observed. When a token validation fails and the
//! file's current CRC also disagrees with the stored snapshot, somebody else
//! modified the file between agent steps.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::token::compute_range_crc;

#[derive(Debug, Clone)]
pub struct FileSnapshot {
    pub content: String,
    pub charset: String,
    pub crc: u32,
    pub line_count: u32,
}

impl FileSnapshot {
    pub fn new(content: String, charset: String, line_count: u32) -> Self {
        let crc = compute_range_crc(&content);
        Self {
            content,
            charset,
            crc,
            line_count,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExternalChange {
    pub path: PathBuf,
    pub previous: FileSnapshot,
    pub current: FileSnapshot,
}

#[derive(Debug, Default)]
pub struct ChangeTracker {
    inner: Mutex<HashMap<PathBuf, FileSnapshot>>,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, path: &Path, snapshot: FileSnapshot) {
        self.lock().insert(path.to_path_buf(), snapshot);
    }

    pub fn get(&self, path: &Path) -> Option<FileSnapshot> {
        self.lock().get(path).cloned()
    }

    /// Compare the current state against the last recorded snapshot. A CRC
    /// mismatch is an external change: every in-task write re-records the
    /// snapshot on commit, so a divergence can only have been authored by
    /// someone else.
    pub fn check_external_change(
        &self,
        path: &Path,
        current: &FileSnapshot,
    ) -> Option<ExternalChange> {
        let previous = self.get(path)?;
        if previous.crc == current.crc {
            return None;
        }
        Some(ExternalChange {
            path: path.to_path_buf(),
            previous,
            current: current.clone(),
        })
    }

    pub fn move_snapshot(&self, from: &Path, to: &Path) {
        let mut inner = self.lock();
        if let Some(snapshot) = inner.remove(from) {
            inner.insert(to.to_path_buf(), snapshot);
        }
    }

    pub fn forget(&self, path: &Path) {
        self.lock().remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, FileSnapshot>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
