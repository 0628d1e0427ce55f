//! Per-task access registry: which line ranges of which files the agent has
//! verifiably observed.
//!
//! Entries are kept in current-file coordinates. After every committed edit
//! the edit engine calls [`AccessRegistry::update_after_edit`], which shifts
//! ranges below the edit and rewrites ranges that intersect it; the CRC an
//! entry was previously known by is retained as an alias so token strings the
//! agent is still holding keep validating against the rewritten entry.

use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::error::TokenError;
use crate::token::AccessToken;
use crate::token::compute_range_crc;
use crate::token::range_crc_of_lines;
use crate::util::unix_ts;

#[derive(Debug, Clone)]
pub struct TokenEntry {
    /// 1-based inclusive, in current-file coordinates.
    pub start: u32,
    pub end: u32,
    pub range_crc: u32,
    pub line_count: u32,
    pub issued_at: i64,
    /// Whole-file CRC when this entry was last (re)written. Entries may only
    /// merge when they agree on it.
    file_crc: u32,
    /// Range CRCs this entry was previously known by, oldest first. Bounded
    /// by the number of edits touching the range within one task.
    source_crcs: Vec<u32>,
}

impl TokenEntry {
    fn knows_crc(&self, crc: u32) -> bool {
        self.range_crc == crc || self.source_crcs.contains(&crc)
    }

    fn overlaps_or_touches(&self, start: u32, end: u32) -> bool {
        // Touching means adjacent ranges like 1-3 and 4-9.
        self.start <= end.saturating_add(1) && start <= self.end.saturating_add(1)
    }
}

#[derive(Debug, Default)]
struct FileTokens {
    entries: Vec<TokenEntry>,
    created_in_task: bool,
}

/// The effective range a wire token resolved to, after alias lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedToken {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Default)]
pub struct AccessRegistry {
    inner: Mutex<HashMap<PathBuf, FileTokens>>,
}

impl AccessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that the agent has observed `lines[start..=end]` of `path` and
    /// mint the corresponding token. Overlapping or adjacent entries minted
    /// against the same file state are eagerly merged.
    pub fn register_access(
        &self,
        path: &Path,
        start: u32,
        end: u32,
        lines: &[String],
    ) -> AccessToken {
        let file_crc = compute_range_crc(&lines.join("\n"));
        let mut inner = self.lock();
        let file = inner.entry(path.to_path_buf()).or_default();

        let mut merged_start = start;
        let mut merged_end = end.min(lines.len() as u32).max(start);
        let mut source_crcs: Vec<u32> = Vec::new();

        // Absorb every compatible neighbor into the union range.
        let mut kept: Vec<TokenEntry> = Vec::with_capacity(file.entries.len());
        for entry in file.entries.drain(..) {
            if entry.file_crc == file_crc && entry.overlaps_or_touches(merged_start, merged_end) {
                merged_start = merged_start.min(entry.start);
                merged_end = merged_end.max(entry.end);
                source_crcs.extend(entry.source_crcs.iter().copied());
                source_crcs.push(entry.range_crc);
            } else {
                kept.push(entry);
            }
        }
        file.entries = kept;

        let range_crc = range_crc_of_lines(lines, merged_start, merged_end);
        source_crcs.retain(|&c| c != range_crc);
        source_crcs.dedup();
        file.entries.push(TokenEntry {
            start: merged_start,
            end: merged_end,
            range_crc,
            line_count: lines.len() as u32,
            issued_at: unix_ts(),
            file_crc,
            source_crcs,
        });
        file.entries.sort_by_key(|e| e.start);

        AccessToken {
            path_hash: crate::util::path_hash(path),
            start: merged_start,
            end: merged_end,
            range_crc,
            line_count: lines.len() as u32,
        }
    }

    /// Files created inside this task are editable without a prior read.
    pub fn mark_created(&self, path: &Path) {
        self.lock()
            .entry(path.to_path_buf())
            .or_default()
            .created_in_task = true;
    }

    pub fn is_created_in_task(&self, path: &Path) -> bool {
        self.lock()
            .get(path)
            .is_some_and(|f| f.created_in_task)
    }

    /// Validate a decoded wire token against the file's current lines.
    ///
    /// The fast path recomputes the CRC at the token's own span. When that
    /// fails, the token may simply predate an in-task rewrite, so the
    /// registry is searched for an entry that descends from the token's CRC;
    /// if that entry still matches the file, the token is valid at the
    /// entry's current range.
    pub fn validate(
        &self,
        path: &Path,
        token: &AccessToken,
        current_lines: &[String],
    ) -> Result<ResolvedToken, TokenError> {
        let direct = token.validate(current_lines);
        if direct.is_ok() {
            return Ok(ResolvedToken {
                start: token.start,
                end: token.end,
            });
        }

        let inner = self.lock();
        if let Some(file) = inner.get(path) {
            for entry in &file.entries {
                if entry.knows_crc(token.range_crc) {
                    let current = range_crc_of_lines(current_lines, entry.start, entry.end);
                    if current == entry.range_crc {
                        return Ok(ResolvedToken {
                            start: entry.start,
                            end: entry.end,
                        });
                    }
                }
            }
        }
        drop(inner);

        // No alias explains the mismatch; surface the direct failure.
        direct.map(|_| ResolvedToken {
            start: token.start,
            end: token.end,
        })
    }

    /// Coverage check, with the created-in-task exception: new files carry an
    /// implicit infinite-range token until the task ends.
    pub fn covers(&self, path: &Path, resolved: &ResolvedToken, start: u32, end: u32) -> bool {
        if self.is_created_in_task(path) {
            return true;
        }
        resolved.start <= start && end <= resolved.end
    }

    /// Rewrite every entry on `path` after an edit replacing lines
    /// `edit_start..=edit_end` with a block whose length difference is
    /// `line_delta`. Entries above the edit are untouched, entries below are
    /// translated, entries intersecting it are re-addressed against
    /// `new_lines` and keep their old CRC as an alias.
    pub fn update_after_edit(
        &self,
        path: &Path,
        edit_start: u32,
        edit_end: u32,
        line_delta: i64,
        new_lines: &[String],
    ) {
        let new_len = new_lines.len() as u32;
        let file_crc = compute_range_crc(&new_lines.join("\n"));
        let shift = |line: u32| -> u32 {
            let shifted = line as i64 + line_delta;
            shifted.clamp(1, new_len.max(1) as i64) as u32
        };

        let mut inner = self.lock();
        let Some(file) = inner.get_mut(path) else {
            return;
        };
        for entry in &mut file.entries {
            if entry.end < edit_start {
                // Fully above the edit: address unchanged.
            } else if entry.start > edit_end {
                entry.start = shift(entry.start);
                entry.end = shift(entry.end);
            } else {
                // Intersects the edit: keep the start, let the end follow the
                // delta, re-CRC against the new content.
                entry.end = shift(entry.end.max(edit_end));
                entry.start = entry.start.min(entry.end);
                let new_crc = range_crc_of_lines(new_lines, entry.start, entry.end);
                if new_crc != entry.range_crc {
                    entry.source_crcs.push(entry.range_crc);
                    entry.range_crc = new_crc;
                }
            }
            entry.line_count = new_len;
            entry.file_crc = file_crc;
        }
    }

    /// Transfer all entries (and the created-in-task mark) to a new path.
    pub fn move_tokens(&self, from: &Path, to: &Path) {
        let mut inner = self.lock();
        if let Some(file) = inner.remove(from) {
            inner.insert(to.to_path_buf(), file);
        }
    }

    /// Drop every entry for `path` (file deleted).
    pub fn invalidate_file(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn tokens_for(&self, path: &Path) -> Vec<TokenEntry> {
        self.lock()
            .get(path)
            .map(|f| f.entries.clone())
            .unwrap_or_default()
    }

    /// Number of files with at least one live entry.
    pub fn unlocked_file_count(&self) -> usize {
        self.lock().values().filter(|f| !f.entries.is_empty()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, FileTokens>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    fn lines(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn ten_lines() -> Vec<String> {
        (1..=10).map(|i| format!("L{i}")).collect()
    }

    #[test]
    fn adjacent_ranges_merge_into_one_entry() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/a.txt");
        let content = ten_lines();
        registry.register_access(path, 1, 3, &content);
        let token = registry.register_access(path, 4, 9, &content);

        let entries = registry.tokens_for(path);
        assert_eq!(entries.len(), 1);
        assert_eq!((entries[0].start, entries[0].end), (1, 9));
        assert_eq!((token.start, token.end), (1, 9));
    }

    #[test]
    fn disjoint_ranges_stay_separate() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/a.txt");
        let content = ten_lines();
        registry.register_access(path, 1, 2, &content);
        registry.register_access(path, 7, 9, &content);
        assert_eq!(registry.tokens_for(path).len(), 2);
    }

    #[test]
    fn tokens_below_an_edit_are_translated() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/a.txt");
        let content = ten_lines();
        registry.register_access(path, 8, 10, &content);

        // Delete lines 2-3 (delta -2).
        let mut after = content.clone();
        after.drain(1..3);
        registry.update_after_edit(path, 2, 3, -2, &after);

        let entries = registry.tokens_for(path);
        assert_eq!((entries[0].start, entries[0].end), (6, 8));
        // Content at the shifted range is unchanged, so the CRC held.
        assert_eq!(
            entries[0].range_crc,
            range_crc_of_lines(&after, 6, 8)
        );
    }

    #[test]
    fn stale_token_validates_through_the_rewritten_entry() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/b.txt");
        let content = ten_lines();
        let token = registry.register_access(path, 1, 10, &content);

        // Replace line 5 and rewrite the registry the way the edit engine does.
        let mut after = content.clone();
        after[4] = "CHANGED".to_string();
        registry.update_after_edit(path, 5, 5, 0, &after);

        let resolved = registry.validate(path, &token, &after).unwrap();
        assert_eq!(resolved, ResolvedToken { start: 1, end: 10 });
        assert!(registry.covers(path, &resolved, 5, 5));
    }

    #[test]
    fn stale_token_fails_when_content_changed_externally() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/b.txt");
        let content = lines(&["x", "y", "z"]);
        let token = registry.register_access(path, 1, 3, &content);

        // Someone else changes line 2; no update_after_edit ran.
        let external = lines(&["x", "Y", "z"]);
        let err = registry.validate(path, &token, &external).unwrap_err();
        assert!(matches!(err, TokenError::RangeCrcMismatch { .. }));
    }

    #[test]
    fn created_in_task_files_have_infinite_coverage() {
        let registry = AccessRegistry::new();
        let path = Path::new("/ws/new.txt");
        registry.mark_created(path);
        let resolved = ResolvedToken { start: 1, end: 1 };
        assert!(registry.covers(path, &resolved, 1, 999));
    }

    #[test]
    fn move_transfers_entries_and_invalidate_drops_them() {
        let registry = AccessRegistry::new();
        let from = Path::new("/ws/a.txt");
        let to = Path::new("/ws/b.txt");
        registry.register_access(from, 1, 2, &lines(&["x", "y"]));
        registry.move_tokens(from, to);
        assert!(registry.tokens_for(from).is_empty());
        assert_eq!(registry.tokens_for(to).len(), 1);

        registry.invalidate_file(to);
        assert!(registry.tokens_for(to).is_empty());
    }
}
