//! Unified-diff rendering shared by dry-run edits, the journal, and the
//! `file.compare` tool.

use similar::TextDiff;

/// Render a git-style unified diff with a `---`/`+++` header naming the file.
pub fn unified(name: &str, before: &str, after: &str) -> String {
    let diff = TextDiff::from_lines(before, after);
    let body = diff.unified_diff().context_radius(3).to_string();
    if body.is_empty() {
        return String::new();
    }
    format!("--- a/{name}\n+++ b/{name}\n{body}")
}

/// Count of added and removed lines between two contents.
pub fn line_stats(before: &str, after: &str) -> (usize, usize) {
    let diff = TextDiff::from_lines(before, after);
    let mut added = 0;
    let mut removed = 0;
    for change in diff.iter_all_changes() {
        match change.tag() {
            similar::ChangeTag::Insert => added += 1,
            similar::ChangeTag::Delete => removed += 1,
            similar::ChangeTag::Equal => {}
        }
    }
    (added, removed)
}
