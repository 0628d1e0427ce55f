//! `file.search`: list, find (glob), grep (literal or regex), structure.
//!
//! Grep walks the workspace with the same parallel tree-walker ripgrep uses
//! and coalesces match and context lines into contiguous ranges. Each range
//! is registered with the access registry, so the agent can edit a match
//! site by citing the returned token without a separate read.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use ignore::WalkBuilder;
use ignore::WalkState;
use regex_lite::Regex;
use serde::Deserialize;
use wildmatch::WildMatch;

use crate::encoding;
use crate::error::EditError;
use crate::error::Result;
use crate::error::ScribeErr;
use crate::task::TaskContext;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub action: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Context lines before and after each grep match.
    #[serde(default)]
    pub before: Option<u32>,
    #[serde(default)]
    pub after: Option<u32>,
    #[serde(default)]
    pub depth: Option<usize>,
    /// Honor ignore files (`.gitignore` and friends) while walking.
    #[serde(default = "default_true")]
    pub auto_ignore: bool,
}

#[derive(Debug, Clone)]
pub struct ListEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct GrepRange {
    pub start: u32,
    pub end: u32,
    pub lines: Vec<String>,
    /// Which lines in `start..=end` actually matched (the rest is context).
    pub match_lines: Vec<u32>,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct FileGrep {
    pub path: PathBuf,
    pub ranges: Vec<GrepRange>,
}

#[derive(Debug, Clone)]
pub enum SearchReport {
    Listing(Vec<ListEntry>),
    Found(Vec<String>),
    Grep(Vec<FileGrep>),
    Structure(String),
}

pub fn search(task: &TaskContext, request: SearchRequest) -> Result<SearchReport> {
    let root = match &request.path {
        Some(path) => task.sandbox.sanitize(path, true)?,
        None => task.cwd.clone(),
    };
    match request.action.as_str() {
        "list" => list(&root),
        "find" => find(&root, &request),
        "grep" => grep(task, &root, &request),
        "structure" => structure(&root, &request),
        other => Err(ScribeErr::UnknownAction(other.to_string())),
    }
}

fn list(root: &Path) -> Result<SearchReport> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        entries.push(ListEntry {
            name: entry.file_name().to_string_lossy().into_owned(),
            is_dir: meta.is_dir(),
            size: meta.len(),
        });
    }
    entries.sort_by_key(|e| (!e.is_dir, e.name.clone()));
    Ok(SearchReport::Listing(entries))
}

fn find(root: &Path, request: &SearchRequest) -> Result<SearchReport> {
    let Some(pattern) = &request.pattern else {
        return Err(EditError::MissingField("pattern").into());
    };
    let matcher = WildMatch::new(pattern);
    let max_results = request.max_results.unwrap_or(1_000);

    let mut found = Vec::new();
    let walker = WalkBuilder::new(root)
        .standard_filters(request.auto_ignore)
        .build();
    for entry in walker.flatten() {
        if found.len() >= max_results {
            break;
        }
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .into_owned();
        let name = entry.file_name().to_string_lossy().into_owned();
        if matcher.matches(&rel) || matcher.matches(&name) {
            found.push(rel);
        }
    }
    found.sort();
    Ok(SearchReport::Found(found))
}

enum LineMatcher {
    Literal(String),
    Pattern(Regex),
}

impl LineMatcher {
    fn matches(&self, line: &str) -> bool {
        match self {
            LineMatcher::Literal(needle) => line.contains(needle.as_str()),
            LineMatcher::Pattern(regex) => regex.is_match(line),
        }
    }
}

/// Per-file grep output produced inside a walker thread; token minting
/// happens afterwards on the caller's thread.
struct PendingFile {
    path: PathBuf,
    lines: Vec<String>,
    ranges: Vec<(u32, u32, Vec<u32>)>,
}

fn grep(task: &TaskContext, root: &Path, request: &SearchRequest) -> Result<SearchReport> {
    let Some(pattern) = &request.pattern else {
        return Err(EditError::MissingField("pattern").into());
    };
    let matcher = if request.is_regex {
        LineMatcher::Pattern(
            Regex::new(pattern)
                .map_err(|e| EditError::BadAnchorPattern(format!("{pattern}: {e}")))?,
        )
    } else {
        LineMatcher::Literal(pattern.clone())
    };
    let before = request.before.unwrap_or(2);
    let after = request.after.unwrap_or(2);
    let max_results = request.max_results.unwrap_or(task.config.grep_max_results);
    let threads = if task.config.grep_threads > 0 {
        task.config.grep_threads
    } else {
        std::thread::available_parallelism().map_or(4, |n| n.get())
    };

    let pending: Mutex<Vec<PendingFile>> = Mutex::new(Vec::new());
    let matched_files = AtomicUsize::new(0);
    let max_file_size = task.config.max_file_size;

    let walker = WalkBuilder::new(root)
        .standard_filters(request.auto_ignore)
        .threads(threads)
        .build_parallel();
    walker.run(|| {
        Box::new(|entry| {
            if matched_files.load(Ordering::Relaxed) >= max_results {
                return WalkState::Quit;
            }
            let Ok(entry) = entry else {
                return WalkState::Continue;
            };
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                return WalkState::Continue;
            }
            match grep_one_file(entry.path(), &matcher, before, after, max_file_size) {
                Ok(Some(file)) => {
                    matched_files.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut guard) = pending.lock() {
                        guard.push(file);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // Search errors are per-file and never abort the batch.
                    tracing::warn!("grep skipping {}: {e}", entry.path().display());
                }
            }
            WalkState::Continue
        })
    });

    let mut pending = match pending.into_inner() {
        Ok(files) => files,
        Err(poisoned) => poisoned.into_inner(),
    };
    pending.sort_by(|a, b| a.path.cmp(&b.path));
    pending.truncate(max_results);

    let mut out = Vec::with_capacity(pending.len());
    for file in pending {
        let mut ranges = Vec::with_capacity(file.ranges.len());
        for (start, end, match_lines) in file.ranges {
            let token = task
                .registry
                .register_access(&file.path, start, end, &file.lines);
            ranges.push(GrepRange {
                start,
                end,
                lines: file.lines[(start - 1) as usize..end as usize].to_vec(),
                match_lines,
                access_token: token.encode(),
            });
        }
        out.push(FileGrep {
            path: file.path,
            ranges,
        });
    }
    Ok(SearchReport::Grep(out))
}

fn grep_one_file(
    path: &Path,
    matcher: &LineMatcher,
    before: u32,
    after: u32,
    max_file_size: u64,
) -> Result<Option<PendingFile>> {
    if std::fs::metadata(path)?.len() > max_file_size {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    if encoding::looks_binary(&bytes) {
        return Ok(None);
    }
    let text = encoding::decode(&bytes, encoding::detect(&bytes));
    let normalized = text.replace("\r\n", "\n");
    let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
    if lines.len() > 1 && lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    let len = lines.len() as u32;

    let match_lines: Vec<u32> = lines
        .iter()
        .enumerate()
        .filter(|(_, line)| matcher.matches(line))
        .map(|(idx, _)| idx as u32 + 1)
        .collect();
    if match_lines.is_empty() {
        return Ok(None);
    }

    // Coalesce match-plus-context windows into contiguous ranges.
    let mut ranges: Vec<(u32, u32, Vec<u32>)> = Vec::new();
    for &line in &match_lines {
        let start = line.saturating_sub(before).max(1);
        let end = (line + after).min(len);
        match ranges.last_mut() {
            Some((_, last_end, matches)) if start <= last_end.saturating_add(1) => {
                *last_end = (*last_end).max(end);
                matches.push(line);
            }
            _ => ranges.push((start, end, vec![line])),
        }
    }

    Ok(Some(PendingFile {
        path: path.to_path_buf(),
        lines,
        ranges,
    }))
}

fn structure(root: &Path, request: &SearchRequest) -> Result<SearchReport> {
    let depth = request.depth.unwrap_or(3);
    let mut rendered = String::new();
    render_tree(root, root, depth, request.auto_ignore, &mut rendered)?;
    Ok(SearchReport::Structure(rendered))
}

fn render_tree(
    root: &Path,
    dir: &Path,
    depth_left: usize,
    auto_ignore: bool,
    out: &mut String,
) -> Result<()> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    let mut files: Vec<String> = Vec::new();
    let walker = WalkBuilder::new(dir)
        .standard_filters(auto_ignore)
        .max_depth(Some(1))
        .build();
    for entry in walker.flatten() {
        if entry.path() == dir {
            continue;
        }
        if entry.file_type().is_some_and(|ft| ft.is_dir()) {
            dirs.push(entry.path().to_path_buf());
        } else {
            files.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    dirs.sort();
    files.sort();

    let indent = "  ".repeat(root_depth(root, dir));
    for sub in dirs {
        let count = file_count(&sub, auto_ignore);
        let name = sub.file_name().map(|n| n.to_string_lossy().into_owned());
        if let Some(name) = name {
            out.push_str(&format!("{indent}{name}/ ({count} files)\n"));
        }
        if depth_left > 1 {
            render_tree(root, &sub, depth_left - 1, auto_ignore, out)?;
        }
    }
    for file in files {
        out.push_str(&format!("{indent}{file}\n"));
    }
    Ok(())
}

fn root_depth(root: &Path, dir: &Path) -> usize {
    dir.strip_prefix(root)
        .map(|rel| rel.components().count())
        .unwrap_or(0)
}

fn file_count(dir: &Path, auto_ignore: bool) -> usize {
    WalkBuilder::new(dir)
        .standard_filters(auto_ignore)
        .build()
        .flatten()
        .filter(|e| e.file_type().is_some_and(|ft| ft.is_file()))
        .count()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use crate::task::TaskManager;
    use crate::token::AccessToken;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn task_in(dir: &std::path::Path) -> Arc<TaskContext> {
        let manager = TaskManager::new(Config::load_with_overrides(
            dir.to_path_buf(),
            ConfigOverrides::default(),
        ));
        manager.init(Some("t".to_string())).unwrap()
    }

    fn request(action: &str) -> SearchRequest {
        SearchRequest {
            action: action.to_string(),
            path: None,
            pattern: None,
            is_regex: false,
            max_results: None,
            before: None,
            after: None,
            depth: None,
            auto_ignore: true,
        }
    }

    #[test]
    fn grep_coalesces_context_into_ranges_and_mints_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=20)
            .map(|i| {
                if i == 5 || i == 7 {
                    format!("needle {i}\n")
                } else {
                    format!("line {i}\n")
                }
            })
            .collect();
        std::fs::write(dir.path().join("a.txt"), &content).unwrap();
        let task = task_in(dir.path());

        let mut req = request("grep");
        req.pattern = Some("needle".to_string());
        let SearchReport::Grep(files) = search(&task, req).unwrap() else {
            panic!("expected grep report");
        };
        assert_eq!(files.len(), 1);
        // Lines 5 and 7 with two lines of context each merge into 3..9.
        assert_eq!(files[0].ranges.len(), 1);
        let range = &files[0].ranges[0];
        assert_eq!((range.start, range.end), (3, 9));
        assert_eq!(range.match_lines, vec![5, 7]);

        // The minted token authorizes an edit of the matched span directly.
        let token = AccessToken::parse(&range.access_token).unwrap();
        assert!(token.covers(5, 7));
    }

    #[test]
    fn grep_respects_max_results() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..6 {
            std::fs::write(dir.path().join(format!("f{i}.txt")), "needle\n").unwrap();
        }
        let task = task_in(dir.path());

        let mut req = request("grep");
        req.pattern = Some("needle".to_string());
        req.max_results = Some(3);
        let SearchReport::Grep(files) = search(&task, req).unwrap() else {
            panic!("expected grep report");
        };
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn grep_regex_mode_matches_patterns() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.rs"), "fn alpha() {}\nfn beta() {}\n").unwrap();
        let task = task_in(dir.path());

        let mut req = request("grep");
        req.pattern = Some(r"fn \w+\(\)".to_string());
        req.is_regex = true;
        req.before = Some(0);
        req.after = Some(0);
        let SearchReport::Grep(files) = search(&task, req).unwrap() else {
            panic!("expected grep report");
        };
        assert_eq!(files[0].ranges[0].match_lines, vec![1, 2]);
    }

    #[test]
    fn find_globs_against_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("readme.md"), "").unwrap();
        let task = task_in(dir.path());

        let mut req = request("find");
        req.pattern = Some("*.rs".to_string());
        let SearchReport::Found(found) = search(&task, req).unwrap() else {
            panic!("expected find report");
        };
        assert_eq!(found, vec!["src/main.rs".to_string()]);
    }

    #[test]
    fn list_reports_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), "x").unwrap();
        let task = task_in(dir.path());

        let SearchReport::Listing(entries) = search(&task, request("list")).unwrap() else {
            panic!("expected listing");
        };
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert!(names.contains(&"sub"));
        assert!(names.contains(&"a.txt"));
    }

    #[test]
    fn structure_renders_a_depth_bounded_tree() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "").unwrap();
        std::fs::write(dir.path().join("src/nested/deep.rs"), "").unwrap();
        let task = task_in(dir.path());

        let mut req = request("structure");
        req.depth = Some(1);
        let SearchReport::Structure(tree) = search(&task, req).unwrap() else {
            panic!("expected structure");
        };
        assert!(tree.contains("src/ (2 files)"));
        assert!(!tree.contains("deep.rs"));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let task = task_in(dir.path());
        assert!(matches!(
            search(&task, request("explode")).unwrap_err(),
            ScribeErr::UnknownAction(_)
        ));
    }
}
