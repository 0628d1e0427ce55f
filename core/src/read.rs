//! `file.read`: read line ranges and mint the access tokens that authorize
//! later edits. Reading is the only way (besides creating a file in-task) to
//! earn the right to write.

use std::path::PathBuf;

use regex_lite::Regex;
use serde::Deserialize;

use crate::edit;
use crate::encoding;
use crate::error::EditError;
use crate::error::Result;
use crate::external::FileSnapshot;
use crate::task::TaskContext;
use crate::token::AccessToken;

/// Context lines shown around an anchor match when no explicit range is given.
const ANCHOR_CONTEXT: u32 = 2;

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineRange {
    pub start: u32,
    pub end: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadRequest {
    pub path: String,
    #[serde(default)]
    pub line: Option<u32>,
    #[serde(default)]
    pub start_line: Option<u32>,
    #[serde(default)]
    pub end_line: Option<u32>,
    #[serde(default)]
    pub ranges: Option<Vec<LineRange>>,
    #[serde(default)]
    pub anchor_pattern: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Read past the configured size cap.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReadRange {
    pub start: u32,
    pub end: u32,
    /// Raw lines of the range, without numbering.
    pub lines: Vec<String>,
    pub access_token: String,
}

#[derive(Debug, Clone)]
pub struct ReadReport {
    pub path: PathBuf,
    pub charset: String,
    pub line_count: u32,
    pub ranges: Vec<ReadRange>,
    /// Result of revalidating a token the caller already held, if one was
    /// passed along.
    pub prior_token_valid: Option<bool>,
}

pub fn read_file(task: &TaskContext, request: ReadRequest) -> Result<ReadReport> {
    let path = task.sandbox.sanitize(&request.path, true)?;
    let forced = match request.encoding.as_deref() {
        Some(label) => Some(
            encoding::by_label(label)
                .ok_or_else(|| EditError::UnknownEncoding(label.to_string()))?,
        ),
        None => None,
    };
    let max_size = if request.force {
        None
    } else {
        Some(task.config.max_file_size)
    };
    let file = edit::load_file(&path, forced, max_size)?;
    let len = file.lines.len() as u32;

    let ranges = resolve_ranges(&request, &file.lines)?;
    let mut out = Vec::with_capacity(ranges.len());
    for (start, end) in ranges {
        let token = task
            .registry
            .register_access(&path, start, end, &file.lines);
        out.push(ReadRange {
            start: token.start,
            end: token.end,
            lines: file.lines[(start - 1) as usize..end as usize].to_vec(),
            access_token: token.encode(),
        });
    }

    let prior_token_valid = match request.access_token.as_deref() {
        Some(wire) => Some(
            AccessToken::decode(wire, &path, &task.lineage)
                .and_then(|token| token.validate(&file.lines))
                .is_ok(),
        ),
        None => None,
    };

    // Every successful read refreshes the external-change baseline and the
    // file's lineage record.
    let normalized = file.normalized();
    task.tracker.record(
        &path,
        FileSnapshot::new(normalized, file.encoding.name().to_string(), len),
    );
    task.lineage.register_file(&path);

    Ok(ReadReport {
        path,
        charset: file.encoding.name().to_string(),
        line_count: len,
        ranges: out,
        prior_token_valid,
    })
}

fn resolve_ranges(request: &ReadRequest, lines: &[String]) -> Result<Vec<(u32, u32)>> {
    let len = lines.len() as u32;
    let clamp = |start: u32, end: u32| -> Result<(u32, u32)> {
        if start == 0 || start > len || end < start {
            return Err(EditError::LineOutOfBounds {
                line: if start == 0 || start > len {
                    start as i64
                } else {
                    end as i64
                },
                len: len as usize,
            }
            .into());
        }
        Ok((start, end.min(len)))
    };

    if let Some(ranges) = &request.ranges {
        if ranges.is_empty() {
            return Err(EditError::MissingField("ranges").into());
        }
        let mut out = Vec::with_capacity(ranges.len());
        for range in ranges {
            out.push(clamp(range.start, range.end)?);
        }
        return Ok(out);
    }
    if let Some(pattern) = &request.anchor_pattern {
        let regex = Regex::new(pattern)
            .map_err(|e| EditError::BadAnchorPattern(format!("{pattern}: {e}")))?;
        let anchor = lines
            .iter()
            .position(|line| regex.is_match(line))
            .ok_or_else(|| EditError::AnchorNotFound(pattern.clone()))? as u32
            + 1;
        let start = anchor.saturating_sub(ANCHOR_CONTEXT).max(1);
        let end = (anchor + ANCHOR_CONTEXT).min(len);
        return Ok(vec![(start, end)]);
    }
    if let Some(line) = request.line {
        return Ok(vec![clamp(line, line)?]);
    }
    if let Some(start) = request.start_line {
        let end = request.end_line.unwrap_or(len);
        return Ok(vec![clamp(start, end)?]);
    }
    // No addressing: the whole file.
    Ok(vec![(1, len.max(1))])
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::config::Config;
    use crate::config::ConfigOverrides;
    use crate::task::TaskManager;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn task_in(dir: &std::path::Path) -> Arc<TaskContext> {
        let manager = TaskManager::new(Config::load_with_overrides(
            dir.to_path_buf(),
            ConfigOverrides::default(),
        ));
        manager.init(Some("t".to_string())).unwrap()
    }

    fn request(path: &str) -> ReadRequest {
        ReadRequest {
            path: path.to_string(),
            line: None,
            start_line: None,
            end_line: None,
            ranges: None,
            anchor_pattern: None,
            access_token: None,
            force: false,
            encoding: None,
        }
    }

    #[test]
    fn whole_file_read_mints_a_covering_token() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x\ny\nz\n").unwrap();
        let task = task_in(dir.path());

        let report = read_file(&task, request("a.txt")).unwrap();
        assert_eq!(report.line_count, 3);
        assert_eq!(report.ranges.len(), 1);
        assert_eq!((report.ranges[0].start, report.ranges[0].end), (1, 3));
        assert_eq!(report.ranges[0].lines, vec!["x", "y", "z"]);

        // The freshly minted token validates immediately (round-trip law).
        let token = AccessToken::parse(&report.ranges[0].access_token).unwrap();
        let lines: Vec<String> = ["x", "y", "z"].iter().map(|s| s.to_string()).collect();
        assert!(token.validate(&lines).is_ok());
    }

    #[test]
    fn disjoint_ranges_mint_one_token_each() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=10).map(|i| format!("L{i}\n")).collect();
        std::fs::write(dir.path().join("a.txt"), content).unwrap();
        let task = task_in(dir.path());

        let mut req = request("a.txt");
        req.ranges = Some(vec![
            LineRange { start: 1, end: 2 },
            LineRange { start: 8, end: 10 },
        ]);
        let report = read_file(&task, req).unwrap();
        assert_eq!(report.ranges.len(), 2);
        assert_eq!((report.ranges[1].start, report.ranges[1].end), (8, 10));
    }

    #[test]
    fn anchor_read_returns_context_window() {
        let dir = tempfile::tempdir().unwrap();
        let content: String = (1..=10).map(|i| format!("L{i}\n")).collect();
        std::fs::write(dir.path().join("a.txt"), content).unwrap();
        let task = task_in(dir.path());

        let mut req = request("a.txt");
        req.anchor_pattern = Some("L5".to_string());
        let report = read_file(&task, req).unwrap();
        assert_eq!((report.ranges[0].start, report.ranges[0].end), (3, 7));
    }

    #[test]
    fn out_of_bounds_range_is_an_addressing_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x\n").unwrap();
        let task = task_in(dir.path());

        let mut req = request("a.txt");
        req.start_line = Some(5);
        assert!(read_file(&task, req).is_err());
    }

    #[test]
    fn empty_file_reads_as_one_empty_line() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "").unwrap();
        let task = task_in(dir.path());

        let report = read_file(&task, request("empty.txt")).unwrap();
        assert_eq!(report.line_count, 1);
        assert_eq!(report.ranges[0].lines, vec![String::new()]);
    }

    #[test]
    fn prior_token_validity_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "x\ny\n").unwrap();
        let task = task_in(dir.path());

        let first = read_file(&task, request("a.txt")).unwrap();
        let mut req = request("a.txt");
        req.access_token = Some(first.ranges[0].access_token.clone());
        let second = read_file(&task, req).unwrap();
        assert_eq!(second.prior_token_valid, Some(true));

        std::fs::write(dir.path().join("a.txt"), "x\nCHANGED\n").unwrap();
        let mut req = request("a.txt");
        req.access_token = Some(first.ranges[0].access_token.clone());
        let third = read_file(&task, req).unwrap();
        assert_eq!(third.prior_token_valid, Some(false));
    }
}
