//! Line-addressed, batch-capable, token-gated edit engine.
//!
//! Every edit resolves its addressing (absolute or anchor-relative),
//! validates the caller's access token against the file's current content,
//! and is applied bottom-up inside a transaction so earlier operations never
//! shift the addresses of later ones. Multi-file batches run under one outer
//! transaction: any failure rolls every file back.

use std::path::Path;
use std::path::PathBuf;

use encoding_rs::Encoding;
use encoding_rs::UTF_8;
use regex_lite::Regex;
use serde::Deserialize;

use crate::diff;
use crate::encoding;
use crate::error::EditError;
use crate::error::Result;
use crate::error::ScribeErr;
use crate::error::TokenError;
use crate::external::FileSnapshot;
use crate::task::TaskContext;
use crate::token::AccessToken;
use crate::transaction::FileStat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditOpKind {
    #[default]
    Replace,
    InsertBefore,
    InsertAfter,
    Delete,
}

/// One operation against one file. `start_line`/`end_line` are 1-based and
/// inclusive; with `anchor_pattern` they become offsets from the first line
/// matching the pattern (0 = the anchor line itself).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditOperation {
    pub start_line: i64,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: EditOpKind,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub ignore_indentation: bool,
    #[serde(default)]
    pub auto_indent: bool,
    #[serde(default)]
    pub anchor_pattern: Option<String>,
}

/// Edits for one file: either the single-edit fields or `operations`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEditRequest {
    pub path: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: Option<EditOpKind>,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub ignore_indentation: bool,
    #[serde(default)]
    pub auto_indent: bool,
    #[serde(default)]
    pub anchor_pattern: Option<String>,
    #[serde(default)]
    pub operations: Option<Vec<EditOperation>>,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Top-level `file.edit` input: one file inline, or a multi-file batch.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    #[serde(flatten)]
    pub single: Option<FileEditRequest>,
    #[serde(default)]
    pub edits: Option<Vec<FileEditRequest>>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone)]
pub struct FileEditReport {
    pub path: PathBuf,
    pub diff: String,
    /// Successor token for the edited span. Absent on dry runs, which must
    /// not mutate the registry.
    pub access_token: Option<String>,
    pub line_delta: i64,
    pub new_line_count: u32,
    /// Set when the file's original charset could not represent the new
    /// content and the write upgraded to UTF-8.
    pub encoding_upgraded: bool,
}

#[derive(Debug, Clone)]
pub struct EditReport {
    pub files: Vec<FileEditReport>,
    pub dry_run: bool,
}

impl FileEditRequest {
    /// Flatten into the operation list, rejecting the ambiguous combination
    /// of top-level `content` with `operations`.
    fn into_operations(self) -> Result<(String, Option<String>, Option<String>, Vec<EditOperation>)> {
        let FileEditRequest {
            path,
            access_token,
            start_line,
            end_line,
            content,
            operation,
            expected_content,
            ignore_indentation,
            auto_indent,
            anchor_pattern,
            operations,
            encoding,
        } = self;
        if let Some(ops) = operations {
            if content.is_some() {
                return Err(EditError::ConflictingContent.into());
            }
            return Ok((path, access_token, encoding, ops));
        }
        let Some(start_line) = start_line else {
            return Err(EditError::MissingField("startLine").into());
        };
        let operation = operation.unwrap_or_default();
        if content.is_none() && operation != EditOpKind::Delete {
            return Err(EditError::MissingField("content").into());
        }
        Ok((
            path,
            access_token,
            encoding,
            vec![EditOperation {
                start_line,
                end_line,
                content,
                operation,
                expected_content,
                ignore_indentation,
                auto_indent,
                anchor_pattern,
            }],
        ))
    }
}

impl EditRequest {
    fn into_file_edits(self) -> Result<(Vec<FileEditRequest>, bool)> {
        let dry_run = self.dry_run;
        if let Some(edits) = self.edits {
            return Ok((edits, dry_run));
        }
        match self.single {
            Some(single) if !single.path.is_empty() => Ok((vec![single], dry_run)),
            _ => Err(EditError::MissingField("path").into()),
        }
    }
}

/// Apply an edit request against a task. Multi-file requests are atomic:
/// either every file commits or all of them are rolled back.
pub fn apply_edits(task: &TaskContext, request: EditRequest) -> Result<EditReport> {
    let (file_edits, dry_run) = request.into_file_edits()?;
    if file_edits.is_empty() {
        return Err(EditError::MissingField("edits").into());
    }

    if dry_run {
        let mut files = Vec::new();
        for file_edit in file_edits {
            let (report, _) = edit_one_file(task, file_edit, true)?;
            files.push(report);
        }
        return Ok(EditReport {
            files,
            dry_run: true,
        });
    }

    let description = if file_edits.len() == 1 {
        format!("edit {}", file_edits[0].path)
    } else {
        format!("edit {} files", file_edits.len())
    };
    task.with_tx(|tx| {
        tx.begin(&description, None);
        Ok(())
    })?;

    let mut files = Vec::new();
    let mut committed_states = Vec::new();
    for file_edit in file_edits {
        match edit_one_file(task, file_edit, false) {
            Ok((report, state)) => {
                files.push(report);
                committed_states.extend(state);
            }
            Err(err) => {
                // Abort the whole unit; a failed rollback outranks the
                // original error because the filesystem is now suspect.
                task.with_tx(|tx| tx.rollback())?;
                return Err(err);
            }
        }
    }
    task.with_tx(|tx| tx.commit())?;

    // The change baseline and lineage reflect committed writes only; a
    // rolled-back batch must not move them.
    for state in committed_states {
        task.tracker.record(&state.path, state.snapshot);
        task.lineage.register_file(&state.path);
        task.lineage.record_crc(&state.path, state.byte_crc);
    }
    task.hud.record_edits(files.len());
    Ok(EditReport {
        files,
        dry_run: false,
    })
}

/// Post-commit bookkeeping captured while a file was edited.
struct CommittedFileState {
    path: PathBuf,
    snapshot: FileSnapshot,
    byte_crc: u32,
}

/// A loaded, line-split file plus everything needed to write it back the way
/// it was found.
pub(crate) struct LoadedFile {
    pub(crate) lines: Vec<String>,
    pub(crate) encoding: &'static Encoding,
    pub(crate) uses_crlf: bool,
    pub(crate) trailing_newline: bool,
}

impl LoadedFile {
    fn render(&self) -> String {
        let sep = if self.uses_crlf { "\r\n" } else { "\n" };
        let mut text = self.lines.join(sep);
        if self.trailing_newline {
            text.push_str(sep);
        }
        text
    }

    /// LF-normalized content, used for CRCs, diffs, and snapshots.
    pub(crate) fn normalized(&self) -> String {
        let mut text = self.lines.join("\n");
        if self.trailing_newline {
            text.push('\n');
        }
        text
    }
}

pub(crate) fn load_file(
    path: &Path,
    forced: Option<&'static Encoding>,
    max_size: Option<u64>,
) -> Result<LoadedFile> {
    let meta = std::fs::metadata(path)?;
    if let Some(limit) = max_size {
        if meta.len() > limit {
            return Err(ScribeErr::FileTooLarge {
                path: path.to_path_buf(),
                size: meta.len(),
                limit,
            });
        }
    }
    let bytes = std::fs::read(path)?;
    if encoding::looks_binary(&bytes) {
        return Err(ScribeErr::BinaryFile(path.to_path_buf()));
    }
    let file_encoding = forced.unwrap_or_else(|| encoding::detect(&bytes));
    let text = encoding::decode(&bytes, file_encoding);
    let uses_crlf = text.contains("\r\n");
    let normalized = text.replace("\r\n", "\n");
    let trailing_newline = normalized.ends_with('\n');
    let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
    // Drop the empty element produced by a trailing newline, but keep the
    // single empty line that represents an empty file.
    if lines.len() > 1 && lines.last().is_some_and(String::is_empty) && trailing_newline {
        lines.pop();
    }
    Ok(LoadedFile {
        lines,
        encoding: file_encoding,
        uses_crlf,
        trailing_newline,
    })
}

/// An operation with its addressing resolved to absolute line numbers.
#[derive(Debug)]
struct ResolvedOp {
    op: EditOperation,
    /// Splice range in 0-based half-open coordinates over the line vector.
    splice_start: usize,
    splice_end: usize,
    /// 1-based inclusive range used for coverage and expectation checks.
    check_start: u32,
    check_end: u32,
}

fn resolve_operation(op: EditOperation, lines: &[String]) -> Result<ResolvedOp> {
    let len = lines.len() as i64;
    let (mut start, mut end) = match &op.anchor_pattern {
        Some(pattern) => {
            let regex = Regex::new(pattern)
                .map_err(|e| EditError::BadAnchorPattern(format!("{pattern}: {e}")))?;
            let anchor = lines
                .iter()
                .position(|line| regex.is_match(line))
                .ok_or_else(|| EditError::AnchorNotFound(pattern.clone()))?
                as i64
                + 1;
            (
                anchor + op.start_line,
                anchor + op.end_line.unwrap_or(op.start_line),
            )
        }
        None => (op.start_line, op.end_line.unwrap_or(op.start_line)),
    };
    if end < start {
        std::mem::swap(&mut start, &mut end);
    }

    let (splice_start, splice_end, check_start, check_end) = match op.operation {
        EditOpKind::InsertBefore => {
            if start < 1 || start > len + 1 {
                return Err(EditError::LineOutOfBounds {
                    line: start,
                    len: len as usize,
                }
                .into());
            }
            let at = (start - 1) as usize;
            let check = start.clamp(1, len.max(1)) as u32;
            (at, at, check, check)
        }
        EditOpKind::InsertAfter => {
            if start < 1 || start > len {
                return Err(EditError::LineOutOfBounds {
                    line: start,
                    len: len as usize,
                }
                .into());
            }
            let at = start as usize;
            (at, at, start as u32, start as u32)
        }
        EditOpKind::Replace | EditOpKind::Delete => {
            if start < 1 || start > len || end > len {
                return Err(EditError::LineOutOfBounds {
                    line: if start < 1 || start > len { start } else { end },
                    len: len as usize,
                }
                .into());
            }
            ((start - 1) as usize, end as usize, start as u32, end as u32)
        }
    };

    Ok(ResolvedOp {
        op,
        splice_start,
        splice_end,
        check_start,
        check_end,
    })
}

/// Normalization used only for `expectedContent` comparison: line endings
/// unified, trailing whitespace stripped per line, trailing blank lines
/// dropped, and optionally leading whitespace stripped. Content inside lines
/// is never touched.
fn fuzzy_normalize(text: &str, ignore_indentation: bool) -> String {
    let mut lines: Vec<String> = text
        .replace("\r\n", "\n")
        .split('\n')
        .map(|line| {
            let line = line.trim_end();
            if ignore_indentation {
                line.trim_start().to_string()
            } else {
                line.to_string()
            }
        })
        .collect();
    while lines.last().is_some_and(|l| l.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

fn check_expectation(resolved: &ResolvedOp, lines: &[String]) -> Result<()> {
    let Some(expected) = &resolved.op.expected_content else {
        return Ok(());
    };
    let actual = lines[resolved.splice_start..resolved.splice_end].join("\n");
    let ignore = resolved.op.ignore_indentation;
    if fuzzy_normalize(expected, ignore) != fuzzy_normalize(&actual, ignore) {
        return Err(EditError::ExpectedContentMismatch {
            start: resolved.check_start,
            end: resolved.check_end,
            expected: expected.clone(),
            actual,
        }
        .into());
    }
    Ok(())
}

fn replacement_lines(resolved: &ResolvedOp, lines: &[String]) -> Vec<String> {
    let mut new_lines: Vec<String> = match (&resolved.op.operation, &resolved.op.content) {
        (EditOpKind::Delete, _) | (_, None) => Vec::new(),
        (_, Some(content)) => content
            .replace("\r\n", "\n")
            .split('\n')
            .map(str::to_string)
            .collect(),
    };
    if resolved.op.auto_indent {
        // The line above the splice point donates its indentation.
        if let Some(idx) = resolved.splice_start.checked_sub(1) {
            if let Some(above) = lines.get(idx) {
                let indent: String = above
                    .chars()
                    .take_while(|c| *c == ' ' || *c == '\t')
                    .collect();
                if !indent.is_empty() {
                    for line in &mut new_lines {
                        if !line.is_empty() {
                            line.insert_str(0, &indent);
                        }
                    }
                }
            }
        }
    }
    new_lines
}

fn edit_one_file(
    task: &TaskContext,
    file_edit: FileEditRequest,
    dry_run: bool,
) -> Result<(FileEditReport, Option<CommittedFileState>)> {
    let (path_input, access_token, forced_encoding, ops) = file_edit.into_operations()?;
    let path = task.sandbox.sanitize(&path_input, true)?;
    task.sandbox.ensure_writable(&path)?;

    let forced = match forced_encoding.as_deref() {
        Some(label) => Some(
            encoding::by_label(label)
                .ok_or_else(|| EditError::UnknownEncoding(label.to_string()))?,
        ),
        None => None,
    };
    let mut file = load_file(&path, forced, Some(task.config.max_file_size))?;
    let before_normalized = file.normalized();

    // Token gate. Files created inside this task are editable bare.
    let created_in_task = task.registry.is_created_in_task(&path);
    let resolved_token = if created_in_task {
        None
    } else {
        let Some(wire) = access_token.as_deref() else {
            return Err(TokenError::Missing.into());
        };
        let token = AccessToken::decode(wire, &path, &task.lineage)?;
        match task.registry.validate(&path, &token, &file.lines) {
            Ok(resolved) => Some(resolved),
            Err(failure) => {
                return Err(classify_token_failure(task, &path, &file, failure));
            }
        }
    };

    // Resolve addressing up front so a batch with one bad operation fails
    // before any splice runs.
    let mut resolved_ops = Vec::with_capacity(ops.len());
    for op in ops {
        resolved_ops.push(resolve_operation(op, &file.lines)?);
    }
    if let Some(resolved) = &resolved_token {
        let union_start = resolved_ops.iter().map(|r| r.check_start).min().unwrap_or(1);
        let union_end = resolved_ops.iter().map(|r| r.check_end).max().unwrap_or(1);
        if !task.registry.covers(&path, resolved, union_start, union_end) {
            return Err(TokenError::OutOfCoverage {
                token_start: resolved.start,
                token_end: resolved.end,
                start: union_start,
                end: union_end,
            }
            .into());
        }
    }

    // Bottom-up: apply from the highest start line down.
    resolved_ops.sort_by(|a, b| b.splice_start.cmp(&a.splice_start));

    if !dry_run {
        task.with_tx(|tx| {
            tx.backup(&path)?;
            tx.mark_accessed(&path)
        })?;
    }

    struct AppliedOp {
        check_start: u32,
        check_end: u32,
        delta: i64,
    }
    let old_len = file.lines.len();
    let mut applied: Vec<AppliedOp> = Vec::new();
    for resolved in &resolved_ops {
        check_expectation(resolved, &file.lines)?;
        let new_lines = replacement_lines(resolved, &file.lines);
        let removed = resolved.splice_end - resolved.splice_start;
        let delta = new_lines.len() as i64 - removed as i64;
        file.lines
            .splice(resolved.splice_start..resolved.splice_end, new_lines);
        applied.push(AppliedOp {
            check_start: resolved.check_start,
            check_end: resolved.check_end,
            delta,
        });
    }
    // Deleting every line leaves one empty line, not a zero-line file.
    if file.lines.is_empty() {
        file.lines.push(String::new());
        file.trailing_newline = false;
    }
    let line_delta = file.lines.len() as i64 - old_len as i64;

    // Encoding preservation, with a one-way upgrade to UTF-8 when the
    // original charset cannot represent the new content.
    let rendered = file.render();
    let (bytes, encoding_upgraded) = match encoding::encode(&rendered, file.encoding) {
        Some(bytes) => (bytes, false),
        None => (rendered.into_bytes(), true),
    };
    let after_normalized = file.normalized();
    let diff_text = diff::unified(&path.display().to_string(), &before_normalized, &after_normalized);

    if dry_run {
        return Ok((
            FileEditReport {
                path,
                diff: diff_text,
                access_token: None,
                line_delta,
                new_line_count: file.lines.len() as u32,
                encoding_upgraded,
            },
            None,
        ));
    }

    safe_write(&path, &bytes)?;

    // Translate every token on this path, lowest applied op first so each
    // shift sees the coordinates the splice actually ran against.
    for op in applied.iter().rev() {
        task.registry
            .update_after_edit(&path, op.check_start, op.check_end, op.delta, &file.lines);
    }
    // Mint the successor token over the edited span in new coordinates.
    let union_start = applied.iter().map(|o| o.check_start).min().unwrap_or(1);
    let union_end = applied.iter().map(|o| o.check_end).max().unwrap_or(1);
    let new_len = file.lines.len() as u32;
    let successor_end = ((union_end as i64 + line_delta).max(union_start as i64) as u32)
        .clamp(1, new_len.max(1));
    let successor_start = union_start.clamp(1, new_len.max(1));
    let successor = task.registry.register_access(
        &path,
        successor_start,
        successor_end.max(successor_start),
        &file.lines,
    );

    let encoding_label = if encoding_upgraded {
        UTF_8.name().to_string()
    } else {
        file.encoding.name().to_string()
    };
    let state = CommittedFileState {
        path: path.clone(),
        snapshot: FileSnapshot::new(after_normalized.clone(), encoding_label, new_len),
        byte_crc: crc32c::crc32c(&bytes),
    };

    let (added, removed) = diff::line_stats(&before_normalized, &after_normalized);
    task.with_tx(|tx| {
        tx.add_stat(FileStat {
            path: path.clone(),
            lines_added: added as i64,
            lines_removed: removed as i64,
            diff: diff_text.clone(),
        })
    })?;

    Ok((
        FileEditReport {
            path,
            diff: diff_text,
            access_token: Some(successor.encode()),
            line_delta,
            new_line_count: new_len,
            encoding_upgraded,
        },
        Some(state),
    ))
}

/// A failed token validation is an external-change event when the file's
/// current content also disagrees with the last snapshot this task recorded.
fn classify_token_failure(
    task: &TaskContext,
    path: &Path,
    file: &LoadedFile,
    failure: TokenError,
) -> ScribeErr {
    let current = FileSnapshot::new(
        file.normalized(),
        file.encoding.name().to_string(),
        file.lines.len() as u32,
    );
    if let Some(change) = task.tracker.check_external_change(path, &current) {
        if let Err(e) = task.with_tx(|tx| {
            tx.journal()
                .record_external_change(path, change.previous.crc, change.current.crc)
        }) {
            tracing::warn!("failed to journal external change for {}: {e}", path.display());
        }
        return TokenError::ExternalChange {
            previous_crc: change.previous.crc,
            current_crc: change.current.crc,
        }
        .into();
    }
    failure.into()
}

/// Write through a temp file in the same directory plus rename, so readers
/// never observe a half-written file.
fn safe_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    std::io::Write::write_all(&mut tmp, bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ScribeErr::Io(e.error))?;
    Ok(())
}
