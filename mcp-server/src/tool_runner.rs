//! Executes tool calls against the core and renders the text envelopes the
//! agent reads. Protocol-level problems (unknown tool, malformed arguments,
//! unknown task) surface as JSON-RPC errors; everything the core rejects is
//! mapped onto the error-code partition of its taxonomy.

use std::collections::BTreeMap;
use std::sync::Arc;

use scribe_core::ScribeErr;
use scribe_core::TaskContext;
use scribe_core::TaskManager;
use scribe_core::diff;
use scribe_core::edit;
use scribe_core::error::ErrorKind;
use scribe_core::manage;
use scribe_core::read;
use scribe_core::search;
use scribe_core::search::SearchReport;
use scribe_core::undo::UndoOutcome;
use scribe_core::undo::UndoResult;
use scribe_protocol::CallToolResult;
use scribe_protocol::error_codes;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug)]
pub(crate) struct ErrorEnvelope {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl ErrorEnvelope {
    fn invalid_params(message: String) -> Self {
        Self {
            code: error_codes::INVALID_PARAMS,
            message,
            data: None,
        }
    }
}

fn code_for(kind: ErrorKind) -> i64 {
    match kind {
        ErrorKind::Addressing => error_codes::INVALID_PARAMS,
        ErrorKind::Authorization => error_codes::AUTHORIZATION,
        ErrorKind::ContentExpectation => error_codes::CONTENT_EXPECTATION,
        ErrorKind::ExternalChange => error_codes::EXTERNAL_CHANGE,
        ErrorKind::Sandbox => error_codes::SANDBOX,
        ErrorKind::Resource => error_codes::RESOURCE,
        ErrorKind::Transactional => error_codes::TRANSACTIONAL,
    }
}

fn kind_label(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::Addressing => "addressing",
        ErrorKind::Authorization => "authorization",
        ErrorKind::ContentExpectation => "content-expectation",
        ErrorKind::ExternalChange => "external-change",
        ErrorKind::Sandbox => "sandbox",
        ErrorKind::Resource => "resource",
        ErrorKind::Transactional => "transactional",
    }
}

impl From<ScribeErr> for ErrorEnvelope {
    fn from(err: ScribeErr) -> Self {
        let kind = err.kind();
        Self {
            code: code_for(kind),
            message: err.to_string(),
            data: Some(serde_json::json!({ "kind": kind_label(kind) })),
        }
    }
}

fn parse_args<T: for<'de> Deserialize<'de>>(args: &Value) -> Result<T, ErrorEnvelope> {
    serde_json::from_value(args.clone())
        .map_err(|e| ErrorEnvelope::invalid_params(format!("invalid arguments: {e}")))
}

fn task_for(manager: &TaskManager, args: &Value) -> Result<Arc<TaskContext>, ErrorEnvelope> {
    let Some(task_id) = args.get("taskId").and_then(Value::as_str) else {
        return Err(ErrorEnvelope::invalid_params(
            "missing required field `taskId`".to_string(),
        ));
    };
    manager.get(task_id).map_err(Into::into)
}

pub(crate) fn run_tool(
    manager: &TaskManager,
    name: &str,
    args: Value,
) -> Result<CallToolResult, ErrorEnvelope> {
    match name {
        "init" => run_init(manager, &args),
        "file.read" => {
            let task = task_for(manager, &args)?;
            let request: read::ReadRequest = parse_args(&args)?;
            let report = read::read_file(&task, request)?;
            Ok(with_hud(&task, render_read(&report)))
        }
        "file.edit" => {
            let task = task_for(manager, &args)?;
            let request: edit::EditRequest = parse_args(&args)?;
            let report = edit::apply_edits(&task, request)?;
            Ok(with_hud(&task, render_edit(&report)))
        }
        "file.manage" => {
            let task = task_for(manager, &args)?;
            let request: manage::ManageRequest = parse_args(&args)?;
            let report = manage::manage(&task, request)?;
            Ok(with_hud(&task, report.summary))
        }
        "file.search" => {
            let task = task_for(manager, &args)?;
            let request: search::SearchRequest = parse_args(&args)?;
            let report = search::search(&task, request)?;
            Ok(with_hud(&task, render_search(&report)))
        }
        "file.compare" => {
            let task = task_for(manager, &args)?;
            run_compare(&task, &args)
        }
        "task" => {
            let task = task_for(manager, &args)?;
            run_task_tool(&task, &args)
        }
        other => Err(ErrorEnvelope {
            code: error_codes::METHOD_NOT_FOUND,
            message: format!("unknown tool: {other}"),
            data: None,
        }),
    }
}

fn run_init(manager: &TaskManager, args: &Value) -> Result<CallToolResult, ErrorEnvelope> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct InitArgs {
        #[serde(default)]
        task_id: Option<String>,
    }
    let init: InitArgs = if args.is_null() {
        InitArgs { task_id: None }
    } else {
        parse_args(args)?
    };
    let task = manager.init(init.task_id)?;
    let mode = if task.reactivated {
        "reactivated (re-read files before editing; previous tokens were not restored)"
    } else {
        "opened"
    };
    Ok(with_hud(
        &task,
        format!("task {} {mode}\nworkspace: {}", task.id, task.cwd.display()),
    ))
}

fn run_compare(task: &Arc<TaskContext>, args: &Value) -> Result<CallToolResult, ErrorEnvelope> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct CompareArgs {
        path1: String,
        path2: String,
    }
    let compare: CompareArgs = parse_args(args)?;
    let path1 = task.sandbox.sanitize(&compare.path1, true).map_err(ScribeErr::from)?;
    let path2 = task.sandbox.sanitize(&compare.path2, true).map_err(ScribeErr::from)?;
    let before = std::fs::read_to_string(&path1).map_err(ScribeErr::from)?;
    let after = std::fs::read_to_string(&path2).map_err(ScribeErr::from)?;
    let rendered = diff::unified(&compare.path2, &before, &after);
    let text = if rendered.is_empty() {
        "files are identical".to_string()
    } else {
        rendered
    };
    Ok(with_hud(task, text))
}

fn run_task_tool(task: &Arc<TaskContext>, args: &Value) -> Result<CallToolResult, ErrorEnvelope> {
    #[derive(Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct TaskArgs {
        action: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        data: Option<BTreeMap<String, String>>,
        #[serde(default)]
        limit: Option<usize>,
        #[serde(default)]
        from: Option<i64>,
        #[serde(default)]
        to: Option<i64>,
    }
    let params: TaskArgs = parse_args(args)?;
    let text = match params.action.as_str() {
        "checkpoint" => {
            let name = params.name.ok_or_else(|| {
                ErrorEnvelope::invalid_params("checkpoint requires `name`".to_string())
            })?;
            task.create_checkpoint(&name)?;
            format!("checkpoint `{name}` created")
        }
        "rollback" => {
            let name = params.name.ok_or_else(|| {
                ErrorEnvelope::invalid_params("rollback requires `name`".to_string())
            })?;
            let results = task.rollback_to_checkpoint(&name)?;
            let mut out = format!(
                "rolled back {} transaction(s) to checkpoint `{name}`",
                results.len()
            );
            for result in &results {
                out.push('\n');
                out.push_str(&render_undo(result));
            }
            out
        }
        "undo" => {
            let result = task.undo()?;
            render_undo(&result)
        }
        "redo" => {
            let id = task.redo()?;
            format!("redid transaction {id}")
        }
        "journal" => {
            let limit = params.limit.unwrap_or(20);
            let mut entries = task.journal_entries(limit)?;
            if let Some(from) = params.from {
                entries.retain(|e| e.seq >= from);
            }
            if let Some(to) = params.to {
                entries.retain(|e| e.seq <= to);
            }
            if entries.is_empty() {
                "journal is empty".to_string()
            } else {
                entries
                    .iter()
                    .map(|entry| {
                        let files = entry
                            .files
                            .iter()
                            .map(|f| {
                                format!("  {} (+{} -{})", f.path, f.lines_added, f.lines_removed)
                            })
                            .collect::<Vec<_>>()
                            .join("\n");
                        let mut line = format!(
                            "#{} [{}] {} ({})",
                            entry.seq, entry.status, entry.description, entry.kind
                        );
                        if !files.is_empty() {
                            line.push('\n');
                            line.push_str(&files);
                        }
                        line
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
        "metadata" => match params.data {
            Some(data) => {
                for (key, value) in &data {
                    task.metadata_set(key, value)?;
                    if key == "plan" {
                        task.hud.set_plan(Some(value.clone()));
                    }
                }
                format!("stored {} metadata key(s)", data.len())
            }
            None => {
                let all = task.metadata_all();
                if all.is_empty() {
                    "no metadata".to_string()
                } else {
                    all.iter()
                        .map(|(k, v)| format!("{k} = {v}"))
                        .collect::<Vec<_>>()
                        .join("\n")
                }
            }
        },
        other => {
            return Err(ErrorEnvelope::invalid_params(format!(
                "unknown task action: {other}"
            )));
        }
    };
    Ok(with_hud(task, text))
}

fn with_hud(task: &Arc<TaskContext>, text: String) -> CallToolResult {
    CallToolResult::text(format!("{text}\n\n{}", task.hud_line()))
}

fn render_read(report: &read::ReadReport) -> String {
    let mut out = format!(
        "{} ({}, {} lines)",
        report.path.display(),
        report.charset,
        report.line_count
    );
    if let Some(valid) = report.prior_token_valid {
        out.push_str(if valid {
            "\nprior token: still valid"
        } else {
            "\nprior token: stale, use the new one below"
        });
    }
    for range in &report.ranges {
        out.push_str(&format!(
            "\n\nlines {}-{} (token: {})\n",
            range.start, range.end, range.access_token
        ));
        for (offset, line) in range.lines.iter().enumerate() {
            out.push_str(&format!("{:>6} | {line}\n", range.start as usize + offset));
        }
    }
    out
}

fn render_edit(report: &edit::EditReport) -> String {
    let mut out = String::new();
    if report.dry_run {
        out.push_str("dry run: nothing was written\n\n");
    }
    for file in &report.files {
        out.push_str(&format!(
            "{} ({} lines now, delta {:+})\n",
            file.path.display(),
            file.new_line_count,
            file.line_delta
        ));
        if let Some(token) = &file.access_token {
            out.push_str(&format!("token: {token}\n"));
        }
        if file.encoding_upgraded {
            out.push_str("note: original charset could not encode the new content; file upgraded to UTF-8\n");
        }
        if file.diff.is_empty() {
            out.push_str("(no content change)\n");
        } else {
            out.push_str(&file.diff);
        }
        out.push('\n');
    }
    out.trim_end().to_string()
}

fn render_search(report: &SearchReport) -> String {
    match report {
        SearchReport::Listing(entries) => {
            if entries.is_empty() {
                return "empty directory".to_string();
            }
            entries
                .iter()
                .map(|e| {
                    if e.is_dir {
                        format!("{}/", e.name)
                    } else {
                        format!("{} ({} bytes)", e.name, e.size)
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")
        }
        SearchReport::Found(paths) => {
            if paths.is_empty() {
                "no files matched".to_string()
            } else {
                paths.join("\n")
            }
        }
        SearchReport::Grep(files) => {
            if files.is_empty() {
                return "no matches".to_string();
            }
            let mut out = String::new();
            for file in files {
                out.push_str(&format!("{}\n", file.path.display()));
                for range in &file.ranges {
                    out.push_str(&format!(
                        "  lines {}-{} (token: {})\n",
                        range.start, range.end, range.access_token
                    ));
                    for (offset, line) in range.lines.iter().enumerate() {
                        let line_no = range.start + offset as u32;
                        let marker = if range.match_lines.contains(&line_no) {
                            '>'
                        } else {
                            ' '
                        };
                        out.push_str(&format!("  {marker}{line_no:>5} | {line}\n"));
                    }
                }
            }
            out.trim_end().to_string()
        }
        SearchReport::Structure(tree) => {
            if tree.is_empty() {
                "empty tree".to_string()
            } else {
                tree.trim_end().to_string()
            }
        }
    }
}

fn render_undo(result: &UndoResult) -> String {
    let outcome = match result.outcome {
        UndoOutcome::Success => "success",
        UndoOutcome::ResolvedMove => "success (restored at moved location)",
        UndoOutcome::Partial => "partial",
        UndoOutcome::Stuck => "stuck: manual recovery required",
    };
    let mut out = format!("undo: {outcome}");
    for file in &result.files {
        let target = file
            .restored_to
            .as_ref()
            .map(|p| format!(" -> {}", p.display()))
            .unwrap_or_default();
        let note = file
            .note
            .as_ref()
            .map(|n| format!(" ({n})"))
            .unwrap_or_default();
        out.push_str(&format!(
            "\n  {:?} {}{target}{note}",
            file.outcome,
            file.path.display()
        ));
    }
    for hint in &result.hints {
        out.push_str(&format!("\n  hint: {hint}"));
    }
    out
}
