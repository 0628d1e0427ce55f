//! Tool definitions advertised by `tools/list`.
//!
//! Each tool gets a schemars-generated JSON schema from a parameter struct.
//! Docstrings become the property descriptions the agent model reads, so
//! they are written for the model, not for rustdoc.

use schemars::JsonSchema;
use schemars::r#gen::SchemaSettings;
use scribe_protocol::Tool;
use serde::Deserialize;

/// Open a new task or reactivate a persisted one.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct InitToolParam {
    /// Reactivate this task id instead of opening a fresh task.
    #[serde(default)]
    pub task_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RangeParam {
    /// First line of the range (1-based, inclusive).
    pub start: u32,
    /// Last line of the range (inclusive).
    pub end: u32,
}

/// Read a line range of a file and mint the access token for editing it.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ReadToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    /// File path, absolute or relative to the workspace root.
    pub path: String,
    /// Read a single line.
    #[serde(default)]
    pub line: Option<u32>,
    /// First line to read (defaults to reading through the end of file).
    #[serde(default)]
    pub start_line: Option<u32>,
    /// Last line to read.
    #[serde(default)]
    pub end_line: Option<u32>,
    /// Several disjoint ranges in one call; one token is minted per range.
    #[serde(default)]
    pub ranges: Option<Vec<RangeParam>>,
    /// Regex; the read is centered on the first matching line.
    #[serde(default)]
    pub anchor_pattern: Option<String>,
    /// A previously issued token to revalidate alongside the read.
    #[serde(default)]
    pub access_token: Option<String>,
    /// Read even if the file exceeds the configured size cap.
    #[serde(default)]
    pub force: bool,
    /// Force a charset label instead of detecting one.
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub(crate) enum OperationKindParam {
    Replace,
    InsertBefore,
    InsertAfter,
    Delete,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct OperationParam {
    /// Target line (1-based), or an offset from the anchor line when
    /// `anchorPattern` is set (0 = the anchor line itself).
    pub start_line: i64,
    /// Last line of the target range (defaults to `startLine`).
    #[serde(default)]
    pub end_line: Option<i64>,
    /// Replacement or inserted text. Required except for `delete`.
    #[serde(default)]
    pub content: Option<String>,
    /// One of `replace` (default), `insert_before`, `insert_after`, `delete`.
    #[serde(default)]
    pub operation: Option<OperationKindParam>,
    /// Text the target range is expected to hold; compared fuzzily.
    #[serde(default)]
    pub expected_content: Option<String>,
    /// Ignore leading whitespace when comparing `expectedContent`.
    #[serde(default)]
    pub ignore_indentation: bool,
    /// Prefix inserted lines with the indentation of the line above.
    #[serde(default)]
    pub auto_indent: bool,
    /// Regex resolving `startLine`/`endLine` relative to its first match.
    #[serde(default)]
    pub anchor_pattern: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct FileEditParam {
    /// File path, absolute or relative to the workspace root.
    pub path: String,
    /// Access token covering the edited lines (from `file.read` or
    /// `file.search`). Not required for files created in this task.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: Option<OperationKindParam>,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub ignore_indentation: bool,
    #[serde(default)]
    pub auto_indent: bool,
    #[serde(default)]
    pub anchor_pattern: Option<String>,
    /// Batch of operations against this file, applied bottom-up.
    #[serde(default)]
    pub operations: Option<Vec<OperationParam>>,
    /// Force a charset label for reading and writing this file.
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Apply token-gated line edits. Multi-file batches are atomic.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EditToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    /// Single-file form: the file to edit.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub start_line: Option<i64>,
    #[serde(default)]
    pub end_line: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub operation: Option<OperationKindParam>,
    #[serde(default)]
    pub expected_content: Option<String>,
    #[serde(default)]
    pub ignore_indentation: bool,
    #[serde(default)]
    pub auto_indent: bool,
    #[serde(default)]
    pub anchor_pattern: Option<String>,
    #[serde(default)]
    pub operations: Option<Vec<OperationParam>>,
    /// Multi-file form: edits applied under one transaction.
    #[serde(default)]
    pub edits: Option<Vec<FileEditParam>>,
    /// Compute and return the diff without writing anything.
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub encoding: Option<String>,
}

/// Create, copy, delete, move, or rename files and directories.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ManageToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    /// One of `create`, `copy`, `delete`, `move`, `rename`.
    pub action: String,
    pub path: String,
    /// Initial content for `create`; omit to create a directory.
    #[serde(default)]
    pub content: Option<String>,
    /// Destination for `copy` and `move`.
    #[serde(default)]
    pub target_path: Option<String>,
    /// New file name for `rename`.
    #[serde(default)]
    pub new_name: Option<String>,
    /// Allow deleting or copying non-empty directories.
    #[serde(default)]
    pub recursive: bool,
}

/// Search the workspace: list a directory, find files by glob, grep file
/// contents, or render the tree structure.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SearchToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    /// One of `list`, `find`, `grep`, `structure`.
    pub action: String,
    /// Directory to search (defaults to the workspace root).
    #[serde(default)]
    pub path: Option<String>,
    /// Glob for `find`, literal or regex for `grep`.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Treat the grep pattern as a regex instead of a literal.
    #[serde(default)]
    pub is_regex: bool,
    /// Stop after this many matching files.
    #[serde(default)]
    pub max_results: Option<usize>,
    /// Context lines before each grep match.
    #[serde(default)]
    pub before: Option<u32>,
    /// Context lines after each grep match.
    #[serde(default)]
    pub after: Option<u32>,
    /// Depth bound for `structure`.
    #[serde(default)]
    pub depth: Option<usize>,
    /// Honor .gitignore and friends while walking (default true).
    #[serde(default)]
    pub auto_ignore: Option<bool>,
}

/// Unified diff between two files.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompareToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    pub path1: String,
    pub path2: String,
}

/// Transaction history controls: checkpoints, undo/redo, the journal, and
/// task metadata.
#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub(crate) struct TaskToolParam {
    /// Task id returned by `init`.
    pub task_id: String,
    /// One of `checkpoint`, `rollback`, `undo`, `redo`, `journal`,
    /// `metadata`.
    pub action: String,
    /// Checkpoint name for `checkpoint` and `rollback`.
    #[serde(default)]
    pub name: Option<String>,
    /// Key/value pairs to store for `metadata`; omit to read them back.
    #[serde(default)]
    pub data: Option<std::collections::BTreeMap<String, String>>,
    /// Maximum journal entries to return (default 20).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Lowest journal sequence number to include.
    #[serde(default)]
    pub from: Option<i64>,
    /// Highest journal sequence number to include.
    #[serde(default)]
    pub to: Option<i64>,
}

fn tool_for<T: JsonSchema>(name: &str, description: &str) -> Tool {
    let schema = SchemaSettings::draft2019_09()
        .with(|s| {
            s.inline_subschemas = true;
            s.option_add_null_type = false
        })
        .into_generator()
        .into_root_schema_for::<T>();
    let input_schema = serde_json::to_value(&schema)
        .unwrap_or_else(|e| panic!("tool schema for {name} should serialize: {e}"));
    Tool {
        name: name.to_string(),
        description: Some(description.to_string()),
        input_schema,
    }
}

pub(crate) fn all_tools() -> Vec<Tool> {
    vec![
        tool_for::<InitToolParam>("init", "Open or reactivate a task. All other tools require the returned task id."),
        tool_for::<ReadToolParam>(
            "file.read",
            "Read lines from a file and mint the access token that authorizes editing them.",
        ),
        tool_for::<EditToolParam>(
            "file.edit",
            "Apply line edits gated by access tokens. Multi-file batches commit atomically or roll back together.",
        ),
        tool_for::<ManageToolParam>(
            "file.manage",
            "Create, copy, delete, move, or rename files and directories inside a transaction.",
        ),
        tool_for::<SearchToolParam>(
            "file.search",
            "List directories, find files by glob, grep contents (minting tokens per match range), or show the tree.",
        ),
        tool_for::<CompareToolParam>("file.compare", "Unified diff between two files."),
        tool_for::<TaskToolParam>(
            "task",
            "Checkpoint, rollback, undo, redo, inspect the journal, or read/write task metadata.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn tool_names_are_stable() {
        let names: Vec<String> = all_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "init",
                "file.read",
                "file.edit",
                "file.manage",
                "file.search",
                "file.compare",
                "task"
            ]
        );
    }

    /// Executable documentation of the generated schema for the smallest
    /// tool, as a tripwire for unintended schema churn.
    #[test]
    fn verify_compare_tool_json_schema() {
        let tool = all_tools()
            .into_iter()
            .find(|t| t.name == "file.compare")
            .unwrap();
        let tool_json = serde_json::to_value(&tool).unwrap();
        let expected = serde_json::json!({
            "name": "file.compare",
            "description": "Unified diff between two files.",
            "inputSchema": {
                "$schema": "https://json-schema.org/draft/2019-09/schema",
                "title": "CompareToolParam",
                "description": "Unified diff between two files.",
                "type": "object",
                "properties": {
                    "taskId": {
                        "description": "Task id returned by `init`.",
                        "type": "string"
                    },
                    "path1": { "type": "string" },
                    "path2": { "type": "string" }
                },
                "required": ["path1", "path2", "taskId"]
            }
        });
        assert_eq!(expected, tool_json);
    }

    #[test]
    fn every_tool_except_init_requires_a_task_id() {
        for tool in all_tools() {
            if tool.name == "init" {
                continue;
            }
            let required = tool.input_schema["required"]
                .as_array()
                .unwrap_or_else(|| panic!("{} has no required list", tool.name));
            assert!(
                required.iter().any(|v| v == "taskId"),
                "{} does not require taskId",
                tool.name
            );
        }
    }
}
