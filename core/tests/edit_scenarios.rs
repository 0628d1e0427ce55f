//! End-to-end scenarios for the token-gated edit pipeline: read, edit,
//! batch, multi-file atomicity, aliasing across renames.

#![allow(clippy::unwrap_used)]

use std::path::Path;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use scribe_core::Config;
use scribe_core::TaskContext;
use scribe_core::TaskManager;
use scribe_core::config::ConfigOverrides;
use scribe_core::edit;
use scribe_core::edit::EditOpKind;
use scribe_core::edit::EditOperation;
use scribe_core::edit::EditRequest;
use scribe_core::edit::FileEditRequest;
use scribe_core::error::ErrorKind;
use scribe_core::journal::KIND_EXTERNAL;
use scribe_core::manage;
use scribe_core::manage::ManageRequest;
use scribe_core::read;
use scribe_core::read::ReadRequest;
use scribe_core::token::AccessToken;

fn task_in(dir: &Path) -> Arc<TaskContext> {
    let manager = TaskManager::new(Config::load_with_overrides(
        dir.to_path_buf(),
        ConfigOverrides::default(),
    ));
    manager.init(Some("test-task".to_string())).unwrap()
}

fn read_whole(task: &TaskContext, path: &str) -> String {
    let report = read::read_file(
        task,
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
        },
    )
    .unwrap();
    report.ranges[0].access_token.clone()
}

fn single_edit(path: &str, token: &str, start: i64, content: &str) -> EditRequest {
    EditRequest {
        single: Some(FileEditRequest {
            path: path.to_string(),
            access_token: Some(token.to_string()),
            start_line: Some(start),
            end_line: None,
            content: Some(content.to_string()),
            operation: None,
            expected_content: None,
            ignore_indentation: false,
            auto_indent: false,
            anchor_pattern: None,
            operations: None,
            encoding: None,
        }),
        edits: None,
        dry_run: false,
    }
}

fn op(kind: EditOpKind, start: i64, end: Option<i64>, content: Option<&str>) -> EditOperation {
    EditOperation {
        start_line: start,
        end_line: end,
        content: content.map(str::to_string),
        operation: kind,
        expected_content: None,
        ignore_indentation: false,
        auto_indent: false,
        anchor_pattern: None,
    }
}

fn current_lines(path: &Path) -> Vec<String> {
    let text = std::fs::read_to_string(path).unwrap();
    let mut lines: Vec<String> = text.split('\n').map(str::to_string).collect();
    if lines.len() > 1 && lines.last().is_some_and(String::is_empty) {
        lines.pop();
    }
    lines
}

/// Scenario: token CRC guard. An external writer invalidates a token, the
/// edit is refused, the file is untouched, and the journal explains why.
#[test]
fn external_change_blocks_the_edit_and_is_journaled() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "x\ny\nz\n").unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "a.txt");

    // Someone else rewrites line 2 behind the agent's back.
    std::fs::write(dir.path().join("a.txt"), "x\nY\nz\n").unwrap();

    let err = edit::apply_edits(&task, single_edit("a.txt", &token, 2, "Y2")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ExternalChange);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "x\nY\nz\n"
    );

    let entries = task.journal_entries(10).unwrap();
    assert!(entries.iter().any(|e| e.kind == KIND_EXTERNAL));
    // No edit transaction was committed.
    assert!(entries.iter().all(|e| e.kind == KIND_EXTERNAL));
}

/// Scenario: bottom-up batch safety. Later operations keep their addresses
/// because application order is descending.
#[test]
fn batch_applies_bottom_up_and_keeps_the_registry_entry_valid() {
    let dir = tempfile::tempdir().unwrap();
    let content: String = (1..=10).map(|i| format!("L{i}\n")).collect();
    std::fs::write(dir.path().join("b.txt"), &content).unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "b.txt");

    let request = EditRequest {
        single: Some(FileEditRequest {
            path: "b.txt".to_string(),
            access_token: Some(token.clone()),
            start_line: None,
            end_line: None,
            content: None,
            operation: None,
            expected_content: None,
            ignore_indentation: false,
            auto_indent: false,
            anchor_pattern: None,
            operations: Some(vec![
                op(EditOpKind::Delete, 2, Some(3), None),
                op(EditOpKind::InsertAfter, 7, None, Some("X")),
            ]),
            encoding: None,
        }),
        edits: None,
        dry_run: false,
    };
    edit::apply_edits(&task, request).unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.path().join("b.txt")).unwrap(),
        "L1\nL4\nL5\nL6\nL7\nX\nL8\nL9\nL10\n"
    );

    // The original whole-file token still resolves through the updated
    // registry entry.
    let path = dir.path().join("b.txt");
    let decoded = AccessToken::decode(&token, &path, &task.lineage).unwrap();
    let resolved = task
        .registry
        .validate(&path, &decoded, &current_lines(&path))
        .unwrap();
    assert_eq!((resolved.start, resolved.end), (1, 9));
}

/// Scenario: multi-file atomicity. One bad operation rolls back the whole
/// batch, leaves no journal entry, and keeps prior tokens valid.
#[test]
fn multi_file_batch_rolls_back_as_a_unit() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("f1.txt"), "one\ntwo\n").unwrap();
    std::fs::write(dir.path().join("f2.txt"), "alpha\n").unwrap();
    let task = task_in(dir.path());

    let token1 = read_whole(&task, "f1.txt");
    let token2 = read_whole(&task, "f2.txt");

    let request = EditRequest {
        single: None,
        edits: Some(vec![
            FileEditRequest {
                path: "f1.txt".to_string(),
                access_token: Some(token1.clone()),
                start_line: Some(1),
                end_line: None,
                content: Some("ONE".to_string()),
                operation: None,
                expected_content: None,
                ignore_indentation: false,
                auto_indent: false,
                anchor_pattern: None,
                operations: None,
                encoding: None,
            },
            FileEditRequest {
                path: "f2.txt".to_string(),
                access_token: Some(token2),
                start_line: Some(99),
                end_line: None,
                content: Some("nope".to_string()),
                operation: None,
                expected_content: None,
                ignore_indentation: false,
                auto_indent: false,
                anchor_pattern: None,
                operations: None,
                encoding: None,
            },
        ]),
        dry_run: false,
    };
    let err = edit::apply_edits(&task, request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Addressing);

    // Both files are bit-identical to their pre-state.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f1.txt")).unwrap(),
        "one\ntwo\n"
    );
    assert_eq!(
        std::fs::read_to_string(dir.path().join("f2.txt")).unwrap(),
        "alpha\n"
    );
    // No journal entry was appended.
    assert!(task.journal_entries(10).unwrap().is_empty());

    // The f1 token is still usable.
    let path1 = dir.path().join("f1.txt");
    let decoded = AccessToken::decode(&token1, &path1, &task.lineage).unwrap();
    assert!(
        task.registry
            .validate(&path1, &decoded, &current_lines(&path1))
            .is_ok()
    );
}

/// Scenario: path aliasing. A token issued against the original path keeps
/// working across chained renames.
#[test]
fn token_survives_chained_renames() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("src")).unwrap();
    std::fs::write(dir.path().join("src/A.java"), "class A {}\nint x;\n").unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "src/A.java");

    for (path, new_name) in [("src/A.java", "B.java"), ("src/B.java", "C.java")] {
        manage::manage(
            &task,
            ManageRequest {
                action: "rename".to_string(),
                path: path.to_string(),
                content: None,
                target_path: None,
                new_name: Some(new_name.to_string()),
                recursive: false,
            },
        )
        .unwrap();
    }

    let report = edit::apply_edits(&task, single_edit("src/C.java", &token, 2, "int y;")).unwrap();
    assert_eq!(report.files.len(), 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("src/C.java")).unwrap(),
        "class A {}\nint y;\n"
    );
}

/// Dry runs produce the same diff a wet run would, and write nothing.
#[test]
fn dry_run_diff_matches_wet_run_diff() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "x\ny\nz\n").unwrap();
    let task = task_in(dir.path());
    let token = read_whole(&task, "a.txt");

    let mut request = single_edit("a.txt", &token, 2, "Y");
    request.dry_run = true;
    let dry = edit::apply_edits(&task, request).unwrap();
    assert!(dry.dry_run);
    assert!(dry.files[0].access_token.is_none());
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "x\ny\nz\n"
    );

    let wet = edit::apply_edits(&task, single_edit("a.txt", &token, 2, "Y")).unwrap();
    assert_eq!(dry.files[0].diff, wet.files[0].diff);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "x\nY\nz\n"
    );
}

/// Boundary behaviors: whole-file replace, prepend, append, and deleting
/// every line.
#[test]
fn boundary_edits_behave_per_contract() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "1\n2\n3\n").unwrap();
    let task = task_in(dir.path());

    // Whole-file replace via startLine=1, endLine=len.
    let token = read_whole(&task, "a.txt");
    let mut request = single_edit("a.txt", &token, 1, "a\nb\nc");
    if let Some(single) = &mut request.single {
        single.end_line = Some(3);
    }
    edit::apply_edits(&task, request).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "a\nb\nc\n"
    );

    // insert_before at line 1 prepends.
    let token = read_whole(&task, "a.txt");
    let mut request = single_edit("a.txt", &token, 1, "top");
    if let Some(single) = &mut request.single {
        single.operation = Some(EditOpKind::InsertBefore);
    }
    edit::apply_edits(&task, request).unwrap();
    assert!(
        std::fs::read_to_string(dir.path().join("a.txt"))
            .unwrap()
            .starts_with("top\na\n")
    );

    // insert_after at the last line appends.
    let token = read_whole(&task, "a.txt");
    let mut request = single_edit("a.txt", &token, 4, "bottom");
    if let Some(single) = &mut request.single {
        single.operation = Some(EditOpKind::InsertAfter);
    }
    edit::apply_edits(&task, request).unwrap();
    assert!(
        std::fs::read_to_string(dir.path().join("a.txt"))
            .unwrap()
            .ends_with("c\nbottom\n")
    );

    // Deleting every line yields one empty line, not a zero-line file.
    let token = read_whole(&task, "a.txt");
    let mut request = single_edit("a.txt", &token, 1, "");
    if let Some(single) = &mut request.single {
        single.operation = Some(EditOpKind::Delete);
        single.end_line = Some(5);
        single.content = None;
    }
    edit::apply_edits(&task, request).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        ""
    );
    let report = read::read_file(
        &task,
        ReadRequest {
            path: "a.txt".to_string(),
            line: None,
            start_line: None,
            end_line: None,
            ranges: None,
            anchor_pattern: None,
            access_token: None,
            force: false,
            encoding: None,
        },
    )
    .unwrap();
    assert_eq!(report.line_count, 1);
}

/// Files created inside the task are editable without any token.
#[test]
fn created_in_task_files_need_no_token() {
    let dir = tempfile::tempdir().unwrap();
    let task = task_in(dir.path());

    manage::manage(
        &task,
        ManageRequest {
            action: "create".to_string(),
            path: "new.txt".to_string(),
            content: Some("hello\n".to_string()),
            target_path: None,
            new_name: None,
            recursive: false,
        },
    )
    .unwrap();

    let mut request = single_edit("new.txt", "ignored", 1, "hello world");
    if let Some(single) = &mut request.single {
        single.access_token = None;
    }
    edit::apply_edits(&task, request).unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("new.txt")).unwrap(),
        "hello world\n"
    );
}

/// CRLF files keep their line endings through an edit.
#[test]
fn crlf_line_endings_are_preserved() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("w.txt"), "one\r\ntwo\r\n").unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "w.txt");
    edit::apply_edits(&task, single_edit("w.txt", &token, 2, "TWO")).unwrap();
    assert_eq!(
        std::fs::read(dir.path().join("w.txt")).unwrap(),
        b"one\r\nTWO\r\n"
    );
}

/// An edit with a stale token but no external change reports a plain
/// authorization failure naming the lines to re-read.
#[test]
fn stale_token_without_external_change_is_authorization() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "x\ny\n").unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "a.txt");
    // The agent edits through the proper channel...
    edit::apply_edits(&task, single_edit("a.txt", &token, 1, "X")).unwrap();
    // ...then tries to reuse a token whose range no longer matches and whose
    // lineage the registry cannot explain.
    let forged = AccessToken {
        path_hash: AccessToken::parse(&token).unwrap().path_hash,
        start: 1,
        end: 2,
        range_crc: 0xDEAD_BEEF,
        line_count: 2,
    };
    let err =
        edit::apply_edits(&task, single_edit("a.txt", &forged.encode(), 2, "Y")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authorization);
}

#[test]
fn expected_content_mismatch_dumps_actual_lines() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.txt"), "alpha\nbeta\n").unwrap();
    let task = task_in(dir.path());

    let token = read_whole(&task, "a.txt");
    let mut request = single_edit("a.txt", &token, 2, "BETA");
    if let Some(single) = &mut request.single {
        single.expected_content = Some("gamma".to_string());
    }
    let err = edit::apply_edits(&task, request).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ContentExpectation);
    let message = err.to_string();
    assert!(message.contains("gamma"));
    assert!(message.contains("beta"));
    // Nothing was written.
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "alpha\nbeta\n"
    );
}
