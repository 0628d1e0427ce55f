use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ScribeErr>;

/// Coarse classification of an error, used by the server layer to pick a
/// JSON-RPC error code and by tests to assert on failure families without
/// matching concrete variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad line numbers, unresolvable anchors, conflicting or missing fields.
    Addressing,
    /// Missing/malformed/stale access tokens.
    Authorization,
    /// `expectedContent` did not match under fuzzy normalization.
    ContentExpectation,
    /// A token failed because someone else modified the file.
    ExternalChange,
    /// Path escape or protected path.
    Sandbox,
    /// File too large, binary content, I/O failure.
    Resource,
    /// Rollback failure; filesystem may be partially restored.
    Transactional,
}

#[derive(Error, Debug)]
pub enum SandboxErr {
    #[error("path escapes the workspace roots: {0}")]
    Escape(String),

    #[error("path does not exist: {0}")]
    NotFound(String),

    #[error("path is protected and cannot be modified: {0}")]
    Protected(String),
}

#[derive(Error, Debug)]
pub enum TokenError {
    #[error("missing access token; read the target lines first to obtain one")]
    Missing,

    #[error("malformed access token: {0}")]
    Malformed(String),

    #[error("access token was issued for a different file")]
    WrongFile,

    #[error(
        "access token is stale: range crc {expected:08x} != current {found:08x}; re-read lines {start}-{end}"
    )]
    RangeCrcMismatch {
        expected: u32,
        found: u32,
        start: u32,
        end: u32,
    },

    #[error("file line count changed: token recorded {recorded} lines, file now has {current}")]
    LineCountMismatch { recorded: u32, current: u32 },

    #[error(
        "access token covers lines {token_start}-{token_end} but the edit targets {start}-{end}; read the missing lines first"
    )]
    OutOfCoverage {
        token_start: u32,
        token_end: u32,
        start: u32,
        end: u32,
    },

    #[error(
        "file was modified outside this task (crc {previous_crc:08x} -> {current_crc:08x}); re-read before editing"
    )]
    ExternalChange { previous_crc: u32, current_crc: u32 },
}

#[derive(Error, Debug)]
pub enum EditError {
    #[error("line {line} is out of bounds for a file with {len} lines")]
    LineOutOfBounds { line: i64, len: usize },

    #[error("anchor pattern matched no line: {0}")]
    AnchorNotFound(String),

    #[error("invalid anchor pattern: {0}")]
    BadAnchorPattern(String),

    #[error("top-level `content` conflicts with `operations`; put content on each operation")]
    ConflictingContent,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown encoding label: {0}")]
    UnknownEncoding(String),

    #[error("expected content does not match lines {start}-{end}:\n--- expected ---\n{expected}\n--- actual ---\n{actual}")]
    ExpectedContentMismatch {
        start: u32,
        end: u32,
        expected: String,
        actual: String,
    },
}

#[derive(Error, Debug)]
pub enum TxError {
    #[error("no transaction is open on this task")]
    NotOpen,

    #[error("no checkpoint named `{0}`")]
    CheckpointNotFound(String),

    #[error("nothing to undo")]
    NothingToUndo,

    #[error("nothing to redo")]
    NothingToRedo,

    #[error("transaction {id} is stuck; filesystem may be partially restored. {hint}")]
    Stuck { id: String, hint: String },
}

#[derive(Error, Debug)]
pub enum ScribeErr {
    #[error("sandbox violation: {0}")]
    Sandbox(#[from] SandboxErr),

    #[error("unauthorized edit: {0}")]
    Token(#[from] TokenError),

    #[error("{0}")]
    Edit(#[from] EditError),

    #[error("transaction error: {0}")]
    Tx(#[from] TxError),

    #[error("no task with id: {0}")]
    TaskNotFound(String),

    #[error("file too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        limit: u64,
    },

    #[error("file appears to be binary: {0}")]
    BinaryFile(PathBuf),

    #[error("unknown search action: {0}")]
    UnknownAction(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("journal error: {0}")]
    Journal(#[from] rusqlite::Error),
}

impl ScribeErr {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ScribeErr::Sandbox(_) => ErrorKind::Sandbox,
            ScribeErr::Token(TokenError::ExternalChange { .. }) => ErrorKind::ExternalChange,
            ScribeErr::Token(_) => ErrorKind::Authorization,
            ScribeErr::Edit(EditError::ExpectedContentMismatch { .. }) => {
                ErrorKind::ContentExpectation
            }
            ScribeErr::Edit(_) => ErrorKind::Addressing,
            ScribeErr::Tx(TxError::Stuck { .. }) => ErrorKind::Transactional,
            ScribeErr::Tx(_) => ErrorKind::Addressing,
            ScribeErr::TaskNotFound(_) | ScribeErr::UnknownAction(_) => ErrorKind::Addressing,
            ScribeErr::FileTooLarge { .. }
            | ScribeErr::BinaryFile(_)
            | ScribeErr::Io(_)
            | ScribeErr::Json(_)
            | ScribeErr::Journal(_) => ErrorKind::Resource,
        }
    }
}
