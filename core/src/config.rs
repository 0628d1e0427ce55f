use std::path::PathBuf;

/// Directory (relative to the first workspace root) that holds all persisted
/// server state: task metadata, snapshots, and journals. The sandbox policy
/// refuses to let the agent touch anything underneath it.
pub const SANDBOX_DIR_NAME: &str = ".scribe";

/// Process-wide configuration. One instance is created at server start and
/// shared (read-only) by every task.
#[derive(Debug, Clone)]
pub struct Config {
    /// Workspace roots. Every path input must resolve under one of these.
    pub roots: Vec<PathBuf>,

    /// Number of committed transactions retained in the journal ring.
    pub journal_ring: usize,

    /// Hard cap on the size of a file the edit engine will load.
    pub max_file_size: u64,

    /// Upper bound on files walked by a CRC deep search during undo.
    pub deep_search_budget: usize,

    /// Worker threads for parallel grep. Zero means "number of cores".
    pub grep_threads: usize,

    /// Maximum matched files returned by a single grep before early exit.
    pub grep_max_results: usize,
}

/// Overrides supplied by the client at `init` time. Every field is optional;
/// `None` keeps the default.
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    pub roots: Option<Vec<PathBuf>>,
    pub journal_ring: Option<usize>,
    pub max_file_size: Option<u64>,
    pub deep_search_budget: Option<usize>,
    pub grep_threads: Option<usize>,
    pub grep_max_results: Option<usize>,
}

impl Config {
    pub fn load_with_overrides(cwd: PathBuf, overrides: ConfigOverrides) -> Self {
        let ConfigOverrides {
            roots,
            journal_ring,
            max_file_size,
            deep_search_budget,
            grep_threads,
            grep_max_results,
        } = overrides;
        Self {
            roots: roots.unwrap_or_else(|| vec![cwd]),
            journal_ring: journal_ring.unwrap_or(50),
            max_file_size: max_file_size.unwrap_or(10 * 1024 * 1024),
            deep_search_budget: deep_search_budget.unwrap_or(2_000),
            grep_threads: grep_threads.unwrap_or(0),
            grep_max_results: grep_max_results.unwrap_or(100),
        }
    }

    /// Root directory for persisted state: `<first root>/.scribe`.
    pub fn sandbox_dir(&self) -> PathBuf {
        self.roots
            .first()
            .map(|r| r.join(SANDBOX_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(SANDBOX_DIR_NAME))
    }

    /// Per-task state directory: `<sandbox>/tasks/<task id>`.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.sandbox_dir().join("tasks").join(task_id)
    }
}
