//! Task lifecycle: each agent session runs inside a task with its own token
//! registry, change tracker, lineage, and transaction stack.
//!
//! Task metadata is persisted as JSONL (one record per line, written with a
//! single append) so a restarted server can reactivate a task. Reactivation
//! restores the journal — and with it the undo stack — but deliberately does
//! **not** restore live tokens: the agent must re-read before editing.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Result;
use crate::error::ScribeErr;
use crate::external::ChangeTracker;
use crate::hud::Hud;
use crate::journal::JournalEntry;
use crate::lineage::LineageTracker;
use crate::registry::AccessRegistry;
use crate::sandbox::PathSandbox;
use crate::transaction::TxManager;
use crate::undo::UndoResult;
use crate::util::unix_ts;

#[derive(Debug, Serialize, Deserialize)]
struct MetaRecord {
    ts: i64,
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
}

pub struct TaskContext {
    pub id: String,
    pub cwd: PathBuf,
    pub config: Config,
    pub sandbox: PathSandbox,
    pub registry: AccessRegistry,
    pub tracker: ChangeTracker,
    pub lineage: LineageTracker,
    pub hud: Hud,
    /// True when this task existed before the current server process.
    pub reactivated: bool,
    tx: Mutex<TxManager>,
    metadata: Mutex<BTreeMap<String, String>>,
    meta_path: PathBuf,
}

impl std::fmt::Debug for TaskContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskContext").field("id", &self.id).finish()
    }
}

impl TaskContext {
    fn open(config: Config, sandbox: PathSandbox, id: String) -> Result<Self> {
        let task_dir = config.task_dir(&id);
        let reactivated = task_dir.exists();
        std::fs::create_dir_all(task_dir.join("todos"))?;
        let meta_path = task_dir.join("meta");

        let cwd = config
            .roots
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("."));
        let tx = TxManager::open(
            cwd.clone(),
            &task_dir,
            config.journal_ring,
            config.deep_search_budget,
        )?;

        let metadata = load_metadata(&meta_path)?;
        let task = Self {
            id,
            cwd,
            config,
            sandbox,
            registry: AccessRegistry::new(),
            tracker: ChangeTracker::new(),
            lineage: LineageTracker::new(),
            hud: Hud::new(),
            reactivated,
            tx: Mutex::new(tx),
            metadata: Mutex::new(metadata),
            meta_path,
        };
        let activated_at = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        task.append_meta(MetaRecord {
            ts: unix_ts(),
            kind: "activated".to_string(),
            key: None,
            value: Some(activated_at),
        })?;
        Ok(task)
    }

    /// Run a closure against the task's transaction manager. All
    /// begin/commit/rollback/undo traffic for a task is serialized here.
    pub fn with_tx<T>(&self, f: impl FnOnce(&mut TxManager) -> Result<T>) -> Result<T> {
        let mut guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }

    pub fn undo(&self) -> Result<UndoResult> {
        let result = self.with_tx(|tx| tx.undo(&self.lineage))?;
        self.hud.record_undo();
        Ok(result)
    }

    pub fn redo(&self) -> Result<String> {
        self.with_tx(|tx| tx.redo())
    }

    pub fn create_checkpoint(&self, name: &str) -> Result<()> {
        self.with_tx(|tx| {
            tx.create_checkpoint(name);
            Ok(())
        })
    }

    pub fn rollback_to_checkpoint(&self, name: &str) -> Result<Vec<UndoResult>> {
        self.with_tx(|tx| tx.rollback_to_checkpoint(name, &self.lineage))
    }

    pub fn journal_entries(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        self.with_tx(|tx| tx.journal().entries(limit))
    }

    pub fn metadata_get(&self, key: &str) -> Option<String> {
        self.lock_metadata().get(key).cloned()
    }

    pub fn metadata_all(&self) -> BTreeMap<String, String> {
        self.lock_metadata().clone()
    }

    pub fn metadata_set(&self, key: &str, value: &str) -> Result<()> {
        self.lock_metadata()
            .insert(key.to_string(), value.to_string());
        self.append_meta(MetaRecord {
            ts: unix_ts(),
            kind: "metadata".to_string(),
            key: Some(key.to_string()),
            value: Some(value.to_string()),
        })
    }

    /// HUD footer appended to every tool response.
    pub fn hud_line(&self) -> String {
        self.hud.render(self.registry.unlocked_file_count())
    }

    fn lock_metadata(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        match self.metadata.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// One record, one line, one write call.
    fn append_meta(&self, record: MetaRecord) -> Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.meta_path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

fn load_metadata(meta_path: &std::path::Path) -> Result<BTreeMap<String, String>> {
    let mut metadata = BTreeMap::new();
    let content = match std::fs::read_to_string(meta_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(metadata),
        Err(e) => return Err(e.into()),
    };
    for line in content.lines() {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<MetaRecord>(line) {
            Ok(record) if record.kind == "metadata" => {
                if let (Some(key), Some(value)) = (record.key, record.value) {
                    metadata.insert(key, value);
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("skipping corrupt task meta line: {e}"),
        }
    }
    Ok(metadata)
}

/// Process-wide task table. One task is "current" per request; tools look it
/// up by the id carried in the request envelope.
pub struct TaskManager {
    config: Config,
    sandbox: PathSandbox,
    tasks: Mutex<HashMap<String, Arc<TaskContext>>>,
}

impl TaskManager {
    pub fn new(config: Config) -> Self {
        let sandbox = PathSandbox::new(config.roots.clone());
        Self {
            config,
            sandbox,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Open a new task, or reactivate the one named by `task_id`.
    pub fn init(&self, task_id: Option<String>) -> Result<Arc<TaskContext>> {
        let id = task_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.get(&id) {
            return Ok(Arc::clone(existing));
        }
        let task = Arc::new(TaskContext::open(
            self.config.clone(),
            self.sandbox.clone(),
            id.clone(),
        )?);
        tracing::info!(task = %id, reactivated = task.reactivated, "task opened");
        tasks.insert(id, Arc::clone(&task));
        Ok(task)
    }

    pub fn get(&self, id: &str) -> Result<Arc<TaskContext>> {
        self.lock_tasks()
            .get(id)
            .cloned()
            .ok_or_else(|| ScribeErr::TaskNotFound(id.to_string()))
    }

    /// Drop a task and reap its snapshot directory. The journal and metadata
    /// stay on disk so the task can be reactivated later.
    pub fn close(&self, id: &str) -> Result<()> {
        let Some(task) = self.lock_tasks().remove(id) else {
            return Err(ScribeErr::TaskNotFound(id.to_string()));
        };
        task.with_tx(|tx| {
            if let Err(e) = tx.snapshot_store().reap() {
                tracing::warn!(task = %id, "failed to reap snapshots: {e}");
            }
            Ok(())
        })?;
        tracing::info!(task = %id, "task closed");
        Ok(())
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<TaskContext>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
