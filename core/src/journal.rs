//! Durable journal of committed transactions.
//!
//! One SQLite database per task (`tasks/<id>/journal.db`) holding one row per
//! committed transaction, one row per touched file, and one row per file diff
//! stat. Entries form a bounded ring; eviction reports the dropped
//! transaction ids so their snapshots can be deleted — but never before the
//! journal write that supersedes them has committed.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::params;

use crate::error::Result;
use crate::transaction::CommittedTx;
use crate::transaction::PreImage;
use crate::util::unix_ts;

const SCHEMA_VERSION: i64 = 1;

/// Row kinds. External changes are journaled for the agent's benefit but are
/// not undoable.
pub const KIND_EDIT: &str = "edit";
pub const KIND_EXTERNAL: &str = "external";

pub const STATUS_COMMITTED: &str = "committed";
pub const STATUS_UNDONE: &str = "undone";
pub const STATUS_STUCK: &str = "stuck";

#[derive(Debug, Clone)]
pub struct JournalFile {
    pub path: String,
    pub existed_before: bool,
    pub lines_added: i64,
    pub lines_removed: i64,
    pub diff: String,
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub seq: i64,
    pub tx_id: String,
    pub kind: String,
    pub description: String,
    pub status: String,
    pub created_at: i64,
    pub files: Vec<JournalFile>,
}

pub struct Journal {
    conn: Connection,
    ring: usize,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").field("ring", &self.ring).finish()
    }
}

impl Journal {
    /// Open (or create) the journal at `path`, migrating the schema when an
    /// older version is found.
    pub fn open(path: &Path, ring: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, ring)
    }

    /// In-memory journal for tests and dry runs.
    pub fn open_in_memory(ring: usize) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, ring)
    }

    fn with_connection(conn: Connection, ring: usize) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS transactions (
                 seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                 tx_id       TEXT NOT NULL UNIQUE,
                 kind        TEXT NOT NULL,
                 description TEXT NOT NULL,
                 status      TEXT NOT NULL,
                 created_at  INTEGER NOT NULL
             );
             CREATE TABLE IF NOT EXISTS tx_files (
                 tx_id         TEXT NOT NULL,
                 path          TEXT NOT NULL,
                 existed_before INTEGER NOT NULL,
                 PRIMARY KEY (tx_id, path)
             );
             CREATE TABLE IF NOT EXISTS tx_stats (
                 tx_id         TEXT NOT NULL,
                 path          TEXT NOT NULL,
                 lines_added   INTEGER NOT NULL,
                 lines_removed INTEGER NOT NULL,
                 diff          TEXT NOT NULL,
                 PRIMARY KEY (tx_id, path)
             );",
        )?;

        let version: Option<i64> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get::<_, String>(0),
            )
            .map(|v| v.parse().ok())
            .unwrap_or(None);
        match version {
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('schema_version', ?1)",
                    params![SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION => {}
            Some(v) => {
                // Future migrations hook in here; an unknown newer version is
                // left untouched and reported.
                tracing::warn!("journal schema version {v} is newer than supported {SCHEMA_VERSION}");
            }
        }

        Ok(Self { conn, ring })
    }

    /// Append a committed transaction inside one SQL transaction, then evict
    /// past the ring bound. Returns the evicted transaction ids so the
    /// caller can forget their snapshots.
    pub fn append_committed(&mut self, tx: &CommittedTx) -> Result<Vec<String>> {
        let sql_tx = self.conn.transaction()?;
        sql_tx.execute(
            "INSERT INTO transactions (tx_id, kind, description, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![tx.id, KIND_EDIT, tx.description, STATUS_COMMITTED, tx.timestamp],
        )?;
        for (path, pre) in &tx.snapshots {
            sql_tx.execute(
                "INSERT OR REPLACE INTO tx_files (tx_id, path, existed_before) VALUES (?1, ?2, ?3)",
                params![
                    tx.id,
                    path.to_string_lossy(),
                    matches!(pre, PreImage::Saved) as i64
                ],
            )?;
        }
        for stat in &tx.stats {
            sql_tx.execute(
                "INSERT OR REPLACE INTO tx_stats (tx_id, path, lines_added, lines_removed, diff)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    tx.id,
                    stat.path.to_string_lossy(),
                    stat.lines_added,
                    stat.lines_removed,
                    stat.diff
                ],
            )?;
        }
        sql_tx.commit()?;

        self.evict_past_ring()
    }

    /// Record an observed external change as its own journal row so undo
    /// history can explain what happened between agent steps.
    pub fn record_external_change(
        &self,
        path: &Path,
        previous_crc: u32,
        current_crc: u32,
    ) -> Result<()> {
        let description = format!(
            "{} was modified outside this task (crc {previous_crc:08x} -> {current_crc:08x})",
            path.display()
        );
        self.conn.execute(
            "INSERT INTO transactions (tx_id, kind, description, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                uuid::Uuid::new_v4().to_string(),
                KIND_EXTERNAL,
                description,
                STATUS_COMMITTED,
                unix_ts()
            ],
        )?;
        Ok(())
    }

    pub fn set_status(&self, tx_id: &str, status: &str) -> Result<()> {
        self.conn.execute(
            "UPDATE transactions SET status = ?1 WHERE tx_id = ?2",
            params![status, tx_id],
        )?;
        Ok(())
    }

    /// Newest-first listing for the `task journal` tool.
    pub fn entries(&self, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT seq, tx_id, kind, description, status, created_at
             FROM transactions ORDER BY seq DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(JournalEntry {
                seq: row.get(0)?,
                tx_id: row.get(1)?,
                kind: row.get(2)?,
                description: row.get(3)?,
                status: row.get(4)?,
                created_at: row.get(5)?,
                files: Vec::new(),
            })
        })?;
        let mut entries: Vec<JournalEntry> = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        for entry in &mut entries {
            entry.files = self.files_for(&entry.tx_id)?;
        }
        Ok(entries)
    }

    /// Committed, still-undoable edit transactions, oldest first. Used to
    /// rebuild the in-memory undo stack when a task is reactivated.
    pub fn committed_edit_ids(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT tx_id, description FROM transactions
             WHERE kind = ?1 AND status = ?2 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![KIND_EDIT, STATUS_COMMITTED], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn files_for(&self, tx_id: &str) -> Result<Vec<JournalFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT f.path, f.existed_before,
                    COALESCE(s.lines_added, 0), COALESCE(s.lines_removed, 0),
                    COALESCE(s.diff, '')
             FROM tx_files f
             LEFT JOIN tx_stats s ON s.tx_id = f.tx_id AND s.path = f.path
             WHERE f.tx_id = ?1 ORDER BY f.path",
        )?;
        let rows = stmt.query_map(params![tx_id], |row| {
            Ok(JournalFile {
                path: row.get(0)?,
                existed_before: row.get::<_, i64>(1)? != 0,
                lines_added: row.get(2)?,
                lines_removed: row.get(3)?,
                diff: row.get(4)?,
            })
        })?;
        let mut files = Vec::new();
        for row in rows {
            files.push(row?);
        }
        Ok(files)
    }

    fn evict_past_ring(&mut self) -> Result<Vec<String>> {
        let mut evicted: Vec<String> = Vec::new();
        {
            let mut stmt = self.conn.prepare(
                "SELECT tx_id FROM transactions WHERE kind = ?1
                 ORDER BY seq DESC LIMIT -1 OFFSET ?2",
            )?;
            let rows = stmt.query_map(params![KIND_EDIT, self.ring as i64], |row| {
                row.get::<_, String>(0)
            })?;
            for row in rows {
                evicted.push(row?);
            }
        }
        if evicted.is_empty() {
            return Ok(evicted);
        }
        let sql_tx = self.conn.transaction()?;
        for tx_id in &evicted {
            sql_tx.execute("DELETE FROM transactions WHERE tx_id = ?1", params![tx_id])?;
            sql_tx.execute("DELETE FROM tx_files WHERE tx_id = ?1", params![tx_id])?;
            sql_tx.execute("DELETE FROM tx_stats WHERE tx_id = ?1", params![tx_id])?;
        }
        sql_tx.commit()?;
        Ok(evicted)
    }
}
