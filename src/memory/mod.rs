//! Memory Store: the persistent per-repo database of file knowledge, error -> fix
//! solutions, task-run history, verification episodes, error -> file relations, and
//! procedural rules.
//!
//! No prior art exists upstream for the relational shape of this store (the
//! surrounding codebase's `context.rs` is a markdown knowledge base, not a database).
//! `rusqlite` (bundled) is used over an async ORM because every operation here is a
//! hand-written upsert with exact atomic-read-then-write semantics (the Laplace
//! recompute, the EMA clamp) that fit raw SQL better than an entity-mapped ORM, and
//! because the single-writer-task concurrency model doesn't need an async driver
//! inside the store itself.

pub mod confidence;
mod reads;
mod schema;
mod writes;

pub use reads::MemoryStats;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// `task_runs.outcome`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Running,
    Passed,
    Failed,
    Blocked,
    Crashed,
    Timeout,
}

impl Outcome {
    fn as_str(&self) -> &'static str {
        match self {
            Outcome::Running => "running",
            Outcome::Passed => "passed",
            Outcome::Failed => "failed",
            Outcome::Blocked => "blocked",
            Outcome::Crashed => "crashed",
            Outcome::Timeout => "timeout",
        }
    }

}

/// One entry in `task_runs.errors[]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRunError {
    pub check: String,
    pub error_key: Option<String>,
    pub output: String,
}

const COCHANGE_MIN_RUNS: i64 = 2;
const COCHANGE_CAP: usize = 10;
const RULE_PRUNE_CONFIDENCE: f64 = 0.05;
const RULE_PRUNE_MIN_MISSES: i64 = 3;
const SOLUTION_PRUNE_CONFIDENCE: f64 = 0.1;
const TASK_RUNS_RETENTION: i64 = 500;

/// Persistent per-repo memory database. Single-writer/multi-reader: every
/// write goes through the `Mutex<Connection>` held here, which also models the
/// "closed" state — writes and reads become no-ops once `close()` has run.
pub struct MemoryStore {
    conn: Mutex<Option<Connection>>,
    /// Process-local "last injected rule ids" register,
    /// consumable via `get_last_injected_rule_ids()` and overwritten on every
    /// `build_task_memory` call. Not cleared on read — repeat reads must return
    /// the same set until the next build.
    last_injected: Mutex<Vec<i64>>,
}

impl MemoryStore {
    /// Open (creating if absent) the memory DB at `path`, e.g.
    /// `~/.homer/context/{slug}/memory.db`.
    pub fn open(path: &Path) -> Result<Self, MemoryError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(Some(conn)), last_injected: Mutex::new(Vec::new()) })
    }

    pub fn open_in_memory() -> Result<Self, MemoryError> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self { conn: Mutex::new(Some(conn)), last_injected: Mutex::new(Vec::new()) })
    }

    /// Close the connection. All subsequent writes are no-ops; all subsequent reads
    /// return empty strings/sections instead of erroring.
    pub fn close(&self) {
        *self.conn.lock().unwrap() = None;
    }

    pub fn is_open(&self) -> bool {
        self.conn.lock().unwrap().is_some()
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T, MemoryError>) -> Result<Option<T>, MemoryError> {
        let guard = self.conn.lock().unwrap();
        match guard.as_ref() {
            Some(conn) => f(conn).map(Some),
            None => Ok(None),
        }
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn to_json(v: &[String]) -> String {
    serde_json::to_string(v).unwrap_or_else(|_| "[]".to_string())
}

fn from_json(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.db");
        let store = MemoryStore::open(&path).unwrap();
        assert!(path.exists());
        assert!(store.is_open());
    }

    #[test]
    fn close_makes_writes_noop() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.close();
        assert!(!store.is_open());
        // record_verification on a closed store must not error.
        let result = store.record_verification(
            "agent-1",
            "story:US-001",
            &crate::verify::VerificationResult { passed: true, skipped: true, results: vec![] },
            &[],
            "claude",
            1,
        );
        assert!(result.is_ok());
    }
}
