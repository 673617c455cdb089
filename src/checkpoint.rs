//! Checkpoints and checkpoint stores.
//!
//! A checkpoint is an immutable snapshot of run state taken at a completed
//! task boundary: the plan, goal, active context, unpromoted scope
//! artifacts, completed outputs, and the ledger prefix. Identity is
//! `(run_id, index)`. Saves must be atomic - a reader sees the whole
//! checkpoint or none of it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

use crate::context::{Context, Goal};
use crate::error::{Error, Result};
use crate::executor::TaskOutput;
use crate::ledger::LedgerEntry;
use crate::plan::Plan;
use crate::scope::ScopeSnapshot;

/// Immutable snapshot of run state at a completed-task boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: String,
    /// Number of tasks completed when the checkpoint was taken
    pub index: u64,
    pub created_at: DateTime<Utc>,
    pub plan: Plan,
    pub goal: Goal,
    /// Active context including all promotions so far
    pub context: Context,
    /// Scope artifacts not already promoted into the context
    #[serde(default)]
    pub internal_scope: ScopeSnapshot,
    pub completed_outputs: BTreeMap<String, TaskOutput>,
    pub ledger_prefix: Vec<LedgerEntry>,
}

impl Checkpoint {
    /// Human-facing id, unique within the run.
    pub fn checkpoint_id(&self) -> String {
        format!("chk-{}", self.index)
    }
}

/// Storage seam for checkpoints. Implementations must make `save` atomic.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()>;

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Checkpoint>;

    /// Checkpoint ids for a run, ordered by index.
    async fn list(&self, run_id: &str) -> Result<Vec<String>>;

    /// Highest-index checkpoint id, if any.
    async fn latest(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self.list(run_id).await?.into_iter().next_back())
    }
}

/// In-memory store, the default for tests and non-durable runs.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    runs: Mutex<HashMap<String, BTreeMap<u64, Checkpoint>>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.runs
            .lock()
            .expect("checkpoint store lock poisoned")
            .entry(checkpoint.run_id.clone())
            .or_default()
            .insert(checkpoint.index, checkpoint.clone());
        Ok(())
    }

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let runs = self.runs.lock().expect("checkpoint store lock poisoned");
        runs.get(run_id)
            .and_then(|by_index| {
                by_index
                    .values()
                    .find(|c| c.checkpoint_id() == checkpoint_id)
            })
            .cloned()
            .ok_or_else(|| {
                Error::CheckpointStore(format!("unknown checkpoint {}/{}", run_id, checkpoint_id))
            })
    }

    async fn list(&self, run_id: &str) -> Result<Vec<String>> {
        let runs = self.runs.lock().expect("checkpoint store lock poisoned");
        Ok(runs
            .get(run_id)
            .map(|by_index| by_index.values().map(Checkpoint::checkpoint_id).collect())
            .unwrap_or_default())
    }
}

/// File-backed store: one JSON file per checkpoint under
/// `<root>/<run_id>/chk-<index>.json`, written atomically via
/// write-then-rename.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    root: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        // keep run directories path-safe regardless of caller-chosen ids
        let safe: String = run_id
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(safe)
    }

    fn checkpoint_path(&self, run_id: &str, checkpoint_id: &str) -> PathBuf {
        self.run_dir(run_id).join(format!("{}.json", checkpoint_id))
    }

    fn io_err(context: &str, path: &Path, e: std::io::Error) -> Error {
        Error::CheckpointStore(format!("{} {}: {}", context, path.display(), e))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.run_dir(&checkpoint.run_id);
        std::fs::create_dir_all(&dir).map_err(|e| Self::io_err("create", &dir, e))?;

        let body = serde_json::to_vec_pretty(checkpoint)?;
        let tmp = dir.join(format!(".tmp-{}", Uuid::new_v4()));
        std::fs::write(&tmp, body).map_err(|e| Self::io_err("write", &tmp, e))?;
        let target = self.checkpoint_path(&checkpoint.run_id, &checkpoint.checkpoint_id());
        std::fs::rename(&tmp, &target).map_err(|e| Self::io_err("rename", &target, e))?;
        Ok(())
    }

    async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let path = self.checkpoint_path(run_id, checkpoint_id);
        let body = std::fs::read(&path).map_err(|e| Self::io_err("read", &path, e))?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn list(&self, run_id: &str) -> Result<Vec<String>> {
        let dir = self.run_dir(run_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Self::io_err("list", &dir, e)),
        };
        let mut indexed: Vec<(u64, String)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| Self::io_err("list", &dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(index) = name
                .strip_prefix("chk-")
                .and_then(|rest| rest.strip_suffix(".json"))
                .and_then(|idx| idx.parse::<u64>().ok())
            {
                indexed.push((index, format!("chk-{}", index)));
            }
        }
        indexed.sort_by_key(|(index, _)| *index);
        Ok(indexed.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteCheckpointStore;

#[cfg(feature = "sqlite")]
mod sqlite_store {
    use super::*;
    use rusqlite::{params, Connection, OptionalExtension};
    use std::sync::Arc;

    /// SQLite-backed store for durable deployments.
    pub struct SqliteCheckpointStore {
        conn: Arc<Mutex<Connection>>,
    }

    impl SqliteCheckpointStore {
        /// Open or create a store at the given path.
        pub fn open(path: impl AsRef<Path>) -> Result<Self> {
            let conn =
                Connection::open(path).map_err(|e| Error::CheckpointStore(e.to_string()))?;
            Self::initialize(conn)
        }

        /// Create an in-memory store (for testing).
        pub fn in_memory() -> Result<Self> {
            let conn =
                Connection::open_in_memory().map_err(|e| Error::CheckpointStore(e.to_string()))?;
            Self::initialize(conn)
        }

        fn initialize(conn: Connection) -> Result<Self> {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS checkpoints (
                    run_id TEXT NOT NULL,
                    checkpoint_id TEXT NOT NULL,
                    idx INTEGER NOT NULL,
                    created_at TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    PRIMARY KEY (run_id, checkpoint_id)
                )",
                [],
            )
            .map_err(|e| Error::CheckpointStore(e.to_string()))?;
            Ok(Self {
                conn: Arc::new(Mutex::new(conn)),
            })
        }

        fn with_conn<F, T>(&self, f: F) -> Result<T>
        where
            F: FnOnce(&Connection) -> rusqlite::Result<T>,
        {
            let conn = self
                .conn
                .lock()
                .map_err(|e| Error::Internal(format!("Failed to lock connection: {}", e)))?;
            f(&conn).map_err(|e| Error::CheckpointStore(e.to_string()))
        }
    }

    #[async_trait]
    impl CheckpointStore for SqliteCheckpointStore {
        async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
            let payload = serde_json::to_string(checkpoint)?;
            self.with_conn(|conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO checkpoints
                        (run_id, checkpoint_id, idx, created_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        checkpoint.run_id,
                        checkpoint.checkpoint_id(),
                        checkpoint.index as i64,
                        checkpoint.created_at.to_rfc3339(),
                        payload,
                    ],
                )?;
                Ok(())
            })
        }

        async fn load(&self, run_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
            let payload: Option<String> = self.with_conn(|conn| {
                conn.query_row(
                    "SELECT payload FROM checkpoints WHERE run_id = ?1 AND checkpoint_id = ?2",
                    params![run_id, checkpoint_id],
                    |row| row.get(0),
                )
                .optional()
            })?;
            let payload = payload.ok_or_else(|| {
                Error::CheckpointStore(format!("unknown checkpoint {}/{}", run_id, checkpoint_id))
            })?;
            Ok(serde_json::from_str(&payload)?)
        }

        async fn list(&self, run_id: &str) -> Result<Vec<String>> {
            self.with_conn(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT checkpoint_id FROM checkpoints WHERE run_id = ?1 ORDER BY idx",
                )?;
                let ids = stmt
                    .query_map(params![run_id], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
        }
    }
}
