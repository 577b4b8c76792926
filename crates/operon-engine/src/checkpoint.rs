//! Persistent execution snapshots backed by SQLite.
//!
//! A snapshot captures everything needed to resume a suspended run: the
//! node index to re-enter, the serialized run state, and the token spend
//! so far. One snapshot per execution; saving again replaces it.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use operon_core::error::{OperonError, Result};
use operon_core::state::ExecutionState;
use operon_core::types::{CompositionId, ExecutionId};

/// A single execution snapshot.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub execution_id: ExecutionId,
    pub composition_id: CompositionId,
    /// Index of the node to enter on resume.
    pub node_index: usize,
    /// Serialized run state (JSON).
    pub state_json: String,
    /// Tokens consumed before suspension.
    pub tokens_used: u64,
    pub created_at: DateTime<Utc>,
}

impl ExecutionSnapshot {
    pub fn new(
        execution_id: ExecutionId,
        composition_id: CompositionId,
        node_index: usize,
        state: &ExecutionState,
        tokens_used: u64,
    ) -> Result<Self> {
        let state_json = serde_json::to_string(state)?;
        Ok(Self {
            execution_id,
            composition_id,
            node_index,
            state_json,
            tokens_used,
            created_at: Utc::now(),
        })
    }

    /// Deserialize the stored run state.
    pub fn state(&self) -> Result<ExecutionState> {
        Ok(serde_json::from_str(&self.state_json)?)
    }
}

/// Persistent snapshot store backed by SQLite.
pub struct CheckpointStore {
    conn: Mutex<Connection>,
}

impl CheckpointStore {
    /// Open or create the snapshot database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| OperonError::Checkpoint(format!("Failed to open store: {}", e)))?;
        Self::init(conn)
    }

    /// In-memory store, for tests and ephemeral engines.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| OperonError::Checkpoint(format!("Failed to open store: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS snapshots (
                 execution_id TEXT PRIMARY KEY,
                 composition_id TEXT NOT NULL,
                 node_index INTEGER NOT NULL,
                 state_json TEXT NOT NULL,
                 tokens_used INTEGER NOT NULL DEFAULT 0,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_snap_composition
                 ON snapshots(composition_id, created_at DESC);",
        )
        .map_err(|e| OperonError::Checkpoint(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| OperonError::Checkpoint(e.to_string()))
    }

    /// Save a snapshot, replacing any previous one for the execution.
    pub fn save(&self, snapshot: &ExecutionSnapshot) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO snapshots (execution_id, composition_id, node_index, state_json, tokens_used, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(execution_id) DO UPDATE SET
                 node_index = excluded.node_index,
                 state_json = excluded.state_json,
                 tokens_used = excluded.tokens_used,
                 created_at = excluded.created_at",
            params![
                snapshot.execution_id.0,
                snapshot.composition_id.0,
                snapshot.node_index as i64,
                snapshot.state_json,
                snapshot.tokens_used as i64,
                snapshot.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| OperonError::Checkpoint(format!("Failed to save snapshot: {}", e)))?;
        Ok(())
    }

    /// Load the snapshot for a specific execution.
    pub fn load(&self, execution_id: &ExecutionId) -> Result<Option<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, composition_id, node_index, state_json, tokens_used, created_at
                 FROM snapshots
                 WHERE execution_id = ?1",
            )
            .map_err(|e| OperonError::Checkpoint(format!("Failed to prepare query: {}", e)))?;

        Ok(stmt
            .query_row(params![execution_id.0], Self::row_to_snapshot)
            .ok())
    }

    /// Load the most recent snapshot for a composition, any execution.
    pub fn load_latest(&self, composition_id: &CompositionId) -> Result<Option<ExecutionSnapshot>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, composition_id, node_index, state_json, tokens_used, created_at
                 FROM snapshots
                 WHERE composition_id = ?1
                 ORDER BY created_at DESC
                 LIMIT 1",
            )
            .map_err(|e| OperonError::Checkpoint(format!("Failed to prepare query: {}", e)))?;

        Ok(stmt
            .query_row(params![composition_id.0], Self::row_to_snapshot)
            .ok())
    }

    /// Delete a finished execution's snapshot.
    pub fn delete(&self, execution_id: &ExecutionId) -> Result<usize> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM snapshots WHERE execution_id = ?1",
            params![execution_id.0],
        )
        .map_err(|e| OperonError::Checkpoint(format!("Failed to delete snapshot: {}", e)))
    }

    fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionSnapshot> {
        let created_at: String = row.get(5)?;
        Ok(ExecutionSnapshot {
            execution_id: ExecutionId::from_raw(row.get::<_, String>(0)?),
            composition_id: CompositionId::new(row.get::<_, String>(1)?),
            node_index: row.get::<_, i64>(2)? as usize,
            state_json: row.get(3)?,
            tokens_used: row.get::<_, i64>(4)? as u64,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}
