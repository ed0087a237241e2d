use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::state::ExecutionState;
use trellis_core::types::RunId;

use crate::store::SqliteStore;

impl SqliteStore {
    /// Persist the run's state. One checkpoint per execution, overwritten
    /// on each suspend.
    pub fn save_checkpoint(&self, state: &ExecutionState) -> Result<()> {
        let json = state.to_checkpoint()?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO checkpoints (execution_id, state, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(execution_id) DO UPDATE SET
                 state = excluded.state,
                 updated_at = excluded.updated_at",
            params![state.run_id.0, json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(execution_id = %state.run_id, node = %state.current_node, "checkpoint saved");
        Ok(())
    }

    pub fn load_checkpoint(&self, execution_id: &RunId) -> Result<Option<ExecutionState>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state FROM checkpoints WHERE execution_id = ?1",
                params![execution_id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        json.map(|j| ExecutionState::from_checkpoint(&j)).transpose()
    }

    /// Drop the checkpoint once the run reaches a terminal status.
    pub fn delete_checkpoint(&self, execution_id: &RunId) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "DELETE FROM checkpoints WHERE execution_id = ?1",
            params![execution_id.0],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }
}
