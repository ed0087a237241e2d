use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::WorkflowRecord;

use crate::store::{parse_ts, SqliteStore};

impl SqliteStore {
    /// Insert or replace a workflow definition. Bumps `updated_at`.
    pub fn save_workflow(&self, record: &WorkflowRecord) -> Result<()> {
        let graph = serde_json::to_string(&record.graph)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO workflows (id, user_id, name, graph, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                 name = excluded.name,
                 graph = excluded.graph,
                 updated_at = excluded.updated_at",
            params![
                record.id,
                record.user_id,
                record.name,
                graph,
                record.created_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(workflow_id = %record.id, "workflow saved");
        Ok(())
    }

    pub fn load_workflow(&self, id: &str) -> Result<Option<WorkflowRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                "SELECT id, user_id, name, graph, created_at, updated_at
                 FROM workflows WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let Some((id, user_id, name, graph, created_at, updated_at)) = row else {
            return Ok(None);
        };

        Ok(Some(WorkflowRecord {
            id,
            user_id,
            name,
            graph: serde_json::from_str(&graph)?,
            created_at: parse_ts(&created_at)?,
            updated_at: parse_ts(&updated_at)?,
        }))
    }

    /// List a user's workflows, most recently updated first.
    pub fn list_workflows(&self, user_id: &str) -> Result<Vec<WorkflowRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, user_id, name, graph, created_at, updated_at
                 FROM workflows WHERE user_id = ?1
                 ORDER BY updated_at DESC",
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut workflows = Vec::new();
        for row in rows {
            let (id, user_id, name, graph, created_at, updated_at) =
                row.map_err(|e| TrellisError::Database(e.to_string()))?;
            workflows.push(WorkflowRecord {
                id,
                user_id,
                name,
                graph: serde_json::from_str(&graph)?,
                created_at: parse_ts(&created_at)?,
                updated_at: parse_ts(&updated_at)?,
            });
        }
        Ok(workflows)
    }

    /// Delete a workflow owned by `user_id`. Returns false if no such row.
    pub fn delete_workflow(&self, id: &str, user_id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "DELETE FROM workflows WHERE id = ?1 AND user_id = ?2",
                params![id, user_id],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(n > 0)
    }
}
