use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{ExecutionLogEntry, ExecutionRecord, ExecutionStatus, RunId};

use crate::store::{parse_opt_ts, parse_ts, SqliteStore};

const COLUMNS: &str = "id, workflow_id, user_id, status, input, output, \
                       error_message, logs, started_at, completed_at";

type ExecRow = (
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<ExecRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn into_record(r: ExecRow) -> Result<ExecutionRecord> {
    let (id, workflow_id, user_id, status, input, output, error_message, logs, started, completed) =
        r;
    let status = ExecutionStatus::parse(&status)
        .ok_or_else(|| TrellisError::Database(format!("unknown execution status: {}", status)))?;
    Ok(ExecutionRecord {
        id: RunId::from_string(&id),
        workflow_id,
        user_id,
        status,
        input: serde_json::from_str(&input)?,
        output: output.map(|s| serde_json::from_str(&s)).transpose()?,
        error_message,
        logs: serde_json::from_str(&logs)?,
        started_at: parse_ts(&started)?,
        completed_at: parse_opt_ts(completed)?,
    })
}

impl SqliteStore {
    /// Persist a freshly created (pending) execution record.
    pub fn create_execution(&self, record: &ExecutionRecord) -> Result<()> {
        let input = serde_json::to_string(&record.input)?;
        let logs = serde_json::to_string(&record.logs)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO executions
                 (id, workflow_id, user_id, status, input, logs, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.id.0,
                record.workflow_id,
                record.user_id,
                record.status.as_str(),
                input,
                logs,
                record.started_at.to_rfc3339(),
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(execution_id = %record.id, workflow_id = %record.workflow_id, "execution created");
        Ok(())
    }

    pub fn load_execution(&self, id: &RunId) -> Result<Option<ExecutionRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM executions WHERE id = ?1", COLUMNS),
                params![id.0],
                read_row,
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        row.map(into_record).transpose()
    }

    /// List executions for a user, newest first, optionally narrowed to one
    /// workflow.
    pub fn list_executions(
        &self,
        user_id: &str,
        workflow_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let sql = format!(
            "SELECT {} FROM executions
             WHERE user_id = ?1 AND (?2 IS NULL OR workflow_id = ?2)
             ORDER BY started_at DESC LIMIT ?3",
            COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![user_id, workflow_id, limit as i64], read_row)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(
                row.map_err(|e| TrellisError::Database(e.to_string()))?,
            )?);
        }
        Ok(records)
    }

    /// All executions currently in `status`, oldest first. Used at boot to
    /// re-enqueue runs that were queued when the service stopped.
    pub fn list_executions_with_status(
        &self,
        status: ExecutionStatus,
    ) -> Result<Vec<ExecutionRecord>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let sql = format!(
            "SELECT {} FROM executions WHERE status = ?1 ORDER BY started_at ASC",
            COLUMNS
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![status.as_str()], read_row)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(into_record(
                row.map_err(|e| TrellisError::Database(e.to_string()))?,
            )?);
        }
        Ok(records)
    }

    /// Boot-time repair: rows left `running` by a crashed worker go back to
    /// `pending` so the pool can re-claim them; their checkpoints are still
    /// in place. Only safe while no run from this process is in flight —
    /// a live worker owns its `running` rows.
    pub fn reset_stranded_running(&self) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE executions SET status = 'pending' WHERE status = 'running'",
                [],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        if n > 0 {
            warn!(count = n, "reset stranded running executions to pending");
        }
        Ok(n)
    }

    /// Compare-and-set status transition.
    ///
    /// The UPDATE is guarded on the expected current status, so two racing
    /// writers (say a worker finishing a run and the expiry sweep cancelling
    /// it) cannot both win. The loser gets `InvalidTransition` carrying the
    /// status actually found.
    pub fn transition_execution(
        &self,
        id: &RunId,
        from: ExecutionStatus,
        to: ExecutionStatus,
    ) -> Result<()> {
        if !from.can_transition(to) {
            return Err(TrellisError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let completed_at = to.is_terminal().then(|| Utc::now().to_rfc3339());
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE executions
                 SET status = ?1, completed_at = COALESCE(?2, completed_at)
                 WHERE id = ?3 AND status = ?4",
                params![to.as_str(), completed_at, id.0, from.as_str()],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        if n == 0 {
            let actual: Option<String> = conn
                .query_row(
                    "SELECT status FROM executions WHERE id = ?1",
                    params![id.0],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            return match actual {
                Some(actual) => Err(TrellisError::InvalidTransition {
                    from: actual,
                    to: to.to_string(),
                }),
                None => Err(TrellisError::ExecutionNotFound(id.to_string())),
            };
        }

        debug!(execution_id = %id, from = %from, to = %to, "execution status changed");
        Ok(())
    }

    /// Finish a running execution in one statement: terminal status, output
    /// or error, and completion timestamp.
    pub fn finish_execution(
        &self,
        id: &RunId,
        status: ExecutionStatus,
        output: Option<&serde_json::Value>,
        error_message: Option<&str>,
    ) -> Result<()> {
        if !ExecutionStatus::Running.can_transition(status) || !status.is_terminal() {
            return Err(TrellisError::InvalidTransition {
                from: ExecutionStatus::Running.to_string(),
                to: status.to_string(),
            });
        }

        let output = output.map(serde_json::to_string).transpose()?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE executions
                 SET status = ?1, output = ?2, error_message = ?3, completed_at = ?4
                 WHERE id = ?5 AND status = 'running'",
                params![
                    status.as_str(),
                    output,
                    error_message,
                    Utc::now().to_rfc3339(),
                    id.0,
                ],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        if n == 0 {
            return Err(TrellisError::InvalidTransition {
                from: "not running".into(),
                to: status.to_string(),
            });
        }
        Ok(())
    }

    /// Append one entry to an execution's log column.
    pub fn append_execution_log(&self, id: &RunId, entry: &ExecutionLogEntry) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let logs: Option<String> = conn
            .query_row(
                "SELECT logs FROM executions WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let Some(logs) = logs else {
            return Err(TrellisError::ExecutionNotFound(id.to_string()));
        };

        let mut entries: Vec<ExecutionLogEntry> = serde_json::from_str(&logs)?;
        entries.push(entry.clone());
        conn.execute(
            "UPDATE executions SET logs = ?1 WHERE id = ?2",
            params![serde_json::to_string(&entries)?, id.0],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(())
    }

    /// Flag an in-flight run for cooperative cancellation. The worker checks
    /// the flag between steps.
    pub fn request_cancel(&self, id: &RunId) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE executions SET cancel_requested = 1 WHERE id = ?1",
                params![id.0],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        if n == 0 {
            return Err(TrellisError::ExecutionNotFound(id.to_string()));
        }
        Ok(())
    }

    pub fn cancel_requested(&self, id: &RunId) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let flag: Option<i64> = conn
            .query_row(
                "SELECT cancel_requested FROM executions WHERE id = ?1",
                params![id.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        match flag {
            Some(f) => Ok(f != 0),
            None => Err(TrellisError::ExecutionNotFound(id.to_string())),
        }
    }
}
