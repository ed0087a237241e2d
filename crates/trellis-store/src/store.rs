use chrono::{DateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        user_id TEXT NOT NULL,
        name TEXT NOT NULL,
        graph TEXT NOT NULL,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_workflows_user ON workflows(user_id);

    CREATE TABLE IF NOT EXISTS executions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        status TEXT NOT NULL,
        input TEXT NOT NULL,
        output TEXT,
        error_message TEXT,
        logs TEXT NOT NULL DEFAULT '[]',
        cancel_requested INTEGER NOT NULL DEFAULT 0,
        started_at TEXT NOT NULL,
        completed_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_executions_workflow
        ON executions(workflow_id, started_at);
    CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);

    CREATE TABLE IF NOT EXISTS approval_gates (
        id TEXT PRIMARY KEY,
        execution_id TEXT NOT NULL,
        workflow_id TEXT NOT NULL,
        node_id TEXT NOT NULL,
        approver TEXT,
        message TEXT,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        decision_notes TEXT,
        decided_by TEXT,
        decided_at TEXT,
        consumed_at TEXT,
        created_at TEXT NOT NULL,
        expires_at TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_gates_execution
        ON approval_gates(execution_id, node_id);
    CREATE INDEX IF NOT EXISTS idx_gates_status ON approval_gates(status);

    CREATE TABLE IF NOT EXISTS webhook_endpoints (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        user_id TEXT NOT NULL,
        token TEXT NOT NULL UNIQUE,
        secret TEXT NOT NULL,
        description TEXT,
        active INTEGER NOT NULL DEFAULT 1,
        allowed_ips TEXT NOT NULL DEFAULT '[]',
        require_signature INTEGER NOT NULL,
        trigger_count INTEGER NOT NULL DEFAULT 0,
        last_triggered_at TEXT,
        created_at TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS webhook_logs (
        id TEXT PRIMARY KEY,
        endpoint_id TEXT NOT NULL,
        execution_id TEXT,
        source_ip TEXT NOT NULL,
        status_code INTEGER NOT NULL,
        message TEXT NOT NULL,
        processing_time_ms INTEGER NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_webhook_logs_endpoint
        ON webhook_logs(endpoint_id, created_at);

    CREATE TABLE IF NOT EXISTS checkpoints (
        execution_id TEXT PRIMARY KEY,
        state TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

/// SQLite-backed store for workflows, executions, gates, and webhooks.
///
/// One connection behind a mutex. Every write is a single statement (or a
/// single compare-and-set UPDATE), so the lock is held only briefly and
/// lifecycle races resolve at the database rather than in memory.
pub struct SqliteStore {
    pub(crate) conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        // Create parent directories
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TrellisError::Database(format!("Failed to create db directory: {}", e))
            })?;
        }

        let conn =
            Connection::open(path).map_err(|e| TrellisError::Database(e.to_string()))?;

        // Enable WAL mode for better concurrent performance
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        debug!(path = %path.display(), "SQLite store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().map_err(|e| TrellisError::Database(e.to_string()))?;

        conn.execute_batch(SCHEMA)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| TrellisError::Database(format!("bad timestamp {:?}: {}", s, e)))
}

pub(crate) fn parse_opt_ts(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}
