use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};

use trellis_core::error::{Result, TrellisError};
use trellis_core::types::{ApprovalDecision, ApprovalGate, ApprovalStatus, RunId};

use crate::store::{parse_opt_ts, parse_ts, SqliteStore};

const COLUMNS: &str = "id, execution_id, workflow_id, node_id, approver, message, payload, \
                       status, decision_notes, decided_by, decided_at, consumed_at, \
                       created_at, expires_at";

#[allow(clippy::type_complexity)]
fn read_row(
    row: &Row<'_>,
) -> rusqlite::Result<(
    String,
    String,
    String,
    String,
    Option<String>,
    Option<String>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<String>,
    String,
    Option<String>,
)> {
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
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
    ))
}

fn into_gate(
    r: (
        String,
        String,
        String,
        String,
        Option<String>,
        Option<String>,
        String,
        String,
        Option<String>,
        Option<String>,
        Option<String>,
        Option<String>,
        String,
        Option<String>,
    ),
) -> Result<ApprovalGate> {
    let (
        id,
        execution_id,
        workflow_id,
        node_id,
        approver,
        message,
        payload,
        status,
        decision_notes,
        decided_by,
        decided_at,
        consumed_at,
        created_at,
        expires_at,
    ) = r;
    let status = ApprovalStatus::parse(&status)
        .ok_or_else(|| TrellisError::Database(format!("unknown gate status: {}", status)))?;
    Ok(ApprovalGate {
        id,
        execution_id: RunId::from_string(&execution_id),
        workflow_id,
        node_id,
        approver,
        message,
        payload: serde_json::from_str(&payload)?,
        status,
        decision_notes,
        decided_by,
        decided_at: parse_opt_ts(decided_at)?,
        consumed_at: parse_opt_ts(consumed_at)?,
        created_at: parse_ts(&created_at)?,
        expires_at: parse_opt_ts(expires_at)?,
    })
}

impl SqliteStore {
    pub fn create_gate(&self, gate: &ApprovalGate) -> Result<()> {
        let payload = serde_json::to_string(&gate.payload)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        conn.execute(
            "INSERT INTO approval_gates
                 (id, execution_id, workflow_id, node_id, approver, message,
                  payload, status, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                gate.id,
                gate.execution_id.0,
                gate.workflow_id,
                gate.node_id,
                gate.approver,
                gate.message,
                payload,
                gate.status.as_str(),
                gate.created_at.to_rfc3339(),
                gate.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| TrellisError::Database(e.to_string()))?;

        info!(gate_id = %gate.id, execution_id = %gate.execution_id, node = %gate.node_id,
              "approval gate created");
        Ok(())
    }

    pub fn load_gate(&self, id: &str) -> Result<Option<ApprovalGate>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM approval_gates WHERE id = ?1", COLUMNS),
                params![id],
                read_row,
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        row.map(into_gate).transpose()
    }

    /// The latest unconsumed gate for one approval node of one run.
    ///
    /// A resumed run consumes its decided gate exactly once; a later visit to
    /// the same node (via a loop) finds no unconsumed gate and opens a fresh
    /// one.
    pub fn find_unconsumed_gate(
        &self,
        execution_id: &RunId,
        node_id: &str,
    ) -> Result<Option<ApprovalGate>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {} FROM approval_gates
                     WHERE execution_id = ?1 AND node_id = ?2 AND consumed_at IS NULL
                     ORDER BY created_at DESC LIMIT 1",
                    COLUMNS
                ),
                params![execution_id.0, node_id],
                read_row,
            )
            .optional()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        row.map(into_gate).transpose()
    }

    /// Pending gates addressed to `approver` (plus any-approver gates).
    pub fn list_pending_gates(&self, approver: &str) -> Result<Vec<ApprovalGate>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM approval_gates
                 WHERE status = 'pending' AND (approver IS NULL OR approver = ?1)
                 ORDER BY created_at ASC",
                COLUMNS
            ))
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![approver], read_row)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut gates = Vec::new();
        for row in rows {
            gates.push(into_gate(
                row.map_err(|e| TrellisError::Database(e.to_string()))?,
            )?);
        }
        Ok(gates)
    }

    pub fn list_gates_for_execution(&self, execution_id: &RunId) -> Result<Vec<ApprovalGate>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM approval_gates WHERE execution_id = ?1
                 ORDER BY created_at ASC",
                COLUMNS
            ))
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let rows = stmt
            .query_map(params![execution_id.0], read_row)
            .map_err(|e| TrellisError::Database(e.to_string()))?;

        let mut gates = Vec::new();
        for row in rows {
            gates.push(into_gate(
                row.map_err(|e| TrellisError::Database(e.to_string()))?,
            )?);
        }
        Ok(gates)
    }

    /// Record a decision against a pending gate.
    ///
    /// Precondition checks are ordered: missing gate, already decided,
    /// expired (which cancels the gate as a side effect), wrong approver.
    /// The final write is a compare-and-set on `status = 'pending'`, so of
    /// two concurrent deciders exactly one wins and the other sees
    /// `AlreadyDecided`.
    pub fn decide_gate(
        &self,
        id: &str,
        decided_by: &str,
        decision: ApprovalDecision,
        notes: Option<&str>,
    ) -> Result<ApprovalGate> {
        let gate = self
            .load_gate(id)?
            .ok_or_else(|| TrellisError::GateNotFound(id.to_string()))?;

        if gate.status.is_terminal() {
            return Err(TrellisError::AlreadyDecided(id.to_string()));
        }
        if gate.is_expired(Utc::now()) {
            self.cancel_gate(id)?;
            return Err(TrellisError::Expired(id.to_string()));
        }
        if let Some(approver) = &gate.approver {
            if approver != decided_by {
                return Err(TrellisError::Forbidden(format!(
                    "gate {} is assigned to another approver",
                    id
                )));
            }
        }

        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE approval_gates
                 SET status = ?1, decided_by = ?2, decided_at = ?3, decision_notes = ?4
                 WHERE id = ?5 AND status = 'pending'",
                params![
                    decision.status().as_str(),
                    decided_by,
                    Utc::now().to_rfc3339(),
                    notes,
                    id,
                ],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        drop(conn);

        if n == 0 {
            return Err(TrellisError::AlreadyDecided(id.to_string()));
        }

        info!(gate_id = %id, decision = %decision.as_str(), decided_by = %decided_by,
              "approval gate decided");
        self.load_gate(id)?
            .ok_or_else(|| TrellisError::GateNotFound(id.to_string()))
    }

    /// Tombstone a gate once its decision has been injected into the run.
    pub fn mark_gate_consumed(&self, id: &str) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE approval_gates SET consumed_at = ?1
                 WHERE id = ?2 AND consumed_at IS NULL",
                params![Utc::now().to_rfc3339(), id],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        if n == 0 {
            return Err(TrellisError::GateNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Cancel a single pending gate. Returns false if it was no longer
    /// pending.
    pub fn cancel_gate(&self, id: &str) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE approval_gates SET status = 'cancelled'
                 WHERE id = ?1 AND status = 'pending'",
                params![id],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(n > 0)
    }

    /// Cancel every pending gate of a run (run cancelled or failed).
    pub fn cancel_gates_for_execution(&self, execution_id: &RunId) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        let n = conn
            .execute(
                "UPDATE approval_gates SET status = 'cancelled'
                 WHERE execution_id = ?1 AND status = 'pending'",
                params![execution_id.0],
            )
            .map_err(|e| TrellisError::Database(e.to_string()))?;
        Ok(n)
    }

    /// Cancel all pending gates whose deadline has passed and return them,
    /// so the caller can cancel the suspended runs they belong to.
    pub fn expire_pending_gates(&self, now: DateTime<Utc>) -> Result<Vec<ApprovalGate>> {
        let expired = {
            let conn = self
                .conn
                .lock()
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM approval_gates
                     WHERE status = 'pending' AND expires_at IS NOT NULL AND expires_at < ?1",
                    COLUMNS
                ))
                .map_err(|e| TrellisError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![now.to_rfc3339()], read_row)
                .map_err(|e| TrellisError::Database(e.to_string()))?;

            let mut gates = Vec::new();
            for row in rows {
                gates.push(into_gate(
                    row.map_err(|e| TrellisError::Database(e.to_string()))?,
                )?);
            }
            gates
        };

        // CAS each one; a gate decided between the select and here is skipped.
        let mut cancelled = Vec::new();
        for gate in expired {
            if self.cancel_gate(&gate.id)? {
                debug!(gate_id = %gate.id, execution_id = %gate.execution_id,
                       "approval gate expired");
                cancelled.push(gate);
            }
        }
        Ok(cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending_gate(execution_id: &RunId, node: &str, approver: Option<&str>) -> ApprovalGate {
        ApprovalGate {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: execution_id.clone(),
            workflow_id: "wf1".into(),
            node_id: node.into(),
            approver: approver.map(String::from),
            message: Some("sign off".into()),
            payload: json!({"amount": 100}),
            status: ApprovalStatus::Pending,
            decision_notes: None,
            decided_by: None,
            decided_at: None,
            consumed_at: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn decide_exactly_once() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        let gate = pending_gate(&run, "approve", None);
        store.create_gate(&gate).unwrap();

        let decided = store
            .decide_gate(&gate.id, "alice", ApprovalDecision::Approved, Some("lgtm"))
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
        assert_eq!(decided.decided_by.as_deref(), Some("alice"));
        assert!(decided.decided_at.is_some());

        // Second decision loses
        let err = store
            .decide_gate(&gate.id, "bob", ApprovalDecision::Rejected, None)
            .unwrap_err();
        assert!(matches!(err, TrellisError::AlreadyDecided(_)));
    }

    #[test]
    fn racing_decides_have_one_winner() {
        use std::sync::{Arc, Barrier};

        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run = RunId::new();
        let gate = pending_gate(&run, "approve", None);
        store.create_gate(&gate).unwrap();

        let barrier = Arc::new(Barrier::new(2));
        let contenders = [
            ("alice", ApprovalDecision::Approved),
            ("bob", ApprovalDecision::Rejected),
        ];
        let handles: Vec<_> = contenders
            .into_iter()
            .map(|(who, decision)| {
                let store = store.clone();
                let barrier = barrier.clone();
                let gate_id = gate.id.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.decide_gate(&gate_id, who, decision, None)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, TrellisError::AlreadyDecided(_))));

        // The stored gate carries exactly the winner's decision
        let settled = store.load_gate(&gate.id).unwrap().unwrap();
        let winner = results.iter().flatten().next().unwrap();
        assert_eq!(settled.status, winner.status);
        assert_eq!(settled.decided_by, winner.decided_by);
    }

    #[test]
    fn wrong_approver_is_forbidden() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        let gate = pending_gate(&run, "approve", Some("alice"));
        store.create_gate(&gate).unwrap();

        let err = store
            .decide_gate(&gate.id, "mallory", ApprovalDecision::Approved, None)
            .unwrap_err();
        assert!(matches!(err, TrellisError::Forbidden(_)));

        // Still pending for the real approver
        let decided = store
            .decide_gate(&gate.id, "alice", ApprovalDecision::Approved, None)
            .unwrap();
        assert_eq!(decided.status, ApprovalStatus::Approved);
    }

    #[test]
    fn expired_gate_is_cancelled_on_decide() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        let mut gate = pending_gate(&run, "approve", None);
        gate.expires_at = Some(Utc::now() - chrono::Duration::minutes(1));
        store.create_gate(&gate).unwrap();

        let err = store
            .decide_gate(&gate.id, "alice", ApprovalDecision::Approved, None)
            .unwrap_err();
        assert!(matches!(err, TrellisError::Expired(_)));

        let loaded = store.load_gate(&gate.id).unwrap().unwrap();
        assert_eq!(loaded.status, ApprovalStatus::Cancelled);
    }

    #[test]
    fn missing_gate() {
        let store = SqliteStore::in_memory().unwrap();
        let err = store
            .decide_gate("nope", "alice", ApprovalDecision::Approved, None)
            .unwrap_err();
        assert!(matches!(err, TrellisError::GateNotFound(_)));
    }

    #[test]
    fn consumed_gate_is_invisible_to_resume_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        let gate = pending_gate(&run, "approve", None);
        store.create_gate(&gate).unwrap();

        let found = store.find_unconsumed_gate(&run, "approve").unwrap().unwrap();
        assert_eq!(found.id, gate.id);

        store.mark_gate_consumed(&gate.id).unwrap();
        assert!(store.find_unconsumed_gate(&run, "approve").unwrap().is_none());

        // A loop re-entering the node opens a fresh gate
        let second = pending_gate(&run, "approve", None);
        store.create_gate(&second).unwrap();
        let found = store.find_unconsumed_gate(&run, "approve").unwrap().unwrap();
        assert_eq!(found.id, second.id);
    }

    #[test]
    fn pending_list_respects_addressee() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        store.create_gate(&pending_gate(&run, "a", Some("alice"))).unwrap();
        store.create_gate(&pending_gate(&run, "b", Some("bob"))).unwrap();
        store.create_gate(&pending_gate(&run, "c", None)).unwrap();

        let mine = store.list_pending_gates("alice").unwrap();
        let nodes: Vec<_> = mine.iter().map(|g| g.node_id.as_str()).collect();
        assert_eq!(nodes, vec!["a", "c"]);
    }

    #[test]
    fn expiry_sweep_cancels_only_overdue_gates() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();

        let mut overdue = pending_gate(&run, "late", None);
        overdue.expires_at = Some(Utc::now() - chrono::Duration::hours(1));
        store.create_gate(&overdue).unwrap();

        let mut fresh = pending_gate(&run, "fresh", None);
        fresh.expires_at = Some(Utc::now() + chrono::Duration::hours(1));
        store.create_gate(&fresh).unwrap();

        let open = pending_gate(&run, "open", None);
        store.create_gate(&open).unwrap();

        let cancelled = store.expire_pending_gates(Utc::now()).unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].node_id, "late");

        assert_eq!(
            store.load_gate(&overdue.id).unwrap().unwrap().status,
            ApprovalStatus::Cancelled
        );
        assert_eq!(
            store.load_gate(&fresh.id).unwrap().unwrap().status,
            ApprovalStatus::Pending
        );

        // Sweep is idempotent
        assert!(store.expire_pending_gates(Utc::now()).unwrap().is_empty());
    }

    #[test]
    fn cancel_gates_for_execution_bulk() {
        let store = SqliteStore::in_memory().unwrap();
        let run = RunId::new();
        let other = RunId::new();
        store.create_gate(&pending_gate(&run, "a", None)).unwrap();
        store.create_gate(&pending_gate(&run, "b", None)).unwrap();
        store.create_gate(&pending_gate(&other, "c", None)).unwrap();

        assert_eq!(store.cancel_gates_for_execution(&run).unwrap(), 2);
        let gates = store.list_gates_for_execution(&other).unwrap();
        assert_eq!(gates[0].status, ApprovalStatus::Pending);
    }
}
