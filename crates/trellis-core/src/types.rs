use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of an execution record.
///
/// The state machine:
/// `pending -> running -> {completed, failed}` with any number of
/// `running -> waiting_approval -> running` cycles in between (one per
/// approval node visited). `pending` and `waiting_approval` may be
/// cancelled by the user; `waiting_approval` is cancelled by gate expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    WaitingApproval,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "waiting_approval" => Some(Self::WaitingApproval),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Completed, failed, and cancelled records reject further mutation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, WaitingApproval)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (WaitingApproval, Running)
                | (WaitingApproval, Cancelled)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in an execution's persisted log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub node_id: String,
    pub message: String,
    /// "ok", "error", "suspended", "retried", ...
    pub outcome: String,
}

/// Durable record of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: RunId,
    pub workflow_id: String,
    pub user_id: String,
    pub status: ExecutionStatus,
    pub input: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub logs: Vec<ExecutionLogEntry>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(workflow_id: impl Into<String>, user_id: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            id: RunId::new(),
            workflow_id: workflow_id.into(),
            user_id: user_id.into(),
            status: ExecutionStatus::Pending,
            input,
            output: None,
            error_message: None,
            logs: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Status of a human approval gate. Once non-pending, the gate is immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decision submitted against a pending gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approved,
    Rejected,
}

impl ApprovalDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    pub fn status(&self) -> ApprovalStatus {
        match self {
            Self::Approved => ApprovalStatus::Approved,
            Self::Rejected => ApprovalStatus::Rejected,
        }
    }
}

/// One pending (or decided) human decision that suspends a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub id: String,
    pub execution_id: RunId,
    pub workflow_id: String,
    /// Approval node this gate belongs to.
    pub node_id: String,
    /// Designated approver (user id or external email). `None` means any
    /// authenticated decider may act.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Data excerpt shown to the approver.
    pub payload: serde_json::Value,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision_notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Set when the stepper has injected this gate's decision into the run.
    /// A consumed gate is never resumed from again.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApprovalGate {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|t| t < now)
    }
}

/// A signed, addressable trigger for a workflow.
///
/// The secret is returned exactly once at creation and never again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEndpoint {
    pub id: String,
    pub workflow_id: String,
    pub user_id: String,
    /// Unique path token: the endpoint answers at `/webhooks/trigger/{token}`.
    pub token: String,
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub active: bool,
    /// Empty list means no IP restriction.
    pub allowed_ips: Vec<String>,
    /// When false, unsigned requests are accepted. Explicit choice at
    /// creation, not a default.
    pub require_signature: bool,
    pub trigger_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Audit log entry for one inbound webhook call, accepted or rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookLog {
    pub id: String,
    pub endpoint_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<RunId>,
    pub source_ip: String,
    pub status_code: u16,
    pub message: String,
    pub processing_time_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// A stored workflow definition: name plus its serialized graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub graph: crate::graph::Graph,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions_follow_state_machine() {
        use ExecutionStatus::*;

        assert!(Pending.can_transition(Running));
        assert!(Pending.can_transition(Cancelled));
        assert!(Running.can_transition(WaitingApproval));
        assert!(WaitingApproval.can_transition(Running));
        assert!(WaitingApproval.can_transition(Cancelled));
        assert!(Running.can_transition(Completed));
        assert!(Running.can_transition(Failed));

        // Single-shot transitions cannot be replayed
        assert!(!Completed.can_transition(Running));
        assert!(!Failed.can_transition(Running));
        assert!(!Cancelled.can_transition(Pending));
        assert!(!Pending.can_transition(Completed));
        assert!(!Pending.can_transition(WaitingApproval));
        assert!(!WaitingApproval.can_transition(Completed));
    }

    #[test]
    fn suspend_resume_cycle_repeats() {
        use ExecutionStatus::*;
        // One cycle per approval node visited, any number of times
        let mut status = Running;
        for _ in 0..3 {
            assert!(status.can_transition(WaitingApproval));
            status = WaitingApproval;
            assert!(status.can_transition(Running));
            status = Running;
        }
        assert!(status.can_transition(Completed));
    }

    #[test]
    fn terminal_statuses() {
        assert!(ExecutionStatus::Completed.is_terminal());
        assert!(ExecutionStatus::Failed.is_terminal());
        assert!(ExecutionStatus::Cancelled.is_terminal());
        assert!(!ExecutionStatus::Pending.is_terminal());
        assert!(!ExecutionStatus::WaitingApproval.is_terminal());
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::WaitingApproval,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Cancelled,
        ] {
            assert_eq!(ExecutionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(ExecutionStatus::parse("nope"), None);
    }

    #[test]
    fn gate_expiry() {
        let now = Utc::now();
        let gate = ApprovalGate {
            id: "g1".into(),
            execution_id: RunId::new(),
            workflow_id: "wf".into(),
            node_id: "approve".into(),
            approver: None,
            message: None,
            payload: serde_json::json!({}),
            status: ApprovalStatus::Pending,
            decision_notes: None,
            decided_by: None,
            decided_at: None,
            consumed_at: None,
            created_at: now,
            expires_at: Some(now - chrono::Duration::seconds(1)),
        };
        assert!(gate.is_expired(now));

        let open = ApprovalGate {
            expires_at: None,
            ..gate
        };
        assert!(!open.is_expired(now));
    }
}
