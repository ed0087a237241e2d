use crate::types::{ApprovalDecision, ExecutionStatus, RunId};

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A run was handed to the worker pool.
    ExecutionEnqueued { execution_id: RunId },
    /// A run started (or resumed) stepping.
    ExecutionStarted { execution_id: RunId },
    /// One node finished.
    NodeCompleted {
        execution_id: RunId,
        node_id: String,
        ok: bool,
    },
    /// A run suspended at an approval gate.
    ApprovalRequested {
        execution_id: RunId,
        gate_id: String,
        node_id: String,
    },
    /// A gate was decided.
    ApprovalResolved {
        gate_id: String,
        decision: ApprovalDecision,
    },
    /// A run reached a terminal status.
    ExecutionFinished {
        execution_id: RunId,
        status: ExecutionStatus,
    },
    /// A webhook trigger was received (accepted or rejected).
    WebhookReceived {
        endpoint_id: String,
        status_code: u16,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
