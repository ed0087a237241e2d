use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EngineEvent, EventBus};
use trellis_core::graph::{Graph, Node, NodeKind, RetryPolicy};
use trellis_core::state::{ExecutionState, APPROVAL_DECISION_KEY};
use trellis_core::types::{ApprovalGate, ApprovalStatus};
use trellis_store::SqliteStore;

use crate::handlers::HandlerRegistry;

/// What one step did to the run.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// The run moved to the next node.
    Continue,
    /// The run hit a pending approval gate and must park.
    Suspended { gate_id: String, node_id: String },
    /// The run reached an end node.
    Completed,
}

/// Where a stepping segment ended.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Completed,
    Suspended { gate_id: String, node_id: String },
}

/// Executes one workflow run, one node at a time.
///
/// The stepper owns no run concurrency: exactly one worker drives a given
/// run, and all cross-run races (status transitions, gate decisions) are
/// settled by compare-and-set writes in the store. Loops are legal; the
/// cumulative `iteration_count` carried in the state is the only guard, so
/// the ceiling holds across suspend/resume cycles.
pub struct Stepper {
    graph: Graph,
    store: Arc<SqliteStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    max_iterations: u32,
}

impl Stepper {
    pub fn new(
        graph: Graph,
        store: Arc<SqliteStore>,
        registry: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        max_iterations: u32,
    ) -> Self {
        Self {
            graph,
            store,
            registry,
            events,
            max_iterations,
        }
    }

    /// Execute a single step: the node the state currently points at.
    pub async fn step(&self, state: &mut ExecutionState) -> Result<StepOutcome> {
        let node = self
            .graph
            .node(&state.current_node)
            .ok_or_else(|| TrellisError::NodeNotFound(state.current_node.clone()))?
            .clone();

        // Approval steps are re-entrant: a wake-up that finds the gate still
        // pending (or just opened it) must leave the state untouched, so one
        // approval round counts exactly once, on the consume path inside
        // run_approval.
        if node.kind != NodeKind::Approval {
            self.count_step(state, &node.id)?;
        }

        debug!(execution_id = %state.run_id, node = %node.id, kind = ?node.kind,
               iteration = state.iteration_count, "stepping");

        match node.kind {
            NodeKind::Start => {
                state.record(&node.id, "ok");
                state.current_node = self.next_node(state, &node)?;
                Ok(StepOutcome::Continue)
            }
            NodeKind::End => {
                state.record(&node.id, "ok");
                Ok(StepOutcome::Completed)
            }
            NodeKind::Action => {
                self.run_action(state, &node).await?;
                state.current_node = self.next_node(state, &node)?;
                Ok(StepOutcome::Continue)
            }
            NodeKind::Condition => {
                let route = self.graph.route_from(&node.id).ok_or_else(|| {
                    TrellisError::Validation(format!(
                        "condition node '{}' has no route",
                        node.id
                    ))
                })?;
                let label = route
                    .select_label(&state.data, &state.visits)
                    .ok_or_else(|| TrellisError::UnmappedRoute {
                        node: node.id.clone(),
                        label: "<no rule matched>".into(),
                    })?
                    .to_string();
                let target = route.targets.get(&label).ok_or_else(|| {
                    TrellisError::UnmappedRoute {
                        node: node.id.clone(),
                        label: label.clone(),
                    }
                })?;
                state.record(&node.id, format!("routed:{}", label));
                state.current_node = target.clone();
                Ok(StepOutcome::Continue)
            }
            NodeKind::Approval => self.run_approval(state, &node).await,
        }
    }

    /// Charge one iteration against the ceiling and bump the node's visit
    /// count.
    fn count_step(&self, state: &mut ExecutionState, node_id: &str) -> Result<()> {
        state.iteration_count += 1;
        if state.iteration_count > self.max_iterations {
            warn!(execution_id = %state.run_id, count = state.iteration_count,
                  "iteration ceiling hit");
            return Err(TrellisError::IterationLimit(self.max_iterations));
        }
        state.visit(node_id);
        Ok(())
    }

    /// Drive the run until it completes, suspends, faults, or is cancelled.
    ///
    /// The cancellation token covers service shutdown; the store flag covers
    /// user-requested cancellation of this specific run. Both are checked
    /// between steps, never mid-handler.
    pub async fn run_to_boundary(
        &self,
        state: &mut ExecutionState,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        loop {
            // Runs driven outside the dispatcher have no execution row; only
            // the token applies to them.
            let flagged = match self.store.cancel_requested(&state.run_id) {
                Ok(flag) => flag,
                Err(TrellisError::ExecutionNotFound(_)) => false,
                Err(e) => return Err(e),
            };
            if cancel.is_cancelled() || flagged {
                let node = state.current_node.clone();
                state.record(&node, "cancelled");
                return Err(TrellisError::Cancelled);
            }

            match self.step(state).await? {
                StepOutcome::Continue => continue,
                StepOutcome::Suspended { gate_id, node_id } => {
                    return Ok(RunOutcome::Suspended { gate_id, node_id })
                }
                StepOutcome::Completed => return Ok(RunOutcome::Completed),
            }
        }
    }

    /// Invoke an action node's handler, retrying transient failures within
    /// the node's retry budget.
    async fn run_action(&self, state: &mut ExecutionState, node: &Node) -> Result<()> {
        let name = node
            .handler
            .as_deref()
            .ok_or_else(|| {
                TrellisError::Validation(format!("action node '{}' has no handler", node.id))
            })?;
        let handler = self
            .registry
            .get(name)
            .ok_or_else(|| TrellisError::HandlerNotFound(name.to_string()))?;

        let retry = node.retry.clone().unwrap_or(RetryPolicy {
            max_attempts: 1,
            base_delay_ms: 0,
        });

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match handler.invoke(&node.config, &state.data).await {
                Ok(out) if out.ok => {
                    state.merge(out.data);
                    state.set(format!("{}_status", node.id), "completed".into());
                    state.record(&node.id, "ok");
                    self.events.publish(EngineEvent::NodeCompleted {
                        execution_id: state.run_id.clone(),
                        node_id: node.id.clone(),
                        ok: true,
                    });
                    return Ok(());
                }
                Ok(out) => {
                    // Handler-reported failure: data is kept for forensics,
                    // the run faults.
                    state.merge(out.data);
                    state.set(format!("{}_status", node.id), "error".into());
                    state.record(&node.id, "error");
                    self.events.publish(EngineEvent::NodeCompleted {
                        execution_id: state.run_id.clone(),
                        node_id: node.id.clone(),
                        ok: false,
                    });
                    return Err(TrellisError::HandlerFailed {
                        node: node.id.clone(),
                        message: "handler reported failure".into(),
                    });
                }
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = retry.delay_ms(attempt);
                    warn!(execution_id = %state.run_id, node = %node.id, attempt,
                          delay_ms = delay, error = %e, "transient failure, retrying");
                    state.errors.push(e.to_string());
                    state.record(&node.id, "retried");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) if e.is_transient() => {
                    state.set(format!("{}_status", node.id), "error".into());
                    state.record(&node.id, "error");
                    return Err(TrellisError::RetriesExhausted {
                        node: node.id.clone(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    state.set(format!("{}_status", node.id), "error".into());
                    state.record(&node.id, "error");
                    return Err(e);
                }
            }
        }
    }

    /// Approval node: open a gate and suspend, or consume a decided gate
    /// and move on.
    async fn run_approval(&self, state: &mut ExecutionState, node: &Node) -> Result<StepOutcome> {
        let existing = self.store.find_unconsumed_gate(&state.run_id, &node.id)?;

        let gate = match existing {
            None => {
                let gate = self.open_gate(state, node)?;
                state.record(&node.id, "suspended");
                info!(execution_id = %state.run_id, node = %node.id, gate_id = %gate.id,
                      "run suspended at approval gate");
                self.events.publish(EngineEvent::ApprovalRequested {
                    execution_id: state.run_id.clone(),
                    gate_id: gate.id.clone(),
                    node_id: node.id.clone(),
                });
                return Ok(StepOutcome::Suspended {
                    gate_id: gate.id,
                    node_id: node.id.clone(),
                });
            }
            Some(gate) => gate,
        };

        match gate.status {
            ApprovalStatus::Pending => {
                // Woken without a decision (crash-retry); park again.
                Ok(StepOutcome::Suspended {
                    gate_id: gate.id,
                    node_id: node.id.clone(),
                })
            }
            ApprovalStatus::Approved | ApprovalStatus::Rejected => {
                self.count_step(state, &node.id)?;
                let decision = gate.status.as_str();
                state.set(APPROVAL_DECISION_KEY.to_string(), decision.into());
                state.set(format!("{}_decision", node.id), decision.into());
                if let Some(notes) = &gate.decision_notes {
                    state.set(format!("{}_notes", node.id), notes.as_str().into());
                }
                self.store.mark_gate_consumed(&gate.id)?;
                state.record(&node.id, format!("resumed:{}", decision));
                info!(execution_id = %state.run_id, node = %node.id, gate_id = %gate.id,
                      decision = %decision, "approval gate consumed");
                state.current_node = self.next_node(state, node)?;
                Ok(StepOutcome::Continue)
            }
            ApprovalStatus::Cancelled => {
                // Expired or cancelled out from under us.
                state.record(&node.id, "cancelled");
                Err(TrellisError::Cancelled)
            }
        }
    }

    fn open_gate(&self, state: &ExecutionState, node: &Node) -> Result<ApprovalGate> {
        let spec = node.approval.clone().unwrap_or_default();

        // Review payload: the named excerpt keys, or the full data map.
        let payload = if spec.payload_keys.is_empty() {
            serde_json::Value::Object(state.data.clone())
        } else {
            let mut excerpt = serde_json::Map::new();
            for key in &spec.payload_keys {
                if let Some(v) = state.data.get(key) {
                    excerpt.insert(key.clone(), v.clone());
                }
            }
            serde_json::Value::Object(excerpt)
        };

        let now = Utc::now();
        let gate = ApprovalGate {
            id: uuid::Uuid::new_v4().to_string(),
            execution_id: state.run_id.clone(),
            workflow_id: self.graph.id.clone(),
            node_id: node.id.clone(),
            approver: spec.approver,
            message: spec.message,
            payload,
            status: ApprovalStatus::Pending,
            decision_notes: None,
            decided_by: None,
            decided_at: None,
            consumed_at: None,
            created_at: now,
            expires_at: spec
                .expires_in_secs
                .map(|s| now + chrono::Duration::seconds(s as i64)),
        };
        self.store.create_gate(&gate)?;
        Ok(gate)
    }

    /// Next node after a non-condition node: its plain edge, or its
    /// conditional route if that's what it carries.
    fn next_node(&self, state: &ExecutionState, node: &Node) -> Result<String> {
        if let Some(edge) = self.graph.edge_from(&node.id) {
            return Ok(edge.to.clone());
        }
        if let Some(route) = self.graph.route_from(&node.id) {
            let label = route
                .select_label(&state.data, &state.visits)
                .ok_or_else(|| TrellisError::UnmappedRoute {
                    node: node.id.clone(),
                    label: "<no rule matched>".into(),
                })?;
            return route
                .targets
                .get(label)
                .cloned()
                .ok_or_else(|| TrellisError::UnmappedRoute {
                    node: node.id.clone(),
                    label: label.to_string(),
                });
        }
        Err(TrellisError::Validation(format!(
            "node '{}' has no outgoing edge",
            node.id
        )))
    }
}
