use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use trellis_core::config::EngineConfig;
use trellis_core::error::{Result, TrellisError};
use trellis_core::event::{EngineEvent, EventBus};
use trellis_core::state::ExecutionState;
use trellis_core::types::{ExecutionLogEntry, ExecutionStatus, RunId};
use trellis_store::SqliteStore;

use crate::handlers::HandlerRegistry;
use crate::stepper::{RunOutcome, Stepper};

/// Cheap cloneable handle for enqueueing runs into the dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: mpsc::Sender<RunId>,
    events: Arc<EventBus>,
}

impl DispatcherHandle {
    /// Queue a run (fresh or resuming) for the worker pool.
    pub async fn enqueue(&self, execution_id: RunId) -> Result<()> {
        self.tx
            .send(execution_id.clone())
            .await
            .map_err(|_| TrellisError::Cancelled)?;
        self.events.publish(EngineEvent::ExecutionEnqueued { execution_id });
        Ok(())
    }
}

/// Pulls queued runs and drives them on a bounded worker pool.
///
/// At-least-once: a run is claimed with a compare-and-set status transition,
/// so a duplicate enqueue (or a crash-retry) finds the row already claimed
/// or already terminal and drops out. Each claimed run gets a wall-clock
/// deadline per segment; the expiry sweep runs alongside the pool and
/// cancels overdue approval gates together with their suspended runs.
pub struct Dispatcher {
    store: Arc<SqliteStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    config: EngineConfig,
    tx: mpsc::Sender<RunId>,
    rx: mpsc::Receiver<RunId>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        store: Arc<SqliteStore>,
        registry: Arc<HandlerRegistry>,
        events: Arc<EventBus>,
        config: EngineConfig,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_depth);
        Self {
            store,
            registry,
            events,
            config,
            tx,
            rx,
            cancel,
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.clone(),
            events: self.events.clone(),
        }
    }

    /// Run the dispatcher loop. Blocks until cancelled.
    pub async fn run(mut self) {
        info!(
            workers = self.config.worker_count,
            deadline_secs = self.config.run_deadline_secs,
            "dispatcher started"
        );

        let sweep = tokio::spawn(sweep_loop(
            self.store.clone(),
            self.events.clone(),
            Duration::from_secs(self.config.gate_sweep_interval_secs),
            self.cancel.clone(),
        ));

        let permits = Arc::new(Semaphore::new(self.config.worker_count));
        loop {
            tokio::select! {
                maybe_id = self.rx.recv() => {
                    let Some(execution_id) = maybe_id else { break };
                    // Capacity gate before spawning, so the queue backs up
                    // instead of the task count.
                    let Ok(permit) = permits.clone().acquire_owned().await else { break };

                    let worker = Worker {
                        store: self.store.clone(),
                        registry: self.registry.clone(),
                        events: self.events.clone(),
                        max_iterations: self.config.max_iterations,
                        deadline: Duration::from_secs(self.config.run_deadline_secs),
                        cancel: self.cancel.clone(),
                    };
                    tokio::spawn(async move {
                        worker.process(execution_id).await;
                        drop(permit);
                    });
                }
                _ = self.cancel.cancelled() => {
                    info!("dispatcher shutting down");
                    break;
                }
            }
        }

        // In-flight workers observe the token between steps
        let _ = permits
            .acquire_many(self.config.worker_count as u32)
            .await;
        sweep.abort();
    }
}

struct Worker {
    store: Arc<SqliteStore>,
    registry: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    max_iterations: u32,
    deadline: Duration,
    cancel: CancellationToken,
}

impl Worker {
    async fn process(&self, execution_id: RunId) {
        if let Err(e) = self.process_inner(&execution_id).await {
            error!(execution_id = %execution_id, error = %e, "worker failed to process run");
        }
    }

    async fn process_inner(&self, execution_id: &RunId) -> Result<()> {
        let record = self
            .store
            .load_execution(execution_id)?
            .ok_or_else(|| TrellisError::ExecutionNotFound(execution_id.to_string()))?;

        // Claim the run. Losing the CAS means someone else has it (or it is
        // already terminal) and this delivery is a duplicate.
        let claim = match record.status {
            ExecutionStatus::Pending => self.store.transition_execution(
                execution_id,
                ExecutionStatus::Pending,
                ExecutionStatus::Running,
            ),
            ExecutionStatus::WaitingApproval => self.store.transition_execution(
                execution_id,
                ExecutionStatus::WaitingApproval,
                ExecutionStatus::Running,
            ),
            other => {
                debug!(execution_id = %execution_id, status = %other,
                       "dropping duplicate delivery");
                return Ok(());
            }
        };
        if let Err(TrellisError::InvalidTransition { .. }) = &claim {
            debug!(execution_id = %execution_id, "lost claim race, dropping");
            return Ok(());
        }
        claim?;

        self.events.publish(EngineEvent::ExecutionStarted {
            execution_id: execution_id.clone(),
        });

        // Once claimed, any processing error must still settle the row;
        // otherwise the run would sit in `running` forever.
        if let Err(e) = self.drive(execution_id, &record).await {
            warn!(execution_id = %execution_id, error = %e, "run processing error");
            self.store.finish_execution(
                execution_id,
                ExecutionStatus::Failed,
                None,
                Some(&e.to_string()),
            )?;
            self.store.cancel_gates_for_execution(execution_id)?;
            self.store.delete_checkpoint(execution_id)?;
            self.events.publish(EngineEvent::ExecutionFinished {
                execution_id: execution_id.clone(),
                status: ExecutionStatus::Failed,
            });
        }
        Ok(())
    }

    async fn drive(
        &self,
        execution_id: &RunId,
        record: &trellis_core::types::ExecutionRecord,
    ) -> Result<()> {
        let workflow = self
            .store
            .load_workflow(&record.workflow_id)?
            .ok_or_else(|| TrellisError::WorkflowNotFound(record.workflow_id.clone()))?;

        // Resume from the checkpoint when there is one, otherwise start at
        // the graph entry with the trigger input.
        let mut state = match self.store.load_checkpoint(execution_id)? {
            Some(state) => state,
            None => ExecutionState::new(
                execution_id.clone(),
                workflow.graph.entry.clone(),
                record.input.clone(),
            ),
        };
        let history_base = state.history.len();

        let stepper = Stepper::new(
            workflow.graph,
            self.store.clone(),
            self.registry.clone(),
            self.events.clone(),
            self.max_iterations,
        );

        let outcome = tokio::time::timeout(
            self.deadline,
            stepper.run_to_boundary(&mut state, &self.cancel),
        )
        .await;

        self.append_segment_logs(execution_id, &state, history_base);

        let status = match outcome {
            Ok(Ok(RunOutcome::Completed)) => {
                let output = serde_json::Value::Object(state.data.clone());
                self.store.finish_execution(
                    execution_id,
                    ExecutionStatus::Completed,
                    Some(&output),
                    None,
                )?;
                self.store.delete_checkpoint(execution_id)?;
                info!(execution_id = %execution_id, steps = state.iteration_count,
                      "run completed");
                ExecutionStatus::Completed
            }
            Ok(Ok(RunOutcome::Suspended { gate_id, node_id })) => {
                self.store.save_checkpoint(&state)?;
                self.store.transition_execution(
                    execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::WaitingApproval,
                )?;
                info!(execution_id = %execution_id, gate_id = %gate_id, node = %node_id,
                      "run waiting for approval");
                ExecutionStatus::WaitingApproval
            }
            Ok(Err(TrellisError::Cancelled)) => {
                self.store.transition_execution(
                    execution_id,
                    ExecutionStatus::Running,
                    ExecutionStatus::Cancelled,
                )?;
                self.store.cancel_gates_for_execution(execution_id)?;
                self.store.delete_checkpoint(execution_id)?;
                info!(execution_id = %execution_id, "run cancelled");
                ExecutionStatus::Cancelled
            }
            Ok(Err(e)) => {
                self.store.finish_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(&e.to_string()),
                )?;
                self.store.cancel_gates_for_execution(execution_id)?;
                self.store.delete_checkpoint(execution_id)?;
                warn!(execution_id = %execution_id, error = %e, "run failed");
                ExecutionStatus::Failed
            }
            Err(_) => {
                let message =
                    TrellisError::DeadlineExceeded(self.deadline.as_secs()).to_string();
                self.store.finish_execution(
                    execution_id,
                    ExecutionStatus::Failed,
                    None,
                    Some(&message),
                )?;
                self.store.cancel_gates_for_execution(execution_id)?;
                self.store.delete_checkpoint(execution_id)?;
                warn!(execution_id = %execution_id, deadline_secs = self.deadline.as_secs(),
                      "run force-failed at deadline");
                ExecutionStatus::Failed
            }
        };

        if status.is_terminal() {
            self.events.publish(EngineEvent::ExecutionFinished {
                execution_id: execution_id.clone(),
                status,
            });
        }
        Ok(())
    }

    /// Copy the history entries produced by this segment into the durable
    /// execution log.
    fn append_segment_logs(&self, execution_id: &RunId, state: &ExecutionState, base: usize) {
        for entry in &state.history[base..] {
            let log = ExecutionLogEntry {
                timestamp: entry.timestamp,
                node_id: entry.node.clone(),
                message: String::new(),
                outcome: entry.outcome.clone(),
            };
            if let Err(e) = self.store.append_execution_log(execution_id, &log) {
                warn!(execution_id = %execution_id, error = %e, "failed to append run log");
                break;
            }
        }
    }
}

/// Periodically cancel overdue approval gates and the runs suspended on
/// them.
async fn sweep_loop(
    store: Arc<SqliteStore>,
    events: Arc<EventBus>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = sweep_expired_gates(&store, &events) {
                    error!(error = %e, "gate expiry sweep failed");
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

/// Boot-time recovery: runs left `running` by a crashed worker are pushed
/// back to `pending` (their last checkpoint, if any, stays in place) and the
/// whole pending backlog is re-enqueued. Only safe at startup, before any
/// run from this process is in flight. Returns the number of runs enqueued.
pub async fn recover_stranded_runs(
    store: &SqliteStore,
    handle: &DispatcherHandle,
) -> Result<usize> {
    store.reset_stranded_running()?;

    let backlog = store.list_executions_with_status(ExecutionStatus::Pending)?;
    let count = backlog.len();
    if count > 0 {
        info!(count, "re-enqueueing stranded runs");
    }
    for record in backlog {
        handle.enqueue(record.id).await?;
    }
    Ok(count)
}

/// One sweep pass: cancel expired pending gates and their suspended runs.
/// Returns the number of gates cancelled.
pub fn sweep_expired_gates(store: &SqliteStore, events: &EventBus) -> Result<usize> {
    let expired = store.expire_pending_gates(Utc::now())?;
    let count = expired.len();

    for gate in expired {
        info!(gate_id = %gate.id, execution_id = %gate.execution_id, "gate expired, cancelling run");
        match store.transition_execution(
            &gate.execution_id,
            ExecutionStatus::WaitingApproval,
            ExecutionStatus::Cancelled,
        ) {
            Ok(()) => {
                store.delete_checkpoint(&gate.execution_id)?;
                events.publish(EngineEvent::ExecutionFinished {
                    execution_id: gate.execution_id.clone(),
                    status: ExecutionStatus::Cancelled,
                });
            }
            // A worker may hold the run right now; its own boundary handling
            // sees the cancelled gate.
            Err(TrellisError::InvalidTransition { .. }) => {
                debug!(execution_id = %gate.execution_id,
                       "expired gate's run not waiting, leaving to its worker");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::BoxFuture;
    use serde_json::json;
    use std::collections::HashMap;
    use trellis_core::graph::{ApprovalSpec, ConditionalRoute, Edge, Graph, Node, RouteCondition, RouteRule};
    use trellis_core::state::APPROVAL_DECISION_KEY;
    use trellis_core::traits::{HandlerOutput, NodeHandler};
    use trellis_core::types::{ApprovalDecision, ApprovalStatus, ExecutionRecord, WorkflowRecord};

    fn engine_config() -> EngineConfig {
        EngineConfig {
            max_iterations: 100,
            worker_count: 2,
            run_deadline_secs: 5,
            gate_sweep_interval_secs: 3600,
            queue_depth: 16,
        }
    }

    fn save_workflow(store: &SqliteStore, graph: Graph) {
        let now = Utc::now();
        store
            .save_workflow(&WorkflowRecord {
                id: graph.id.clone(),
                user_id: "alice".into(),
                name: graph.name.clone(),
                graph,
                created_at: now,
                updated_at: now,
            })
            .unwrap();
    }

    fn linear_graph() -> Graph {
        let mut config = serde_json::Map::new();
        config.insert("greeting".into(), json!("hi"));
        Graph {
            id: "wf-linear".into(),
            name: "linear".into(),
            nodes: vec![
                Node::start("start"),
                Node::action("greet", "set_data").with_config(config),
                Node::end("done"),
            ],
            edges: vec![Edge::new("start", "greet"), Edge::new("greet", "done")],
            routes: vec![],
            entry: "start".into(),
        }
    }

    fn approval_graph() -> Graph {
        Graph {
            id: "wf-approve".into(),
            name: "approve".into(),
            nodes: vec![
                Node::start("start"),
                Node::approval("gate", ApprovalSpec::default()),
                Node::condition("verdict"),
                Node::end("shipped"),
                Node::end("dropped"),
            ],
            edges: vec![Edge::new("start", "gate"), Edge::new("gate", "verdict")],
            routes: vec![ConditionalRoute {
                from: "verdict".into(),
                rules: vec![RouteRule {
                    when: RouteCondition::DataEquals {
                        key: APPROVAL_DECISION_KEY.into(),
                        value: json!("approved"),
                    },
                    label: "ship".into(),
                }],
                fallback: Some("drop".into()),
                targets: HashMap::from([
                    ("ship".to_string(), "shipped".to_string()),
                    ("drop".to_string(), "dropped".to_string()),
                ]),
            }],
            entry: "start".into(),
        }
    }

    async fn wait_for_status(
        store: &SqliteStore,
        id: &RunId,
        want: ExecutionStatus,
    ) -> ExecutionRecord {
        for _ in 0..500 {
            let record = store.load_execution(id).unwrap().unwrap();
            if record.status == want {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run never reached {:?}", want);
    }

    struct Dispatched {
        store: Arc<SqliteStore>,
        handle: DispatcherHandle,
        cancel: CancellationToken,
    }

    fn spawn_dispatcher(config: EngineConfig, registry: HandlerRegistry) -> Dispatched {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::new(
            store.clone(),
            Arc::new(registry),
            Arc::new(EventBus::default()),
            config,
            cancel.clone(),
        );
        let handle = dispatcher.handle();
        tokio::spawn(dispatcher.run());
        Dispatched {
            store,
            handle,
            cancel,
        }
    }

    #[tokio::test]
    async fn enqueued_run_completes() {
        let d = spawn_dispatcher(engine_config(), HandlerRegistry::new());
        save_workflow(&d.store, linear_graph());

        let record = ExecutionRecord::new("wf-linear", "alice", json!({"who": "world"}));
        d.store.create_execution(&record).unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Completed).await;
        let output = finished.output.unwrap();
        assert_eq!(output["greeting"], json!("hi"));
        assert_eq!(output["who"], json!("world"));
        assert!(finished.completed_at.is_some());
        assert!(!finished.logs.is_empty());
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn missing_workflow_fails_run() {
        let d = spawn_dispatcher(engine_config(), HandlerRegistry::new());

        let record = ExecutionRecord::new("no-such-wf", "alice", json!(null));
        d.store.create_execution(&record).unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Failed).await;
        assert!(finished.error_message.unwrap().contains("no-such-wf"));
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn suspend_decide_resume_lifecycle() {
        let d = spawn_dispatcher(engine_config(), HandlerRegistry::new());
        save_workflow(&d.store, approval_graph());

        let record = ExecutionRecord::new("wf-approve", "alice", json!({"amount": 3}));
        d.store.create_execution(&record).unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        wait_for_status(&d.store, &record.id, ExecutionStatus::WaitingApproval).await;
        let gates = d.store.list_gates_for_execution(&record.id).unwrap();
        assert_eq!(gates.len(), 1);
        assert!(d.store.load_checkpoint(&record.id).unwrap().is_some());

        d.store
            .decide_gate(&gates[0].id, "alice", ApprovalDecision::Approved, None)
            .unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Completed).await;
        let output = finished.output.unwrap();
        assert_eq!(output[APPROVAL_DECISION_KEY], json!("approved"));
        // Checkpoint is dropped once terminal
        assert!(d.store.load_checkpoint(&record.id).unwrap().is_none());
        d.cancel.cancel();
    }

    struct Stall;

    impl NodeHandler for Stall {
        fn name(&self) -> &str {
            "stall"
        }

        fn invoke(
            &self,
            _config: &serde_json::Map<String, serde_json::Value>,
            _data: &serde_json::Map<String, serde_json::Value>,
        ) -> BoxFuture<'_, Result<HandlerOutput>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(600)).await;
                Ok(HandlerOutput::empty())
            })
        }
    }

    #[tokio::test]
    async fn deadline_force_fails_stalled_run() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Stall));
        let mut config = engine_config();
        config.run_deadline_secs = 1;
        let d = spawn_dispatcher(config, registry);

        let graph = Graph {
            id: "wf-stall".into(),
            name: "stall".into(),
            nodes: vec![
                Node::start("start"),
                Node::action("work", "stall"),
                Node::end("done"),
            ],
            edges: vec![Edge::new("start", "work"), Edge::new("work", "done")],
            routes: vec![],
            entry: "start".into(),
        };
        save_workflow(&d.store, graph);

        let record = ExecutionRecord::new("wf-stall", "alice", json!(null));
        d.store.create_execution(&record).unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Failed).await;
        assert!(finished.error_message.unwrap().contains("deadline"));
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_dropped() {
        let d = spawn_dispatcher(engine_config(), HandlerRegistry::new());
        save_workflow(&d.store, linear_graph());

        let record = ExecutionRecord::new("wf-linear", "alice", json!(null));
        d.store.create_execution(&record).unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();
        d.handle.enqueue(record.id.clone()).await.unwrap();

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Completed).await;
        // Exactly one pass through the graph
        let steps: Vec<_> = finished.logs.iter().map(|l| l.node_id.as_str()).collect();
        assert_eq!(steps, vec!["start", "greet", "done"]);
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn stranded_running_run_recovers_at_boot() {
        let d = spawn_dispatcher(engine_config(), HandlerRegistry::new());
        save_workflow(&d.store, linear_graph());

        // A previous process claimed the run, checkpointed past `start`,
        // then died without settling the row.
        let record = ExecutionRecord::new("wf-linear", "alice", json!(null));
        d.store.create_execution(&record).unwrap();
        d.store
            .transition_execution(&record.id, ExecutionStatus::Pending, ExecutionStatus::Running)
            .unwrap();
        let mut state =
            ExecutionState::new(record.id.clone(), "greet", json!({"crash": "survivor"}));
        state.iteration_count = 1;
        d.store.save_checkpoint(&state).unwrap();

        assert_eq!(recover_stranded_runs(&d.store, &d.handle).await.unwrap(), 1);

        let finished = wait_for_status(&d.store, &record.id, ExecutionStatus::Completed).await;
        let output = finished.output.unwrap();
        // Resumed from the checkpoint, not restarted at the entry
        assert_eq!(output["crash"], json!("survivor"));
        assert_eq!(output["greeting"], json!("hi"));
        d.cancel.cancel();
    }

    #[tokio::test]
    async fn sweep_cancels_expired_gate_and_run() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let events = EventBus::default();
        save_workflow(&store, approval_graph());

        let record = ExecutionRecord::new("wf-approve", "alice", json!(null));
        store.create_execution(&record).unwrap();
        store
            .transition_execution(&record.id, ExecutionStatus::Pending, ExecutionStatus::Running)
            .unwrap();
        store
            .transition_execution(
                &record.id,
                ExecutionStatus::Running,
                ExecutionStatus::WaitingApproval,
            )
            .unwrap();

        let gate = trellis_core::types::ApprovalGate {
            id: "g-exp".into(),
            execution_id: record.id.clone(),
            workflow_id: "wf-approve".into(),
            node_id: "gate".into(),
            approver: None,
            message: None,
            payload: json!({}),
            status: ApprovalStatus::Pending,
            decision_notes: None,
            decided_by: None,
            decided_at: None,
            consumed_at: None,
            created_at: Utc::now(),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(5)),
        };
        store.create_gate(&gate).unwrap();

        assert_eq!(sweep_expired_gates(&store, &events).unwrap(), 1);

        let rec = store.load_execution(&record.id).unwrap().unwrap();
        assert_eq!(rec.status, ExecutionStatus::Cancelled);
        assert_eq!(
            store.load_gate("g-exp").unwrap().unwrap().status,
            ApprovalStatus::Cancelled
        );

        // Second pass finds nothing
        assert_eq!(sweep_expired_gates(&store, &events).unwrap(), 0);
    }
}
