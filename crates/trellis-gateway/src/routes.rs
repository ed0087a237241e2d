use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use rand::Rng;
use serde::Deserialize;
use tracing::{info, warn};

use trellis_core::error::TrellisError;
use trellis_core::event::EngineEvent;
use trellis_core::graph::{self, ConditionalRoute, Edge, Graph, Node};
use trellis_core::types::{
    ApprovalDecision, ExecutionRecord, ExecutionStatus, RunId, WebhookEndpoint, WorkflowRecord,
};

use crate::middleware::Authenticated;
use crate::state::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);
type ApiResult<T> = Result<T, ApiError>;

fn api_error(e: TrellisError) -> ApiError {
    let code = match &e {
        TrellisError::WorkflowNotFound(_)
        | TrellisError::ExecutionNotFound(_)
        | TrellisError::GateNotFound(_)
        | TrellisError::NodeNotFound(_)
        | TrellisError::WebhookNotFound => StatusCode::NOT_FOUND,
        TrellisError::Forbidden(_) | TrellisError::WebhookDisabled => StatusCode::FORBIDDEN,
        TrellisError::AlreadyDecided(_) | TrellisError::Expired(_) | TrellisError::Validation(_) => {
            StatusCode::BAD_REQUEST
        }
        TrellisError::InvalidTransition { .. } => StatusCode::CONFLICT,
        TrellisError::InvalidSignature => StatusCode::UNAUTHORIZED,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        warn!(error = %e, "internal error serving request");
    }
    (code, Json(serde_json::json!({"error": e.to_string()})))
}

fn not_found(what: &str) -> ApiError {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": format!("{} not found", what)})),
    )
}

const HEX: &[u8; 16] = b"0123456789abcdef";

fn random_hex(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| HEX[rng.gen_range(0..16)] as char).collect()
}

// GET /api/health — no auth required
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Workflows ───────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateWorkflowBody {
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub routes: Vec<ConditionalRoute>,
    pub entry: String,
}

// POST /api/workflows
pub async fn create_workflow(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateWorkflowBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let graph = Graph {
        id: uuid::Uuid::new_v4().to_string(),
        name: body.name.clone(),
        nodes: body.nodes,
        edges: body.edges,
        routes: body.routes,
        entry: body.entry,
    };

    let report = graph::validate(&graph);
    if !report.is_valid() {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(serde_json::json!({
                "error": "graph validation failed",
                "errors": report.errors,
                "warnings": report.warnings,
            })),
        ));
    }

    let now = Utc::now();
    let record = WorkflowRecord {
        id: graph.id.clone(),
        user_id: auth.user.clone(),
        name: body.name,
        graph,
        created_at: now,
        updated_at: now,
    };
    state.store.save_workflow(&record).map_err(api_error)?;
    info!(workflow_id = %record.id, user = %auth.user, "workflow created");

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "id": record.id,
            "name": record.name,
            "warnings": report.warnings,
        })),
    ))
}

// GET /api/workflows
pub async fn list_workflows(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let workflows = state.store.list_workflows(&auth.user).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "workflows": workflows })))
}

fn load_owned_workflow(
    state: &AppState,
    user: &str,
    id: &str,
) -> ApiResult<WorkflowRecord> {
    let record = state
        .store
        .load_workflow(id)
        .map_err(api_error)?
        .filter(|w| w.user_id == user)
        .ok_or_else(|| not_found("workflow"))?;
    Ok(record)
}

// GET /api/workflows/{id}
pub async fn get_workflow(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<WorkflowRecord>> {
    Ok(Json(load_owned_workflow(&state, &auth.user, &id)?))
}

// DELETE /api/workflows/{id}
pub async fn delete_workflow(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state
        .store
        .delete_workflow(&id, &auth.user)
        .map_err(api_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("workflow"))
    }
}

// ── Executions ──────────────────────────────────────────────────

#[derive(Deserialize, Default)]
pub struct ExecuteBody {
    #[serde(default)]
    pub input: serde_json::Value,
}

// POST /api/workflows/{id}/execute
pub async fn execute_workflow(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<ExecuteBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let workflow = load_owned_workflow(&state, &auth.user, &id)?;

    let record = ExecutionRecord::new(&workflow.id, &auth.user, body.input);
    state.store.create_execution(&record).map_err(api_error)?;
    state
        .dispatcher
        .enqueue(record.id.clone())
        .await
        .map_err(api_error)?;
    info!(workflow_id = %workflow.id, execution_id = %record.id, "execution enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "execution_id": record.id.to_string(),
            "status": record.status,
        })),
    ))
}

#[derive(Deserialize)]
pub struct ExecutionsQuery {
    #[serde(default)]
    pub workflow_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    50
}

// GET /api/executions?workflow_id=&limit=
pub async fn list_executions(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Query(q): Query<ExecutionsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let executions = state
        .store
        .list_executions(&auth.user, q.workflow_id.as_deref(), q.limit)
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "executions": executions })))
}

fn load_owned_execution(
    state: &AppState,
    user: &str,
    id: &str,
) -> ApiResult<ExecutionRecord> {
    let run_id = RunId::from_string(id);
    state
        .store
        .load_execution(&run_id)
        .map_err(api_error)?
        .filter(|r| r.user_id == user)
        .ok_or_else(|| not_found("execution"))
}

// GET /api/executions/{id}
pub async fn get_execution(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ExecutionRecord>> {
    Ok(Json(load_owned_execution(&state, &auth.user, &id)?))
}

// POST /api/executions/{id}/cancel
//
// Queued and suspended runs cancel immediately; an in-flight run gets the
// cooperative flag and its worker settles the record between steps.
pub async fn cancel_execution(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let record = load_owned_execution(&state, &auth.user, &id)?;

    let message = match record.status {
        ExecutionStatus::Pending | ExecutionStatus::WaitingApproval => {
            state
                .store
                .transition_execution(&record.id, record.status, ExecutionStatus::Cancelled)
                .map_err(api_error)?;
            state
                .store
                .cancel_gates_for_execution(&record.id)
                .map_err(api_error)?;
            state
                .store
                .delete_checkpoint(&record.id)
                .map_err(api_error)?;
            state.events.publish(EngineEvent::ExecutionFinished {
                execution_id: record.id.clone(),
                status: ExecutionStatus::Cancelled,
            });
            "cancelled"
        }
        ExecutionStatus::Running => {
            state.store.request_cancel(&record.id).map_err(api_error)?;
            "cancellation requested"
        }
        terminal => {
            return Err(api_error(TrellisError::InvalidTransition {
                from: terminal.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            }))
        }
    };

    info!(execution_id = %record.id, outcome = %message, "cancel requested");
    Ok(Json(serde_json::json!({
        "execution_id": record.id.to_string(),
        "status": message,
    })))
}

// ── Approvals ───────────────────────────────────────────────────

// GET /api/approvals/pending
pub async fn pending_approvals(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let gates = state
        .store
        .list_pending_gates(&auth.user)
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "approvals": gates })))
}

// GET /api/approvals/{id}
pub async fn get_approval(
    Authenticated(_auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<trellis_core::types::ApprovalGate>> {
    let gate = state
        .store
        .load_gate(&id)
        .map_err(api_error)?
        .ok_or_else(|| not_found("approval gate"))?;
    Ok(Json(gate))
}

#[derive(Deserialize)]
pub struct DecideBody {
    pub decision: ApprovalDecision,
    #[serde(default)]
    pub notes: Option<String>,
}

// POST /api/approvals/{id}/decide
//
// Approval and rejection both resume the run; the decision lands in the
// run's data and routing takes it from there. An expired gate is cancelled
// along with its suspended run.
pub async fn decide_approval(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<DecideBody>,
) -> ApiResult<Json<trellis_core::types::ApprovalGate>> {
    let gate = match state
        .store
        .decide_gate(&id, &auth.user, body.decision, body.notes.as_deref())
    {
        Ok(gate) => gate,
        Err(TrellisError::Expired(gate_id)) => {
            if let Ok(Some(gate)) = state.store.load_gate(&gate_id) {
                cancel_suspended_run(&state, &gate.execution_id);
            }
            return Err(api_error(TrellisError::Expired(gate_id)));
        }
        Err(e) => return Err(api_error(e)),
    };

    state.events.publish(EngineEvent::ApprovalResolved {
        gate_id: gate.id.clone(),
        decision: body.decision,
    });
    state
        .dispatcher
        .enqueue(gate.execution_id.clone())
        .await
        .map_err(api_error)?;
    info!(gate_id = %gate.id, decision = %body.decision.as_str(), decided_by = %auth.user,
          "approval decided, run re-enqueued");

    Ok(Json(gate))
}

// DELETE /api/approvals/{id} — cancel a pending gate and its run.
pub async fn delete_approval(
    Authenticated(_auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let gate = state
        .store
        .load_gate(&id)
        .map_err(api_error)?
        .ok_or_else(|| not_found("approval gate"))?;

    if !state.store.cancel_gate(&id).map_err(api_error)? {
        return Err(api_error(TrellisError::AlreadyDecided(id)));
    }
    cancel_suspended_run(&state, &gate.execution_id);
    Ok(StatusCode::NO_CONTENT)
}

/// Best-effort: a run whose gate went away is cancelled if it is still
/// suspended. If a worker holds it, the worker settles it instead.
fn cancel_suspended_run(state: &AppState, execution_id: &RunId) {
    match state.store.transition_execution(
        execution_id,
        ExecutionStatus::WaitingApproval,
        ExecutionStatus::Cancelled,
    ) {
        Ok(()) => {
            if let Err(e) = state.store.delete_checkpoint(execution_id) {
                warn!(execution_id = %execution_id, error = %e, "checkpoint cleanup failed");
            }
            state.events.publish(EngineEvent::ExecutionFinished {
                execution_id: execution_id.clone(),
                status: ExecutionStatus::Cancelled,
            });
        }
        Err(TrellisError::InvalidTransition { .. }) => {}
        Err(e) => warn!(execution_id = %execution_id, error = %e, "run cancel failed"),
    }
}

// ── Webhook endpoints ───────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateWebhookBody {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Explicit choice, not a default: unsigned endpoints must be asked for.
    pub require_signature: bool,
}

// POST /api/workflows/{id}/webhooks
//
// The secret appears in this response and nowhere else, ever.
pub async fn create_webhook(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CreateWebhookBody>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let workflow = load_owned_workflow(&state, &auth.user, &id)?;

    let secret = random_hex(64);
    let endpoint = WebhookEndpoint {
        id: uuid::Uuid::new_v4().to_string(),
        workflow_id: workflow.id.clone(),
        user_id: auth.user.clone(),
        token: random_hex(32),
        secret: secret.clone(),
        description: body.description,
        active: true,
        allowed_ips: body.allowed_ips,
        require_signature: body.require_signature,
        trigger_count: 0,
        last_triggered_at: None,
        created_at: Utc::now(),
    };
    state.store.create_endpoint(&endpoint).map_err(api_error)?;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "endpoint": endpoint,
            "secret": secret,
            "trigger_path": format!("/webhooks/trigger/{}", endpoint.token),
        })),
    ))
}

// GET /api/webhooks
pub async fn list_webhooks(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    let endpoints = state.store.list_endpoints(&auth.user).map_err(api_error)?;
    Ok(Json(serde_json::json!({ "webhooks": endpoints })))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

// GET /api/webhooks/{id}/logs
pub async fn webhook_logs(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let endpoint = state
        .store
        .load_endpoint(&id)
        .map_err(api_error)?
        .filter(|e| e.user_id == auth.user)
        .ok_or_else(|| not_found("webhook"))?;

    let logs = state
        .store
        .list_webhook_logs(&endpoint.id, q.limit)
        .map_err(api_error)?;
    Ok(Json(serde_json::json!({ "logs": logs })))
}

// DELETE /api/webhooks/{id}
pub async fn delete_webhook(
    Authenticated(auth): Authenticated,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    if state
        .store
        .delete_endpoint(&id, &auth.user)
        .map_err(api_error)?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("webhook"))
    }
}
