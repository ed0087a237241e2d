use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use tracing::{info, warn};

use trellis_core::event::EngineEvent;
use trellis_core::types::{ExecutionRecord, RunId, WebhookEndpoint, WebhookLog};

use crate::signature;
use crate::state::AppState;

pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

/// POST /webhooks/trigger/{token} — public, signature-authenticated.
///
/// Checks run in a fixed order: unknown token, disabled endpoint, IP
/// allowlist, signature. Every call that resolves to an endpoint is audit
/// logged with its outcome, rejected or accepted alike; only an unknown
/// token leaves no trace (there is no endpoint to attribute it to).
pub async fn trigger(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(payload): Json<serde_json::Value>,
) -> (StatusCode, Json<serde_json::Value>) {
    let start = Instant::now();
    let source_ip = addr.ip().to_string();

    let endpoint = match state.store.find_endpoint_by_token(&token) {
        Ok(Some(endpoint)) => endpoint,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({"error": "unknown webhook"})),
            )
        }
        Err(e) => {
            warn!(error = %e, "webhook lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": "internal error"})),
            );
        }
    };

    if !endpoint.active {
        return reject(
            &state,
            &endpoint,
            &source_ip,
            StatusCode::FORBIDDEN,
            "endpoint disabled",
            start,
        );
    }

    if !endpoint.allowed_ips.is_empty() && !endpoint.allowed_ips.contains(&source_ip) {
        return reject(
            &state,
            &endpoint,
            &source_ip,
            StatusCode::FORBIDDEN,
            "source ip not allowed",
            start,
        );
    }

    let provided = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    match provided {
        Some(sig) => {
            if !signature::verify(&endpoint.secret, &payload, sig) {
                return reject(
                    &state,
                    &endpoint,
                    &source_ip,
                    StatusCode::UNAUTHORIZED,
                    "invalid signature",
                    start,
                );
            }
        }
        None if endpoint.require_signature => {
            return reject(
                &state,
                &endpoint,
                &source_ip,
                StatusCode::UNAUTHORIZED,
                "missing signature",
                start,
            );
        }
        None => {}
    }

    // Accepted: create the run, enqueue, bump the trigger counter.
    let record = ExecutionRecord::new(&endpoint.workflow_id, &endpoint.user_id, payload);
    let accepted = state
        .store
        .create_execution(&record)
        .and_then(|_| state.store.record_trigger(&endpoint.id));
    if let Err(e) = accepted {
        warn!(endpoint_id = %endpoint.id, error = %e, "webhook accept failed");
        return reject(
            &state,
            &endpoint,
            &source_ip,
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error",
            start,
        );
    }
    if state.dispatcher.enqueue(record.id.clone()).await.is_err() {
        return reject(
            &state,
            &endpoint,
            &source_ip,
            StatusCode::SERVICE_UNAVAILABLE,
            "dispatcher unavailable",
            start,
        );
    }

    audit(
        &state,
        &endpoint,
        Some(record.id.clone()),
        &source_ip,
        StatusCode::OK,
        "accepted",
        start,
    );
    info!(endpoint_id = %endpoint.id, execution_id = %record.id, source_ip = %source_ip,
          "webhook trigger accepted");

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "execution_id": record.id.to_string(),
            "status": "pending",
        })),
    )
}

fn reject(
    state: &AppState,
    endpoint: &WebhookEndpoint,
    source_ip: &str,
    code: StatusCode,
    message: &str,
    start: Instant,
) -> (StatusCode, Json<serde_json::Value>) {
    info!(endpoint_id = %endpoint.id, source_ip = %source_ip, code = %code.as_u16(),
          reason = %message, "webhook trigger rejected");
    audit(state, endpoint, None, source_ip, code, message, start);
    (code, Json(serde_json::json!({"error": message})))
}

fn audit(
    state: &AppState,
    endpoint: &WebhookEndpoint,
    execution_id: Option<RunId>,
    source_ip: &str,
    code: StatusCode,
    message: &str,
    start: Instant,
) {
    let log = WebhookLog {
        id: uuid::Uuid::new_v4().to_string(),
        endpoint_id: endpoint.id.clone(),
        execution_id,
        source_ip: source_ip.to_string(),
        status_code: code.as_u16(),
        message: message.to_string(),
        processing_time_ms: start.elapsed().as_millis() as u64,
        created_at: Utc::now(),
    };
    if let Err(e) = state.store.append_webhook_log(&log) {
        warn!(endpoint_id = %endpoint.id, error = %e, "failed to write webhook audit log");
    }
    state.events.publish(EngineEvent::WebhookReceived {
        endpoint_id: endpoint.id.clone(),
        status_code: code.as_u16(),
    });
}
