use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;

use trellis_core::config::GatewayConfig;
use trellis_core::event::EventBus;
use trellis_engine::DispatcherHandle;
use trellis_store::SqliteStore;

use crate::routes;
use crate::state::AppState;
use crate::webhook;

/// HTTP trigger API built on axum.
pub struct GatewayServer {
    config: GatewayConfig,
    store: Arc<SqliteStore>,
    events: Arc<EventBus>,
    dispatcher: DispatcherHandle,
}

impl GatewayServer {
    pub fn new(
        config: GatewayConfig,
        store: Arc<SqliteStore>,
        events: Arc<EventBus>,
        dispatcher: DispatcherHandle,
    ) -> Self {
        Self {
            config,
            store,
            events,
            dispatcher,
        }
    }

    pub fn router(&self) -> Router {
        let state = Arc::new(AppState {
            config: self.config.clone(),
            store: self.store.clone(),
            events: self.events.clone(),
            dispatcher: self.dispatcher.clone(),
        });

        Router::new()
            .route("/api/health", get(routes::health))
            // Workflows
            .route("/api/workflows", post(routes::create_workflow))
            .route("/api/workflows", get(routes::list_workflows))
            .route("/api/workflows/{id}", get(routes::get_workflow))
            .route("/api/workflows/{id}", delete(routes::delete_workflow))
            .route("/api/workflows/{id}/execute", post(routes::execute_workflow))
            .route("/api/workflows/{id}/webhooks", post(routes::create_webhook))
            // Executions
            .route("/api/executions", get(routes::list_executions))
            .route("/api/executions/{id}", get(routes::get_execution))
            .route("/api/executions/{id}/cancel", post(routes::cancel_execution))
            // Approvals
            .route("/api/approvals/pending", get(routes::pending_approvals))
            .route("/api/approvals/{id}", get(routes::get_approval))
            .route("/api/approvals/{id}/decide", post(routes::decide_approval))
            .route("/api/approvals/{id}", delete(routes::delete_approval))
            // Webhook management
            .route("/api/webhooks", get(routes::list_webhooks))
            .route("/api/webhooks/{id}/logs", get(routes::webhook_logs))
            .route("/api/webhooks/{id}", delete(routes::delete_webhook))
            // Public trigger surface
            .route("/webhooks/trigger/{token}", post(webhook::trigger))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    /// Run the gateway server until the cancellation token is triggered.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let app = self.router();

        let listener = TcpListener::bind(&self.config.bind).await?;
        info!(bind = %self.config.bind, "gateway listening");

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

        info!("gateway shut down");
        Ok(())
    }
}
