use std::sync::Arc;

use trellis_core::config::GatewayConfig;
use trellis_core::event::EventBus;
use trellis_engine::DispatcherHandle;
use trellis_store::SqliteStore;

/// Shared application state for axum handlers.
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Arc<SqliteStore>,
    pub events: Arc<EventBus>,
    pub dispatcher: DispatcherHandle,
}
