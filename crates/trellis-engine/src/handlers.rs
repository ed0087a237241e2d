use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use trellis_core::error::Result;
use trellis_core::traits::{HandlerOutput, NodeHandler};

/// Registry of named handler capabilities.
///
/// Action nodes reference handlers by name; resolution happens at
/// invocation time, so a workflow can be stored before every handler it
/// names exists.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
}

impl HandlerRegistry {
    /// Registry pre-loaded with the builtin handlers.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
        };
        registry.register(Arc::new(SetData));
        registry.register(Arc::new(Noop));
        registry
    }

    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        debug!(handler = %handler.name(), "handler registered");
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Builtin: merge the node's static config values into the run data.
struct SetData;

impl NodeHandler for SetData {
    fn name(&self) -> &str {
        "set_data"
    }

    fn invoke(
        &self,
        config: &serde_json::Map<String, serde_json::Value>,
        _data: &serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<HandlerOutput>> {
        let out = config.clone();
        Box::pin(async move { Ok(HandlerOutput::ok(out)) })
    }
}

/// Builtin: do nothing. Useful as a placeholder while sketching a workflow.
struct Noop;

impl NodeHandler for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    fn invoke(
        &self,
        _config: &serde_json::Map<String, serde_json::Value>,
        _data: &serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<HandlerOutput>> {
        Box::pin(async { Ok(HandlerOutput::empty()) })
    }
}
