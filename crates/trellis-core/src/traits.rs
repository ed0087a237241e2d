use futures::future::BoxFuture;

use crate::error::Result;

/// Output of one handler invocation: updated data values (merged into the
/// run's data map) and a success flag.
#[derive(Debug, Clone)]
pub struct HandlerOutput {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub ok: bool,
}

impl HandlerOutput {
    pub fn ok(data: serde_json::Map<String, serde_json::Value>) -> Self {
        Self { data, ok: true }
    }

    pub fn empty() -> Self {
        Self {
            data: serde_json::Map::new(),
            ok: true,
        }
    }
}

/// Node handler capability — the uniform interface through which the engine
/// invokes concrete actions (send an email, call an API, run an agent).
///
/// Implementations must be idempotent or consult the run's history before
/// performing side effects: the dispatcher is at-least-once, and a worker
/// crash after partial progress is retried from the last checkpoint.
///
/// Failures are classified through the error enum: `HandlerTransient` is
/// retried with backoff when the node carries a retry budget; anything else
/// faults the run.
pub trait NodeHandler: Send + Sync + 'static {
    /// Handler name (referenced by action nodes).
    fn name(&self) -> &str;

    /// Invoke the handler with the node's static config and the run's
    /// current data.
    fn invoke(
        &self,
        config: &serde_json::Map<String, serde_json::Value>,
        data: &serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<HandlerOutput>>;
}
