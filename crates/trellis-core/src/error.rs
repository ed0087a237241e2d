use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Graph definition errors — surfaced at creation time, never at runtime
    #[error("Graph validation failed: {0}")]
    Validation(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    // Handler errors
    #[error("Handler not found: {0}")]
    HandlerNotFound(String),

    #[error("Handler failed: {node}: {message}")]
    HandlerFailed { node: String, message: String },

    #[error("Handler transient failure: {node}: {message}")]
    HandlerTransient { node: String, message: String },

    #[error("Handler exhausted retries: {node} after {attempts} attempts: {message}")]
    RetriesExhausted {
        node: String,
        attempts: u32,
        message: String,
    },

    // Execution faults
    #[error("Iteration limit exceeded ({0} steps)")]
    IterationLimit(u32),

    #[error("Unmapped routing label: {node} returned '{label}'")]
    UnmappedRoute { node: String, label: String },

    #[error("Node not found in graph: {0}")]
    NodeNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Run deadline exceeded after {0}s")]
    DeadlineExceeded(u64),

    #[error("Execution cancelled")]
    Cancelled,

    // Lifecycle conflicts
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Approval gate not found: {0}")]
    GateNotFound(String),

    #[error("Approval gate already decided: {0}")]
    AlreadyDecided(String),

    #[error("Approval gate expired: {0}")]
    Expired(String),

    // Authorization
    #[error("Not authorized: {0}")]
    Forbidden(String),

    #[error("Webhook endpoint not found")]
    WebhookNotFound,

    #[error("Webhook endpoint is disabled")]
    WebhookDisabled,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TrellisError {
    /// Whether this error is retryable with backoff. Only handler-reported
    /// transient failures qualify; everything else is terminal for the run
    /// or the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, TrellisError::HandlerTransient { .. })
    }
}

pub type Result<T> = std::result::Result<T, TrellisError>;
