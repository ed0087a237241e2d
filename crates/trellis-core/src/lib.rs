pub mod config;
pub mod error;
pub mod event;
pub mod graph;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, TrellisError};
pub use event::{EngineEvent, EventBus};
pub use graph::{Graph, Node, NodeKind};
pub use state::{ExecutionState, APPROVAL_DECISION_KEY};
pub use types::*;
