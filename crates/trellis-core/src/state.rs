use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::RunId;

/// Reserved data key the stepper writes approval decisions under, so the
/// next conditional route can branch on the outcome.
pub const APPROVAL_DECISION_KEY: &str = "approval_decision";

/// One step the run has taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub node: String,
    pub timestamp: DateTime<Utc>,
    /// "ok", "error", "suspended", "resumed", "retried", "routed:<label>"
    pub outcome: String,
}

/// Mutable state threaded through a single run.
///
/// Mutated only by the stepper, strictly sequentially — exactly one worker
/// owns a run at a time. The serialized form of this struct *is* the
/// checkpoint: persisted at a Suspend outcome and re-loaded verbatim on
/// resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub run_id: RunId,
    pub current_node: String,
    /// Side-channel values accumulated by node handlers.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// Global loop guard, incremented once per step.
    pub iteration_count: u32,
    /// Per-node visit counts, for loop-specific routing conditions.
    pub visits: HashMap<String, u32>,
    /// Errors accumulated along the way (retries that later succeeded
    /// included).
    pub errors: Vec<String>,
    pub history: Vec<HistoryEntry>,
}

impl ExecutionState {
    /// Fresh state positioned at the graph entry with the trigger's input
    /// as initial data.
    pub fn new(run_id: RunId, entry: impl Into<String>, input: serde_json::Value) -> Self {
        let data = match input {
            serde_json::Value::Object(map) => map,
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };
        Self {
            run_id,
            current_node: entry.into(),
            data,
            iteration_count: 0,
            visits: HashMap::new(),
            errors: Vec::new(),
            history: Vec::new(),
        }
    }

    /// Record a history entry for a node outcome.
    pub fn record(&mut self, node: &str, outcome: impl Into<String>) {
        self.history.push(HistoryEntry {
            node: node.to_string(),
            timestamp: Utc::now(),
            outcome: outcome.into(),
        });
    }

    /// Bump the visit counter for a node, returning the new count.
    pub fn visit(&mut self, node: &str) -> u32 {
        let count = self.visits.entry(node.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Merge handler output into the data map (overwrites on conflict).
    pub fn merge(&mut self, other: serde_json::Map<String, serde_json::Value>) {
        for (k, v) in other {
            self.data.insert(k, v);
        }
    }

    /// Serialize for checkpoint storage.
    pub fn to_checkpoint(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Restore from a stored checkpoint.
    pub fn from_checkpoint(json: &str) -> crate::error::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_state_from_object_input() {
        let state = ExecutionState::new(RunId::new(), "start", json!({"topic": "rust"}));
        assert_eq!(state.current_node, "start");
        assert_eq!(state.data.get("topic"), Some(&json!("rust")));
        assert_eq!(state.iteration_count, 0);
    }

    #[test]
    fn new_state_wraps_scalar_input() {
        let state = ExecutionState::new(RunId::new(), "start", json!("plain text"));
        assert_eq!(state.data.get("input"), Some(&json!("plain text")));

        let state = ExecutionState::new(RunId::new(), "start", json!(null));
        assert!(state.data.is_empty());
    }

    #[test]
    fn visit_counts_accumulate() {
        let mut state = ExecutionState::new(RunId::new(), "start", json!(null));
        assert_eq!(state.visit("retry"), 1);
        assert_eq!(state.visit("retry"), 2);
        assert_eq!(state.visit("other"), 1);
        assert_eq!(state.visits["retry"], 2);
    }

    #[test]
    fn checkpoint_round_trip() {
        let mut state = ExecutionState::new(RunId::from_string("run-1"), "work", json!({"n": 1}));
        state.iteration_count = 7;
        state.visit("work");
        state.record("work", "ok");
        state.errors.push("transient: timeout".to_string());

        let json = state.to_checkpoint().unwrap();
        let restored = ExecutionState::from_checkpoint(&json).unwrap();

        assert_eq!(restored.run_id, state.run_id);
        assert_eq!(restored.current_node, "work");
        assert_eq!(restored.iteration_count, 7);
        assert_eq!(restored.visits["work"], 1);
        assert_eq!(restored.history.len(), 1);
        assert_eq!(restored.errors, state.errors);
        assert_eq!(restored.data.get("n"), Some(&json!(1)));
    }
}
