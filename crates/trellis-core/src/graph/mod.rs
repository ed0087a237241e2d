//! Workflow graph model — immutable description of a workflow.
//!
//! A workflow is a directed graph of `Node`s (actions, conditions, approval
//! gates) connected by plain `Edge`s and `ConditionalRoute`s. Plain edges
//! have a single deterministic target; conditional routes pick a target from
//! a label mapping based on the run's accumulated data, which is how loops
//! and approval-retry cycles are expressed.
//!
//! The graph is a pure value: created once from a workflow definition,
//! never mutated during a run. Cycles are legal — nodes live in a flat map
//! addressed by id, edges are explicit lists, so no cyclic ownership is
//! needed.

pub mod node;
pub mod route;
pub mod validate;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub use node::{ApprovalSpec, Node, NodeKind, RetryPolicy};
pub use route::{ConditionalRoute, RouteCondition, RouteRule};
pub use validate::{validate, ValidationReport};

/// An edge connecting two nodes. `label` is informational (shown in UIs and
/// logs); routing through labels is the job of `ConditionalRoute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            label: None,
        }
    }
}

/// An immutable workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Graph {
    pub id: String,
    pub name: String,
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    #[serde(default)]
    pub routes: Vec<ConditionalRoute>,
    pub entry: String,
}

impl Graph {
    /// Look up a node by id.
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The plain edge leaving `from`, if any.
    pub fn edge_from(&self, from: &str) -> Option<&Edge> {
        self.edges.iter().find(|e| e.from == from)
    }

    /// The conditional route leaving `from`, if any.
    pub fn route_from(&self, from: &str) -> Option<&ConditionalRoute> {
        self.routes.iter().find(|r| r.from == from)
    }

    /// Node ids indexed for quick membership checks.
    pub fn node_ids(&self) -> HashMap<&str, &Node> {
        self.nodes.iter().map(|n| (n.id.as_str(), n)).collect()
    }
}
