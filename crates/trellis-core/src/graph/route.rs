use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Condition evaluated against the run's accumulated data. A pure function
/// of state: same data, same answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteCondition {
    /// Always matches.
    Always,
    /// Data value at `key` equals `value` exactly.
    DataEquals {
        key: String,
        value: serde_json::Value,
    },
    /// Data value at `key` is a truthy boolean, non-zero number, or
    /// non-empty string.
    DataTruthy { key: String },
    /// The node has been visited fewer than `count` times in this run.
    VisitsBelow { node: String, count: u32 },
    /// All sub-conditions match.
    All { conditions: Vec<RouteCondition> },
    /// At least one sub-condition matches.
    Any { conditions: Vec<RouteCondition> },
    /// Sub-condition does not match.
    Not { condition: Box<RouteCondition> },
}

impl RouteCondition {
    /// Evaluate against the run's data map and per-node visit counts.
    pub fn evaluate(
        &self,
        data: &serde_json::Map<String, serde_json::Value>,
        visits: &HashMap<String, u32>,
    ) -> bool {
        match self {
            Self::Always => true,
            Self::DataEquals { key, value } => data.get(key) == Some(value),
            Self::DataTruthy { key } => data.get(key).is_some_and(is_truthy),
            Self::VisitsBelow { node, count } => {
                visits.get(node).copied().unwrap_or(0) < *count
            }
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(data, visits)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(data, visits)),
            Self::Not { condition } => !condition.evaluate(data, visits),
        }
    }
}

fn is_truthy(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Null => false,
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
    }
}

/// One rule in a conditional route: when the condition matches, the route
/// produces `label`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub when: RouteCondition,
    pub label: String,
}

/// Data-dependent routing out of a condition node.
///
/// Rules are evaluated in order; the first match wins. If no rule matches,
/// `fallback` is used. The produced label is looked up in `targets` to find
/// the next node — and since rules are data, "every label has a target" is
/// checked statically by `validate()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConditionalRoute {
    pub from: String,
    pub rules: Vec<RouteRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback: Option<String>,
    /// label -> target node id.
    pub targets: HashMap<String, String>,
}

impl ConditionalRoute {
    /// Produce the routing label for the current state, if any rule (or the
    /// fallback) applies.
    pub fn select_label(
        &self,
        data: &serde_json::Map<String, serde_json::Value>,
        visits: &HashMap<String, u32>,
    ) -> Option<&str> {
        for rule in &self.rules {
            if rule.when.evaluate(data, visits) {
                return Some(rule.label.as_str());
            }
        }
        self.fallback.as_deref()
    }

    /// All labels this route can produce.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .map(|r| r.label.as_str())
            .chain(self.fallback.as_deref())
    }
}
