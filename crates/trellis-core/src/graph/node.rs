use serde::{Deserialize, Serialize};

/// Node kind — exhaustive, so the stepper's core match never meets an
/// unknown node type at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Start,
    Action,
    Condition,
    Approval,
    End,
}

/// Retry budget for a retry-eligible action node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (so 3 means two retries).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base delay; doubled on each subsequent attempt.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-based, attempt 1 is the
    /// first retry). Exponential: base, 2*base, 4*base, ...
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        self.base_delay_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
    }
}

/// Configuration of the gate created when the stepper reaches an approval
/// node.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApprovalSpec {
    /// Designated approver (user id or email). `None` = any authenticated
    /// decider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Data keys copied into the gate's review payload.
    #[serde(default)]
    pub payload_keys: Vec<String>,
    /// Gate lifetime; expired pending gates are cancelled by the sweep.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in_secs: Option<u64>,
}

/// A node in the workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    #[serde(default)]
    pub name: String,
    /// Handler capability name, resolved by the registry at invocation time.
    /// Only meaningful for action nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    /// Static configuration passed to the handler alongside run data.
    #[serde(default)]
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Present iff the node is retry-eligible.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Present iff kind == Approval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalSpec>,
}

impl Node {
    pub fn start(id: impl Into<String>) -> Self {
        Self::of_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::of_kind(id, NodeKind::End)
    }

    pub fn action(id: impl Into<String>, handler: impl Into<String>) -> Self {
        let mut n = Self::of_kind(id, NodeKind::Action);
        n.handler = Some(handler.into());
        n
    }

    pub fn condition(id: impl Into<String>) -> Self {
        Self::of_kind(id, NodeKind::Condition)
    }

    pub fn approval(id: impl Into<String>, spec: ApprovalSpec) -> Self {
        let mut n = Self::of_kind(id, NodeKind::Approval);
        n.approval = Some(spec);
        n
    }

    fn of_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            kind,
            handler: None,
            config: serde_json::Map::new(),
            retry: None,
            approval: None,
        }
    }

    /// Set the static handler configuration.
    pub fn with_config(mut self, config: serde_json::Map<String, serde_json::Value>) -> Self {
        self.config = config;
        self
    }

    /// Mark the node retry-eligible.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_set_kind() {
        assert_eq!(Node::start("s").kind, NodeKind::Start);
        assert_eq!(Node::end("e").kind, NodeKind::End);
        assert_eq!(Node::condition("c").kind, NodeKind::Condition);

        let a = Node::action("a", "send_email");
        assert_eq!(a.kind, NodeKind::Action);
        assert_eq!(a.handler.as_deref(), Some("send_email"));

        let g = Node::approval("g", ApprovalSpec::default());
        assert_eq!(g.kind, NodeKind::Approval);
        assert!(g.approval.is_some());
    }

    #[test]
    fn retry_backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
        };
        assert_eq!(policy.delay_ms(1), 100);
        assert_eq!(policy.delay_ms(2), 200);
        assert_eq!(policy.delay_ms(3), 400);
    }

    #[test]
    fn kind_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&NodeKind::Approval).unwrap(),
            "\"approval\""
        );
        let parsed: NodeKind = serde_json::from_str("\"condition\"").unwrap();
        assert_eq!(parsed, NodeKind::Condition);
    }
}
