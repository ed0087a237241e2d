use std::collections::{HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use super::{Graph, NodeKind};

/// Result of validating a graph. Fatal errors make the graph unexecutable;
/// warnings flag suspicious but legal structure (orphan nodes, unreachable
/// branches).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validate a workflow graph. Never mutates the graph; idempotent.
pub fn validate(graph: &Graph) -> ValidationReport {
    let mut report = ValidationReport::default();

    if graph.nodes.is_empty() {
        report.errors.push("graph has no nodes".to_string());
        return report;
    }

    // Duplicate ids
    let mut seen = HashSet::new();
    for node in &graph.nodes {
        if !seen.insert(node.id.as_str()) {
            report
                .errors
                .push(format!("duplicate node id '{}'", node.id));
        }
    }

    let ids: HashSet<&str> = graph.nodes.iter().map(|n| n.id.as_str()).collect();

    // Entry must exist
    if !ids.contains(graph.entry.as_str()) {
        report
            .errors
            .push(format!("entry point '{}' not in node set", graph.entry));
    }

    // Edge endpoints must exist
    for edge in &graph.edges {
        if !ids.contains(edge.from.as_str()) {
            report
                .errors
                .push(format!("edge source '{}' not in node set", edge.from));
        }
        if !ids.contains(edge.to.as_str()) {
            report
                .errors
                .push(format!("edge target '{}' not in node set", edge.to));
        }
    }

    // Route endpoints and label mappings
    for route in &graph.routes {
        if !ids.contains(route.from.as_str()) {
            report
                .errors
                .push(format!("route source '{}' not in node set", route.from));
        }
        for (label, target) in &route.targets {
            if !ids.contains(target.as_str()) {
                report.errors.push(format!(
                    "route from '{}' maps label '{}' to unknown node '{}'",
                    route.from, label, target
                ));
            }
        }
        // Rules are data, so every producible label is checkable here
        for label in route.labels() {
            if !route.targets.contains_key(label) {
                report.errors.push(format!(
                    "route from '{}' can produce label '{}' with no target",
                    route.from, label
                ));
            }
        }
    }

    // Every non-terminal node needs a way out
    for node in &graph.nodes {
        if node.kind == NodeKind::End {
            continue;
        }
        let has_edge = graph.edges.iter().any(|e| e.from == node.id);
        let has_route = graph.routes.iter().any(|r| r.from == node.id);
        if !has_edge && !has_route {
            report.errors.push(format!(
                "non-terminal node '{}' has no outgoing edge or route",
                node.id
            ));
        }
    }

    // Reachability from entry (warning only)
    let adjacency = adjacency(graph);
    let mut reachable = HashSet::new();
    let mut queue = VecDeque::new();
    if ids.contains(graph.entry.as_str()) {
        reachable.insert(graph.entry.as_str());
        queue.push_back(graph.entry.as_str());
    }
    while let Some(id) = queue.pop_front() {
        for next in adjacency.get(id).into_iter().flatten() {
            if reachable.insert(next) {
                queue.push_back(next);
            }
        }
    }
    for node in &graph.nodes {
        if !reachable.contains(node.id.as_str()) {
            report
                .warnings
                .push(format!("node '{}' unreachable from entry", node.id));
        }
    }

    // Orphans: non-entry nodes with no incoming edge or route target
    let mut incoming: HashSet<&str> = HashSet::new();
    for edge in &graph.edges {
        incoming.insert(edge.to.as_str());
    }
    for route in &graph.routes {
        for target in route.targets.values() {
            incoming.insert(target.as_str());
        }
    }
    for node in &graph.nodes {
        if node.id != graph.entry && !incoming.contains(node.id.as_str()) {
            report
                .warnings
                .push(format!("node '{}' has no incoming edge", node.id));
        }
    }

    report
}

fn adjacency(graph: &Graph) -> HashMap<&str, Vec<&str>> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        adj.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    for route in &graph.routes {
        for target in route.targets.values() {
            adj.entry(route.from.as_str())
                .or_default()
                .push(target.as_str());
        }
    }
    adj
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ConditionalRoute, Edge, Node, RouteCondition, RouteRule};

    fn linear() -> Graph {
        Graph {
            id: "g".into(),
            name: "linear".into(),
            nodes: vec![
                Node::start("start"),
                Node::action("work", "noop"),
                Node::end("done"),
            ],
            edges: vec![Edge::new("start", "work"), Edge::new("work", "done")],
            routes: vec![],
            entry: "start".into(),
        }
    }

    #[test]
    fn valid_linear_graph() {
        let report = validate(&linear());
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn validate_is_idempotent() {
        let g = linear();
        let first = validate(&g);
        let second = validate(&g);
        assert_eq!(first.errors, second.errors);
        assert_eq!(first.warnings, second.warnings);
    }

    #[test]
    fn empty_graph_is_fatal() {
        let g = Graph {
            id: "g".into(),
            name: "empty".into(),
            nodes: vec![],
            edges: vec![],
            routes: vec![],
            entry: "start".into(),
        };
        let report = validate(&g);
        assert!(!report.is_valid());
    }

    #[test]
    fn missing_entry_is_fatal() {
        let mut g = linear();
        g.entry = "nowhere".into();
        let report = validate(&g);
        assert!(report.errors.iter().any(|e| e.contains("entry point")));
    }

    #[test]
    fn duplicate_ids_are_fatal() {
        let mut g = linear();
        g.nodes.push(Node::action("work", "other"));
        let report = validate(&g);
        assert!(report.errors.iter().any(|e| e.contains("duplicate")));
    }

    #[test]
    fn dangling_edge_is_fatal() {
        let mut g = linear();
        g.edges.push(Edge::new("work", "ghost"));
        let report = validate(&g);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("edge target 'ghost'")));
    }

    #[test]
    fn dead_end_node_is_fatal() {
        let mut g = linear();
        g.edges.retain(|e| e.from != "work");
        let report = validate(&g);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("no outgoing edge")));
    }

    #[test]
    fn route_label_without_target_is_fatal() {
        let mut g = linear();
        g.nodes.push(Node::condition("check"));
        g.edges.retain(|e| e.from != "work");
        g.edges.push(Edge::new("work", "check"));
        g.routes.push(ConditionalRoute {
            from: "check".into(),
            rules: vec![RouteRule {
                when: RouteCondition::Always,
                label: "missing_label".into(),
            }],
            fallback: None,
            targets: [("other".to_string(), "done".to_string())].into(),
        });
        let report = validate(&g);
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("label 'missing_label' with no target")));
    }

    #[test]
    fn unreachable_node_is_warning_not_error() {
        let mut g = linear();
        g.nodes.push(Node::action("island", "noop"));
        g.edges.push(Edge::new("island", "done"));
        let report = validate(&g);
        assert!(report.is_valid());
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("'island' unreachable")));
        assert!(report
            .warnings
            .iter()
            .any(|w| w.contains("'island' has no incoming edge")));
    }

    #[test]
    fn cycle_through_route_is_valid() {
        // start -> check -[retry]-> work -> check (loop), check -[done]-> end
        let g = Graph {
            id: "g".into(),
            name: "loop".into(),
            nodes: vec![
                Node::start("start"),
                Node::condition("check"),
                Node::action("work", "noop"),
                Node::end("end"),
            ],
            edges: vec![Edge::new("start", "check"), Edge::new("work", "check")],
            routes: vec![ConditionalRoute {
                from: "check".into(),
                rules: vec![RouteRule {
                    when: RouteCondition::DataTruthy {
                        key: "finished".into(),
                    },
                    label: "done".into(),
                }],
                fallback: Some("retry".into()),
                targets: [
                    ("done".to_string(), "end".to_string()),
                    ("retry".to_string(), "work".to_string()),
                ]
                .into(),
            }],
            entry: "start".into(),
        };
        let report = validate(&g);
        assert!(report.is_valid(), "errors: {:?}", report.errors);
    }
}
