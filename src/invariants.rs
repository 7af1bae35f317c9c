use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;

use crate::error::{ErrorDetails, LibError, Result};
use crate::models::{Endpoints, NodeId};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphInvariantViolation {
    CycleDetected { path: Vec<NodeId> },
}

impl GraphInvariantViolation {
    pub const fn error_code(&self) -> &'static str {
        match self {
            GraphInvariantViolation::CycleDetected { .. } => "graph_cycle",
        }
    }

    pub const fn public_message(&self) -> &'static str {
        match self {
            GraphInvariantViolation::CycleDetected { .. } => "Graph must be acyclic",
        }
    }

    fn details(&self) -> ErrorDetails {
        match self {
            GraphInvariantViolation::CycleDetected { path } => ErrorDetails::CycleDetected {
                path: path.iter().map(|id| id.0.clone()).collect(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Unvisited,
    InProgress,
    Done,
}

/// Returns the first cycle found, as a closed path (`a -> b -> a`).
///
/// `node_ids` is the declared node universe and `edges` the complete edge set
/// that would exist after the mutation. Endpoints missing from `node_ids` are
/// still traversed. Traversal starts from declared nodes in the given order,
/// then from endpoint-only ids in edge order, so the reported path is
/// deterministic for a given input order.
pub fn find_cycle<'a, E>(
    node_ids: impl IntoIterator<Item = &'a NodeId>,
    edges: &'a [E],
) -> Option<Vec<NodeId>>
where
    E: Endpoints,
{
    let mut order: Vec<&NodeId> = Vec::new();
    let mut state: HashMap<&NodeId, VisitState> = HashMap::new();
    let mut admit = |id: &'a NodeId, order: &mut Vec<&'a NodeId>| {
        if state.insert(id, VisitState::Unvisited).is_none() {
            order.push(id);
        }
    };

    for id in node_ids {
        admit(id, &mut order);
    }

    let mut adjacency: HashMap<&NodeId, Vec<&NodeId>> = HashMap::new();
    for edge in edges {
        admit(edge.from_node(), &mut order);
        admit(edge.to_node(), &mut order);
        adjacency
            .entry(edge.from_node())
            .or_default()
            .push(edge.to_node());
    }

    for start in order {
        if state[start] != VisitState::Unvisited {
            continue;
        }

        let mut stack: Vec<(&NodeId, usize)> = vec![(start, 0)];
        state.insert(start, VisitState::InProgress);

        while let Some(&(node, next)) = stack.last() {
            let children = adjacency.get(node).map(Vec::as_slice).unwrap_or(&[]);
            let Some(&child) = children.get(next) else {
                state.insert(node, VisitState::Done);
                stack.pop();
                continue;
            };

            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }

            match state[child] {
                VisitState::InProgress => {
                    let begin = stack
                        .iter()
                        .position(|(id, _)| *id == child)
                        .unwrap_or_default();
                    let mut path: Vec<NodeId> =
                        stack[begin..].iter().map(|(id, _)| (*id).clone()).collect();
                    path.push(child.clone());
                    return Some(path);
                }
                VisitState::Unvisited => {
                    state.insert(child, VisitState::InProgress);
                    stack.push((child, 0));
                }
                VisitState::Done => {}
            }
        }
    }

    None
}

pub fn has_cycle<'a, E>(node_ids: impl IntoIterator<Item = &'a NodeId>, edges: &'a [E]) -> bool
where
    E: Endpoints,
{
    find_cycle(node_ids, edges).is_some()
}

pub fn graph_invariant_violations<'a, E>(
    node_ids: impl IntoIterator<Item = &'a NodeId>,
    edges: &'a [E],
) -> Vec<GraphInvariantViolation>
where
    E: Endpoints,
{
    find_cycle(node_ids, edges)
        .map(|path| vec![GraphInvariantViolation::CycleDetected { path }])
        .unwrap_or_default()
}

pub fn ensure_acyclic<'a, E>(
    node_ids: impl IntoIterator<Item = &'a NodeId>,
    edges: &'a [E],
) -> Result<()>
where
    E: Endpoints,
{
    let violations = graph_invariant_violations(node_ids, edges);
    if let Some(first) = violations.first() {
        return Err(LibError::invalid_with_code(
            first.error_code(),
            first.public_message(),
            anyhow!("graph invariant validation failed: {:?}", violations),
        )
        .with_details(first.details()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(value: &str) -> NodeId {
        NodeId::from(value)
    }

    fn edge(from: &str, to: &str) -> (NodeId, NodeId) {
        (id(from), id(to))
    }

    #[test]
    fn chain_is_acyclic() {
        let nodes = [id("q1"), id("q2"), id("q3")];
        let edges = [edge("q1", "q2"), edge("q2", "q3")];
        assert!(!has_cycle(&nodes, &edges));
        assert!(ensure_acyclic(&nodes, &edges).is_ok());
    }

    #[test]
    fn closing_edge_is_a_cycle() {
        let nodes = [id("q1"), id("q2"), id("q3")];
        let edges = [edge("q1", "q2"), edge("q2", "q3"), edge("q3", "q1")];
        let path = find_cycle(&nodes, &edges).expect("cycle should be found");
        assert_eq!(path, vec![id("q1"), id("q2"), id("q3"), id("q1")]);
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let nodes = [id("a")];
        let edges = [edge("a", "a")];
        assert_eq!(find_cycle(&nodes, &edges), Some(vec![id("a"), id("a")]));
    }

    #[test]
    fn diamond_is_acyclic() {
        let nodes = [id("a"), id("b"), id("c"), id("d")];
        let edges = [
            edge("a", "b"),
            edge("a", "c"),
            edge("b", "d"),
            edge("c", "d"),
        ];
        assert!(!has_cycle(&nodes, &edges));
    }

    #[test]
    fn parallel_edges_are_not_a_cycle() {
        let nodes = [id("a"), id("b")];
        let edges = [edge("a", "b"), edge("a", "b")];
        assert!(!has_cycle(&nodes, &edges));
    }

    #[test]
    fn undeclared_endpoints_are_still_traversed() {
        let nodes: [NodeId; 0] = [];
        let edges = [edge("x", "y"), edge("y", "x")];
        assert!(has_cycle(&nodes, &edges));
    }

    #[test]
    fn cycle_reachable_only_from_later_start_is_found() {
        let nodes = [id("root"), id("b"), id("c")];
        let edges = [edge("b", "c"), edge("c", "b")];
        let path = find_cycle(&nodes, &edges).expect("cycle should be found");
        assert_eq!(path.first(), path.last());
        assert!(path.contains(&id("b")) && path.contains(&id("c")));
    }

    #[test]
    fn long_chain_does_not_overflow() {
        let nodes: Vec<NodeId> = (0..50_000).map(|i| id(&format!("n{i}"))).collect();
        let edges: Vec<(NodeId, NodeId)> = nodes
            .windows(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect();
        assert!(!has_cycle(&nodes, &edges));
    }

    #[test]
    fn ensure_acyclic_reports_cycle_code_and_path() {
        let nodes = [id("a"), id("b")];
        let edges = [edge("a", "b"), edge("b", "a")];
        let err = ensure_acyclic(&nodes, &edges).expect_err("cycle should be rejected");
        assert_eq!(err.code, "graph_cycle");
        assert!(err.is_cycle());
        assert!(matches!(
            err.details,
            Some(ErrorDetails::CycleDetected { ref path }) if path == &["a", "b", "a"]
        ));
    }
}
