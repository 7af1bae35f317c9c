use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use uuid::Uuid;

use crate::error::{EdgeSide, ErrorDetails, LibError, Result};
use crate::models::{
    EdgeDraft, EdgeId, GraphDefinition, NewEdge, NewNode, NodeDraft, NodeId, ReplaceGraphPayload,
    default_data, present,
};

/// Source of fresh, collision-resistant identifiers.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn generate(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

impl ReplaceGraphPayload {
    pub fn resolve(self, ids: &dyn IdGenerator) -> Result<GraphDefinition> {
        resolve_graph(self, ids)
    }
}

/// Assigns ids and turns every ref into a concrete node id.
///
/// Pure: nothing is read or written, so a failure here leaves no trace.
/// The returned definition carries no refs.
pub fn resolve_graph(payload: ReplaceGraphPayload, ids: &dyn IdGenerator) -> Result<GraphDefinition> {
    let (nodes, refs) = resolve_nodes(payload.nodes, ids)?;
    let edges = payload
        .edges
        .into_iter()
        .map(|edge| resolve_edge(edge, &refs, ids))
        .collect::<Result<Vec<_>>>()?;

    Ok(GraphDefinition { nodes, edges })
}

fn resolve_nodes(
    nodes: Vec<NewNode>,
    ids: &dyn IdGenerator,
) -> Result<(Vec<NodeDraft>, HashMap<String, NodeId>)> {
    let mut seen_ids = HashSet::with_capacity(nodes.len());
    let mut refs = HashMap::new();
    let mut output = Vec::with_capacity(nodes.len());

    for node in nodes {
        let node_id = match present(node.id.as_ref().map(NodeId::as_str)) {
            Some(id) => NodeId::from(id),
            None => NodeId(ids.generate()),
        };

        if !seen_ids.insert(node_id.clone()) {
            return Err(LibError::invalid_with_code(
                "duplicate_node_id",
                "Node IDs must be unique within a graph",
                anyhow!("duplicate node id {}", node_id),
            ));
        }

        if let Some(label) = present(node.node_ref.as_deref()) {
            if refs.insert(label.to_string(), node_id.clone()).is_some() {
                return Err(LibError::invalid_with_code(
                    "duplicate_node_ref",
                    "Node refs must be unique within a request",
                    anyhow!("duplicate node ref {:?}", label),
                )
                .with_details(ErrorDetails::DuplicateReference {
                    reference: label.to_string(),
                }));
            }
        }

        output.push(NodeDraft {
            id: node_id,
            data: default_data(node.data),
        });
    }

    Ok((output, refs))
}

fn resolve_edge(
    edge: NewEdge,
    refs: &HashMap<String, NodeId>,
    ids: &dyn IdGenerator,
) -> Result<EdgeDraft> {
    let from_node_id = resolve_endpoint(
        edge.from_node_id.as_ref(),
        edge.from_node_ref.as_deref(),
        refs,
        EdgeSide::From,
    )?;
    let to_node_id = resolve_endpoint(
        edge.to_node_id.as_ref(),
        edge.to_node_ref.as_deref(),
        refs,
        EdgeSide::To,
    )?;
    let id = match present(edge.id.as_ref().map(EdgeId::as_str)) {
        Some(id) => EdgeId::from(id),
        None => EdgeId(ids.generate()),
    };

    Ok(EdgeDraft {
        id,
        from_node_id,
        to_node_id,
        data: default_data(edge.data),
    })
}

fn resolve_endpoint(
    node_id: Option<&NodeId>,
    node_ref: Option<&str>,
    refs: &HashMap<String, NodeId>,
    side: EdgeSide,
) -> Result<NodeId> {
    if let Some(id) = present(node_id.map(NodeId::as_str)) {
        return Ok(NodeId::from(id));
    }

    match present(node_ref) {
        Some(label) => refs
            .get(label)
            .cloned()
            .ok_or_else(|| LibError::unknown_reference(label, side)),
        None => Err(LibError::invalid_with_code(
            "missing_edge_endpoint",
            "Edge endpoints need a node id or a node ref",
            anyhow!("edge has no {}_node_id or {}_node_ref", side.as_str(), side.as_str()),
        )),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    /// Deterministic ids for assertions: `id-1`, `id-2`, ...
    #[derive(Debug, Default)]
    pub(crate) struct SequentialIds(AtomicUsize);

    impl IdGenerator for SequentialIds {
        fn generate(&self) -> String {
            format!("id-{}", self.0.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    fn node(node_ref: &str, data: serde_json::Value) -> NewNode {
        NewNode {
            id: None,
            node_ref: Some(node_ref.to_string()),
            data: Some(data),
        }
    }

    fn ref_edge(from: &str, to: &str) -> NewEdge {
        NewEdge {
            from_node_ref: Some(from.to_string()),
            to_node_ref: Some(to.to_string()),
            ..NewEdge::default()
        }
    }

    #[test]
    fn refs_resolve_to_generated_ids() {
        let payload = ReplaceGraphPayload {
            nodes: vec![node("a", json!({"n": 1})), node("b", json!({"n": 2}))],
            edges: vec![NewEdge {
                data: Some(json!({"n": 3})),
                ..ref_edge("a", "b")
            }],
        };

        let resolved = resolve_graph(payload, &SequentialIds::default())
            .expect("payload should resolve");

        assert_eq!(resolved.nodes[0].id, NodeId::from("id-1"));
        assert_eq!(resolved.nodes[1].id, NodeId::from("id-2"));
        assert_eq!(resolved.edges[0].id, EdgeId::from("id-3"));
        assert_eq!(resolved.edges[0].from_node_id, resolved.nodes[0].id);
        assert_eq!(resolved.edges[0].to_node_id, resolved.nodes[1].id);
        assert_eq!(resolved.edges[0].data, json!({"n": 3}));
    }

    #[test]
    fn explicit_ids_are_kept() {
        let payload = ReplaceGraphPayload {
            nodes: vec![NewNode {
                id: Some(NodeId::from("fixed")),
                node_ref: Some("a".to_string()),
                data: None,
            }],
            edges: vec![],
        };

        let resolved = payload
            .resolve(&UuidGenerator)
            .expect("payload should resolve");
        assert_eq!(resolved.nodes[0].id, NodeId::from("fixed"));
        assert_eq!(resolved.nodes[0].data, json!({}));
    }

    #[test]
    fn explicit_endpoint_id_wins_over_ref() {
        let payload = ReplaceGraphPayload {
            nodes: vec![node("a", json!({})), node("b", json!({}))],
            edges: vec![NewEdge {
                from_node_id: Some(NodeId::from("elsewhere")),
                ..ref_edge("a", "b")
            }],
        };

        let resolved = resolve_graph(payload, &SequentialIds::default())
            .expect("payload should resolve");
        assert_eq!(resolved.edges[0].from_node_id, NodeId::from("elsewhere"));
        assert_eq!(resolved.edges[0].to_node_id, NodeId::from("id-2"));
    }

    #[test]
    fn blank_ids_are_generated() {
        let payload = ReplaceGraphPayload {
            nodes: vec![NewNode {
                id: Some(NodeId::from("")),
                node_ref: Some("a".to_string()),
                data: None,
            }],
            edges: vec![],
        };

        let resolved = resolve_graph(payload, &SequentialIds::default())
            .expect("payload should resolve");
        assert_eq!(resolved.nodes[0].id, NodeId::from("id-1"));
    }

    #[test]
    fn unknown_ref_names_the_ref_and_side() {
        let payload = ReplaceGraphPayload {
            nodes: vec![node("a", json!({}))],
            edges: vec![ref_edge("a", "ghost")],
        };

        let err = resolve_graph(payload, &SequentialIds::default())
            .expect_err("unknown ref should fail");
        assert_eq!(err.code, "unknown_node_ref");
        assert_eq!(
            err.details,
            Some(ErrorDetails::UnknownReference {
                reference: "ghost".to_string(),
                side: EdgeSide::To,
            })
        );
    }

    #[test]
    fn duplicate_ref_is_rejected() {
        let payload = ReplaceGraphPayload {
            nodes: vec![node("a", json!({})), node("a", json!({}))],
            edges: vec![],
        };

        let err = resolve_graph(payload, &SequentialIds::default())
            .expect_err("duplicate ref should fail");
        assert_eq!(err.code, "duplicate_node_ref");
    }

    #[test]
    fn duplicate_node_id_is_rejected() {
        let payload = ReplaceGraphPayload {
            nodes: vec![
                NewNode {
                    id: Some(NodeId::from("n")),
                    ..NewNode::default()
                },
                NewNode {
                    id: Some(NodeId::from("n")),
                    ..NewNode::default()
                },
            ],
            edges: vec![],
        };

        let err = resolve_graph(payload, &SequentialIds::default())
            .expect_err("duplicate id should fail");
        assert_eq!(err.code, "duplicate_node_id");
    }

    #[test]
    fn edge_without_endpoint_is_rejected() {
        let payload = ReplaceGraphPayload {
            nodes: vec![node("a", json!({}))],
            edges: vec![NewEdge {
                from_node_ref: Some("a".to_string()),
                ..NewEdge::default()
            }],
        };

        let err = resolve_graph(payload, &SequentialIds::default())
            .expect_err("missing endpoint should fail");
        assert_eq!(err.code, "missing_edge_endpoint");
    }
}
