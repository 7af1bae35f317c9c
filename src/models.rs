use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

macro_rules! string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(GraphId);
string_id!(NodeId);
string_id!(EdgeId);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub graph_id: GraphId,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub graph_id: GraphId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub data: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

/// Node as submitted to a bulk replace.
///
/// `ref` is a label that edges in the same call can point at before the node
/// has an id. It is resolved away and never stored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewNode {
    pub id: Option<NodeId>,
    #[serde(rename = "ref")]
    pub node_ref: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewEdge {
    pub id: Option<EdgeId>,
    pub from_node_id: Option<NodeId>,
    pub to_node_id: Option<NodeId>,
    pub from_node_ref: Option<String>,
    pub to_node_ref: Option<String>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplaceGraphPayload {
    #[serde(default)]
    pub nodes: Vec<NewNode>,
    #[serde(default)]
    pub edges: Vec<NewEdge>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddNodePayload {
    pub id: Option<NodeId>,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddEdgePayload {
    pub id: Option<EdgeId>,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateNodePayload {
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateEdgePayload {
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub data: Option<Value>,
}

/// A node ready to be written: id assigned, no ref.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDraft {
    pub id: NodeId,
    pub data: Value,
}

/// An edge ready to be written: ids assigned and endpoints resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeDraft {
    pub id: EdgeId,
    pub from_node_id: NodeId,
    pub to_node_id: NodeId,
    pub data: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphDefinition {
    pub nodes: Vec<NodeDraft>,
    pub edges: Vec<EdgeDraft>,
}

/// Endpoint pair used by the cycle validator.
pub trait Endpoints {
    fn from_node(&self) -> &NodeId;
    fn to_node(&self) -> &NodeId;
}

impl Endpoints for Edge {
    fn from_node(&self) -> &NodeId {
        &self.from_node_id
    }

    fn to_node(&self) -> &NodeId {
        &self.to_node_id
    }
}

impl Endpoints for EdgeDraft {
    fn from_node(&self) -> &NodeId {
        &self.from_node_id
    }

    fn to_node(&self) -> &NodeId {
        &self.to_node_id
    }
}

impl Endpoints for (NodeId, NodeId) {
    fn from_node(&self) -> &NodeId {
        &self.0
    }

    fn to_node(&self) -> &NodeId {
        &self.1
    }
}

impl EdgeDraft {
    pub fn from_payload(id: EdgeId, payload: AddEdgePayload) -> Self {
        Self {
            id,
            from_node_id: payload.from_node_id,
            to_node_id: payload.to_node_id,
            data: default_data(payload.data),
        }
    }
}

pub(crate) fn default_data(data: Option<Value>) -> Value {
    data.unwrap_or_else(|| json!({}))
}

/// Empty or whitespace-only strings count as "not provided". Anything else
/// is returned untouched.
pub(crate) fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|value| !value.trim().is_empty())
}
