use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{LibError, Result, Stage};
use crate::invariants::ensure_acyclic;
use crate::models::{
    AddEdgePayload, AddNodePayload, Edge, EdgeDraft, EdgeId, Endpoints, Graph, GraphId, Node,
    NodeDraft, NodeId, ReplaceGraphPayload, UpdateEdgePayload, UpdateNodePayload, default_data,
    present,
};
use crate::resolver::{IdGenerator, UuidGenerator};
use crate::store::{GraphStore, GraphTransaction};

/// Serializable graph actions, for callers that route work as data (job
/// queues, tool calls) instead of calling methods directly.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum GraphOperation {
    ReplaceGraph {
        graph_id: GraphId,
        payload: ReplaceGraphPayload,
    },
    GetGraph {
        graph_id: GraphId,
    },
    DeleteGraph {
        graph_id: GraphId,
    },
    AddNode {
        graph_id: GraphId,
        payload: AddNodePayload,
    },
    GetNode {
        node_id: NodeId,
    },
    UpdateNode {
        node_id: NodeId,
        payload: UpdateNodePayload,
    },
    DeleteNode {
        node_id: NodeId,
    },
    ListNodes {
        graph_id: GraphId,
    },
    AddEdge {
        graph_id: GraphId,
        payload: AddEdgePayload,
    },
    GetEdge {
        edge_id: EdgeId,
    },
    UpdateEdge {
        edge_id: EdgeId,
        payload: UpdateEdgePayload,
    },
    DeleteEdge {
        edge_id: EdgeId,
    },
    ListEdges {
        graph_id: GraphId,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GraphOperationResult {
    Graph { graph: Graph },
    Node { node: Node },
    Nodes { nodes: Vec<Node> },
    Edge { edge: Edge },
    Edges { edges: Vec<Edge> },
    NodeCreated { id: NodeId },
    EdgeCreated { id: EdgeId },
    /// The requested item does not exist. Reads report absence this way
    /// rather than failing.
    Missing,
    Updated,
    Deleted,
}

/// Graph mutation engine.
///
/// Every operation runs in a single store transaction. Mutations that can
/// change edge topology take the graph lock first, then load the graph,
/// validate the candidate state and write. A mutation that would introduce a
/// cycle is rejected before any write is issued.
pub struct GraphOperations<S> {
    store: Arc<S>,
    ids: Arc<dyn IdGenerator>,
    cancel: CancellationToken,
    operation_timeout: Option<Duration>,
}

impl<S> Clone for GraphOperations<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            ids: Arc::clone(&self.ids),
            cancel: self.cancel.clone(),
            operation_timeout: self.operation_timeout,
        }
    }
}

impl<S: GraphStore> GraphOperations<S> {
    pub fn new(store: S) -> Self {
        Self::from_arc(Arc::new(store))
    }

    pub fn from_arc(store: Arc<S>) -> Self {
        Self {
            store,
            ids: Arc::new(UuidGenerator),
            cancel: CancellationToken::new(),
            operation_timeout: None,
        }
    }

    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    /// Deadline applied to each operation. An operation that runs past it is
    /// abandoned and its transaction rolled back.
    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Operations started from the returned handle stop when `token` is
    /// cancelled. The store and id generator are shared with `self`.
    pub fn with_cancellation(&self, token: CancellationToken) -> Self {
        Self {
            cancel: token,
            ..self.clone()
        }
    }

    pub fn store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub async fn execute(&self, operation: GraphOperation) -> Result<GraphOperationResult> {
        match operation {
            GraphOperation::ReplaceGraph { graph_id, payload } => {
                let graph = self.replace_graph(&graph_id, payload).await?;
                Ok(GraphOperationResult::Graph { graph })
            }
            GraphOperation::GetGraph { graph_id } => Ok(match self.get_graph(&graph_id).await? {
                Some(graph) => GraphOperationResult::Graph { graph },
                None => GraphOperationResult::Missing,
            }),
            GraphOperation::DeleteGraph { graph_id } => {
                self.delete_graph(&graph_id).await?;
                Ok(GraphOperationResult::Deleted)
            }
            GraphOperation::AddNode { graph_id, payload } => {
                let id = self.add_node(&graph_id, payload).await?;
                Ok(GraphOperationResult::NodeCreated { id })
            }
            GraphOperation::GetNode { node_id } => Ok(match self.get_node(&node_id).await? {
                Some(node) => GraphOperationResult::Node { node },
                None => GraphOperationResult::Missing,
            }),
            GraphOperation::UpdateNode { node_id, payload } => {
                self.update_node(&node_id, payload).await?;
                Ok(GraphOperationResult::Updated)
            }
            GraphOperation::DeleteNode { node_id } => {
                self.delete_node(&node_id).await?;
                Ok(GraphOperationResult::Deleted)
            }
            GraphOperation::ListNodes { graph_id } => {
                let nodes = self.list_nodes(&graph_id).await?;
                Ok(GraphOperationResult::Nodes { nodes })
            }
            GraphOperation::AddEdge { graph_id, payload } => {
                let id = self.add_edge(&graph_id, payload).await?;
                Ok(GraphOperationResult::EdgeCreated { id })
            }
            GraphOperation::GetEdge { edge_id } => Ok(match self.get_edge(&edge_id).await? {
                Some(edge) => GraphOperationResult::Edge { edge },
                None => GraphOperationResult::Missing,
            }),
            GraphOperation::UpdateEdge { edge_id, payload } => {
                self.update_edge(&edge_id, payload).await?;
                Ok(GraphOperationResult::Updated)
            }
            GraphOperation::DeleteEdge { edge_id } => {
                self.delete_edge(&edge_id).await?;
                Ok(GraphOperationResult::Deleted)
            }
            GraphOperation::ListEdges { graph_id } => {
                let edges = self.list_edges(&graph_id).await?;
                Ok(GraphOperationResult::Edges { edges })
            }
        }
    }

    /// Replaces the whole content of `graph_id` with `payload`.
    ///
    /// Refs are resolved and the result checked for cycles before the
    /// transaction opens. Inside it the previous content is removed, then
    /// nodes and edges are inserted in payload order. On any failure the
    /// previous content is left as it was.
    pub async fn replace_graph(
        &self,
        graph_id: &GraphId,
        payload: ReplaceGraphPayload,
    ) -> Result<Graph> {
        let progress = Progress::default();
        self.guarded("replace_graph", &progress, async {
            let definition = payload.resolve(self.ids.as_ref())?;
            validate(
                graph_id,
                definition.nodes.iter().map(|node| &node.id),
                &definition.edges,
            )?;

            tracing::debug!(
                graph_id = %graph_id,
                nodes = definition.nodes.len(),
                edges = definition.edges.len(),
                "replacing graph"
            );

            let mut tx = self.store.begin().await?;
            tx.lock_graph(graph_id).await?;
            progress.reach(Stage::Write);
            tx.delete_graph(graph_id).await?;

            let mut nodes = Vec::with_capacity(definition.nodes.len());
            for node in &definition.nodes {
                nodes.push(tx.insert_node(graph_id, node).await?);
            }

            let mut edges = Vec::with_capacity(definition.edges.len());
            for edge in &definition.edges {
                edges.push(tx.insert_edge(graph_id, edge).await?);
            }

            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;

            Ok(Graph {
                id: graph_id.clone(),
                nodes,
                edges,
            })
        })
        .await
    }

    /// Returns `None` when the graph has no nodes.
    pub async fn get_graph(&self, graph_id: &GraphId) -> Result<Option<Graph>> {
        let progress = Progress::default();
        self.guarded("get_graph", &progress, async {
            let mut tx = self.store.begin().await?;
            let nodes = tx.list_nodes(graph_id).await?;
            if nodes.is_empty() {
                return Ok(None);
            }
            let edges = tx.list_edges(graph_id).await?;
            tx.commit().await?;

            Ok(Some(Graph {
                id: graph_id.clone(),
                nodes,
                edges,
            }))
        })
        .await
    }

    /// Removes every node and edge of the graph. Deleting an empty or unknown
    /// graph succeeds.
    pub async fn delete_graph(&self, graph_id: &GraphId) -> Result<()> {
        let progress = Progress::default();
        self.guarded("delete_graph", &progress, async {
            let mut tx = self.store.begin().await?;
            tx.lock_graph(graph_id).await?;
            progress.reach(Stage::Write);
            tx.delete_graph(graph_id).await?;
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            tracing::debug!(graph_id = %graph_id, "graph deleted");
            Ok(())
        })
        .await
    }

    pub async fn add_node(&self, graph_id: &GraphId, payload: AddNodePayload) -> Result<NodeId> {
        let progress = Progress::default();
        self.guarded("add_node", &progress, async {
            let draft = NodeDraft {
                id: match present(payload.id.as_ref().map(NodeId::as_str)) {
                    Some(id) => NodeId::from(id),
                    None => NodeId(self.ids.generate()),
                },
                data: default_data(payload.data),
            };

            let mut tx = self.store.begin().await?;
            progress.reach(Stage::Write);
            let node = tx.insert_node(graph_id, &draft).await?;
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            Ok(node.id)
        })
        .await
    }

    pub async fn get_node(&self, node_id: &NodeId) -> Result<Option<Node>> {
        let progress = Progress::default();
        self.guarded("get_node", &progress, async {
            let mut tx = self.store.begin().await?;
            let node = tx.get_node(node_id).await?;
            tx.commit().await?;
            Ok(node)
        })
        .await
    }

    /// Replaces the node's data. Missing data is stored as `{}`.
    pub async fn update_node(&self, node_id: &NodeId, payload: UpdateNodePayload) -> Result<()> {
        let progress = Progress::default();
        self.guarded("update_node", &progress, async {
            let data = default_data(payload.data);
            let mut tx = self.store.begin().await?;
            progress.reach(Stage::Write);
            if tx.update_node_data(node_id, &data).await? == 0 {
                return Err(node_not_found(node_id));
            }
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            Ok(())
        })
        .await
    }

    /// Deletes the node and every edge touching it. Deleting a missing node
    /// succeeds.
    pub async fn delete_node(&self, node_id: &NodeId) -> Result<()> {
        let progress = Progress::default();
        self.guarded("delete_node", &progress, async {
            let mut tx = self.store.begin().await?;
            let Some(node) = tx.get_node(node_id).await? else {
                return Ok(());
            };

            tx.lock_graph(&node.graph_id).await?;
            progress.reach(Stage::Write);
            let edges = tx.delete_edges_touching(node_id).await?;
            tx.delete_node(node_id).await?;
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;

            tracing::debug!(
                graph_id = %node.graph_id,
                node_id = %node_id,
                edges,
                "node deleted"
            );
            Ok(())
        })
        .await
    }

    pub async fn list_nodes(&self, graph_id: &GraphId) -> Result<Vec<Node>> {
        let progress = Progress::default();
        self.guarded("list_nodes", &progress, async {
            let mut tx = self.store.begin().await?;
            let nodes = tx.list_nodes(graph_id).await?;
            tx.commit().await?;
            Ok(nodes)
        })
        .await
    }

    /// Adds one edge after checking that the graph stays acyclic with it.
    ///
    /// Both endpoints must already be nodes of `graph_id`; the store rejects
    /// the write otherwise.
    pub async fn add_edge(&self, graph_id: &GraphId, payload: AddEdgePayload) -> Result<EdgeId> {
        let progress = Progress::default();
        self.guarded("add_edge", &progress, async {
            let edge_id = match present(payload.id.as_ref().map(EdgeId::as_str)) {
                Some(id) => EdgeId::from(id),
                None => EdgeId(self.ids.generate()),
            };
            let candidate = EdgeDraft::from_payload(edge_id, payload);

            let mut tx = self.store.begin().await?;
            tx.lock_graph(graph_id).await?;
            let nodes = tx.list_nodes(graph_id).await?;
            let mut edges = endpoint_pairs(tx.list_edges(graph_id).await?);
            edges.push((
                candidate.from_node_id.clone(),
                candidate.to_node_id.clone(),
            ));
            validate(graph_id, nodes.iter().map(|node| &node.id), &edges)?;

            progress.reach(Stage::Write);
            let edge = tx.insert_edge(graph_id, &candidate).await?;
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            Ok(edge.id)
        })
        .await
    }

    pub async fn get_edge(&self, edge_id: &EdgeId) -> Result<Option<Edge>> {
        let progress = Progress::default();
        self.guarded("get_edge", &progress, async {
            let mut tx = self.store.begin().await?;
            let edge = tx.get_edge(edge_id).await?;
            tx.commit().await?;
            Ok(edge)
        })
        .await
    }

    /// Moves an edge to new endpoints and replaces its data.
    ///
    /// Fails with `edge_not_found` before any validation when the edge does
    /// not exist.
    pub async fn update_edge(&self, edge_id: &EdgeId, payload: UpdateEdgePayload) -> Result<()> {
        let progress = Progress::default();
        self.guarded("update_edge", &progress, async {
            let mut tx = self.store.begin().await?;
            let Some(graph_id) = tx.edge_graph_id(edge_id).await? else {
                return Err(edge_not_found(edge_id));
            };

            tx.lock_graph(&graph_id).await?;
            let nodes = tx.list_nodes(&graph_id).await?;
            let mut edges = tx.list_edges(&graph_id).await?;
            let Some(existing) = edges.iter_mut().find(|edge| &edge.id == edge_id) else {
                return Err(edge_not_found(edge_id));
            };
            existing.from_node_id = payload.from_node_id.clone();
            existing.to_node_id = payload.to_node_id.clone();
            validate(&graph_id, nodes.iter().map(|node| &node.id), &edges)?;

            let draft = EdgeDraft {
                id: edge_id.clone(),
                from_node_id: payload.from_node_id,
                to_node_id: payload.to_node_id,
                data: default_data(payload.data),
            };
            progress.reach(Stage::Write);
            if tx.update_edge(&draft).await? == 0 {
                return Err(edge_not_found(edge_id));
            }
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            Ok(())
        })
        .await
    }

    /// Deleting a missing edge succeeds.
    pub async fn delete_edge(&self, edge_id: &EdgeId) -> Result<()> {
        let progress = Progress::default();
        self.guarded("delete_edge", &progress, async {
            let mut tx = self.store.begin().await?;
            progress.reach(Stage::Write);
            tx.delete_edge(edge_id).await?;
            progress.reach(Stage::Commit);
            tx.commit().await.map_err(|err| err.at(Stage::Commit))?;
            Ok(())
        })
        .await
    }

    pub async fn list_edges(&self, graph_id: &GraphId) -> Result<Vec<Edge>> {
        let progress = Progress::default();
        self.guarded("list_edges", &progress, async {
            let mut tx = self.store.begin().await?;
            let edges = tx.list_edges(graph_id).await?;
            tx.commit().await?;
            Ok(edges)
        })
        .await
    }

    /// Runs `fut` under the cancellation token and the operation deadline.
    ///
    /// When either fires the future is dropped, which drops any open
    /// transaction and rolls it back. The resulting error carries the
    /// furthest stage `progress` recorded, so callers can tell whether
    /// writes had been issued.
    async fn guarded<T, F>(
        &self,
        operation: &'static str,
        progress: &Progress,
        fut: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let cut_short = |public: &'static str, source: anyhow::Error| {
            let err = LibError::cancelled(public, source);
            match progress.stage() {
                Some(stage) => err.at(stage),
                None => err,
            }
        };

        let limited = async {
            match self.operation_timeout {
                Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| {
                    cut_short(
                        "Operation deadline exceeded",
                        anyhow!("{} exceeded {:?}", operation, limit),
                    )
                })?,
                None => fut.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                tracing::debug!(operation, stage = ?progress.stage(), "graph operation cancelled");
                Err(cut_short(
                    "Operation cancelled",
                    anyhow!("{} cancelled", operation),
                ))
            }
            result = limited => result,
        }
    }
}

/// Furthest stage an operation has reached.
#[derive(Default)]
struct Progress(AtomicU8);

impl Progress {
    fn reach(&self, stage: Stage) {
        let rank = match stage {
            Stage::Prepare => 1,
            Stage::Read => 2,
            Stage::Write => 3,
            Stage::Commit => 4,
        };
        self.0.fetch_max(rank, Ordering::Relaxed);
    }

    fn stage(&self) -> Option<Stage> {
        match self.0.load(Ordering::Relaxed) {
            1 => Some(Stage::Prepare),
            2 => Some(Stage::Read),
            3 => Some(Stage::Write),
            4 => Some(Stage::Commit),
            _ => None,
        }
    }
}

fn validate<'a, E: Endpoints>(
    graph_id: &GraphId,
    node_ids: impl IntoIterator<Item = &'a NodeId>,
    edges: &'a [E],
) -> Result<()> {
    ensure_acyclic(node_ids, edges).inspect_err(|err| {
        tracing::warn!(
            graph_id = %graph_id,
            code = err.code,
            "rejected graph mutation"
        );
    })
}

fn endpoint_pairs(edges: Vec<Edge>) -> Vec<(NodeId, NodeId)> {
    edges
        .into_iter()
        .map(|edge| (edge.from_node_id, edge.to_node_id))
        .collect()
}

fn node_not_found(node_id: &NodeId) -> LibError {
    LibError::not_found(
        "node_not_found",
        "Node not found",
        anyhow!("node {} not found", node_id),
    )
}

fn edge_not_found(edge_id: &EdgeId) -> LibError {
    LibError::not_found(
        "edge_not_found",
        "Edge not found",
        anyhow!("edge {} not found", edge_id),
    )
}
