use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{GraphStore, GraphTransaction};
use crate::error::{LibError, Result, Stage};
use crate::models::{Edge, EdgeDraft, EdgeId, GraphId, Node, NodeDraft, NodeId};

/// In-process graph store.
///
/// Committed rows live behind a single async mutex. A transaction works on
/// its own copy of those rows and records each write; at commit the recorded
/// writes are replayed against the latest committed rows, all at once or not
/// at all. `lock_graph` hands out one mutex per graph id, so two transactions
/// on the same graph run their read-validate-write sequences one after the
/// other while different graphs proceed in parallel. Taking the lock also
/// refreshes the transaction's copy, so reads after it see every commit made
/// by the previous holder.
///
/// Integrity rules mirror the Postgres schema: ids are unique across the
/// store, edge endpoints must be nodes of the edge's graph, and deleting a
/// node removes the edges touching it.
#[derive(Debug, Clone, Default)]
pub struct MemoryGraphStore {
    state: Arc<Mutex<MemoryState>>,
    graph_locks: Arc<DashMap<GraphId, Arc<Mutex<()>>>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Rows in insertion order, with id indexes for the integrity checks.
#[derive(Debug, Clone, Default)]
struct MemoryState {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    node_graphs: HashMap<NodeId, GraphId>,
    edge_ids: HashSet<EdgeId>,
}

#[derive(Debug, Clone)]
enum PendingWrite {
    InsertNode(Node),
    InsertEdge(Edge),
    UpdateNodeData { node_id: NodeId, data: Value },
    UpdateEdge(EdgeDraft),
    DeleteNode(NodeId),
    DeleteEdge(EdgeId),
    DeleteEdgesTouching(NodeId),
    DeleteGraph(GraphId),
}

fn duplicate_id(id: &str) -> LibError {
    LibError::conflict(
        "duplicate_identifier",
        "Identifier already exists",
        anyhow!("duplicate id {}", id),
    )
}

fn dangling_endpoint(graph_id: &GraphId, node_id: &NodeId) -> LibError {
    LibError::conflict(
        "dangling_node_reference",
        "Edge endpoint does not exist in this graph",
        anyhow!("node {} not found in graph {}", node_id, graph_id),
    )
}

impl MemoryState {
    fn check_endpoints(&self, graph_id: &GraphId, from: &NodeId, to: &NodeId) -> Result<()> {
        for node_id in [from, to] {
            if self.node_graphs.get(node_id) != Some(graph_id) {
                return Err(dangling_endpoint(graph_id, node_id));
            }
        }
        Ok(())
    }

    fn retain_nodes(&mut self, keep: impl Fn(&Node) -> bool) -> u64 {
        let before = self.nodes.len();
        let node_graphs = &mut self.node_graphs;
        self.nodes.retain(|node| {
            let kept = keep(node);
            if !kept {
                node_graphs.remove(&node.id);
            }
            kept
        });
        (before - self.nodes.len()) as u64
    }

    fn retain_edges(&mut self, keep: impl Fn(&Edge) -> bool) -> u64 {
        let before = self.edges.len();
        let edge_ids = &mut self.edge_ids;
        self.edges.retain(|edge| {
            let kept = keep(edge);
            if !kept {
                edge_ids.remove(&edge.id);
            }
            kept
        });
        (before - self.edges.len()) as u64
    }

    fn apply(&mut self, write: &PendingWrite) -> Result<u64> {
        match write {
            PendingWrite::InsertNode(node) => {
                if self.node_graphs.contains_key(&node.id) {
                    return Err(duplicate_id(node.id.as_str()));
                }
                self.node_graphs
                    .insert(node.id.clone(), node.graph_id.clone());
                self.nodes.push(node.clone());
                Ok(1)
            }
            PendingWrite::InsertEdge(edge) => {
                if self.edge_ids.contains(&edge.id) {
                    return Err(duplicate_id(edge.id.as_str()));
                }
                self.check_endpoints(&edge.graph_id, &edge.from_node_id, &edge.to_node_id)?;
                self.edge_ids.insert(edge.id.clone());
                self.edges.push(edge.clone());
                Ok(1)
            }
            PendingWrite::UpdateNodeData { node_id, data } => {
                match self.nodes.iter_mut().find(|node| &node.id == node_id) {
                    Some(node) => {
                        node.data = data.clone();
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            PendingWrite::UpdateEdge(draft) => {
                let Some(index) = self.edges.iter().position(|edge| edge.id == draft.id) else {
                    return Ok(0);
                };
                let graph_id = self.edges[index].graph_id.clone();
                self.check_endpoints(&graph_id, &draft.from_node_id, &draft.to_node_id)?;
                let edge = &mut self.edges[index];
                edge.from_node_id = draft.from_node_id.clone();
                edge.to_node_id = draft.to_node_id.clone();
                edge.data = draft.data.clone();
                Ok(1)
            }
            PendingWrite::DeleteNode(node_id) => {
                if !self.node_graphs.contains_key(node_id) {
                    return Ok(0);
                }
                self.retain_edges(|edge| {
                    &edge.from_node_id != node_id && &edge.to_node_id != node_id
                });
                Ok(self.retain_nodes(|node| &node.id != node_id))
            }
            PendingWrite::DeleteEdge(edge_id) => {
                if !self.edge_ids.contains(edge_id) {
                    return Ok(0);
                }
                Ok(self.retain_edges(|edge| &edge.id != edge_id))
            }
            PendingWrite::DeleteEdgesTouching(node_id) => Ok(self.retain_edges(|edge| {
                &edge.from_node_id != node_id && &edge.to_node_id != node_id
            })),
            PendingWrite::DeleteGraph(graph_id) => {
                let edges = self.retain_edges(|edge| &edge.graph_id != graph_id);
                Ok(edges + self.retain_nodes(|node| &node.graph_id != graph_id))
            }
        }
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            graph_locks: Arc::clone(&self.graph_locks),
            locked: HashSet::new(),
            guards: Vec::new(),
            working: None,
            pending: Vec::new(),
        })
    }

    async fn drop_schema(&self) -> Result<()> {
        *self.state.lock().await = MemoryState::default();
        tracing::info!("in-memory dag rows cleared");
        Ok(())
    }
}

pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    graph_locks: Arc<DashMap<GraphId, Arc<Mutex<()>>>>,
    locked: HashSet<GraphId>,
    guards: Vec<OwnedMutexGuard<()>>,
    /// Committed rows with this transaction's writes applied. Built on first
    /// use and rebuilt whenever a graph lock is taken.
    working: Option<MemoryState>,
    pending: Vec<PendingWrite>,
}

impl MemoryTransaction {
    async fn working(&mut self) -> &mut MemoryState {
        if self.working.is_none() {
            let snapshot = self.state.lock().await.clone();
            self.working = Some(snapshot);
        }
        self.working.get_or_insert_with(MemoryState::default)
    }

    async fn refresh(&mut self) -> Result<()> {
        let mut fresh = self.state.lock().await.clone();
        for write in &self.pending {
            fresh.apply(write).map_err(|err| err.at(Stage::Write))?;
        }
        self.working = Some(fresh);
        Ok(())
    }

    async fn stage(&mut self, write: PendingWrite) -> Result<u64> {
        let affected = self
            .working()
            .await
            .apply(&write)
            .map_err(|err| err.at(Stage::Write))?;
        self.pending.push(write);
        Ok(affected)
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.guards.clear();
        // An entry nobody else holds or waits on can go; the next locker
        // recreates it.
        for graph_id in self.locked.drain() {
            self.graph_locks
                .remove_if(&graph_id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[async_trait]
impl GraphTransaction for MemoryTransaction {
    async fn lock_graph(&mut self, graph_id: &GraphId) -> Result<()> {
        if self.locked.contains(graph_id) {
            return Ok(());
        }

        let lock = Arc::clone(self.graph_locks.entry(graph_id.clone()).or_default().value());
        self.guards.push(lock.lock_owned().await);
        self.locked.insert(graph_id.clone());
        self.refresh().await
    }

    async fn list_nodes(&mut self, graph_id: &GraphId) -> Result<Vec<Node>> {
        let working = self.working().await;
        Ok(working
            .nodes
            .iter()
            .filter(|node| &node.graph_id == graph_id)
            .cloned()
            .collect())
    }

    async fn list_edges(&mut self, graph_id: &GraphId) -> Result<Vec<Edge>> {
        let working = self.working().await;
        Ok(working
            .edges
            .iter()
            .filter(|edge| &edge.graph_id == graph_id)
            .cloned()
            .collect())
    }

    async fn get_node(&mut self, node_id: &NodeId) -> Result<Option<Node>> {
        let working = self.working().await;
        Ok(working.nodes.iter().find(|node| &node.id == node_id).cloned())
    }

    async fn get_edge(&mut self, edge_id: &EdgeId) -> Result<Option<Edge>> {
        let working = self.working().await;
        Ok(working.edges.iter().find(|edge| &edge.id == edge_id).cloned())
    }

    async fn edge_graph_id(&mut self, edge_id: &EdgeId) -> Result<Option<GraphId>> {
        Ok(self.get_edge(edge_id).await?.map(|edge| edge.graph_id))
    }

    async fn insert_node(&mut self, graph_id: &GraphId, node: &NodeDraft) -> Result<Node> {
        let row = Node {
            id: node.id.clone(),
            graph_id: graph_id.clone(),
            data: node.data.clone(),
            created_at: Utc::now(),
        };
        self.stage(PendingWrite::InsertNode(row.clone())).await?;
        Ok(row)
    }

    async fn insert_edge(&mut self, graph_id: &GraphId, edge: &EdgeDraft) -> Result<Edge> {
        let row = Edge {
            id: edge.id.clone(),
            graph_id: graph_id.clone(),
            from_node_id: edge.from_node_id.clone(),
            to_node_id: edge.to_node_id.clone(),
            data: edge.data.clone(),
            created_at: Utc::now(),
        };
        self.stage(PendingWrite::InsertEdge(row.clone())).await?;
        Ok(row)
    }

    async fn update_node_data(&mut self, node_id: &NodeId, data: &Value) -> Result<u64> {
        self.stage(PendingWrite::UpdateNodeData {
            node_id: node_id.clone(),
            data: data.clone(),
        })
        .await
    }

    async fn update_edge(&mut self, edge: &EdgeDraft) -> Result<u64> {
        self.stage(PendingWrite::UpdateEdge(edge.clone())).await
    }

    async fn delete_node(&mut self, node_id: &NodeId) -> Result<u64> {
        self.stage(PendingWrite::DeleteNode(node_id.clone())).await
    }

    async fn delete_edge(&mut self, edge_id: &EdgeId) -> Result<u64> {
        self.stage(PendingWrite::DeleteEdge(edge_id.clone())).await
    }

    async fn delete_edges_touching(&mut self, node_id: &NodeId) -> Result<u64> {
        self.stage(PendingWrite::DeleteEdgesTouching(node_id.clone()))
            .await
    }

    async fn delete_graph(&mut self, graph_id: &GraphId) -> Result<()> {
        self.stage(PendingWrite::DeleteGraph(graph_id.clone()))
            .await?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut next = state.clone();
        for write in &self.pending {
            next.apply(write).map_err(|err| err.at(Stage::Commit))?;
        }
        *state = next;
        Ok(())
    }
}
