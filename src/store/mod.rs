//! Storage collaborators for the graph engine.
//!
//! The engine never talks to a database directly. It opens a
//! [`GraphTransaction`] through a [`GraphStore`], runs its read-validate-write
//! sequence inside it, and commits. Two backends are provided:
//!
//! - [`PgGraphStore`]: Postgres via sqlx, with per-graph advisory locks
//! - [`MemoryGraphStore`]: in-process storage for tests and embedding
//!
//! Dropping a transaction without calling [`GraphTransaction::commit`] rolls
//! it back in both backends.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::models::{Edge, EdgeDraft, EdgeId, GraphId, Node, NodeDraft, NodeId};

pub mod memory;
#[cfg(feature = "sqlx")]
pub mod postgres;

pub use memory::MemoryGraphStore;
#[cfg(feature = "sqlx")]
pub use postgres::PgGraphStore;

#[async_trait]
pub trait GraphStore: Send + Sync + 'static {
    type Transaction: GraphTransaction;

    async fn begin(&self) -> Result<Self::Transaction>;

    /// Provisions backing tables. Idempotent.
    async fn create_schema(&self) -> Result<()> {
        Ok(())
    }

    /// Removes backing tables and every row in them.
    async fn drop_schema(&self) -> Result<()>;
}

/// One atomic unit of work against the store.
///
/// Listing methods return rows in insertion order.
#[async_trait]
pub trait GraphTransaction: Send + Sized {
    /// Serializes writers of `graph_id` until this transaction ends.
    async fn lock_graph(&mut self, graph_id: &GraphId) -> Result<()>;

    async fn list_nodes(&mut self, graph_id: &GraphId) -> Result<Vec<Node>>;

    async fn list_edges(&mut self, graph_id: &GraphId) -> Result<Vec<Edge>>;

    async fn get_node(&mut self, node_id: &NodeId) -> Result<Option<Node>>;

    async fn get_edge(&mut self, edge_id: &EdgeId) -> Result<Option<Edge>>;

    /// Graph owning `edge_id`, if the edge exists.
    async fn edge_graph_id(&mut self, edge_id: &EdgeId) -> Result<Option<GraphId>>;

    /// Returns the stored row.
    async fn insert_node(&mut self, graph_id: &GraphId, node: &NodeDraft) -> Result<Node>;

    /// Both endpoints must already exist in `graph_id`. Returns the stored row.
    async fn insert_edge(&mut self, graph_id: &GraphId, edge: &EdgeDraft) -> Result<Edge>;

    /// Returns the number of rows changed.
    async fn update_node_data(&mut self, node_id: &NodeId, data: &Value) -> Result<u64>;

    /// Rewrites endpoints and data. Returns the number of rows changed.
    async fn update_edge(&mut self, edge: &EdgeDraft) -> Result<u64>;

    async fn delete_node(&mut self, node_id: &NodeId) -> Result<u64>;

    async fn delete_edge(&mut self, edge_id: &EdgeId) -> Result<u64>;

    /// Deletes every edge where `node_id` is the source or the target.
    async fn delete_edges_touching(&mut self, node_id: &NodeId) -> Result<u64>;

    /// Deletes all edges, then all nodes, owned by `graph_id`.
    async fn delete_graph(&mut self, graph_id: &GraphId) -> Result<()>;

    async fn commit(self) -> Result<()>;
}
