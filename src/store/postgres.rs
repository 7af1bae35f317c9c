use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use super::{GraphStore, GraphTransaction};
use crate::config::PoolConfig;
use crate::error::{LibError, Result, Stage};
use crate::models::{Edge, EdgeDraft, EdgeId, GraphId, Node, NodeDraft, NodeId};

/// Idempotent DDL for the node and edge tables.
///
/// `seq` gives a total insertion order; `created_at` alone is not enough
/// because rows written in one transaction can share a timestamp. Edges
/// reference nodes through `(dag_id, id)`, so both endpoints must belong to
/// the edge's own graph.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS dag_nodes (
    seq        BIGINT GENERATED ALWAYS AS IDENTITY,
    id         TEXT PRIMARY KEY,
    dag_id     TEXT NOT NULL,
    data       JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    UNIQUE (dag_id, id)
);

CREATE TABLE IF NOT EXISTS dag_edges (
    seq          BIGINT GENERATED ALWAYS AS IDENTITY,
    id           TEXT PRIMARY KEY,
    dag_id       TEXT NOT NULL,
    from_node_id TEXT NOT NULL,
    to_node_id   TEXT NOT NULL,
    data         JSONB NOT NULL DEFAULT '{}',
    created_at   TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp(),
    FOREIGN KEY (dag_id, from_node_id) REFERENCES dag_nodes (dag_id, id) ON DELETE CASCADE,
    FOREIGN KEY (dag_id, to_node_id) REFERENCES dag_nodes (dag_id, id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_dag_nodes_dag_id ON dag_nodes (dag_id, seq);
CREATE INDEX IF NOT EXISTS idx_dag_edges_dag_id ON dag_edges (dag_id, seq);
CREATE INDEX IF NOT EXISTS idx_dag_edges_from ON dag_edges (from_node_id);
CREATE INDEX IF NOT EXISTS idx_dag_edges_to ON dag_edges (to_node_id);
"#;

const DROP_SCHEMA_SQL: &str = "DROP TABLE IF EXISTS dag_edges, dag_nodes CASCADE";

#[derive(Debug, Clone, FromRow)]
struct NodeRow {
    id: String,
    dag_id: String,
    data: Value,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
struct EdgeRow {
    id: String,
    dag_id: String,
    from_node_id: String,
    to_node_id: String,
    data: Value,
    created_at: DateTime<Utc>,
}

impl From<NodeRow> for Node {
    fn from(value: NodeRow) -> Self {
        Self {
            id: NodeId(value.id),
            graph_id: GraphId(value.dag_id),
            data: value.data,
            created_at: value.created_at,
        }
    }
}

impl From<EdgeRow> for Edge {
    fn from(value: EdgeRow) -> Self {
        Self {
            id: EdgeId(value.id),
            graph_id: GraphId(value.dag_id),
            from_node_id: NodeId(value.from_node_id),
            to_node_id: NodeId(value.to_node_id),
            data: value.data,
            created_at: value.created_at,
        }
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    let kind = err.as_database_error().map(|db| db.kind());
    match kind {
        Some(sqlx::error::ErrorKind::UniqueViolation) => LibError::conflict(
            "duplicate_identifier",
            "Identifier already exists",
            anyhow!(err),
        ),
        Some(sqlx::error::ErrorKind::ForeignKeyViolation) => LibError::conflict(
            "dangling_node_reference",
            "Edge endpoint does not exist in this graph",
            anyhow!(err),
        ),
        _ => LibError::database(public, anyhow!(err)),
    }
}

fn read_err(public: &'static str, err: sqlx::Error) -> LibError {
    db_err(public, err).at(Stage::Read)
}

fn write_err(public: &'static str, err: sqlx::Error) -> LibError {
    db_err(public, err).at(Stage::Write)
}

/// Postgres-backed graph store.
#[derive(Debug, Clone)]
pub struct PgGraphStore {
    pool: PgPool,
}

impl PgGraphStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, config: &PoolConfig) -> Result<Self> {
        let mut builder = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout);

        if let Some(min_connections) = config.min_connections {
            builder = builder.min_connections(min_connections);
        }

        if let Some(idle_timeout) = config.idle_timeout {
            builder = builder.idle_timeout(idle_timeout);
        }

        let pool = builder
            .connect(database_url)
            .await
            .map_err(|err| db_err("Failed to connect to postgres", err))?;

        tracing::debug!(max_connections = config.max_connections, "dag store connected");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl GraphStore for PgGraphStore {
    type Transaction = PgGraphTransaction;

    async fn begin(&self) -> Result<PgGraphTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| read_err("Failed to start transaction", err))?;
        Ok(PgGraphTransaction { tx })
    }

    async fn create_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|err| db_err("Failed to create graph tables", err))?;
        tracing::info!("dag schema created");
        Ok(())
    }

    async fn drop_schema(&self) -> Result<()> {
        sqlx::query(DROP_SCHEMA_SQL)
            .execute(&self.pool)
            .await
            .map_err(|err| db_err("Failed to drop graph tables", err))?;
        tracing::info!("dag schema dropped");
        Ok(())
    }
}

pub struct PgGraphTransaction {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl GraphTransaction for PgGraphTransaction {
    async fn lock_graph(&mut self, graph_id: &GraphId) -> Result<()> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended('dag:' || $1, 0))")
            .bind(graph_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| read_err("Failed to lock graph", err))?;
        Ok(())
    }

    async fn list_nodes(&mut self, graph_id: &GraphId) -> Result<Vec<Node>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT id, dag_id, data, created_at
            FROM dag_nodes
            WHERE dag_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(graph_id.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| read_err("Failed to query graph nodes", err))?;

        Ok(rows.into_iter().map(Node::from).collect())
    }

    async fn list_edges(&mut self, graph_id: &GraphId) -> Result<Vec<Edge>> {
        let rows = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT id, dag_id, from_node_id, to_node_id, data, created_at
            FROM dag_edges
            WHERE dag_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(graph_id.as_str())
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| read_err("Failed to query graph edges", err))?;

        Ok(rows.into_iter().map(Edge::from).collect())
    }

    async fn get_node(&mut self, node_id: &NodeId) -> Result<Option<Node>> {
        let row = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT id, dag_id, data, created_at
            FROM dag_nodes
            WHERE id = $1
            "#,
        )
        .bind(node_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|err| read_err("Failed to query node", err))?;

        Ok(row.map(Node::from))
    }

    async fn get_edge(&mut self, edge_id: &EdgeId) -> Result<Option<Edge>> {
        let row = sqlx::query_as::<_, EdgeRow>(
            r#"
            SELECT id, dag_id, from_node_id, to_node_id, data, created_at
            FROM dag_edges
            WHERE id = $1
            "#,
        )
        .bind(edge_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|err| read_err("Failed to query edge", err))?;

        Ok(row.map(Edge::from))
    }

    async fn edge_graph_id(&mut self, edge_id: &EdgeId) -> Result<Option<GraphId>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT dag_id FROM dag_edges WHERE id = $1")
            .bind(edge_id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|err| read_err("Failed to find edge", err))?;

        Ok(row.map(|(dag_id,)| GraphId(dag_id)))
    }

    async fn insert_node(&mut self, graph_id: &GraphId, node: &NodeDraft) -> Result<Node> {
        let row = sqlx::query_as::<_, NodeRow>(
            r#"
            INSERT INTO dag_nodes (id, dag_id, data)
            VALUES ($1, $2, $3)
            RETURNING id, dag_id, data, created_at
            "#,
        )
        .bind(node.id.as_str())
        .bind(graph_id.as_str())
        .bind(&node.data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to write graph nodes", err))?;

        Ok(Node::from(row))
    }

    async fn insert_edge(&mut self, graph_id: &GraphId, edge: &EdgeDraft) -> Result<Edge> {
        let row = sqlx::query_as::<_, EdgeRow>(
            r#"
            INSERT INTO dag_edges (id, dag_id, from_node_id, to_node_id, data)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, dag_id, from_node_id, to_node_id, data, created_at
            "#,
        )
        .bind(edge.id.as_str())
        .bind(graph_id.as_str())
        .bind(edge.from_node_id.as_str())
        .bind(edge.to_node_id.as_str())
        .bind(&edge.data)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to write graph edges", err))?;

        Ok(Edge::from(row))
    }

    async fn update_node_data(&mut self, node_id: &NodeId, data: &Value) -> Result<u64> {
        let result = sqlx::query("UPDATE dag_nodes SET data = $1 WHERE id = $2")
            .bind(data)
            .bind(node_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to update node", err))?;
        Ok(result.rows_affected())
    }

    async fn update_edge(&mut self, edge: &EdgeDraft) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE dag_edges
            SET from_node_id = $1,
                to_node_id = $2,
                data = $3
            WHERE id = $4
            "#,
        )
        .bind(edge.from_node_id.as_str())
        .bind(edge.to_node_id.as_str())
        .bind(&edge.data)
        .bind(edge.id.as_str())
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to update edge", err))?;
        Ok(result.rows_affected())
    }

    async fn delete_node(&mut self, node_id: &NodeId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dag_nodes WHERE id = $1")
            .bind(node_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to delete node", err))?;
        Ok(result.rows_affected())
    }

    async fn delete_edge(&mut self, edge_id: &EdgeId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dag_edges WHERE id = $1")
            .bind(edge_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to delete edge", err))?;
        Ok(result.rows_affected())
    }

    async fn delete_edges_touching(&mut self, node_id: &NodeId) -> Result<u64> {
        let result = sqlx::query("DELETE FROM dag_edges WHERE from_node_id = $1 OR to_node_id = $1")
            .bind(node_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to delete node edges", err))?;
        Ok(result.rows_affected())
    }

    async fn delete_graph(&mut self, graph_id: &GraphId) -> Result<()> {
        sqlx::query("DELETE FROM dag_edges WHERE dag_id = $1")
            .bind(graph_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to delete graph edges", err))?;

        sqlx::query("DELETE FROM dag_nodes WHERE dag_id = $1")
            .bind(graph_id.as_str())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to delete graph nodes", err))?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err).at(Stage::Commit))
    }
}
