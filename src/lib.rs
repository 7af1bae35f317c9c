#[cfg(feature = "api")]
pub mod api;
pub mod config;
pub mod error;
pub mod invariants;
pub mod models;
pub mod operations;
pub mod resolver;
pub mod store;

pub mod prelude {
    #[cfg(feature = "api")]
    pub use crate::api::{AppError, DagApp, ReplaceGraphRequest, routes};
    pub use crate::config::{DagConfig, PoolConfig};
    pub use crate::error::{EdgeSide, ErrorClass, ErrorDetails, ErrorKind, LibError, Result, Stage};
    pub use crate::invariants::{
        GraphInvariantViolation, ensure_acyclic, find_cycle, graph_invariant_violations, has_cycle,
    };
    pub use crate::models::{
        AddEdgePayload, AddNodePayload, Edge, EdgeDraft, EdgeId, Endpoints, Graph,
        GraphDefinition, GraphId, NewEdge, NewNode, Node, NodeDraft, NodeId, ReplaceGraphPayload,
        UpdateEdgePayload, UpdateNodePayload,
    };
    pub use crate::operations::{GraphOperation, GraphOperationResult, GraphOperations};
    pub use crate::resolver::{IdGenerator, UuidGenerator, resolve_graph};
    #[cfg(feature = "sqlx")]
    pub use crate::store::PgGraphStore;
    pub use crate::store::{GraphStore, GraphTransaction, MemoryGraphStore};
}
