use anyhow::anyhow;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use crate::error::{ErrorKind, LibError};
use crate::models::{
    AddEdgePayload, AddNodePayload, EdgeId, GraphId, NodeId, ReplaceGraphPayload,
    UpdateEdgePayload, UpdateNodePayload, present,
};
use crate::operations::GraphOperations;
use crate::store::GraphStore;

#[derive(Debug)]
pub struct AppError(pub LibError);

impl From<LibError> for AppError {
    fn from(value: LibError) -> Self {
        Self(value)
    }
}

fn status_for(err: &LibError) -> StatusCode {
    match err.kind {
        ErrorKind::InvalidInput if err.is_cycle() => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorKind::InvalidInput => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Cancelled => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::Database | ErrorKind::Unknown => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            tracing::error!(kind = ?self.0.kind, stage = ?self.0.stage, error = %self.0.source, "dag api request failed");
        } else {
            tracing::debug!(kind = ?self.0.kind, code = self.0.code, error = %self.0.source, "dag api request rejected");
        }

        let body = json!({
            "error": {
                "code": self.0.code,
                "message": self.0.public,
                "details": self.0.details,
            }
        });
        (status, Json(body)).into_response()
    }
}

/// Application state for [`routes`].
pub trait DagApp: Clone + Send + Sync + 'static {
    type Store: GraphStore;

    fn operations(&self) -> GraphOperations<Self::Store>;
}

/// Body of `POST /dag`: the graph id plus its full content.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplaceGraphRequest {
    pub id: GraphId,
    #[serde(flatten)]
    pub payload: ReplaceGraphPayload,
}

fn not_found(code: &'static str, public: &'static str, id: &str) -> AppError {
    AppError(LibError::not_found(code, public, anyhow!("{} not found", id)))
}

async fn replace_graph_handler<S: DagApp>(
    State(app): State<S>,
    Json(request): Json<ReplaceGraphRequest>,
) -> Result<impl IntoResponse, AppError> {
    let Some(graph_id) = present(Some(request.id.as_str())).map(GraphId::from) else {
        return Err(AppError(LibError::invalid_with_code(
            "missing_graph_id",
            "Graph id is required",
            anyhow!("replace request without graph id"),
        )));
    };

    let graph = app
        .operations()
        .replace_graph(&graph_id, request.payload)
        .await?;
    Ok((StatusCode::CREATED, Json(graph)))
}

async fn get_graph_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
) -> Result<impl IntoResponse, AppError> {
    match app.operations().get_graph(&graph_id).await? {
        Some(graph) => Ok(Json(graph)),
        None => Err(not_found("graph_not_found", "Graph not found", graph_id.as_str())),
    }
}

async fn delete_graph_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().delete_graph(&graph_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_node_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
    Json(payload): Json<AddNodePayload>,
) -> Result<impl IntoResponse, AppError> {
    let id = app.operations().add_node(&graph_id, payload).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn list_nodes_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
) -> Result<impl IntoResponse, AppError> {
    let nodes = app.operations().list_nodes(&graph_id).await?;
    Ok(Json(nodes))
}

async fn get_node_handler<S: DagApp>(
    State(app): State<S>,
    Path(node_id): Path<NodeId>,
) -> Result<impl IntoResponse, AppError> {
    match app.operations().get_node(&node_id).await? {
        Some(node) => Ok(Json(node)),
        None => Err(not_found("node_not_found", "Node not found", node_id.as_str())),
    }
}

async fn update_node_handler<S: DagApp>(
    State(app): State<S>,
    Path(node_id): Path<NodeId>,
    Json(payload): Json<UpdateNodePayload>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().update_node(&node_id, payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_node_handler<S: DagApp>(
    State(app): State<S>,
    Path(node_id): Path<NodeId>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().delete_node(&node_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_edge_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
    Json(payload): Json<AddEdgePayload>,
) -> Result<impl IntoResponse, AppError> {
    let id = app.operations().add_edge(&graph_id, payload).await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn list_edges_handler<S: DagApp>(
    State(app): State<S>,
    Path(graph_id): Path<GraphId>,
) -> Result<impl IntoResponse, AppError> {
    let edges = app.operations().list_edges(&graph_id).await?;
    Ok(Json(edges))
}

async fn get_edge_handler<S: DagApp>(
    State(app): State<S>,
    Path(edge_id): Path<EdgeId>,
) -> Result<impl IntoResponse, AppError> {
    match app.operations().get_edge(&edge_id).await? {
        Some(edge) => Ok(Json(edge)),
        None => Err(not_found("edge_not_found", "Edge not found", edge_id.as_str())),
    }
}

async fn update_edge_handler<S: DagApp>(
    State(app): State<S>,
    Path(edge_id): Path<EdgeId>,
    Json(payload): Json<UpdateEdgePayload>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().update_edge(&edge_id, payload).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_edge_handler<S: DagApp>(
    State(app): State<S>,
    Path(edge_id): Path<EdgeId>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().delete_edge(&edge_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_schema_handler<S: DagApp>(
    State(app): State<S>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().store().create_schema().await?;
    Ok(Json(json!({ "message": "schema created" })))
}

async fn drop_schema_handler<S: DagApp>(
    State(app): State<S>,
) -> Result<impl IntoResponse, AppError> {
    app.operations().store().drop_schema().await?;
    Ok(Json(json!({ "message": "schema dropped" })))
}

pub fn routes<S: DagApp>() -> Router<S> {
    tracing::info!("Registering route /schema [POST,DELETE]");
    tracing::info!("Registering route /dag [POST]");
    tracing::info!("Registering route /dag/{{graph_id}} [GET,DELETE]");
    tracing::info!("Registering route /dag/{{graph_id}}/nodes [GET,POST]");
    tracing::info!("Registering route /dag/{{graph_id}}/edges [GET,POST]");
    tracing::info!("Registering route /nodes/{{node_id}} [GET,PUT,DELETE]");
    tracing::info!("Registering route /edges/{{edge_id}} [GET,PUT,DELETE]");

    Router::new()
        .route(
            "/schema",
            post(create_schema_handler::<S>).delete(drop_schema_handler::<S>),
        )
        .route("/dag", post(replace_graph_handler::<S>))
        .route(
            "/dag/{graph_id}",
            get(get_graph_handler::<S>).delete(delete_graph_handler::<S>),
        )
        .route(
            "/dag/{graph_id}/nodes",
            get(list_nodes_handler::<S>).post(add_node_handler::<S>),
        )
        .route(
            "/dag/{graph_id}/edges",
            get(list_edges_handler::<S>).post(add_edge_handler::<S>),
        )
        .route(
            "/nodes/{node_id}",
            get(get_node_handler::<S>)
                .put(update_node_handler::<S>)
                .delete(delete_node_handler::<S>),
        )
        .route(
            "/edges/{edge_id}",
            get(get_edge_handler::<S>)
                .put(update_edge_handler::<S>)
                .delete(delete_edge_handler::<S>),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EdgeSide, ErrorDetails};
    use crate::models::NewNode;
    use crate::store::MemoryGraphStore;

    #[derive(Clone)]
    struct TestApp {
        operations: GraphOperations<MemoryGraphStore>,
    }

    impl DagApp for TestApp {
        type Store = MemoryGraphStore;

        fn operations(&self) -> GraphOperations<MemoryGraphStore> {
            self.operations.clone()
        }
    }

    async fn message(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        serde_json::from_slice(&bytes).expect("json body")
    }

    #[tokio::test]
    async fn schema_routes_provision_and_clear_storage() {
        let app = TestApp {
            operations: GraphOperations::new(MemoryGraphStore::new()),
        };
        let graph = GraphId::from("flow");

        let created = create_schema_handler(State(app.clone()))
            .await
            .expect("create schema")
            .into_response();
        assert_eq!(created.status(), StatusCode::OK);
        assert_eq!(message(created).await["message"], "schema created");

        app.operations()
            .replace_graph(
                &graph,
                ReplaceGraphPayload {
                    nodes: vec![NewNode {
                        id: Some(NodeId::from("a")),
                        ..NewNode::default()
                    }],
                    edges: vec![],
                },
            )
            .await
            .expect("seed");

        let dropped = drop_schema_handler(State(app.clone()))
            .await
            .expect("drop schema")
            .into_response();
        assert_eq!(dropped.status(), StatusCode::OK);
        assert_eq!(message(dropped).await["message"], "schema dropped");
        assert!(app.operations().get_graph(&graph).await.expect("get").is_none());
    }

    #[test]
    fn cycles_map_to_unprocessable_entity() {
        let cycle = LibError::invalid_with_code("graph_cycle", "Graph must be acyclic", anyhow!("x"));
        assert_eq!(status_for(&cycle), StatusCode::UNPROCESSABLE_ENTITY);

        let unknown_ref = LibError::unknown_reference("ghost", EdgeSide::From);
        assert_eq!(status_for(&unknown_ref), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn remaining_kinds_map_to_statuses() {
        let cases = [
            (
                LibError::not_found("edge_not_found", "Edge not found", anyhow!("x")),
                StatusCode::NOT_FOUND,
            ),
            (
                LibError::conflict("duplicate_identifier", "Identifier already exists", anyhow!("x")),
                StatusCode::CONFLICT,
            ),
            (
                LibError::cancelled("Operation cancelled", anyhow!("x")),
                StatusCode::REQUEST_TIMEOUT,
            ),
            (
                LibError::database("Failed to query graph nodes", anyhow!("x")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, expected) in cases {
            assert_eq!(status_for(&err), expected, "{}", err.code);
        }
    }

    #[tokio::test]
    async fn error_body_carries_code_and_details() {
        let response = AppError(LibError::unknown_reference("ghost", EdgeSide::To)).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body should be readable");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        assert_eq!(body["error"]["code"], "unknown_node_ref");
        assert_eq!(
            body["error"]["details"],
            serde_json::to_value(ErrorDetails::UnknownReference {
                reference: "ghost".to_string(),
                side: EdgeSide::To,
            })
            .expect("details serialize")
        );
    }

    #[test]
    fn replace_request_flattens_payload() {
        let request: ReplaceGraphRequest = serde_json::from_value(json!({
            "id": "flow",
            "nodes": [{"ref": "a"}],
            "edges": []
        }))
        .expect("request should deserialize");

        assert_eq!(request.id, GraphId::from("flow"));
        assert_eq!(request.payload.nodes.len(), 1);
    }
}
