use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use subseq_dag::api::DagApp;
use subseq_dag::config::DagConfig;
use subseq_dag::operations::GraphOperations;
use subseq_dag::store::{GraphStore, PgGraphStore};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Clone)]
struct ExampleApp {
    operations: GraphOperations<PgGraphStore>,
}

impl DagApp for ExampleApp {
    type Store = PgGraphStore;

    fn operations(&self) -> GraphOperations<PgGraphStore> {
        self.operations.clone()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,subseq_dag=debug")),
        )
        .init();

    let config = DagConfig::from_env()?;

    let store = PgGraphStore::connect(&config.database_url, &config.pool)
        .await
        .context("failed to connect to postgres")?;
    store
        .create_schema()
        .await
        .context("failed to create dag tables")?;

    let shutdown = CancellationToken::new();
    let operations = GraphOperations::new(store)
        .with_operation_timeout(config.operation_timeout)
        .with_cancellation(shutdown.clone());
    let app_state = ExampleApp { operations };

    let app = Router::new()
        .route("/healthz", get(health_handler))
        .merge(subseq_dag::api::routes::<ExampleApp>())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind listener on {}", config.bind))?;

    tracing::info!(bind = %config.bind, "subseq_dag example server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down, cancelling in-flight graph operations");
            shutdown.cancel();
        })
        .await
        .context("example server failed")
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({
        "ok": true
    }))
}
