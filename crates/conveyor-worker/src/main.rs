use std::sync::Arc;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::{
    DispatchLayer, HandlerRegistry, JobHandler, JobId, ProgressReporter, StateStore,
};
use conveyor_dispatch::{PollingDispatch, RedisDispatch};
use conveyor_store::PostgresStore;
use conveyor_worker::{metrics, Worker, WorkerConfig};

/// Built-in demo handler: returns the payload unchanged, or fails when the
/// payload asks for it with `{"fail": true}`.
struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn handle(
        &self,
        _job_id: JobId,
        payload: serde_json::Value,
        _progress: ProgressReporter,
    ) -> anyhow::Result<serde_json::Value> {
        if payload.get("fail").and_then(|v| v.as_bool()) == Some(true) {
            anyhow::bail!("simulated failure requested by payload");
        }
        Ok(payload)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    metrics::init_metrics();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor_worker=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorkerConfig::from_env();

    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set (postgres://...)");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to Postgres");
    let store: Arc<dyn StateStore> = Arc::new(PostgresStore::new(pool));

    let dispatch: Arc<dyn DispatchLayer> = match std::env::var("REDIS_URL") {
        Ok(url) => Arc::new(RedisDispatch::connect(&url).await?),
        Err(_) => {
            tracing::info!("REDIS_URL not set, polling the state store");
            Arc::new(PollingDispatch::new(store.clone()))
        }
    };

    let registry = Arc::new(HandlerRegistry::new());
    registry.register("echo", || Arc::new(EchoHandler))?;

    let worker = Worker::new(store, dispatch, registry, config);
    worker.run().await?;
    Ok(())
}
