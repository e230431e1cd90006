use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use conveyor_core::{
    DispatchLayer, DispatchRequest, Dispatcher, HandlerRegistry, JobFilter, JobHandler, JobId,
    JobStatus, ProgressReporter, QueueError, StateStore,
};
use conveyor_dispatch::{PollingDispatch, RedisDispatch};
use conveyor_store::PostgresStore;
use conveyor_worker::{Worker, WorkerConfig};

#[derive(Parser)]
#[command(name = "conveyor", version, about = "CLI for the conveyor job queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dispatch a job
    Dispatch {
        /// Handler selector, e.g. email.send
        #[arg(long = "type")]
        job_type: String,

        /// JSON payload string, e.g. '{"hello":"world"}'
        #[arg(long)]
        json: String,

        #[arg(long, default_value = "default")]
        queue: String,

        #[arg(long)]
        max_attempts: Option<i32>,

        /// Idempotency key: while a job with this key is active, the same
        /// job id is returned instead of creating a new one
        #[arg(long)]
        request_id: Option<String>,
    },

    /// Show one job record as JSON
    Status { id: JobId },

    /// List job records
    List {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        queue: Option<String>,

        #[arg(long, default_value_t = 50)]
        limit: i64,

        #[arg(long, default_value_t = 0)]
        offset: i64,
    },

    /// Count job records
    Count {
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        queue: Option<String>,
    },

    /// Delete completed jobs older than the threshold
    Prune {
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// Run a worker with the built-in echo handler (same as the
    /// conveyor-worker binary, but convenient)
    Worker {
        #[arg(long, default_value = "default")]
        queue: String,
    },
}

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

async fn build_store() -> anyhow::Result<Arc<dyn StateStore>> {
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL must be set (postgres://...)")?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(Arc::new(PostgresStore::new(pool)))
}

async fn build_dispatch(store: Arc<dyn StateStore>) -> anyhow::Result<Arc<dyn DispatchLayer>> {
    match std::env::var("REDIS_URL") {
        Ok(url) => Ok(Arc::new(RedisDispatch::connect(&url).await?)),
        Err(_) => Ok(Arc::new(PollingDispatch::new(store))),
    }
}

fn parse_status(s: Option<String>) -> anyhow::Result<Option<JobStatus>> {
    s.map(|s| JobStatus::parse(&s).map_err(anyhow::Error::new))
        .transpose()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conveyor=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dispatch {
            job_type,
            json,
            queue,
            max_attempts,
            request_id,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&json).context("invalid JSON payload")?;

            let store = build_store().await?;
            let dispatch = build_dispatch(store.clone()).await?;
            let dispatcher = Dispatcher::new(store, dispatch);

            match request_id {
                Some(request_id) => {
                    let outcome = dispatcher
                        .dispatch_idempotent(
                            &job_type,
                            payload,
                            &request_id,
                            Some(queue),
                            max_attempts,
                        )
                        .await?;
                    println!("{} created={}", outcome.id, outcome.created);
                }
                None => {
                    let id = dispatcher
                        .dispatch(DispatchRequest {
                            job_type,
                            payload,
                            queue: Some(queue),
                            max_attempts,
                            request_id: None,
                        })
                        .await?;
                    println!("{id}");
                }
            }
        }

        Commands::Status { id } => {
            let store = build_store().await?;
            let record = store
                .find(id)
                .await?
                .ok_or(QueueError::NotFound)
                .with_context(|| format!("job {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }

        Commands::List {
            status,
            queue,
            limit,
            offset,
        } => {
            let store = build_store().await?;
            let records = store
                .list(JobFilter {
                    status: parse_status(status)?,
                    queue,
                    limit,
                    offset,
                })
                .await?;
            for record in records {
                println!(
                    "{}\t{}\t{}\t{}\tattempts={}/{}",
                    record.id,
                    record.queue,
                    record.job_type,
                    record.status,
                    record.attempts,
                    record.max_attempts
                );
            }
        }

        Commands::Count { status, queue } => {
            let store = build_store().await?;
            let n = store.count(parse_status(status)?, queue.as_deref()).await?;
            println!("{n}");
        }

        Commands::Prune { days } => {
            let store = build_store().await?;
            let n = store.prune_completed(days).await?;
            println!("{n}");
        }

        Commands::Worker { queue } => {
            let store = build_store().await?;
            let dispatch = build_dispatch(store.clone()).await?;

            let registry = Arc::new(HandlerRegistry::new());
            registry.register("echo", || Arc::new(EchoHandler))?;

            let config = WorkerConfig {
                queue,
                ..WorkerConfig::from_env()
            };
            let worker = Worker::new(store, dispatch, registry, config);
            worker.run().await?;
        }
    }

    Ok(())
}
