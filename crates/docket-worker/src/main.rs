//! Docket worker - runs the question, document and email queues until
//! SIGINT or SIGTERM, then drains in-flight jobs and exits.
//!
//! # Usage
//!
//! ```bash
//! # SQLite broker in the working directory
//! docket-worker
//!
//! # Shared Redis broker, JSON logs
//! BROKER_KIND=redis BROKER_HOST=redis.internal docket-worker --log-json
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use docket_jobs::{
    register_queues, AnswerProvider, JobLogSink, OpenAiProvider, Services, StaticAnswerProvider,
};
use docket_persist::{SqliteConfig, SqliteQueueBackend};
use docket_queue::{
    ChannelSink, Fanout, JobEvent, MemoryQueue, QueueBackend, QueueRegistry, ShutdownCoordinator,
    ShutdownOutcome,
};

mod config;
mod telemetry;

use config::{BrokerKind, Settings};

const EVENT_BUFFER: usize = 1024;
const TALLY_FLUSH: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    let settings = Settings::parse();
    telemetry::init_tracing(settings.log_filter.as_deref(), settings.log_json)?;

    info!(broker = %settings.broker_kind, "Starting docket worker");

    let backend = connect_backend(&settings).await?;
    let mut registry = QueueRegistry::new(backend);
    register_queues(&mut registry, &settings.job_defaults(), services(&settings))
        .context("Failed to register queues")?;
    let registry = Arc::new(registry);

    let (tally_sink, events) = ChannelSink::new(EVENT_BUFFER);
    let tally = tokio::spawn(tally_events(events));
    let sink = Fanout::new().with(JobLogSink).with(tally_sink);

    let pools = registry
        .start_workers(Arc::new(sink), settings.worker_config())
        .context("Failed to start worker pools")?;
    info!(queues = ?registry.names(), "Worker ready, waiting for jobs");

    let outcome = ShutdownCoordinator::new(registry, pools)
        .run_until_signal(settings.shutdown_grace())
        .await;

    match tokio::time::timeout(TALLY_FLUSH, tally).await {
        Ok(Ok(tally)) => info!(
            completed = tally.completed,
            retried = tally.retried,
            failed = tally.failed,
            errors = tally.errors,
            "Job summary"
        ),
        _ => warn!("Job summary unavailable, event stream did not close"),
    }

    Ok(match outcome {
        ShutdownOutcome::Drained => ExitCode::SUCCESS,
        ShutdownOutcome::Forced { .. } => ExitCode::FAILURE,
    })
}

async fn connect_backend(settings: &Settings) -> Result<Arc<dyn QueueBackend>> {
    match settings.broker_kind {
        BrokerKind::Sqlite => {
            let backend = SqliteQueueBackend::connect(&SqliteConfig::new(&settings.database_url))
                .await
                .with_context(|| format!("Failed to open SQLite broker at {}", settings.database_url))?;
            info!(url = %settings.database_url, "Connected to SQLite broker");
            Ok(Arc::new(backend))
        }
        BrokerKind::Redis => connect_redis(settings).await,
        BrokerKind::Memory => {
            warn!("Using in-memory broker, queued jobs are lost on exit");
            Ok(Arc::new(MemoryQueue::new()))
        }
    }
}

#[cfg(feature = "redis")]
async fn connect_redis(settings: &Settings) -> Result<Arc<dyn QueueBackend>> {
    let config = settings.broker_config();
    let backend = docket_persist::RedisQueueBackend::connect(config)
        .await
        .with_context(|| {
            format!(
                "Failed to connect to Redis broker at {}:{}",
                settings.broker_host, settings.broker_port
            )
        })?;
    info!(host = %settings.broker_host, port = settings.broker_port, "Connected to Redis broker");
    Ok(Arc::new(backend))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_settings: &Settings) -> Result<Arc<dyn QueueBackend>> {
    anyhow::bail!("Redis broker requested but docket-worker was built without the `redis` feature")
}

fn services(settings: &Settings) -> Services {
    let answers: Arc<dyn AnswerProvider> = match settings.openai_api_key() {
        Some(key) => {
            info!(model = %settings.ai_model, "Answering questions with OpenAI");
            Arc::new(
                OpenAiProvider::new(key, &settings.ai_model).with_max_tokens(settings.ai_max_tokens),
            )
        }
        None => {
            warn!("OPENAI_API_KEY not set, questions get a placeholder answer");
            Arc::new(StaticAnswerProvider::default())
        }
    };

    Services {
        answers,
        ..Services::default()
    }
}

#[derive(Debug, Default)]
struct Tally {
    completed: u64,
    retried: u64,
    failed: u64,
    errors: u64,
}

/// Count events until every sender is gone.
async fn tally_events(mut events: mpsc::Receiver<JobEvent>) -> Tally {
    let mut tally = Tally::default();
    while let Some(event) = events.recv().await {
        match event {
            JobEvent::Completed { .. } => tally.completed += 1,
            JobEvent::Retrying { .. } => tally.retried += 1,
            JobEvent::Failed { .. } => tally.failed += 1,
            JobEvent::Error { .. } => tally.errors += 1,
        }
    }
    tally
}
