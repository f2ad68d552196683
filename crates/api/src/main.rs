use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use eventmill_api::{AppState, build_app, server, tasks};
use eventmill_events::{Consumer, ConsumerError, DispatchEngine, DispatchTable, EngineConfig};
use eventmill_infra::checkpoint::{InMemoryCheckpointStore, PostgresCheckpointStore};
use eventmill_infra::config::CheckpointBackend;
use eventmill_infra::log::InMemoryLog;
use eventmill_infra::queue::InMemoryQueue;
use eventmill_infra::{
    CheckpointStore, LogProducer, MessageQueue, Producer, QueueConsumer, QueueConsumerConfig,
    QueueProducer, Settings, ShardLog, StreamConsumer, StreamConsumerConfig,
};

/// Event routed to the built-in log task.
const TEST_EVENT: &str = "test_event";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env().context("loading configuration")?;
    eventmill_observability::init(&settings.log_level);

    let table = DispatchTable::new().route(TEST_EVENT, tasks::log_event);
    table.validate([TEST_EVENT])?;

    match settings.queue.clone() {
        Some(queue_settings) => {
            let queue = build_queue(&settings, &queue_settings.topic, &queue_settings.channel)?;
            let config = QueueConsumerConfig::new(&queue_settings.topic, &queue_settings.channel)
                .with_handler_count(queue_settings.handler_count)
                .with_max_in_flight(queue_settings.max_in_flight);
            let consumer = QueueConsumer::new(queue.clone(), config);
            let producer: Arc<dyn Producer> = Arc::new(QueueProducer::new(queue));
            run(&settings, consumer, producer, table).await
        }
        None => {
            let log = build_log(&settings)?;
            let checkpoints = build_checkpoints(&settings).await?;
            let config = StreamConsumerConfig::new(&settings.stream, &settings.shard_path)
                .with_advance_policy(settings.advance_policy);
            let consumer = StreamConsumer::new(log.clone(), checkpoints, config);
            let producer: Arc<dyn Producer> = Arc::new(LogProducer::new(log, &settings.stream));
            run(&settings, consumer, producer, table).await
        }
    }
}

enum Exit {
    Signal,
    Http(anyhow::Result<()>),
    Engine(Result<(), ConsumerError>),
}

async fn run<C: Consumer + 'static>(
    settings: &Settings,
    consumer: C,
    producer: Arc<dyn Producer>,
    table: DispatchTable,
) -> anyhow::Result<()> {
    let engine = Arc::new(DispatchEngine::new(
        consumer,
        table,
        EngineConfig::new(settings.max_jobs, settings.drain_timeout).with_name("eventmill-server"),
    ));

    let mut state = AppState::new(producer);
    if let Some(secret) = &settings.auth_secret {
        state = state.with_auth_secret(secret);
    }
    let app = build_app(state);

    let shutdown = CancellationToken::new();
    let mut http: JoinHandle<anyhow::Result<()>> = {
        let address = settings.address;
        let tls = settings.tls.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            server::serve(app, address, tls.as_ref(), shutdown).await?;
            Ok(())
        })
    };
    let mut consuming = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.start().await })
    };

    let exit = tokio::select! {
        _ = shutdown_signal() => {
            info!("received interrupt");
            Exit::Signal
        }
        res = &mut http => {
            info!("received error from http server");
            Exit::Http(res.unwrap_or_else(|e| Err(e.into())))
        }
        res = &mut consuming => {
            info!("received error from dispatch engine");
            Exit::Engine(res.unwrap_or_else(|e| Err(ConsumerError::Join(e.to_string()))))
        }
    };

    shutdown.cancel();
    engine.stop().await;

    let (http_result, engine_result) = match exit {
        Exit::Signal => (join_http(http).await, join_engine(consuming).await),
        Exit::Http(res) => (res, join_engine(consuming).await),
        Exit::Engine(res) => (join_http(http).await, res),
    };

    info!(stats = ?engine.stats(), "stopped");

    if let Err(e) = &http_result {
        error!(error = %e, "http server failed");
    }
    engine_result.context("dispatch engine")?;
    http_result
}

async fn join_http(handle: JoinHandle<anyhow::Result<()>>) -> anyhow::Result<()> {
    handle.await.unwrap_or_else(|e| Err(e.into()))
}

async fn join_engine(handle: JoinHandle<Result<(), ConsumerError>>) -> Result<(), ConsumerError> {
    handle
        .await
        .unwrap_or_else(|e| Err(ConsumerError::Join(e.to_string())))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "couldn't listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "couldn't listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn build_log(settings: &Settings) -> anyhow::Result<Arc<dyn ShardLog>> {
    #[cfg(feature = "redis")]
    {
        if let Some(url) = &settings.redis_url {
            let log = eventmill_infra::log::RedisStreamsLog::new(url, "eventmill:")?;
            info!(backend = "redis", stream = %settings.stream, "shard log");
            return Ok(Arc::new(log));
        }
    }

    warn!(stream = %settings.stream, "using the in-memory shard log; events do not survive a restart");
    let log = InMemoryLog::new();
    log.create_stream(&settings.stream, 1);
    Ok(Arc::new(log))
}

fn build_queue(
    settings: &Settings,
    topic: &str,
    channel: &str,
) -> anyhow::Result<Arc<dyn MessageQueue>> {
    #[cfg(feature = "redis")]
    {
        if let Some(url) = &settings.redis_url {
            let queue = eventmill_infra::queue::RedisStreamsQueue::new(url, topic, channel)?;
            info!(backend = "redis", topic, channel, "queue");
            return Ok(Arc::new(queue));
        }
    }

    #[cfg(not(feature = "redis"))]
    let _ = settings;

    warn!(topic, channel, "using the in-memory queue; messages do not survive a restart");
    Ok(Arc::new(InMemoryQueue::new()))
}

async fn build_checkpoints(settings: &Settings) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    match settings.checkpoint_backend {
        CheckpointBackend::Memory => {
            warn!("using the in-memory checkpoint store; position resets on restart");
            Ok(Arc::new(InMemoryCheckpointStore::new()))
        }
        CheckpointBackend::Redis => redis_checkpoints(settings),
        CheckpointBackend::Postgres => {
            let url = settings
                .database_url
                .as_deref()
                .context("EVENTMILL_DATABASE_URL is required for the postgres checkpoint store")?;
            let store = PostgresCheckpointStore::connect_lazy(url)?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(feature = "redis")]
fn redis_checkpoints(settings: &Settings) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    let url = settings
        .redis_url
        .as_deref()
        .context("EVENTMILL_REDIS_URL is required for the redis checkpoint store")?;
    Ok(Arc::new(
        eventmill_infra::checkpoint::RedisCheckpointStore::new(url)?,
    ))
}

#[cfg(not(feature = "redis"))]
fn redis_checkpoints(_settings: &Settings) -> anyhow::Result<Arc<dyn CheckpointStore>> {
    anyhow::bail!("the redis checkpoint store needs the `redis` feature")
}
