use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;

use haven_notification_service::broker::{consumer_options, create_broker_backend, EventConsumer};
use haven_notification_service::config::Settings;
use haven_notification_service::postgres::PostgresPool;
use haven_notification_service::redis::RedisPool;
use haven_notification_service::resilience::CircuitBreaker;
use haven_notification_service::server::{create_app, AppState};
use haven_notification_service::shutdown::GracefulShutdown;
use haven_notification_service::tasks::{
    ApprovalSweeper, IndependenceEvaluator, LivenessTask, RetentionTask,
};
use haven_notification_service::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::new().context("Failed to load configuration")?;
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    let postgres_pool = connect_postgres(&settings).await?;
    let redis_pool = connect_redis(&settings)?;
    let broker_backend = create_broker_backend(&settings.broker, redis_pool.clone());

    let state = AppState::new(
        settings.clone(),
        broker_backend,
        postgres_pool.clone(),
        redis_pool,
    );
    tracing::info!("Application state initialized");

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut tasks = Vec::new();

    let consumer = EventConsumer::new(
        (*state.broker).clone(),
        state.pipeline.clone(),
        consumer_options(&settings.broker),
    );
    let consumer_shutdown = shutdown_tx.subscribe();
    tasks.push(tokio::spawn(async move {
        let exit = consumer.run(consumer_shutdown).await;
        tracing::info!(exit = ?exit, "Broker consumer exited");
    }));

    let liveness = LivenessTask::new(
        settings.presence.clone(),
        state.presence.clone(),
        state.conversations.clone(),
        shutdown_tx.subscribe(),
    );
    tasks.push(tokio::spawn(liveness.run()));

    let sweeper = ApprovalSweeper::new(
        settings.guardian.sweep_interval_secs,
        state.approvals.clone(),
        shutdown_tx.subscribe(),
    );
    tasks.push(tokio::spawn(sweeper.run()));

    let evaluator = IndependenceEvaluator::new(
        settings.independence.evaluation_interval_secs,
        state.independence.clone(),
        shutdown_tx.subscribe(),
    );
    tasks.push(tokio::spawn(evaluator.run()));

    let retention = RetentionTask::new(
        settings.inbox.cleanup_interval_secs,
        state.retention,
        state.inbox.clone(),
        state.broker.clone(),
        shutdown_tx.subscribe(),
    )
    .with_conversations(state.conversations.clone(), settings.messaging.retention());
    tasks.push(tokio::spawn(retention.run()));

    let presence = state.presence.clone();
    let app = create_app(state);

    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let result = GracefulShutdown::new(presence, shutdown_tx)
        .execute("server stopping", tasks)
        .await;
    if !result.success {
        tracing::warn!(
            sessions_remaining = result.sessions_remaining,
            tasks_stopped = result.tasks_stopped,
            "Shutdown finished with leftovers"
        );
    }

    if let Some(pool) = postgres_pool {
        pool.close().await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Connect when a URL is set or any backend needs Postgres.
async fn connect_postgres(settings: &Settings) -> Result<Option<Arc<PostgresPool>>> {
    let wanted = [
        &settings.inbox.backend,
        &settings.guardian.backend,
        &settings.directory.backend,
        &settings.independence.backend,
    ]
    .iter()
    .any(|backend| backend.as_str() == "postgres");
    if settings.database.url.is_none() {
        if wanted {
            tracing::warn!("A postgres backend is configured but database.url is unset");
        }
        return Ok(None);
    }

    let breaker = Arc::new(CircuitBreaker::new("postgres"));
    let pool = PostgresPool::new(&settings.database, breaker)
        .await
        .context("Failed to connect to PostgreSQL")?;
    pool.ensure_schema()
        .await
        .context("Failed to prepare PostgreSQL schema")?;
    Ok(Some(Arc::new(pool)))
}

fn connect_redis(settings: &Settings) -> Result<Option<Arc<RedisPool>>> {
    if settings.broker.backend != "redis" {
        return Ok(None);
    }
    let breaker = Arc::new(CircuitBreaker::new("redis"));
    let pool = RedisPool::new(&settings.redis, breaker).context("Failed to create Redis client")?;
    Ok(Some(Arc::new(pool)))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
