//! # Orchestrator Server
//!
//! Process entrypoint wiring config load, storage connections, and every
//! orchestration subsystem (lifecycle admission via HTTP, targeting,
//! schedulers, outbox publisher, orchestration consumer, DLT consumer).
//! Grounded on `tasker-orchestration/src/bin/server.rs`'s bootstrap /
//! graceful-shutdown shape.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::info;

use broadcast_queue::{PgQueue, SharedListener};
use broadcast_shared::config::BroadcastConfig;
use broadcast_shared::logging;
use broadcast_shared::messaging::TopicRouterKind;
use broadcast_shared::presence::PresenceStore;

use broadcast_orchestration::dlq::{DlqService, DltConsumer};
use broadcast_orchestration::http::{self, AppState};
use broadcast_orchestration::lifecycle::LifecycleService;
use broadcast_orchestration::orchestration_consumer::OrchestrationConsumer;
use broadcast_orchestration::outbox_publisher::OutboxPublisher;
use broadcast_orchestration::schedulers::Scheduler;
use broadcast_orchestration::targeting::TargetingService;
use broadcast_orchestration::user_directory::StaticUserDirectory;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    info!(version = env!("CARGO_PKG_VERSION"), "starting broadcast orchestrator");

    let config = BroadcastConfig::load()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.common.database.max_connections)
        .connect(&config.common.database.url)
        .await?;
    // Both this crate's domain tables and `broadcast-queue`'s queue table
    // are migrated from whichever binary boots first, so a fresh
    // environment never depends on start order between pods and the
    // orchestrator.
    sqlx::migrate!("../broadcast-queue/migrations").run(&pool).await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let presence = PresenceStore::connect(&config.common.cache.url).await?;
    let queue = PgQueue::new(pool.clone());
    let listener = SharedListener::new(pool.clone());
    let topic_router = TopicRouterKind::Default(broadcast_shared::messaging::DefaultTopicRouter::new(
        config.common.topics.orchestration_topic.clone(),
        config.common.topics.worker_topic_prefix.clone(),
    ));

    let directory = Arc::new(StaticUserDirectory::empty());
    let lifecycle = Arc::new(LifecycleService::new(
        pool.clone(),
        config.orchestration.clone(),
        topic_router.clone(),
        StaticUserDirectory::empty(),
    ));
    let targeting = Arc::new(TargetingService::new(
        pool.clone(),
        &config.orchestration,
        StaticUserDirectory::empty(),
    ));
    let dlq = Arc::new(DlqService::new(pool.clone(), queue.clone()));

    let scheduler = Arc::new(Scheduler::new(
        pool.clone(),
        config.orchestration.clone(),
        topic_router.clone(),
        presence.clone(),
        directory.clone(),
        targeting.clone(),
    ));
    let scheduler_handles = scheduler.spawn();

    let outbox_publisher = OutboxPublisher::new(pool.clone(), queue.clone(), config.orchestration.clone());
    tokio::spawn(async move { outbox_publisher.run().await });

    let orchestration_consumer = OrchestrationConsumer::new(
        pool.clone(),
        queue.clone(),
        presence.clone(),
        topic_router.clone(),
        listener.clone(),
    );
    tokio::spawn(async move { orchestration_consumer.run().await });

    let dlt_consumer = DltConsumer::new(pool.clone(), queue.clone());
    tokio::spawn(async move { dlt_consumer.run().await });

    let state = AppState {
        pool: pool.clone(),
        queue: queue.clone(),
        lifecycle,
        dlq,
    };
    let app = http::router(state);
    let addr = format!("{}:{}", config.orchestration.web.host, config.orchestration.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "admin HTTP surface listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await?;

    for handle in scheduler_handles {
        handle.abort();
    }

    info!("broadcast orchestrator shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}
