//! # Broadcast Pod Server
//!
//! Process entrypoint for one worker pod: wires config load, storage
//! connections, the SSE connection manager, the worker-topic consumer,
//! heartbeat tick loops, inbox assembly, and the HTTP surface. Grounded on
//! `broadcast-orchestration/src/bin/orchestrator.rs`'s bootstrap /
//! graceful-shutdown shape, the same way that binary is grounded on
//! `tasker-orchestration/src/bin/server.rs`.

use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tracing::info;

use broadcast_queue::{PgQueue, SharedListener};
use broadcast_shared::config::BroadcastConfig;
use broadcast_shared::logging;
use broadcast_shared::messaging::{DefaultTopicRouter, TopicRouterKind};
use broadcast_shared::presence::PresenceStore;

use broadcast_worker::http::{self, AppState};
use broadcast_worker::inbox::InboxService;
use broadcast_worker::sse::SseConnectionManager;
use broadcast_worker::worker_consumer::WorkerConsumer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    logging::init_tracing();

    let config = BroadcastConfig::load()?;
    let cluster = config.common.cluster_name.clone();
    let pod = config.common.pod_name.clone();

    info!(version = env!("CARGO_PKG_VERSION"), cluster, pod, "starting broadcast pod");

    let pool = PgPoolOptions::new()
        .max_connections(config.common.database.max_connections)
        .connect(&config.common.database.url)
        .await?;
    // Same idempotent migrate-on-boot as the orchestrator, so a pod can
    // come up first in a fresh environment without waiting on it.
    sqlx::migrate!("../broadcast-queue/migrations").run(&pool).await?;
    sqlx::migrate!("../broadcast-orchestration/migrations").run(&pool).await?;

    let presence = PresenceStore::connect(&config.common.cache.url).await?;
    let queue = PgQueue::new(pool.clone());
    let listener = SharedListener::new(pool.clone());
    let topic_router = TopicRouterKind::Default(DefaultTopicRouter::new(
        config.common.topics.orchestration_topic.clone(),
        config.common.topics.worker_topic_prefix.clone(),
    ));
    let worker_topic = topic_router.worker_topic(&cluster, &pod);

    let sse = Arc::new(SseConnectionManager::new(
        config.worker.clone(),
        presence.clone(),
        cluster.clone(),
        pod.clone(),
    ));

    let worker_consumer = WorkerConsumer::new(
        pool.clone(),
        queue.clone(),
        presence.clone(),
        worker_topic.clone(),
        sse.clone(),
        listener.clone(),
    );
    tokio::spawn(async move { worker_consumer.run().await });

    let heartbeat_sse = sse.clone();
    let heartbeat_interval = Duration::from_millis(config.worker.sse.heartbeat_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = heartbeat_sse.heartbeat_tick().await {
                tracing::warn!(error = %e, "SSE heartbeat tick failed");
            }
        }
    });

    let pod_heartbeat_sse = sse.clone();
    let pod_heartbeat_interval = Duration::from_millis(config.worker.sse.pod_heartbeat_interval_ms);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(pod_heartbeat_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = pod_heartbeat_sse.pod_heartbeat_tick().await {
                tracing::warn!(error = %e, "pod self-heartbeat failed");
            }
        }
    });

    let inbox = Arc::new(InboxService::new(
        pool.clone(),
        presence.clone(),
        topic_router.orchestration_topic(),
    ));

    let state = AppState {
        pool: pool.clone(),
        queue: queue.clone(),
        sse: sse.clone(),
        inbox,
    };
    let app = http::router(state);
    let addr = format!("{}:{}", config.worker.web.host, config.worker.web.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, worker_topic, "worker pod HTTP surface listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    server.await?;

    sse.shutdown().await;
    info!("broadcast pod shutdown complete");
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
}
