//! # Orchestration Consumer (router)
//!
//! Routes the single orchestration topic's `CREATED` / `CANCELLED` /
//! `EXPIRED` / `READ` events to the owning pod's worker topic, or to the
//! offline user's pending-events cache. Styled after
//! `task_request_processor.rs`'s batch-poll-then-ack loop, generalized to
//! route by presence lookup instead of a namespace registry lookup. Uses the
//! per-pod worker-topic delivery medium (see DESIGN.md's Open Question
//! resolution), not the cache-dispatch-region variant.

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use broadcast_queue::{PgQueue, QueuedMessage, SharedListener};
use broadcast_shared::error::{BroadcastError, BroadcastResult};
use broadcast_shared::messaging::{OrchestrationEvent, OrchestrationEventKind, TopicRouterKind, WorkerEvent};
use broadcast_shared::models::{Priority, TargetType};
use broadcast_shared::presence::PresenceStore;

/// Deliveries beyond this many attempts are routed to the `.DLT` sibling
/// topic instead of requeued.
const MAX_DELIVERY_ATTEMPTS: i32 = 5;

/// Idle-poll ceiling when no `LISTEN`/`NOTIFY` wake-up arrives in time; the
/// shared listener normally wakes this loop well before the ceiling is hit.
const IDLE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

pub struct OrchestrationConsumer {
    pool: PgPool,
    queue: PgQueue,
    presence: PresenceStore,
    topic_router: TopicRouterKind,
    listener: SharedListener,
}

impl OrchestrationConsumer {
    pub fn new(
        pool: PgPool,
        queue: PgQueue,
        presence: PresenceStore,
        topic_router: TopicRouterKind,
        listener: SharedListener,
    ) -> Self {
        Self {
            pool,
            queue,
            presence,
            topic_router,
            listener,
        }
    }

    /// Batch-poll loop: claim a batch from the orchestration topic, process
    /// each, ack only after its side effects commit. An idle tick waits on
    /// the shared `LISTEN`/`NOTIFY` wake-up rather than sleeping the full
    /// poll interval, so a freshly published event is picked up as soon as
    /// Postgres delivers the notification instead of on the next fixed tick.
    pub async fn run(&self) {
        let topic = self.topic_router.orchestration_topic();
        let mut wake = self.listener.subscribe(&topic);
        loop {
            match self
                .queue
                .receive_messages::<OrchestrationEvent>(&topic, 20, std::time::Duration::from_secs(30))
                .await
            {
                Ok(messages) if messages.is_empty() => {
                    tokio::select! {
                        _ = wake.recv() => {}
                        _ = tokio::time::sleep(IDLE_POLL_INTERVAL) => {}
                    }
                }
                Ok(messages) => {
                    for message in messages {
                        self.process_one(&topic, message).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "orchestration consumer poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Per-kind propagation policy: `ResourceNotFound` is ack-and-log
    /// (the referenced row is gone, retrying can't help);
    /// `TransientCache` is logged and let go, reconciled by the next tick
    /// or reconnect rather than redelivered; `DataIntegrityViolation` is
    /// the idempotence path on a unique-key collision and is dropped, not
    /// retried; `Serialization` is a critical, unretryable error and goes
    /// straight to the DLT; everything else routed through `is_retryable`
    /// keeps the bounded-retry-then-DLT behavior.
    async fn process_one(&self, topic: &str, message: QueuedMessage<OrchestrationEvent>) {
        let event = message.message.clone();
        match self.route(&message.message).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack_message(topic, &message.receipt_handle).await {
                    warn!(error = %e, "failed to ack orchestration event");
                }
            }
            Err(BroadcastError::ResourceNotFound(msg)) => {
                info!(event_id = %event.event_id, resource = %msg, "orchestration event referenced a missing resource, acking");
                self.ack(topic, &message).await;
            }
            Err(BroadcastError::TransientCache(msg)) => {
                warn!(event_id = %event.event_id, error = %msg, "transient cache error, will reconcile on next tick");
                self.ack(topic, &message).await;
            }
            Err(BroadcastError::DataIntegrityViolation(msg)) => {
                warn!(event_id = %event.event_id, error = %msg, "data integrity violation, treating event as already applied");
                self.ack(topic, &message).await;
            }
            Err(e @ BroadcastError::Serialization(_)) => {
                tracing::error!(event_id = %event.event_id, error = %e, "unrecoverable serialization error, routing to DLT");
                self.route_to_dlt(topic, &message, &event, &e).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(event_id = %event.event_id, error = %e, attempt = message.metadata.read_count, "orchestration event processing failed");
                if message.metadata.read_count >= MAX_DELIVERY_ATTEMPTS {
                    self.route_to_dlt(topic, &message, &event, &e).await;
                } else if let Err(nack_err) = self.queue.nack_message(topic, &message.receipt_handle, true).await {
                    warn!(error = %nack_err, "failed to nack orchestration event");
                }
            }
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "non-retryable orchestration event error, acking without retry");
                self.ack(topic, &message).await;
            }
        }
    }

    async fn ack(&self, topic: &str, message: &QueuedMessage<OrchestrationEvent>) {
        if let Err(e) = self.queue.ack_message(topic, &message.receipt_handle).await {
            warn!(error = %e, "failed to ack orchestration event");
        }
    }

    async fn route_to_dlt(
        &self,
        topic: &str,
        message: &QueuedMessage<OrchestrationEvent>,
        event: &OrchestrationEvent,
        e: &BroadcastError,
    ) {
        let payload = serde_json::to_value(event).unwrap_or_default();
        if let Err(dlt_err) = self
            .queue
            .move_to_dlt(topic, &message.receipt_handle, payload, &e.to_string())
            .await
        {
            warn!(error = %dlt_err, "failed to route exhausted event to DLT");
        }
    }

    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    async fn route(&self, event: &OrchestrationEvent) -> BroadcastResult<()> {
        match &event.kind {
            OrchestrationEventKind::Created {
                broadcast_id,
                target_type,
                user_id,
            } => self.handle_created(*broadcast_id, *target_type, user_id.clone()).await,
            OrchestrationEventKind::Cancelled { broadcast_id, target_type } => {
                self.handle_group_removal(*broadcast_id, *target_type).await
            }
            OrchestrationEventKind::Expired { broadcast_id, target_type } => {
                self.handle_group_removal(*broadcast_id, *target_type).await
            }
            OrchestrationEventKind::Read {
                broadcast_id,
                user_id,
                user_message_id,
            } => self.handle_read(*broadcast_id, user_id, *user_message_id).await,
        }
    }

    async fn handle_created(
        &self,
        broadcast_id: i64,
        target_type: TargetType,
        user_id: Option<String>,
    ) -> BroadcastResult<()> {
        self.prewarm_content_cache(broadcast_id).await?;
        let content = self.load_content(broadcast_id).await?;

        let targets = match &user_id {
            Some(uid) => vec![uid.clone()],
            None if target_type == TargetType::All => self.online_users().await?,
            None => self.precomputed_targets(broadcast_id).await?,
        };

        for user in targets {
            let event = WorkerEvent::Message {
                broadcast_id,
                user_message_id: None,
                user_id: user.clone(),
                content: content.content.clone(),
                priority: content.priority,
                category: content.category.clone(),
                created_at: content.created_at,
                delivery_status: "PENDING".to_string(),
                read_status: "UNREAD".to_string(),
            };
            self.dispatch_to_user(&user, &event).await?;
        }
        Ok(())
    }

    /// CANCEL/EXPIRE of an `ALL` broadcast evicts only online users' inbox
    /// caches (targeted users never had a per-user row in the first
    /// place unless they'd already read it); CANCEL/EXPIRE of a targeted
    /// broadcast (ROLE/SELECTED/PRODUCT) evicts every user with a row in
    /// `user_broadcast_messages`, unconditionally — branching on
    /// `target_type` directly rather than inferring it from whether any
    /// rows happen to exist, since an ALL broadcast can have a partial,
    /// incomplete set of lazily-materialized rows at cancel time.
    async fn handle_group_removal(&self, broadcast_id: i64, target_type: TargetType) -> BroadcastResult<()> {
        self.presence.evict_broadcast_content(broadcast_id).await?;

        let targets = if target_type == TargetType::All {
            self.online_users().await?
        } else {
            sqlx::query_scalar("SELECT user_id FROM user_broadcast_messages WHERE broadcast_id = $1")
                .bind(broadcast_id)
                .fetch_all(&self.pool)
                .await?
        };

        for user in &targets {
            self.presence.evict_user_inbox(user).await?;
        }

        for user in &targets {
            let removal = WorkerEvent::MessageRemoved {
                broadcast_id,
                user_id: Some(user.clone()),
            };
            self.dispatch_to_user(user, &removal).await?;
        }
        info!(broadcast_id, affected = targets.len(), "broadcast removal fanned out");
        Ok(())
    }

    async fn handle_read(&self, broadcast_id: i64, user_id: &str, user_message_id: i64) -> BroadcastResult<()> {
        let event = WorkerEvent::ReadReceipt {
            broadcast_id,
            user_message_id,
            user_id: user_id.to_string(),
        };
        self.dispatch_to_user(user_id, &event).await
    }

    /// Looks up the user's most-recently-heartbeated connection and routes
    /// the event to that connection's pod worker topic; offline users get
    /// the event appended to their pending-events cache.
    async fn dispatch_to_user(&self, user_id: &str, event: &WorkerEvent) -> BroadcastResult<()> {
        let connections = self.presence.connections_for_user(user_id).await?;
        let most_recent = connections
            .values()
            .max_by_key(|info| info.last_heartbeat_epoch_ms);

        match most_recent {
            Some(info) => {
                let topic = self.topic_router.worker_topic(&info.cluster_name, &info.pod_name);
                self.queue.send_message(&topic, event).await?;
            }
            None => {
                let payload = serde_json::to_value(event)?;
                self.presence.append_pending_event(user_id, &payload).await?;
            }
        }
        Ok(())
    }

    async fn prewarm_content_cache(&self, broadcast_id: i64) -> BroadcastResult<()> {
        if self.presence.get_broadcast_content(broadcast_id).await?.is_some() {
            return Ok(());
        }
        let content = self.load_content(broadcast_id).await?;
        let payload = serde_json::to_value(&content)?;
        self.presence.cache_broadcast_content(broadcast_id, &payload).await
    }

    async fn load_content(&self, broadcast_id: i64) -> BroadcastResult<BroadcastContent> {
        if let Some(cached) = self.presence.get_broadcast_content(broadcast_id).await? {
            if let Ok(content) = serde_json::from_value(cached) {
                return Ok(content);
            }
        }
        let row: BroadcastContent = sqlx::query_as(
            "SELECT content, priority, category, created_at FROM broadcasts WHERE id = $1",
        )
        .bind(broadcast_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn online_users(&self) -> BroadcastResult<Vec<String>> {
        self.presence.online_users().await
    }

    async fn precomputed_targets(&self, broadcast_id: i64) -> BroadcastResult<Vec<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT user_id FROM user_broadcast_targets WHERE broadcast_id = $1",
        )
        .bind(broadcast_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, sqlx::FromRow)]
struct BroadcastContent {
    content: String,
    priority: Priority,
    category: String,
    created_at: chrono::DateTime<Utc>,
}
