//! # Worker Consumer
//!
//! Reads this pod's worker topic and hands each event to the local SSE
//! layer. Uses the same batch-poll-then-ack shape as
//! `broadcast-orchestration::orchestration_consumer`, itself styled after
//! `task_request_processor.rs`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, warn};

use broadcast_queue::{PgQueue, QueuedMessage, SharedListener};
use broadcast_shared::error::{BroadcastError, BroadcastResult};
use broadcast_shared::messaging::WorkerEvent;
use broadcast_shared::presence::PresenceStore;

use crate::sse::SseConnectionManager;

const MAX_DELIVERY_ATTEMPTS: i32 = 5;
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

pub struct WorkerConsumer {
    pool: PgPool,
    queue: PgQueue,
    presence: PresenceStore,
    topic: String,
    sse: Arc<SseConnectionManager>,
    listener: SharedListener,
}

impl WorkerConsumer {
    pub fn new(
        pool: PgPool,
        queue: PgQueue,
        presence: PresenceStore,
        topic: String,
        sse: Arc<SseConnectionManager>,
        listener: SharedListener,
    ) -> Self {
        Self {
            pool,
            queue,
            presence,
            topic,
            sse,
            listener,
        }
    }

    pub async fn run(&self) {
        let mut wake = self.listener.subscribe(&self.topic);
        loop {
            match self
                .queue
                .receive_messages::<WorkerEvent>(&self.topic, 20, Duration::from_secs(30))
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
                        self.process_one(message).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, topic = %self.topic, "worker consumer poll failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Mirrors `orchestration_consumer::process_one`'s per-kind propagation
    /// policy: non-retryable kinds are acked without a retry (dropped, or
    /// left for reconciliation), `Serialization` goes straight to the DLT,
    /// and retryable kinds keep the bounded-retry-then-DLT behavior.
    async fn process_one(&self, message: QueuedMessage<WorkerEvent>) {
        match self.deliver(&message.message).await {
            Ok(()) => {
                if let Err(e) = self.queue.ack_message(&self.topic, &message.receipt_handle).await {
                    warn!(error = %e, "failed to ack worker event");
                }
            }
            Err(BroadcastError::ResourceNotFound(msg)) => {
                info!(resource = %msg, "worker event referenced a missing resource, acking");
                self.ack(&message).await;
            }
            Err(BroadcastError::TransientCache(msg)) => {
                warn!(error = %msg, "transient cache error delivering worker event, will reconcile later");
                self.ack(&message).await;
            }
            Err(BroadcastError::DataIntegrityViolation(msg)) => {
                warn!(error = %msg, "data integrity violation delivering worker event, treating as already applied");
                self.ack(&message).await;
            }
            Err(e @ BroadcastError::Serialization(_)) => {
                tracing::error!(error = %e, "unrecoverable serialization error, routing worker event to DLT");
                self.route_to_dlt(&message, &e).await;
            }
            Err(e) if e.is_retryable() => {
                warn!(error = %e, attempt = message.metadata.read_count, "worker event delivery failed");
                if message.metadata.read_count >= MAX_DELIVERY_ATTEMPTS {
                    self.route_to_dlt(&message, &e).await;
                } else if let Err(nack_err) = self.queue.nack_message(&self.topic, &message.receipt_handle, true).await
                {
                    warn!(error = %nack_err, "failed to nack worker event");
                }
            }
            Err(e) => {
                warn!(error = %e, "non-retryable worker event error, acking without retry");
                self.ack(&message).await;
            }
        }
    }

    async fn ack(&self, message: &QueuedMessage<WorkerEvent>) {
        if let Err(e) = self.queue.ack_message(&self.topic, &message.receipt_handle).await {
            warn!(error = %e, "failed to ack worker event");
        }
    }

    async fn route_to_dlt(&self, message: &QueuedMessage<WorkerEvent>, e: &BroadcastError) {
        let payload = serde_json::to_value(&message.message).unwrap_or_default();
        if let Err(dlt_err) = self
            .queue
            .move_to_dlt(&self.topic, &message.receipt_handle, payload, &e.to_string())
            .await
        {
            warn!(error = %dlt_err, "failed to route exhausted worker event to DLT");
        }
    }

    /// Looks up the target user's connections owned by this pod and
    /// pushes to each matching local sink; a user id with no connection on
    /// this pod (stale routing after a reconnect elsewhere) is a no-op,
    /// not an error — the event was already delivered or will be picked
    /// up through inbox assembly on next connect. A successful `MESSAGE`
    /// push is one of the two independent delivered-triggers (the other is
    /// `InboxService::reconcile`'s first-surfacing on `GET /inbox`), so it
    /// also flips the row to DELIVERED and bumps the broadcast's stats.
    async fn deliver(&self, event: &WorkerEvent) -> BroadcastResult<()> {
        let Some(user_id) = event.target_user_id() else {
            return Ok(());
        };
        let connections = self.presence.connections_for_user(user_id).await?;
        if connections.is_empty() {
            return Ok(());
        }
        for connection_id in connections.keys() {
            self.sse.push(connection_id, event);
        }
        if let WorkerEvent::Message { broadcast_id, .. } = event {
            self.mark_delivered(*broadcast_id, user_id).await?;
        }
        Ok(())
    }

    /// Idempotent PENDING -> DELIVERED transition, mirroring the guard
    /// `InboxService::reconcile` uses so a redelivered event (retry, or a
    /// second local connection for the same user) never double-counts
    /// `total_delivered`. A no-op for an `ALL` broadcast whose per-user row
    /// hasn't been lazily materialized yet — that case is first surfaced by
    /// `GET /inbox` instead.
    async fn mark_delivered(&self, broadcast_id: i64, user_id: &str) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE user_broadcast_messages SET delivery_status = 'DELIVERED', delivered_at = $1, updated_at = $1 \
             WHERE broadcast_id = $2 AND user_id = $3 AND delivery_status = 'PENDING'",
        )
        .bind(now)
        .bind(broadcast_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() > 0 {
            sqlx::query(
                "UPDATE broadcast_statistics SET total_delivered = total_delivered + 1, calculated_at = $1 \
                 WHERE broadcast_id = $2",
            )
            .bind(now)
            .bind(broadcast_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
