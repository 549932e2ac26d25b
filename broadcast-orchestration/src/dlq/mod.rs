//! # DLT Consumer and Redrive
//!
//! Persists a durable record for every event that exhausts retries on its
//! primary topic, and offers operator redrive/purge. Styled after
//! `tasker-orchestration/src/grpc/services/dlq.rs`'s `DlqEntry`/
//! resolution-status shape, generalized from a gRPC surface to a plain
//! service consulted by the admin HTTP router.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use broadcast_queue::PgQueue;
use broadcast_shared::error::{BroadcastError, BroadcastResult};
use broadcast_shared::messaging::DltHeaders;
use broadcast_shared::models::DltRecord;

/// Envelope shape written by `PgQueue::move_to_dlt`. Only ever deserialized
/// here, but `PgQueue::receive_messages`'s `QueuePayload` bound requires
/// `Serialize` too.
#[derive(Debug, Serialize, Deserialize)]
struct DltEnvelope {
    headers: DltHeaders,
    original_payload: serde_json::Value,
}

pub struct DltConsumer {
    pool: PgPool,
    queue: PgQueue,
}

impl DltConsumer {
    pub fn new(pool: PgPool, queue: PgQueue) -> Self {
        Self { pool, queue }
    }

    /// Polls every `.DLT` queue present in storage (the schema has no
    /// fixed topic list, so candidates are discovered from the table
    /// itself rather than hand-enumerated), persists a record per
    /// message, and acks once persisted.
    pub async fn run(&self) {
        loop {
            match self.poll_once().await {
                Ok(0) => tokio::time::sleep(std::time::Duration::from_secs(2)).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "DLT consumer poll failed");
                    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn poll_once(&self) -> BroadcastResult<usize> {
        let dlt_queues: Vec<String> = sqlx::query_scalar(
            "SELECT DISTINCT queue_name FROM queue_messages WHERE queue_name LIKE '%.DLT'",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut processed = 0;
        for queue_name in dlt_queues {
            let messages = self
                .queue
                .receive_messages::<DltEnvelope>(&queue_name, 20, std::time::Duration::from_secs(30))
                .await?;
            for message in messages {
                self.persist_one(&message.message).await?;
                self.queue.ack_message(&queue_name, &message.receipt_handle).await?;
                processed += 1;
            }
        }
        Ok(processed)
    }

    #[instrument(skip(self, envelope), fields(topic = %envelope.headers.original_topic))]
    async fn persist_one(&self, envelope: &DltEnvelope) -> BroadcastResult<()> {
        let partition_key = extract_partition_key(&envelope.original_payload);

        sqlx::query(
            r#"
            INSERT INTO dlt_messages
                (id, original_partition_key, original_topic, partition, "offset",
                 exception_message, failed_at, original_payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (original_topic, original_partition_key) DO NOTHING
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&partition_key)
        .bind(&envelope.headers.original_topic)
        .bind(envelope.headers.original_partition)
        .bind(envelope.headers.original_offset)
        .bind(&envelope.headers.exception_message)
        .bind(Utc::now())
        .bind(&envelope.original_payload)
        .execute(&self.pool)
        .await?;

        self.mark_failed(&envelope.original_payload).await?;
        warn!(partition_key = %partition_key, "DLT record persisted");
        Ok(())
    }

    /// If the failed payload carried a user id, marks that per-user row
    /// FAILED; otherwise marks the parent broadcast FAILED, in its own
    /// transaction so this always commits regardless of the consumer's
    /// outer poll outcome.
    async fn mark_failed(&self, payload: &serde_json::Value) -> BroadcastResult<()> {
        let Some(broadcast_id) = payload_broadcast_id(payload) else {
            return Ok(());
        };
        let user_id = payload_user_id(payload);

        let mut tx = self.pool.begin().await?;
        match user_id {
            Some(user_id) => {
                sqlx::query(
                    "UPDATE user_broadcast_messages SET delivery_status = 'FAILED', updated_at = now() WHERE broadcast_id = $1 AND user_id = $2",
                )
                .bind(broadcast_id)
                .bind(user_id)
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query("UPDATE broadcasts SET status = 'FAILED', updated_at = now() WHERE id = $1")
                    .bind(broadcast_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }
}

/// Reads `broadcast_id` off a payload, whichever of the two event envelope
/// shapes on the bus it came from: `OrchestrationEvent` nests its fields
/// under a `kind` object (`#[serde(tag = "eventType")]` on the inner enum),
/// while `WorkerEvent` is itself internally tagged with `kind` as the
/// variant name, so its fields sit at the top level.
fn payload_broadcast_id(payload: &serde_json::Value) -> Option<i64> {
    payload
        .get("kind")
        .and_then(|k| k.get("broadcast_id"))
        .or_else(|| payload.get("broadcast_id"))
        .and_then(|v| v.as_i64())
}

fn payload_user_id(payload: &serde_json::Value) -> Option<&str> {
    payload
        .get("kind")
        .and_then(|k| k.get("user_id"))
        .or_else(|| payload.get("user_id"))
        .and_then(|v| v.as_str())
}

fn extract_partition_key(payload: &serde_json::Value) -> String {
    match (payload_broadcast_id(payload), payload_user_id(payload)) {
        (_, Some(user_id)) => user_id.to_string(),
        (Some(broadcast_id), None) => broadcast_id.to_string(),
        (None, None) => payload.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct RedriveOutcome {
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
    pub failures: Vec<(Uuid, String)>,
}

/// Operator redrive/purge surface backing the admin HTTP endpoints.
pub struct DlqService {
    pool: PgPool,
    queue: PgQueue,
}

impl DlqService {
    pub fn new(pool: PgPool, queue: PgQueue) -> Self {
        Self { pool, queue }
    }

    pub async fn list(&self) -> BroadcastResult<Vec<DltRecord>> {
        let rows = sqlx::query_as("SELECT * FROM dlt_messages ORDER BY failed_at DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// `redrive(id)`: validates the parent is in {ACTIVE, FAILED}, resets
    /// the affected per-user row to PENDING, resends the original payload
    /// to its original topic, writes a tombstone to the DLT topic, deletes
    /// the DLT record.
    #[instrument(skip(self))]
    pub async fn redrive(&self, id: Uuid) -> BroadcastResult<()> {
        let record: DltRecord = sqlx::query_as("SELECT * FROM dlt_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BroadcastError::ResourceNotFound(format!("dlt record {id}")))?;

        let broadcast_id = payload_broadcast_id(&record.original_payload);

        if let Some(broadcast_id) = broadcast_id {
            let status: Option<String> = sqlx::query_scalar("SELECT status FROM broadcasts WHERE id = $1")
                .bind(broadcast_id)
                .fetch_optional(&self.pool)
                .await?;
            match status.as_deref() {
                Some("ACTIVE") => {}
                Some("FAILED") => {
                    sqlx::query("UPDATE broadcasts SET status = 'ACTIVE', updated_at = now() WHERE id = $1")
                        .bind(broadcast_id)
                        .execute(&self.pool)
                        .await?;
                }
                _ => {
                    return Err(BroadcastError::IllegalTransition(format!(
                        "broadcast {broadcast_id} is not ACTIVE or FAILED, cannot redrive"
                    )))
                }
            }

            let user_id = payload_user_id(&record.original_payload);
            if let Some(user_id) = user_id {
                sqlx::query(
                    "UPDATE user_broadcast_messages SET delivery_status = 'PENDING', updated_at = now() WHERE broadcast_id = $1 AND user_id = $2",
                )
                .bind(broadcast_id)
                .bind(user_id)
                .execute(&self.pool)
                .await?;
            }
        }

        self.queue
            .send_message(&record.original_topic, &record.original_payload)
            .await?;
        self.write_tombstone(&record).await?;
        sqlx::query("DELETE FROM dlt_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        info!(id = %id, "DLT record redriven");
        Ok(())
    }

    /// Iterates every DLT record with per-item isolation: each redrive
    /// attempt is its own operation, so one failure never aborts the rest.
    pub async fn redrive_all(&self) -> BroadcastResult<RedriveOutcome> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM dlt_messages ORDER BY failed_at")
            .fetch_all(&self.pool)
            .await?;

        let total = ids.len();
        let mut success_count = 0;
        let mut failures = Vec::new();
        for id in ids {
            match self.redrive(id).await {
                Ok(()) => success_count += 1,
                Err(e) => failures.push((id, e.to_string())),
            }
        }
        Ok(RedriveOutcome {
            total,
            success_count,
            failure_count: failures.len(),
            failures,
        })
    }

    /// `purge(id)`: tombstones and deletes without redriving.
    #[instrument(skip(self))]
    pub async fn purge(&self, id: Uuid) -> BroadcastResult<()> {
        let record: DltRecord = sqlx::query_as("SELECT * FROM dlt_messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| BroadcastError::ResourceNotFound(format!("dlt record {id}")))?;
        self.write_tombstone(&record).await?;
        sqlx::query("DELETE FROM dlt_messages WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn purge_all(&self) -> BroadcastResult<usize> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM dlt_messages").fetch_all(&self.pool).await?;
        let count = ids.len();
        for id in ids {
            self.purge(id).await?;
        }
        Ok(count)
    }

    async fn write_tombstone(&self, record: &DltRecord) -> BroadcastResult<()> {
        let dlt_topic = format!("{}.DLT", record.original_topic);
        let tombstone = serde_json::json!({
            "tombstone": true,
            "original_partition_key": record.original_partition_key,
        });
        self.queue.send_message(&dlt_topic, &tombstone).await?;
        Ok(())
    }
}
