//! # Postgres-Backed Queue
//!
//! `PgQueue` wraps raw `sqlx` queries over the `queue_messages` table with
//! PGMQ-style semantics (visibility timeout, `FOR UPDATE SKIP LOCKED`
//! claim, archive-on-ack), generalizing
//! `tasker-shared/src/messaging/service/providers/pgmq.rs`'s
//! `PgmqMessagingService` down one layer since this workspace has no
//! external `pgmq` crate to wrap (see DESIGN.md "Dependency drops").

use std::time::Duration;

use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument, warn};

use broadcast_shared::error::BroadcastResult;
use broadcast_shared::messaging::DltHeaders;

use crate::message::{
    from_json, to_json, MessageId, MessageMetadata, QueueHealthReport, QueuePayload,
    QueuedMessage, ReceiptHandle,
};

/// Cluster-wide Postgres-backed queue. Cheap to clone: `PgPool` is itself an
/// `Arc`-backed handle.
#[derive(Debug, Clone)]
pub struct PgQueue {
    pool: PgPool,
}

impl PgQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Sends one message, returning its assigned id for use as a receipt
    /// handle by a caller that wants to track an in-flight send (the outbox
    /// publisher does not; it only cares that the insert committed).
    #[instrument(skip(self, payload), fields(queue = %queue_name))]
    pub async fn send_message<T: QueuePayload>(
        &self,
        queue_name: &str,
        payload: &T,
    ) -> BroadcastResult<MessageId> {
        let json = to_json(payload)?;
        let row = sqlx::query(
            "INSERT INTO queue_messages (queue_name, payload) VALUES ($1, $2) RETURNING id",
        )
        .bind(queue_name)
        .bind(json)
        .fetch_one(&self.pool)
        .await?;
        Ok(MessageId(row.try_get("id")?))
    }

    /// Sends a batch of messages in one round trip. Order of `ids` matches
    /// `payloads`.
    #[instrument(skip(self, payloads), fields(queue = %queue_name, count = payloads.len()))]
    pub async fn send_batch<T: QueuePayload>(
        &self,
        queue_name: &str,
        payloads: &[T],
    ) -> BroadcastResult<Vec<MessageId>> {
        let mut ids = Vec::with_capacity(payloads.len());
        let mut tx = self.pool.begin().await?;
        for payload in payloads {
            let json = to_json(payload)?;
            let row = sqlx::query(
                "INSERT INTO queue_messages (queue_name, payload) VALUES ($1, $2) RETURNING id",
            )
            .bind(queue_name)
            .bind(json)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(MessageId(row.try_get("id")?));
        }
        tx.commit().await?;
        Ok(ids)
    }

    /// Claims up to `max_messages` ready rows, setting their `visible_at` to
    /// `now + visibility_timeout` so a concurrent receiver on another pod
    /// does not also claim them (`FOR UPDATE SKIP LOCKED`).
    #[instrument(skip(self), fields(queue = %queue_name))]
    pub async fn receive_messages<T: QueuePayload>(
        &self,
        queue_name: &str,
        max_messages: usize,
        visibility_timeout: Duration,
    ) -> BroadcastResult<Vec<QueuedMessage<T>>> {
        let now = Utc::now();
        let new_visible_at = now + chrono::Duration::from_std(visibility_timeout).unwrap_or_default();

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT id, payload, enqueued_at, read_count
            FROM queue_messages
            WHERE queue_name = $1 AND visible_at <= $2
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            LIMIT $3
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .bind(max_messages as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in &rows {
            let id: i64 = row.try_get("id")?;
            sqlx::query(
                "UPDATE queue_messages SET visible_at = $1, read_count = read_count + 1 WHERE id = $2",
            )
            .bind(new_visible_at)
            .bind(id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        for row in rows {
            let id: i64 = row.try_get("id")?;
            let payload: serde_json::Value = row.try_get("payload")?;
            let enqueued_at = row.try_get("enqueued_at")?;
            let read_count: i32 = row.try_get("read_count")?;
            result.push(QueuedMessage {
                message: from_json(payload)?,
                receipt_handle: ReceiptHandle(id),
                metadata: MessageMetadata {
                    read_count: read_count + 1,
                    enqueued_at,
                },
            });
        }

        if !result.is_empty() {
            debug!(queue = %queue_name, count = result.len(), "claimed messages");
        }
        Ok(result)
    }

    /// Acks (archives) a message by deleting its row. PGMQ-equivalent of
    /// `archive_message`.
    #[instrument(skip(self), fields(queue = %queue_name))]
    pub async fn ack_message(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
    ) -> BroadcastResult<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND queue_name = $2")
            .bind(receipt_handle.0)
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Nacks a message: `requeue = true` makes it immediately visible again
    /// (`visible_at = now`); `requeue = false` deletes it (the caller is
    /// expected to have already routed it to the `.DLT` sibling via
    /// [`Self::move_to_dlt`]).
    #[instrument(skip(self), fields(queue = %queue_name, requeue))]
    pub async fn nack_message(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        requeue: bool,
    ) -> BroadcastResult<()> {
        if requeue {
            sqlx::query(
                "UPDATE queue_messages SET visible_at = now() WHERE id = $1 AND queue_name = $2",
            )
            .bind(receipt_handle.0)
            .bind(queue_name)
            .execute(&self.pool)
            .await?;
        } else {
            self.ack_message(queue_name, receipt_handle).await?;
        }
        Ok(())
    }

    /// Extends the visibility timeout of an in-flight message without
    /// acking it, for a consumer that needs more processing time.
    pub async fn extend_visibility(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        extension: Duration,
    ) -> BroadcastResult<()> {
        let new_visible_at =
            Utc::now() + chrono::Duration::from_std(extension).unwrap_or_default();
        sqlx::query(
            "UPDATE queue_messages SET visible_at = $1 WHERE id = $2 AND queue_name = $3",
        )
        .bind(new_visible_at)
        .bind(receipt_handle.0)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Moves a failed message's payload onto `<queue_name>.DLT`, each
    /// primary topic's sibling dead-letter topic, wrapped in [`DltHeaders`]
    /// (this transport has no partition concept, so `original_partition` is
    /// always `0`; `original_offset` carries the claimed row's id), then
    /// deletes the original row. Both the insert and delete happen in one
    /// transaction so a crash between the two never silently drops the
    /// payload.
    #[instrument(skip(self, payload), fields(queue = %queue_name))]
    pub async fn move_to_dlt(
        &self,
        queue_name: &str,
        receipt_handle: &ReceiptHandle,
        payload: serde_json::Value,
        exception_message: &str,
    ) -> BroadcastResult<()> {
        let dlt_topic = format!("{queue_name}.DLT");
        let headers = DltHeaders {
            original_topic: queue_name.to_string(),
            original_partition: 0,
            original_offset: receipt_handle.0,
            exception_message: exception_message.to_string(),
            exception_stacktrace: None,
        };
        let envelope = serde_json::json!({
            "headers": headers,
            "original_payload": payload,
        });
        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO queue_messages (queue_name, payload) VALUES ($1, $2)")
            .bind(&dlt_topic)
            .bind(envelope)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM queue_messages WHERE id = $1 AND queue_name = $2")
            .bind(receipt_handle.0)
            .bind(queue_name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        warn!(queue = %queue_name, dlt_topic = %dlt_topic, "message routed to DLT");
        Ok(())
    }

    pub async fn queue_stats(&self, queue_name: &str) -> BroadcastResult<crate::message::QueueStats> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"
            SELECT
                count(*) FILTER (WHERE visible_at <= $2) AS ready_count,
                count(*) FILTER (WHERE visible_at > $2) AS in_flight_count
            FROM queue_messages WHERE queue_name = $1
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        Ok(crate::message::QueueStats {
            queue_name: queue_name.to_string(),
            ready_count: row.try_get("ready_count")?,
            in_flight_count: row.try_get("in_flight_count")?,
        })
    }

    pub async fn health_check(&self) -> QueueHealthReport {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => QueueHealthReport {
                connected: true,
                error: None,
            },
            Err(e) => QueueHealthReport {
                connected: false,
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_id_display() {
        assert_eq!(MessageId(42).to_string(), "42");
    }
}
