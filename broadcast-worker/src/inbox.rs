//! # Pending-Events & Inbox Assembly
//!
//! When a user connects, the initial inbox is assembled server-side by
//! draining pending events, merging in outstanding per-user rows and
//! not-yet-seen ALL broadcasts, then asynchronously reconciling delivery
//! state in a fresh transaction. Uses the same transaction-per-step
//! discipline `broadcast-orchestration::lifecycle` uses for cancel/expire,
//! here split across a synchronous read path and a detached follow-up task
//! instead of one commit, since the synchronous merge and the reconciliation
//! step have different failure-recovery needs.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Transaction};
use tracing::{instrument, warn};
use uuid::Uuid;

use broadcast_shared::error::BroadcastResult;
use broadcast_shared::messaging::{OrchestrationEvent, OrchestrationEventKind, WorkerEvent};
use broadcast_shared::models::Priority;
use broadcast_shared::presence::PresenceStore;

/// `UserInbox` cache item shape: `(id, broadcastId, deliveryStatus,
/// readStatus, createdAt-epoch-ms)`, with content inlined so a client can
/// render without a second round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboxItem {
    pub broadcast_id: i64,
    pub user_message_id: Option<i64>,
    pub content: String,
    pub priority: String,
    pub category: String,
    pub delivery_status: String,
    pub read_status: String,
    pub created_at_epoch_ms: i64,
}

/// What the synchronous assembly pass learned, for the detached
/// reconciliation task to act on.
struct ReconciliationWork {
    /// ALL broadcasts the user has no per-user row for yet.
    new_all_broadcasts: Vec<i64>,
    /// Existing per-user rows still PENDING that were just surfaced.
    newly_delivered_ids: Vec<i64>,
}

#[derive(sqlx::FromRow)]
struct ExistingRow {
    user_message_id: i64,
    broadcast_id: i64,
    content: String,
    priority: Priority,
    category: String,
    delivery_status: String,
    read_status: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct AllBroadcastRow {
    broadcast_id: i64,
    content: String,
    priority: Priority,
    category: String,
    created_at: DateTime<Utc>,
}

pub struct InboxService {
    pool: PgPool,
    presence: PresenceStore,
    orchestration_topic: String,
}

impl InboxService {
    pub fn new(pool: PgPool, presence: PresenceStore, orchestration_topic: String) -> Self {
        Self {
            pool,
            presence,
            orchestration_topic,
        }
    }

    /// `GET /inbox`: drains pending events, merges in outstanding per-user
    /// rows and not-yet-seen ALL broadcasts, sorts descending by
    /// `created_at`, caches the result, and kicks off asynchronous
    /// reconciliation.
    #[instrument(skip(self))]
    pub async fn assemble(&self, user_id: &str) -> BroadcastResult<Vec<InboxItem>> {
        let mut items = Vec::new();
        let mut seen = HashSet::new();

        for raw in self.presence.drain_pending_events(user_id).await? {
            let Ok(event) = serde_json::from_value::<WorkerEvent>(raw) else {
                continue;
            };
            if let WorkerEvent::Message {
                broadcast_id,
                user_message_id,
                content,
                priority,
                category,
                created_at,
                delivery_status,
                read_status,
                ..
            } = event
            {
                if seen.insert(broadcast_id) {
                    items.push(InboxItem {
                        broadcast_id,
                        user_message_id,
                        content,
                        priority: format!("{priority:?}").to_uppercase(),
                        category,
                        delivery_status,
                        read_status,
                        created_at_epoch_ms: created_at.timestamp_millis(),
                    });
                }
            }
        }

        let mut work = ReconciliationWork {
            new_all_broadcasts: Vec::new(),
            newly_delivered_ids: Vec::new(),
        };

        let existing: Vec<ExistingRow> = sqlx::query_as(
            r#"
            SELECT m.id AS user_message_id, m.broadcast_id, b.content, b.priority, b.category,
                   m.delivery_status, m.read_status, b.created_at
            FROM user_broadcast_messages m
            JOIN broadcasts b ON b.id = m.broadcast_id
            WHERE m.user_id = $1 AND m.delivery_status IN ('PENDING', 'DELIVERED')
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        for row in existing {
            if row.delivery_status == "PENDING" {
                work.newly_delivered_ids.push(row.user_message_id);
            }
            if seen.insert(row.broadcast_id) {
                items.push(InboxItem {
                    broadcast_id: row.broadcast_id,
                    user_message_id: Some(row.user_message_id),
                    content: row.content,
                    priority: format!("{:?}", row.priority).to_uppercase(),
                    category: row.category,
                    delivery_status: row.delivery_status,
                    read_status: row.read_status,
                    created_at_epoch_ms: row.created_at.timestamp_millis(),
                });
            }
        }

        let all_broadcasts: Vec<AllBroadcastRow> = sqlx::query_as(
            r#"
            SELECT b.id AS broadcast_id, b.content, b.priority, b.category, b.created_at
            FROM broadcasts b
            WHERE b.target_type = 'ALL' AND b.status = 'ACTIVE'
              AND NOT EXISTS (
                  SELECT 1 FROM user_broadcast_messages m
                  WHERE m.broadcast_id = b.id AND m.user_id = $1
              )
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        for row in all_broadcasts {
            work.new_all_broadcasts.push(row.broadcast_id);
            if seen.insert(row.broadcast_id) {
                items.push(InboxItem {
                    broadcast_id: row.broadcast_id,
                    user_message_id: None,
                    content: row.content,
                    priority: format!("{:?}", row.priority).to_uppercase(),
                    category: row.category,
                    delivery_status: "PENDING".to_string(),
                    read_status: "UNREAD".to_string(),
                    created_at_epoch_ms: row.created_at.timestamp_millis(),
                });
            }
        }

        items.sort_by(|a, b| b.created_at_epoch_ms.cmp(&a.created_at_epoch_ms));

        let cached = serde_json::to_value(&items)?;
        self.presence.cache_user_inbox(user_id, &cached).await?;

        self.spawn_reconciliation(user_id.to_string(), work);

        Ok(items)
    }

    pub async fn cached(&self, user_id: &str) -> BroadcastResult<Option<Vec<InboxItem>>> {
        match self.presence.get_user_inbox(user_id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Detached from the request path so `GET /inbox` doesn't wait on a
    /// second round of writes. A failure here is recovered on the
    /// user's next inbox assembly (the rows are re-derived from
    /// `user_broadcast_messages`/`broadcasts`, not from this task's state).
    fn spawn_reconciliation(&self, user_id: String, work: ReconciliationWork) {
        if work.new_all_broadcasts.is_empty() && work.newly_delivered_ids.is_empty() {
            return;
        }
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(e) = reconcile(&pool, &user_id, &work).await {
                warn!(user_id, error = %e, "inbox reconciliation failed");
            }
        });
    }

    /// Mark-as-read: read-modify-write (or insert-if-absent) on the
    /// per-user row, increments `total_read`,
    /// evicts the cached inbox, and writes a `READ` event to the outbox so
    /// the user's other connections see the read receipt.
    #[instrument(skip(self))]
    pub async fn mark_read(&self, broadcast_id: i64, user_id: &str) -> BroadcastResult<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let existing: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, read_status FROM user_broadcast_messages WHERE broadcast_id = $1 AND user_id = $2 FOR UPDATE",
        )
        .bind(broadcast_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (user_message_id, already_read) = match existing {
            Some((id, status)) => (id, status == "READ"),
            None => {
                let id: i64 = sqlx::query_scalar(
                    r#"
                    INSERT INTO user_broadcast_messages
                        (broadcast_id, user_id, delivery_status, read_status, delivered_at, created_at, updated_at)
                    VALUES ($1, $2, 'DELIVERED', 'UNREAD', $3, $3, $3)
                    RETURNING id
                    "#,
                )
                .bind(broadcast_id)
                .bind(user_id)
                .bind(now)
                .fetch_one(&mut *tx)
                .await?;
                (id, false)
            }
        };

        if !already_read {
            sqlx::query(
                "UPDATE user_broadcast_messages SET read_status = 'READ', read_at = $1, updated_at = $1 WHERE id = $2",
            )
            .bind(now)
            .bind(user_message_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "UPDATE broadcast_statistics SET total_read = total_read + 1, calculated_at = $1 WHERE broadcast_id = $2",
            )
            .bind(now)
            .bind(broadcast_id)
            .execute(&mut *tx)
            .await?;

            let event = OrchestrationEvent::new(
                OrchestrationEventKind::Read {
                    broadcast_id,
                    user_id: user_id.to_string(),
                    user_message_id,
                },
                now,
            );
            insert_read_outbox_event(&mut tx, &self.orchestration_topic, &event).await?;
        }

        tx.commit().await?;
        self.presence.evict_user_inbox(user_id).await?;
        Ok(user_message_id)
    }
}

/// Reconciliation's two write paths, each its own transaction so a partial
/// failure never blocks the other: new ALL rows are inserted (idempotent on the
/// unique key) and `total_delivered` incremented; PENDING rows that were
/// just surfaced flip to DELIVERED.
async fn reconcile(pool: &PgPool, user_id: &str, work: &ReconciliationWork) -> BroadcastResult<()> {
    if !work.new_all_broadcasts.is_empty() {
        let now = Utc::now();
        let mut tx = pool.begin().await?;
        for broadcast_id in &work.new_all_broadcasts {
            let inserted = sqlx::query(
                r#"
                INSERT INTO user_broadcast_messages
                    (broadcast_id, user_id, delivery_status, read_status, delivered_at, created_at, updated_at)
                VALUES ($1, $2, 'DELIVERED', 'UNREAD', $3, $3, $3)
                ON CONFLICT (broadcast_id, user_id) DO NOTHING
                "#,
            )
            .bind(broadcast_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            if inserted.rows_affected() > 0 {
                sqlx::query(
                    "UPDATE broadcast_statistics SET total_delivered = total_delivered + 1, calculated_at = $1 WHERE broadcast_id = $2",
                )
                .bind(now)
                .bind(broadcast_id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
    }

    if !work.newly_delivered_ids.is_empty() {
        let now = Utc::now();
        let mut tx = pool.begin().await?;
        for id in &work.newly_delivered_ids {
            let updated = sqlx::query(
                "UPDATE user_broadcast_messages SET delivery_status = 'DELIVERED', delivered_at = $1, updated_at = $1 WHERE id = $2 AND delivery_status = 'PENDING'",
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            if updated.rows_affected() > 0 {
                sqlx::query(
                    r#"
                    UPDATE broadcast_statistics SET total_delivered = total_delivered + 1, calculated_at = $1
                    WHERE broadcast_id = (SELECT broadcast_id FROM user_broadcast_messages WHERE id = $2)
                    "#,
                )
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            }
        }
        tx.commit().await?;
    }

    Ok(())
}

async fn insert_read_outbox_event(
    tx: &mut Transaction<'_, sqlx::Postgres>,
    topic: &str,
    event: &OrchestrationEvent,
) -> BroadcastResult<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, topic, payload, created_at, published)
        VALUES ($1, 'broadcast', $2, 'READ', $3, $4, now(), false)
        "#,
    )
    .bind(Uuid::now_v7())
    .bind(event.partition_key())
    .bind(topic)
    .bind(serde_json::to_value(event)?)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbox_items_serialize_camel_case() {
        let item = InboxItem {
            broadcast_id: 42,
            user_message_id: Some(7),
            content: "hi".to_string(),
            priority: "NORMAL".to_string(),
            category: "general".to_string(),
            delivery_status: "DELIVERED".to_string(),
            read_status: "UNREAD".to_string(),
            created_at_epoch_ms: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["broadcastId"], 42);
        assert_eq!(json["userMessageId"], 7);
    }
}
