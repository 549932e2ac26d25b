//! # Outbox
//!
//! Written in the same transaction as the domain change it reflects; the
//! publisher marks each row published only after the bus confirms receipt.
//! `aggregate_id` doubles as the bus partition key (broadcast id for
//! group-level events, user id for per-user events).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OutboxEvent {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: String,
    pub event_type: String,
    pub topic: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub published: bool,
}

impl OutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        event_type: impl Into<String>,
        topic: impl Into<String>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            event_type: event_type.into(),
            topic: topic.into(),
            payload,
            created_at: now,
            published: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_unpublished_with_fresh_id() {
        let a = OutboxEvent::new(
            "broadcast",
            "42",
            "CREATED",
            "broadcast_orchestration",
            serde_json::json!({"broadcastId": 42}),
            Utc::now(),
        );
        let b = OutboxEvent::new(
            "broadcast",
            "42",
            "CREATED",
            "broadcast_orchestration",
            serde_json::json!({"broadcastId": 42}),
            Utc::now(),
        );
        assert!(!a.published);
        assert_ne!(a.id, b.id);
    }
}
