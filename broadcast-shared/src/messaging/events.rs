//! # Event Envelopes
//!
//! Payload shapes carried on the orchestration topic, the per-pod worker
//! topics, and the DLT headers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Priority, TargetType};

/// Events on the single orchestration topic, keyed by broadcast id (or user
/// id for READ). Ordering: lifecycle events for one broadcast share the
/// broadcast-id partition key so CREATED always precedes
/// CANCELLED/EXPIRED; READ is independent, keyed by user id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum OrchestrationEventKind {
    Created {
        broadcast_id: i64,
        target_type: TargetType,
        /// Present only for per-user CREATED variants produced by on-write
        /// fan-out (ROLE/SELECTED/PRODUCT); absent for ALL (delivered
        /// lazily via the inbox view).
        user_id: Option<String>,
    },
    Cancelled {
        broadcast_id: i64,
        target_type: TargetType,
    },
    Expired {
        broadcast_id: i64,
        target_type: TargetType,
    },
    Read {
        broadcast_id: i64,
        user_id: String,
        user_message_id: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationEvent {
    /// Carried in the payload so consumers can dedupe re-delivered events.
    pub event_id: Uuid,
    pub kind: OrchestrationEventKind,
    pub occurred_at: DateTime<Utc>,
}

impl OrchestrationEvent {
    pub fn new(kind: OrchestrationEventKind, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            kind,
            occurred_at: now,
        }
    }

    /// Partition key used when writing to the outbox / bus: broadcast id
    /// for group-level events, user id for per-user events.
    pub fn partition_key(&self) -> String {
        match &self.kind {
            OrchestrationEventKind::Created {
                user_id: Some(user_id),
                ..
            } => user_id.clone(),
            OrchestrationEventKind::Created { broadcast_id, .. }
            | OrchestrationEventKind::Cancelled { broadcast_id, .. }
            | OrchestrationEventKind::Expired { broadcast_id, .. } => broadcast_id.to_string(),
            OrchestrationEventKind::Read { user_id, .. } => user_id.clone(),
        }
    }
}

/// A per-user event dispatched to the owning pod's worker topic (or the
/// equivalent cache-dispatch region), carrying enough content for the SSE
/// manager to build the `MESSAGE` / `MESSAGE_REMOVED` event without a
/// second DB round trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum WorkerEvent {
    Message {
        broadcast_id: i64,
        user_message_id: Option<i64>,
        user_id: String,
        content: String,
        priority: Priority,
        category: String,
        created_at: DateTime<Utc>,
        delivery_status: String,
        read_status: String,
    },
    MessageRemoved {
        broadcast_id: i64,
        user_id: Option<String>,
    },
    ReadReceipt {
        broadcast_id: i64,
        user_message_id: i64,
        user_id: String,
    },
}

impl WorkerEvent {
    pub fn target_user_id(&self) -> Option<&str> {
        match self {
            WorkerEvent::Message { user_id, .. } => Some(user_id),
            WorkerEvent::MessageRemoved { user_id, .. } => user_id.as_deref(),
            WorkerEvent::ReadReceipt { user_id, .. } => Some(user_id),
        }
    }
}

/// Headers attached by the queue transport when an event is moved to a
/// `.DLT` sibling topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DltHeaders {
    pub original_topic: String,
    pub original_partition: i32,
    pub original_offset: i64,
    pub exception_message: String,
    pub exception_stacktrace: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_event_partitions_by_broadcast_id() {
        let event = OrchestrationEvent::new(
            OrchestrationEventKind::Cancelled {
                broadcast_id: 42,
                target_type: TargetType::All,
            },
            Utc::now(),
        );
        assert_eq!(event.partition_key(), "42");
    }

    #[test]
    fn per_user_created_event_partitions_by_user_id() {
        let event = OrchestrationEvent::new(
            OrchestrationEventKind::Created {
                broadcast_id: 42,
                target_type: TargetType::Selected,
                user_id: Some("u1".to_string()),
            },
            Utc::now(),
        );
        assert_eq!(event.partition_key(), "u1");
    }

    #[test]
    fn read_event_partitions_by_user_id() {
        let event = OrchestrationEvent::new(
            OrchestrationEventKind::Read {
                broadcast_id: 42,
                user_id: "u9".to_string(),
                user_message_id: 7,
            },
            Utc::now(),
        );
        assert_eq!(event.partition_key(), "u9");
    }
}
