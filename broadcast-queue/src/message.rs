//! # Queue Message Types
//!
//! Provider-agnostic envelope types returned by [`crate::PgQueue`], mirroring
//! the `QueuedMessage` / `MessageId` / `ReceiptHandle` split in
//! `tasker-shared/src/messaging/service/providers/pgmq.rs` so a future
//! non-Postgres transport could implement the same shape.

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};

use broadcast_shared::error::BroadcastResult;

/// Row id assigned at send time; doubles as the at-least-once receipt handle
/// used to ack/nack a specific delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId(pub i64);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReceiptHandle(pub i64);

#[derive(Debug, Clone)]
pub struct MessageMetadata {
    pub read_count: i32,
    pub enqueued_at: DateTime<Utc>,
}

/// A message received from a queue, generic over the deserialized payload
/// type `T`. `receipt_handle` is passed back to `ack_message`/`nack_message`.
#[derive(Debug, Clone)]
pub struct QueuedMessage<T> {
    pub message: T,
    pub receipt_handle: ReceiptHandle,
    pub metadata: MessageMetadata,
}

pub trait QueuePayload: Serialize + DeserializeOwned + Send + Sync + 'static {}
impl<T: Serialize + DeserializeOwned + Send + Sync + 'static> QueuePayload for T {}

pub(crate) fn to_json<T: Serialize>(value: &T) -> BroadcastResult<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

pub(crate) fn from_json<T: DeserializeOwned>(value: serde_json::Value) -> BroadcastResult<T> {
    Ok(serde_json::from_value(value)?)
}

#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queue_name: String,
    pub ready_count: i64,
    pub in_flight_count: i64,
}

#[derive(Debug, Clone)]
pub struct QueueHealthReport {
    pub connected: bool,
    pub error: Option<String>,
}
