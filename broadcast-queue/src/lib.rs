//! # Broadcast Queue
//!
//! Postgres-backed event bus: queue semantics (send/receive/ack/nack,
//! visibility timeout, DLT sibling convention) plus a shared LISTEN/NOTIFY
//! wake-up layer, one layer below `PgmqMessagingService` since this
//! workspace wraps raw `sqlx` directly rather than an external `pgmq` crate
//! (see DESIGN.md "Dependency drops").

mod listener;
mod message;
mod queue;

pub use listener::SharedListener;
pub use message::{
    MessageId, MessageMetadata, QueueHealthReport, QueuePayload, QueueStats, QueuedMessage,
    ReceiptHandle,
};
pub use queue::PgQueue;
