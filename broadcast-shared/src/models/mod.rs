//! # Data Model
//!
//! The durable-store entities: `Broadcast`, `PerUserMessage`,
//! `PrecomputedTarget`, `Statistics`, `OutboxEvent`, `DltRecord`.

mod broadcast;
mod dlt;
mod outbox;
mod per_user_message;
mod precomputed_target;
mod statistics;

pub use broadcast::{Broadcast, BroadcastStatus, Priority, TargetType};
pub use dlt::DltRecord;
pub use outbox::OutboxEvent;
pub use per_user_message::{DeliveryStatus, PerUserMessage, ReadStatus};
pub use precomputed_target::PrecomputedTarget;
pub use statistics::Statistics;
