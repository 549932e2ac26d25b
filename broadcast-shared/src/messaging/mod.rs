//! # Messaging
//!
//! Topic naming and event envelope types shared by the orchestration
//! consumer, worker consumer, outbox publisher, and DLT consumer.

mod events;
mod router;

pub use events::{DltHeaders, OrchestrationEvent, OrchestrationEventKind, WorkerEvent};
pub use router::{DefaultTopicRouter, TopicRouter, TopicRouterKind};
