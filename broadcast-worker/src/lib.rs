//! # Broadcast Worker
//!
//! The per-pod delivery surface: local SSE connection management, the
//! per-pod worker-topic consumer, and inbox assembly/mark-as-read.

pub mod http;
pub mod inbox;
pub mod sse;
pub mod worker_consumer;
