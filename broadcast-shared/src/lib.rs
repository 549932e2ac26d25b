//! # Broadcast Shared
//!
//! Shared config, error, model, resilience, messaging-routing and presence
//! primitives used by `broadcast-orchestration` and `broadcast-worker`.

pub mod config;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod models;
pub mod presence;
pub mod resilience;

pub use error::{BroadcastError, BroadcastResult};
