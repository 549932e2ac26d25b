//! # Presence Store
//!
//! Cluster-wide cache regions: per-user connection map, per-connection
//! heartbeat, pod heartbeats, pod-owned connection sets, plus the
//! content/inbox/pending-events regions consulted during orchestration
//! routing and inbox assembly. All connections live in the owning pod's
//! memory only; this store is the cluster-wide source of truth for *where*
//! a user is connected.

mod keys;
mod store;

pub use keys::PresenceKeys;
pub use store::{ConnectionInfo, PodHeartbeat, PresenceStore};
