//! # PrecomputedTarget
//!
//! `(broadcast_id, user_id)` pairs produced by the Targeting Service for
//! PRODUCT broadcasts; truncated by the reap-finalized scheduler an hour
//! after the broadcast reaches a terminal status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PrecomputedTarget {
    pub broadcast_id: i64,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}
