//! # DLT Record
//!
//! A record of an event that exhausted retries on its primary topic,
//! persisted for operator redrive or purge. Duplicate inserts for the same
//! broadcast id from multiple pods are absorbed via a unique constraint
//! (enforced at the `broadcast-queue` persistence layer).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DltRecord {
    pub id: Uuid,
    pub original_partition_key: String,
    pub original_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub exception_message: String,
    pub exception_stacktrace: Option<String>,
    pub failed_at: DateTime<Utc>,
    pub original_payload: serde_json::Value,
}
