//! # Health Reporting
//!
//! `/healthz` (liveness) and `/readyz` (readiness: DB pool + queue) for the
//! orchestrator binary. Styled after
//! `tasker-orchestration/src/health/db_status.rs`'s health-check-with-timeout
//! shape, simplified to the two probes an orchestrator needs without a
//! dedicated circuit breaker of its own.

use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;

use broadcast_queue::PgQueue;

#[derive(Debug, Clone, Serialize)]
pub struct ReadinessReport {
    pub database_connected: bool,
    pub queue_connected: bool,
}

impl ReadinessReport {
    pub fn is_ready(&self) -> bool {
        self.database_connected && self.queue_connected
    }
}

pub async fn evaluate_readiness(pool: &PgPool, queue: &PgQueue) -> ReadinessReport {
    let db_check = tokio::time::timeout(Duration::from_millis(500), sqlx::query("SELECT 1").execute(pool));
    let database_connected = matches!(db_check.await, Ok(Ok(_)));
    let queue_connected = queue.health_check().await.connected;
    ReadinessReport {
        database_connected,
        queue_connected,
    }
}
