//! # Targeting Service
//!
//! Asynchronous PRODUCT cohort resolution, guarded by a circuit breaker and
//! bulkhead around the opaque `UserService` collaborator, whose own
//! directory lookup lives outside this workspace. Styled after
//! `tasker-shared/src/resilience/behavior.rs` for the breaker abstraction
//! and
//! `tasker-orchestration/src/orchestration/task_readiness/circuit_breaker.rs`
//! for the call-wrapping idiom.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{info, instrument, warn};

use broadcast_shared::config::OrchestrationConfig;
use broadcast_shared::error::{BroadcastError, BroadcastResult};
use broadcast_shared::models::BroadcastStatus;
use broadcast_shared::resilience::{
    Bulkhead, CircuitBreaker, CircuitBreakerBehavior, MetricsCollector, PrometheusMetricsExporter,
};

/// Opaque interface returning user ids for a PRODUCT cohort or a ROLE.
#[async_trait::async_trait]
pub trait UserService: Send + Sync {
    async fn resolve_product_members(&self, product_key: &str) -> BroadcastResult<Vec<String>>;
}

pub struct TargetingService<U: UserService> {
    pool: PgPool,
    user_service: U,
    breaker: Arc<CircuitBreaker>,
    bulkhead: Bulkhead,
    metrics: Arc<dyn MetricsCollector + Send + Sync>,
}

impl<U: UserService> TargetingService<U> {
    pub fn new(pool: PgPool, config: &OrchestrationConfig, user_service: U) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            "user_service",
            config.targeting.circuit_breaker.to_resilience_config(),
        ));
        let bulkhead = Bulkhead::new(config.targeting.bulkhead_limit);
        Self {
            pool,
            user_service,
            breaker,
            bulkhead,
            metrics: Arc::new(PrometheusMetricsExporter),
        }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        self.breaker.clone()
    }

    /// `precompute(broadcastId) -> terminal status`. Idempotent by
    /// broadcast id: a second attempt detects existing per-user rows via
    /// `ON CONFLICT DO NOTHING` and never double-inserts.
    #[instrument(skip(self))]
    pub async fn precompute(&self, broadcast_id: i64) -> BroadcastResult<BroadcastStatus> {
        let row: Option<(String, serde_json::Value)> =
            sqlx::query_as("SELECT target_type, target_ids FROM broadcasts WHERE id = $1")
                .bind(broadcast_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some((target_type, target_ids)) = row else {
            return Err(BroadcastError::ResourceNotFound(format!("broadcast {broadcast_id}")));
        };
        if target_type != "PRODUCT" {
            return Err(BroadcastError::IllegalTransition(format!(
                "broadcast {broadcast_id} is not a PRODUCT broadcast"
            )));
        }
        let product_keys: Vec<String> = serde_json::from_value(target_ids)?;

        match self.resolve_all_products(&product_keys).await {
            Ok(members) => self.mark_ready(broadcast_id, members).await,
            Err(e) => {
                warn!(broadcast_id, error = %e, "precompute failed, marking broadcast FAILED");
                self.mark_failed(broadcast_id).await?;
                Err(e)
            }
        }
    }

    async fn resolve_all_products(&self, product_keys: &[String]) -> BroadcastResult<Vec<String>> {
        let mut members = Vec::new();
        for key in product_keys {
            members.extend(self.call_user_service(key).await?);
        }
        members.sort();
        members.dedup();
        Ok(members)
    }

    /// Circuit-breaker- and bulkhead-guarded call: when the breaker is
    /// open, short-circuits to `UserServiceUnavailable` instead of
    /// attempting the call.
    async fn call_user_service(&self, product_key: &str) -> BroadcastResult<Vec<String>> {
        if !self.breaker.should_allow() {
            return Err(BroadcastError::UserServiceUnavailable(format!(
                "circuit open for product {product_key}"
            )));
        }

        let _permit = self.bulkhead.acquire().await;
        let start = Instant::now();
        let state_before = self.breaker.state();
        let result = self.user_service.resolve_product_members(product_key).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(_) => self.breaker.record_success(elapsed),
            Err(_) => self.breaker.record_failure(elapsed),
        }

        let state_after = self.breaker.state();
        if state_after != state_before {
            self.metrics
                .record_state_transition(self.breaker.name(), state_before, state_after);
        }
        self.metrics
            .record_operation_timing(self.breaker.name(), elapsed, result.is_ok());
        self.metrics
            .record_circuit_breaker_metrics(self.breaker.name(), &self.breaker.metrics());

        result
    }

    async fn mark_ready(&self, broadcast_id: i64, members: Vec<String>) -> BroadcastResult<BroadcastStatus> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        for user_id in &members {
            sqlx::query(
                "INSERT INTO user_broadcast_targets (broadcast_id, user_id, created_at) VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
            )
            .bind(broadcast_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                r#"
                INSERT INTO user_broadcast_messages (broadcast_id, user_id, delivery_status, read_status, created_at, updated_at)
                VALUES ($1, $2, 'PENDING', 'UNREAD', $3, $3)
                ON CONFLICT (broadcast_id, user_id) DO NOTHING
                "#,
            )
            .bind(broadcast_id)
            .bind(user_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (broadcast_id) DO UPDATE SET total_targeted = excluded.total_targeted, calculated_at = excluded.calculated_at
            "#,
        )
        .bind(broadcast_id)
        .bind(members.len() as i64)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        // No outbox row here: the scheduler's READY -> ACTIVE activation
        // step (not precompute) emits the CREATED event, once it has
        // re-read the precomputed target list.
        let updated = sqlx::query(
            "UPDATE broadcasts SET status = 'READY', updated_at = $1 WHERE id = $2 AND status = 'PREPARING'",
        )
        .bind(now)
        .bind(broadcast_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if updated.rows_affected() == 0 {
            warn!(broadcast_id, "precompute completed but broadcast was not PREPARING");
        }
        info!(broadcast_id, targeted = members.len(), "precompute ready");
        Ok(BroadcastStatus::Ready)
    }

    async fn mark_failed(&self, broadcast_id: i64) -> BroadcastResult<()> {
        sqlx::query("UPDATE broadcasts SET status = 'FAILED', updated_at = now() WHERE id = $1 AND status = 'PREPARING'")
            .bind(broadcast_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
