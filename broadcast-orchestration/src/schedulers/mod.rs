//! # Schedulers
//!
//! One periodic tick (precompute-due, activate-READY, activate-SCHEDULED,
//! expire) plus two coarser reapers (finalized rows, stale pods), each run
//! under a cluster-wide singleton lock so exactly one pod executes a given
//! job per period. Follows `tasker-orchestration`'s task-claim idiom
//! (`FOR UPDATE SKIP LOCKED`, bounded batch) generalized from task requests
//! to due broadcasts, and `SharedListenerManager`'s lease-ownership pattern
//! for the singleton lock itself (here backed by
//! `PresenceStore::try_acquire_lock` instead of an in-process atomic, since
//! schedulers run on every pod).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info, instrument, warn};

use broadcast_shared::config::OrchestrationConfig;
use broadcast_shared::error::BroadcastResult;
use broadcast_shared::messaging::{OrchestrationEvent, OrchestrationEventKind, TopicRouterKind};
use broadcast_shared::models::TargetType;
use broadcast_shared::presence::{PresenceKeys, PresenceStore};

use crate::lifecycle::RoleResolver;
use crate::outbox_publisher::insert_outbox_event;
use crate::targeting::{TargetingService, UserService};

pub struct Scheduler<R: RoleResolver, U: UserService> {
    pool: PgPool,
    config: OrchestrationConfig,
    topic_router: TopicRouterKind,
    presence: PresenceStore,
    role_resolver: Arc<R>,
    targeting: Arc<TargetingService<U>>,
}

impl<R: RoleResolver + 'static, U: UserService + 'static> Scheduler<R, U> {
    pub fn new(
        pool: PgPool,
        config: OrchestrationConfig,
        topic_router: TopicRouterKind,
        presence: PresenceStore,
        role_resolver: Arc<R>,
        targeting: Arc<TargetingService<U>>,
    ) -> Self {
        Self {
            pool,
            config,
            topic_router,
            presence,
            role_resolver,
            targeting,
        }
    }

    /// Spawns the three independent cadences as background tasks. Returns
    /// immediately; callers join the handles (or let them run for the
    /// process lifetime, as `bin/orchestrator.rs` does).
    pub fn spawn(self: Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let tick = self.clone();
        let finalized = self.clone();
        let stale_pods = self.clone();

        vec![
            tokio::spawn(async move { tick.main_tick_loop().await }),
            tokio::spawn(async move { finalized.reap_finalized_loop().await }),
            tokio::spawn(async move { stale_pods.reap_stale_pods_loop().await }),
        ]
    }

    async fn main_tick_loop(&self) {
        let period = StdDuration::from_millis(self.config.scheduler.activation_tick_period_ms);
        loop {
            if let Err(e) = self.run_main_tick().await {
                error!(error = %e, "scheduler main tick failed");
            }
            tokio::time::sleep(period).await;
        }
    }

    async fn run_main_tick(&self) -> BroadcastResult<()> {
        if !self.acquire("main_tick").await? {
            return Ok(());
        }
        let started = tokio::time::Instant::now();
        let result = async {
            self.precompute_due_product().await?;
            self.activate_ready_on_write().await?;
            self.activate_scheduled_on_read().await?;
            self.expire_active().await?;
            Ok(())
        }
        .await;
        self.release("main_tick", started).await?;
        result
    }

    async fn reap_finalized_loop(&self) {
        let period = StdDuration::from_secs(3600);
        loop {
            if let Err(e) = self.run_locked("reap_finalized", || self.reap_finalized()).await {
                error!(error = %e, "reap_finalized failed");
            }
            tokio::time::sleep(period).await;
        }
    }

    async fn reap_stale_pods_loop(&self) {
        let period = StdDuration::from_secs(60);
        loop {
            if let Err(e) = self
                .run_locked("reap_stale_pods", || self.reap_stale_pods())
                .await
            {
                error!(error = %e, "reap_stale_pods failed");
            }
            tokio::time::sleep(period).await;
        }
    }

    /// Runs a single zero-argument job only while holding the named
    /// cluster-wide lock, leased for `lockAtMostFor`.
    async fn run_locked<Fut>(
        &self,
        name: &str,
        job: impl FnOnce() -> Fut,
    ) -> BroadcastResult<()>
    where
        Fut: std::future::Future<Output = BroadcastResult<()>>,
    {
        if !self.acquire(name).await? {
            return Ok(());
        }
        let started = tokio::time::Instant::now();
        let result = job().await;
        self.release(name, started).await?;
        result
    }

    async fn acquire(&self, name: &str) -> BroadcastResult<bool> {
        let key = PresenceKeys::scheduler_lock(name);
        let ttl = StdDuration::from_millis(self.config.scheduler.lock_at_most_for_ms);
        self.presence.try_acquire_lock(&key, ttl).await
    }

    async fn release(&self, name: &str, started: tokio::time::Instant) -> BroadcastResult<()> {
        let min_hold = StdDuration::from_millis(self.config.scheduler.lock_at_least_for_ms);
        let elapsed = started.elapsed();
        if elapsed < min_hold {
            tokio::time::sleep(min_hold - elapsed).await;
        }
        self.presence.release_lock(&PresenceKeys::scheduler_lock(name)).await
    }

    /// Job 1: claim due PRODUCT broadcasts and trigger async precompute.
    #[instrument(skip(self))]
    async fn precompute_due_product(&self) -> BroadcastResult<()> {
        let horizon = Utc::now()
            + chrono::Duration::milliseconds(
                (self.config.targeting.user_fetch_delay_ms
                    + self.config.targeting.precompute_safety_buffer_ms) as i64,
            );

        let mut tx = self.pool.begin().await?;
        let claimed: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM broadcasts
            WHERE status = 'SCHEDULED' AND target_type = 'PRODUCT' AND scheduled_at <= $1
            ORDER BY scheduled_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(horizon)
        .bind(self.config.scheduler.claim_batch_size)
        .fetch_all(&mut *tx)
        .await?;

        for (id,) in &claimed {
            sqlx::query("UPDATE broadcasts SET status = 'PREPARING', updated_at = now() WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        for (id,) in claimed {
            let targeting = self.targeting.clone();
            tokio::spawn(async move {
                if let Err(e) = targeting.precompute(id).await {
                    warn!(broadcast_id = id, error = %e, "async precompute failed");
                }
            });
        }
        Ok(())
    }

    /// Job 2: claim READY broadcasts whose `scheduled_at` is due, move them
    /// to ACTIVE, and publish one group-level CREATED event per broadcast
    /// (the orchestration consumer re-reads the precomputed target list
    /// using the broadcast id carried on the event).
    #[instrument(skip(self))]
    async fn activate_ready_on_write(&self) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let claimed: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, target_type FROM broadcasts
            WHERE status = 'READY' AND scheduled_at <= $1
            ORDER BY scheduled_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(self.config.scheduler.claim_batch_size)
        .fetch_all(&mut *tx)
        .await?;

        for (id, target_type) in &claimed {
            sqlx::query("UPDATE broadcasts SET status = 'ACTIVE', updated_at = $1 WHERE id = $2")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            let event = OrchestrationEvent::new(
                OrchestrationEventKind::Created {
                    broadcast_id: *id,
                    target_type: parse_target_type(target_type),
                    user_id: None,
                },
                now,
            );
            insert_outbox_event(
                &mut tx,
                "broadcast",
                &event.partition_key(),
                "CREATED",
                &self.topic_router.orchestration_topic(),
                &event,
            )
            .await?;
        }
        tx.commit().await?;
        if !claimed.is_empty() {
            info!(count = claimed.len(), "activated READY broadcasts");
        }
        Ok(())
    }

    /// Job 3: claim SCHEDULED broadcasts for ALL/ROLE/SELECTED whose
    /// `scheduled_at` is due. ROLE resolves its member list at activation
    /// time (the names were never resolved at admission, since admission
    /// for a future schedule performed no fan-out at all).
    #[instrument(skip(self))]
    async fn activate_scheduled_on_read(&self) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let claimed: Vec<(i64, String, serde_json::Value)> = sqlx::query_as(
            r#"
            SELECT id, target_type, target_ids FROM broadcasts
            WHERE status = 'SCHEDULED' AND scheduled_at <= $1
              AND target_type IN ('ALL', 'ROLE', 'SELECTED')
            ORDER BY scheduled_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(self.config.scheduler.claim_batch_size)
        .fetch_all(&mut *tx)
        .await?;

        for (id, target_type_raw, target_ids_json) in claimed {
            let target_type = parse_target_type(&target_type_raw);
            sqlx::query("UPDATE broadcasts SET status = 'ACTIVE', updated_at = $1 WHERE id = $2")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;

            match target_type {
                TargetType::Role | TargetType::Selected => {
                    let target_ids: Vec<String> = serde_json::from_value(target_ids_json)?;
                    let members = if target_type == TargetType::Role {
                        let mut all = Vec::new();
                        for role in &target_ids {
                            all.extend(self.role_resolver.resolve_role_members(role).await?);
                        }
                        all.sort();
                        all.dedup();
                        all
                    } else {
                        target_ids
                    };

                    for user_id in &members {
                        sqlx::query(
                            r#"
                            INSERT INTO user_broadcast_messages
                                (broadcast_id, user_id, delivery_status, read_status, created_at, updated_at)
                            VALUES ($1, $2, 'PENDING', 'UNREAD', $3, $3)
                            ON CONFLICT (broadcast_id, user_id) DO NOTHING
                            "#,
                        )
                        .bind(id)
                        .bind(user_id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;

                        let event = OrchestrationEvent::new(
                            OrchestrationEventKind::Created {
                                broadcast_id: id,
                                target_type,
                                user_id: Some(user_id.clone()),
                            },
                            now,
                        );
                        insert_outbox_event(
                            &mut tx,
                            "broadcast",
                            &event.partition_key(),
                            "CREATED",
                            &self.topic_router.orchestration_topic(),
                            &event,
                        )
                        .await?;
                    }

                    sqlx::query(
                        r#"
                        INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (broadcast_id) DO UPDATE SET total_targeted = excluded.total_targeted, calculated_at = excluded.calculated_at
                        "#,
                    )
                    .bind(id)
                    .bind(members.len() as i64)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                }
                TargetType::All => {
                    sqlx::query(
                        "INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at) VALUES ($1, 0, $2) ON CONFLICT (broadcast_id) DO NOTHING",
                    )
                    .bind(id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;

                    let event = OrchestrationEvent::new(
                        OrchestrationEventKind::Created {
                            broadcast_id: id,
                            target_type: TargetType::All,
                            user_id: None,
                        },
                        now,
                    );
                    insert_outbox_event(
                        &mut tx,
                        "broadcast",
                        &event.partition_key(),
                        "CREATED",
                        &self.topic_router.orchestration_topic(),
                        &event,
                    )
                    .await?;
                }
                TargetType::Product => unreachable!("PRODUCT excluded from this query"),
            }
        }

        tx.commit().await?;
        Ok(())
    }

    /// Job 4: expire ACTIVE broadcasts past `expires_at`, through the same
    /// terminate path as operator-expire.
    #[instrument(skip(self))]
    async fn expire_active(&self) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let due: Vec<(i64, String)> = sqlx::query_as(
            r#"
            SELECT id, target_type FROM broadcasts
            WHERE status = 'ACTIVE' AND expires_at IS NOT NULL AND expires_at <= $1
            ORDER BY expires_at
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(self.config.scheduler.claim_batch_size)
        .fetch_all(&mut *tx)
        .await?;

        for (id, target_type_raw) in due {
            sqlx::query("UPDATE broadcasts SET status = 'EXPIRED', updated_at = $1 WHERE id = $2")
                .bind(now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                r#"
                UPDATE user_broadcast_messages
                SET delivery_status = 'SUPERSEDED', updated_at = $1
                WHERE broadcast_id = $2 AND delivery_status IN ('PENDING', 'DELIVERED')
                "#,
            )
            .bind(now)
            .bind(id)
            .execute(&mut *tx)
            .await?;

            let event = OrchestrationEvent::new(
                OrchestrationEventKind::Expired {
                    broadcast_id: id,
                    target_type: parse_target_type(&target_type_raw),
                },
                now,
            );
            insert_outbox_event(
                &mut tx,
                "broadcast",
                &event.partition_key(),
                "EXPIRED",
                &self.topic_router.orchestration_topic(),
                &event,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Job 5: for terminal broadcasts older than 1 hour, delete
    /// precomputed targets and unread per-user rows, preserving rows the
    /// user actually read.
    #[instrument(skip(self))]
    async fn reap_finalized(&self) -> BroadcastResult<()> {
        let cutoff = Utc::now()
            - chrono::Duration::milliseconds(self.config.scheduler.reap_finalized_after_ms as i64);

        let ids: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT id FROM broadcasts
            WHERE status IN ('CANCELLED', 'EXPIRED', 'FAILED') AND updated_at <= $1
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(());
        }

        let id_list: Vec<i64> = ids.into_iter().map(|(id,)| id).collect();
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_broadcast_targets WHERE broadcast_id = ANY($1)")
            .bind(&id_list)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "DELETE FROM user_broadcast_messages WHERE broadcast_id = ANY($1) AND read_status = 'UNREAD'",
        )
        .bind(&id_list)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(count = id_list.len(), "reaped finalized broadcasts");
        Ok(())
    }

    /// Job 6: reap pods missing a heartbeat for `staleThreshold`, freeing
    /// their owned connection bookkeeping.
    #[instrument(skip(self))]
    async fn reap_stale_pods(&self) -> BroadcastResult<()> {
        let threshold = StdDuration::from_millis(self.config.scheduler.stale_pod_threshold_ms);
        let reaped = self.presence.reap_stale_pods(Utc::now(), threshold).await?;
        if !reaped.is_empty() {
            info!(count = reaped.len(), "reaped stale pods");
        }
        Ok(())
    }
}

fn parse_target_type(raw: &str) -> TargetType {
    match raw {
        "ALL" => TargetType::All,
        "ROLE" => TargetType::Role,
        "SELECTED" => TargetType::Selected,
        "PRODUCT" => TargetType::Product,
        other => unreachable!("unknown target_type in storage: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_type_round_trips_stored_text() {
        assert_eq!(parse_target_type("ALL"), TargetType::All);
        assert_eq!(parse_target_type("ROLE"), TargetType::Role);
        assert_eq!(parse_target_type("SELECTED"), TargetType::Selected);
        assert_eq!(parse_target_type("PRODUCT"), TargetType::Product);
    }
}
