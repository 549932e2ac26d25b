//! # Broadcast Lifecycle
//!
//! Admission, cancel, and expire contracts, styled after
//! `orchestration/lifecycle/task_request_processor.rs`'s transaction shape
//! but generalized to a single-call admission (broadcasts admit
//! one-at-a-time over HTTP, unlike task requests which batch-poll a
//! queue).

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{info, instrument};

use broadcast_shared::config::OrchestrationConfig;
use broadcast_shared::error::{BroadcastError, BroadcastResult};
use broadcast_shared::messaging::{OrchestrationEvent, OrchestrationEventKind, TopicRouterKind};
use broadcast_shared::models::{Broadcast, BroadcastStatus, Priority, TargetType};

use crate::outbox_publisher::insert_outbox_event;

/// Fields accepted from the admin HTTP surface's `POST /broadcasts`.
#[derive(Debug, Clone)]
pub struct CreateBroadcastRequest {
    pub sender_id: i64,
    pub sender_display_name: String,
    pub content: String,
    pub target_type: TargetType,
    pub target_ids: Vec<String>,
    pub priority: Priority,
    pub category: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fire_and_forget: bool,
}

#[derive(Debug, Clone)]
pub struct CreateBroadcastResult {
    pub id: i64,
    pub status: BroadcastStatus,
    pub total_targeted: Option<i64>,
}

/// Depends on an injected `UserService` resolver only for ROLE, which needs
/// the role's member ids up front to batch-insert per-user rows before the
/// outbox row is written at admission. PRODUCT never resolves here; its
/// cohort is resolved out-of-band by the Targeting Service.
#[async_trait::async_trait]
pub trait RoleResolver: Send + Sync {
    async fn resolve_role_members(&self, role: &str) -> BroadcastResult<Vec<String>>;
}

pub struct LifecycleService<R: RoleResolver> {
    pool: PgPool,
    config: OrchestrationConfig,
    topic_router: TopicRouterKind,
    role_resolver: R,
}

impl<R: RoleResolver> LifecycleService<R> {
    pub fn new(
        pool: PgPool,
        config: OrchestrationConfig,
        topic_router: TopicRouterKind,
        role_resolver: R,
    ) -> Self {
        Self {
            pool,
            config,
            topic_router,
            role_resolver,
        }
    }

    fn activation_threshold(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(
            (self.config.targeting.user_fetch_delay_ms
                + self.config.targeting.precompute_safety_buffer_ms) as i64,
        )
    }

    /// `createBroadcast(request) -> (id, initialStatus, totalTargeted?)`.
    /// Atomic: the broadcast row, any on-write per-user rows, statistics
    /// row, and the initial orchestration outbox row commit in one
    /// transaction, except PRODUCT which writes no outbox row at
    /// admission.
    #[instrument(skip(self, request), fields(target_type = ?request.target_type))]
    pub async fn create_broadcast(
        &self,
        request: CreateBroadcastRequest,
    ) -> BroadcastResult<CreateBroadcastResult> {
        let now = Utc::now();
        let initial_status = Broadcast::initial_status(
            request.expires_at,
            request.scheduled_at,
            request.target_type,
            now,
            self.activation_threshold(),
        );

        // ROLE resolves its member list before opening the transaction:
        // `UserServiceUnavailable` must not roll back the base broadcast
        // row, so the base row is inserted even if this call fails.
        let resolved_members = if initial_status != BroadcastStatus::Expired
            && request.target_type == TargetType::Role
        {
            let mut all = Vec::new();
            for role in &request.target_ids {
                match self.role_resolver.resolve_role_members(role).await {
                    Ok(members) => all.extend(members),
                    Err(e) => {
                        return self
                            .admit_base_row_only(&request, initial_status, now, e)
                            .await;
                    }
                }
            }
            all.sort();
            all.dedup();
            Some(all)
        } else {
            None
        };

        let mut tx = self.pool.begin().await?;

        let broadcast_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broadcasts
                (sender_id, sender_display_name, content, target_type, target_ids,
                 priority, category, scheduled_at, expires_at, fire_and_forget, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING id
            "#,
        )
        .bind(request.sender_id)
        .bind(&request.sender_display_name)
        .bind(&request.content)
        .bind(request.target_type)
        .bind(serde_json::to_value(&request.target_ids)?)
        .bind(request.priority)
        .bind(&request.category)
        .bind(request.scheduled_at)
        .bind(request.expires_at)
        .bind(request.fire_and_forget)
        .bind(initial_status)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        let mut total_targeted: Option<i64> = None;

        match initial_status {
            BroadcastStatus::Expired | BroadcastStatus::Preparing => {
                // EXPIRED: no fan-out at all. PREPARING (PRODUCT): the
                // Targeting Service writes per-user rows and statistics
                // when it flips PREPARING -> READY; the outbox CREATED
                // event is deferred further, to the scheduler's READY ->
                // ACTIVE activation step.
            }
            BroadcastStatus::Scheduled => {
                // No fan-out yet; the activation scheduler (§4.3) handles
                // it when `scheduled_at` arrives.
            }
            BroadcastStatus::Active => {
                match request.target_type {
                    TargetType::Role | TargetType::Selected => {
                        let members = resolved_members.unwrap_or_else(|| request.target_ids.clone());
                        insert_pending_rows(&mut tx, broadcast_id, &members, now).await?;
                        total_targeted = Some(members.len() as i64);

                        sqlx::query(
                            "INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at) VALUES ($1, $2, $3)",
                        )
                        .bind(broadcast_id)
                        .bind(members.len() as i64)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;

                        for user_id in &members {
                            let event = OrchestrationEvent::new(
                                OrchestrationEventKind::Created {
                                    broadcast_id,
                                    target_type: request.target_type,
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
                    }
                    TargetType::All => {
                        sqlx::query(
                            "INSERT INTO broadcast_statistics (broadcast_id, total_targeted, calculated_at) VALUES ($1, 0, $2)",
                        )
                        .bind(broadcast_id)
                        .bind(now)
                        .execute(&mut *tx)
                        .await?;

                        let event = OrchestrationEvent::new(
                            OrchestrationEventKind::Created {
                                broadcast_id,
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
                    TargetType::Product => unreachable!("PRODUCT is never Active at admission"),
                }
            }
            BroadcastStatus::Ready
            | BroadcastStatus::Cancelled
            | BroadcastStatus::Failed => {
                unreachable!("initial_status never yields this state")
            }
        }

        tx.commit().await?;

        info!(broadcast_id, status = ?initial_status, "broadcast admitted");

        Ok(CreateBroadcastResult {
            id: broadcast_id,
            status: initial_status,
            total_targeted,
        })
    }

    /// `UserServiceUnavailable` path: the base row still commits, but no
    /// per-user rows or outbox event are written.
    async fn admit_base_row_only(
        &self,
        request: &CreateBroadcastRequest,
        initial_status: BroadcastStatus,
        now: DateTime<Utc>,
        cause: BroadcastError,
    ) -> BroadcastResult<CreateBroadcastResult> {
        let broadcast_id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO broadcasts
                (sender_id, sender_display_name, content, target_type, target_ids,
                 priority, category, scheduled_at, expires_at, fire_and_forget, status,
                 created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $12)
            RETURNING id
            "#,
        )
        .bind(request.sender_id)
        .bind(&request.sender_display_name)
        .bind(&request.content)
        .bind(request.target_type)
        .bind(serde_json::to_value(&request.target_ids)?)
        .bind(request.priority)
        .bind(&request.category)
        .bind(request.scheduled_at)
        .bind(request.expires_at)
        .bind(request.fire_and_forget)
        .bind(initial_status)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;

        tracing::warn!(broadcast_id, error = %cause, "admitted base row only, UserService unavailable");
        Err(BroadcastError::UserServiceUnavailable(format!(
            "broadcast {broadcast_id} admitted but fan-out deferred: {cause}"
        )))
    }

    /// Cancel or expire a broadcast: update status, supersede non-final
    /// per-user rows, write one orchestration event.
    #[instrument(skip(self))]
    pub async fn cancel(&self, broadcast_id: i64) -> BroadcastResult<()> {
        self.terminate(broadcast_id, BroadcastStatus::Cancelled).await
    }

    #[instrument(skip(self))]
    pub async fn expire(&self, broadcast_id: i64) -> BroadcastResult<()> {
        self.terminate(broadcast_id, BroadcastStatus::Expired).await
    }

    async fn terminate(&self, broadcast_id: i64, next: BroadcastStatus) -> BroadcastResult<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let current: Option<(String, String)> = sqlx::query_as(
            "SELECT status, target_type FROM broadcasts WHERE id = $1 FOR UPDATE",
        )
        .bind(broadcast_id)
        .fetch_optional(&mut *tx)
        .await?;
        let (current, target_type) = match current {
            Some((status, target_type)) => {
                let current: BroadcastStatus = serde_json::from_value(serde_json::Value::String(status))?;
                let target_type: TargetType = serde_json::from_value(serde_json::Value::String(target_type))?;
                (current, target_type)
            }
            None => return Err(BroadcastError::ResourceNotFound(format!("broadcast {broadcast_id}"))),
        };
        let event_kind = match next {
            BroadcastStatus::Cancelled => OrchestrationEventKind::Cancelled { broadcast_id, target_type },
            BroadcastStatus::Expired => OrchestrationEventKind::Expired { broadcast_id, target_type },
            _ => unreachable!("terminate is only called with Cancelled or Expired"),
        };

        if !current.can_transition_to(next) {
            return Err(BroadcastError::IllegalTransition(format!(
                "broadcast {broadcast_id}: {current:?} -> {next:?} is not a valid transition"
            )));
        }

        sqlx::query("UPDATE broadcasts SET status = $1, updated_at = $2 WHERE id = $3")
            .bind(next)
            .bind(now)
            .bind(broadcast_id)
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
        .bind(broadcast_id)
        .execute(&mut *tx)
        .await?;

        let event = OrchestrationEvent::new(event_kind, now);
        insert_outbox_event(
            &mut tx,
            "broadcast",
            &event.partition_key(),
            match next {
                BroadcastStatus::Cancelled => "CANCELLED",
                BroadcastStatus::Expired => "EXPIRED",
                _ => unreachable!(),
            },
            &self.topic_router.orchestration_topic(),
            &event,
        )
        .await?;

        tx.commit().await?;
        info!(broadcast_id, next = ?next, "broadcast terminated");
        Ok(())
    }
}

async fn insert_pending_rows(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    broadcast_id: i64,
    user_ids: &[String],
    now: DateTime<Utc>,
) -> BroadcastResult<()> {
    for user_id in user_ids {
        sqlx::query(
            r#"
            INSERT INTO user_broadcast_messages
                (broadcast_id, user_id, delivery_status, read_status, created_at, updated_at)
            VALUES ($1, $2, 'PENDING', 'UNREAD', $3, $3)
            ON CONFLICT (broadcast_id, user_id) DO NOTHING
            "#,
        )
        .bind(broadcast_id)
        .bind(user_id)
        .bind(now)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoRoles;

    #[async_trait::async_trait]
    impl RoleResolver for NoRoles {
        async fn resolve_role_members(&self, _role: &str) -> BroadcastResult<Vec<String>> {
            Ok(vec![])
        }
    }

    #[test]
    fn activation_threshold_sums_config() {
        let config = OrchestrationConfig::default();
        let expected = config.targeting.user_fetch_delay_ms + config.targeting.precompute_safety_buffer_ms;
        assert_eq!(
            chrono::Duration::milliseconds(expected as i64).num_milliseconds(),
            expected as i64
        );
        let _ = NoRoles; // keeps the helper referenced for future DB-backed tests
    }
}
