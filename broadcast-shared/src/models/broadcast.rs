//! # Broadcast
//!
//! The administrator-authored message row and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum BroadcastStatus {
    Scheduled,
    Preparing,
    Ready,
    Active,
    Cancelled,
    Expired,
    Failed,
}

impl BroadcastStatus {
    /// Terminal states: once reached, a broadcast's status never changes
    /// again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BroadcastStatus::Cancelled | BroadcastStatus::Expired | BroadcastStatus::Failed
        )
    }

    /// Valid forward transitions. Used by the lifecycle service to reject
    /// illegal moves with `BroadcastError::IllegalTransition`.
    pub fn can_transition_to(self, next: BroadcastStatus) -> bool {
        use BroadcastStatus::*;
        match (self, next) {
            (Preparing, Ready) | (Preparing, Failed) => true,
            (Scheduled, Active) | (Ready, Active) => true,
            (Active, Expired) => true,
            (Active, Failed) => true,
            (s, Cancelled) if !s.is_terminal() => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TargetType {
    All,
    Role,
    Selected,
    Product,
}

impl TargetType {
    /// Whether this target type fans out on write at admission time
    /// (synchronous batch insert for Role/Selected, asynchronous precompute
    /// for Product) vs. on read (All). See DESIGN.md Open Question
    /// resolution #2.
    pub fn is_fan_out_on_write(self) -> bool {
        !matches!(self, TargetType::All)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Broadcast {
    pub id: i64,
    pub sender_id: i64,
    pub sender_display_name: String,
    pub content: String,
    pub target_type: TargetType,
    /// Opaque list of target identifiers; interpretation depends on
    /// `target_type` (role names, user ids, or product keys).
    pub target_ids: Vec<String>,
    pub priority: Priority,
    pub category: String,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub fire_and_forget: bool,
    pub status: BroadcastStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Broadcast {
    /// Admission-time initial state decision table.
    pub fn initial_status(
        expires_at: Option<DateTime<Utc>>,
        scheduled_at: Option<DateTime<Utc>>,
        target_type: TargetType,
        now: DateTime<Utc>,
        activation_threshold: chrono::Duration,
    ) -> BroadcastStatus {
        if let Some(expires) = expires_at {
            if expires < now {
                return BroadcastStatus::Expired;
            }
        }

        let scheduled_in_future = scheduled_at.is_some_and(|s| s > now + activation_threshold);

        match (scheduled_in_future, target_type) {
            (true, TargetType::Product) => BroadcastStatus::Preparing,
            (true, _) => BroadcastStatus::Scheduled,
            (false, TargetType::Product) => BroadcastStatus::Preparing,
            (false, _) => BroadcastStatus::Active,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-07-28T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn expired_scheduled_at_admission_yields_expired() {
        let t = now();
        let status = Broadcast::initial_status(
            Some(t - Duration::minutes(5)),
            None,
            TargetType::All,
            t,
            Duration::minutes(0),
        );
        assert_eq!(status, BroadcastStatus::Expired);
    }

    #[test]
    fn future_product_is_preparing() {
        let t = now();
        let status = Broadcast::initial_status(
            None,
            Some(t + Duration::minutes(30)),
            TargetType::Product,
            t,
            Duration::minutes(0),
        );
        assert_eq!(status, BroadcastStatus::Preparing);
    }

    #[test]
    fn future_all_is_scheduled() {
        let t = now();
        let status = Broadcast::initial_status(
            None,
            Some(t + Duration::minutes(30)),
            TargetType::All,
            t,
            Duration::minutes(0),
        );
        assert_eq!(status, BroadcastStatus::Scheduled);
    }

    #[test]
    fn immediate_selected_is_active() {
        let t = now();
        let status =
            Broadcast::initial_status(None, None, TargetType::Selected, t, Duration::minutes(0));
        assert_eq!(status, BroadcastStatus::Active);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        assert!(!BroadcastStatus::Cancelled.can_transition_to(BroadcastStatus::Active));
        assert!(!BroadcastStatus::Expired.can_transition_to(BroadcastStatus::Cancelled));
    }

    #[test]
    fn active_can_expire_or_fail_or_cancel() {
        assert!(BroadcastStatus::Active.can_transition_to(BroadcastStatus::Expired));
        assert!(BroadcastStatus::Active.can_transition_to(BroadcastStatus::Failed));
        assert!(BroadcastStatus::Active.can_transition_to(BroadcastStatus::Cancelled));
    }

    #[test]
    fn target_type_fan_out_classification() {
        assert!(!TargetType::All.is_fan_out_on_write());
        assert!(TargetType::Role.is_fan_out_on_write());
        assert!(TargetType::Selected.is_fan_out_on_write());
        assert!(TargetType::Product.is_fan_out_on_write());
    }
}
