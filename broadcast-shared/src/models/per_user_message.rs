//! # PerUserMessage
//!
//! `(broadcast_id, user_id)` unique row tracking per-user delivery/read
//! state. Created by on-write fan-out (SELECTED/ROLE/PRODUCT) or lazily on
//! first delivery for ALL.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
    Superseded,
}

impl DeliveryStatus {
    /// Delivery status monotonically advances through Pending ->
    /// Delivered, except that Pending/Delivered may also move to
    /// Superseded or Failed.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        use DeliveryStatus::*;
        match (self, next) {
            (Pending, Delivered) => true,
            (Pending, Superseded) | (Pending, Failed) => true,
            (Delivered, Superseded) | (Delivered, Failed) => true,
            _ => false,
        }
    }

    pub fn is_final(self) -> bool {
        matches!(self, DeliveryStatus::Failed | DeliveryStatus::Superseded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadStatus {
    Unread,
    Read,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PerUserMessage {
    pub id: i64,
    pub broadcast_id: i64,
    pub user_id: String,
    pub delivery_status: DeliveryStatus,
    pub read_status: ReadStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_can_advance_to_delivered() {
        assert!(DeliveryStatus::Pending.can_transition_to(DeliveryStatus::Delivered));
    }

    #[test]
    fn delivered_cannot_revert_to_pending() {
        assert!(!DeliveryStatus::Delivered.can_transition_to(DeliveryStatus::Pending));
    }

    #[test]
    fn final_states_reject_any_transition() {
        assert!(!DeliveryStatus::Superseded.can_transition_to(DeliveryStatus::Delivered));
        assert!(!DeliveryStatus::Failed.can_transition_to(DeliveryStatus::Pending));
        assert!(DeliveryStatus::Failed.is_final());
        assert!(DeliveryStatus::Superseded.is_final());
    }

    #[test]
    fn delivered_can_be_superseded_or_failed() {
        assert!(DeliveryStatus::Delivered.can_transition_to(DeliveryStatus::Superseded));
        assert!(DeliveryStatus::Delivered.can_transition_to(DeliveryStatus::Failed));
    }
}
