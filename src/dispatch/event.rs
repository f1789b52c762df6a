//! Settlement sync events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{OrderId, PaymentId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    PaymentSuccess,
    PaymentFailed,
    PaymentCanceled,
    RefundSuccess,
    RefundFailed,
}

impl SyncEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncEventType::PaymentSuccess => "payment_success",
            SyncEventType::PaymentFailed => "payment_failed",
            SyncEventType::PaymentCanceled => "payment_canceled",
            SyncEventType::RefundSuccess => "refund_success",
            SyncEventType::RefundFailed => "refund_failed",
        }
    }
}

impl std::fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncEvent {
    pub id: String,
    pub event_type: SyncEventType,
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl SyncEvent {
    pub fn new(
        event_type: SyncEventType,
        payment_id: PaymentId,
        order_id: OrderId,
        user_id: UserId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: crate::core_types::external_no("EVT"),
            event_type,
            payment_id,
            order_id,
            user_id,
            payload,
            retry_count: 0,
            next_retry_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(SyncEventType::PaymentSuccess.as_str(), "payment_success");
        assert_eq!(SyncEventType::RefundFailed.as_str(), "refund_failed");
        let json = serde_json::to_string(&SyncEventType::PaymentCanceled).unwrap();
        assert_eq!(json, "\"payment_canceled\"");
    }

    #[test]
    fn test_new_event_has_unique_id_and_zero_retries() {
        let a = SyncEvent::new(
            SyncEventType::PaymentSuccess,
            1,
            2,
            3,
            serde_json::json!({}),
        );
        let b = SyncEvent::new(
            SyncEventType::PaymentSuccess,
            1,
            2,
            3,
            serde_json::json!({}),
        );
        assert_ne!(a.id, b.id);
        assert_eq!(a.retry_count, 0);
        assert!(a.next_retry_at.is_none());
    }
}
