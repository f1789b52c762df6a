//! Order row types and status state machines.
//!
//! Status IDs are stored as SMALLINT; negative IDs are the abnormal
//! terminals, mirroring the payment status encoding.

use crate::core_types::{OrderId, ProductId, SkuId, UserId};
use crate::inventory::StockRequest;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// Order fulfilment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum OrderStatus {
    Pending = 0,
    Paid = 10,
    Shipped = 20,
    Delivered = 30,
    Completed = 40,
    Cancelled = -10,
    Refunded = -20,
}

impl OrderStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderStatus::Pending),
            10 => Some(OrderStatus::Paid),
            20 => Some(OrderStatus::Shipped),
            30 => Some(OrderStatus::Delivered),
            40 => Some(OrderStatus::Completed),
            -10 => Some(OrderStatus::Cancelled),
            -20 => Some(OrderStatus::Refunded),
            _ => None,
        }
    }

    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Cancelled | OrderStatus::Refunded
        )
    }

    /// Permitted fulfilment edges.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Paid, Shipped)
                | (Paid, Refunded)
                | (Shipped, Delivered)
                | (Shipped, Refunded)
                | (Delivered, Completed)
                | (Delivered, Refunded)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Paid => "PAID",
            OrderStatus::Shipped => "SHIPPED",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Completed => "COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment-side status mirrored onto the order row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum OrderPaymentStatus {
    Pending = 0,
    Paying = 10,
    Paid = 20,
    Refunded = 30,
    Failed = -10,
    Cancelled = -20,
}

impl OrderPaymentStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(OrderPaymentStatus::Pending),
            10 => Some(OrderPaymentStatus::Paying),
            20 => Some(OrderPaymentStatus::Paid),
            30 => Some(OrderPaymentStatus::Refunded),
            -10 => Some(OrderPaymentStatus::Failed),
            -20 => Some(OrderPaymentStatus::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderPaymentStatus::Pending => "PENDING",
            OrderPaymentStatus::Paying => "PAYING",
            OrderPaymentStatus::Paid => "PAID",
            OrderPaymentStatus::Refunded => "REFUNDED",
            OrderPaymentStatus::Failed => "FAILED",
            OrderPaymentStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for OrderPaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct Order {
    pub id: OrderId,
    pub order_no: String,
    pub user_id: UserId,
    pub total_amount: Decimal,
    pub status: i16,
    pub payment_status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn status(&self) -> Option<OrderStatus> {
        OrderStatus::from_id(self.status)
    }

    pub fn payment_status(&self) -> Option<OrderPaymentStatus> {
        OrderPaymentStatus::from_id(self.payment_status)
    }
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct OrderItem {
    pub id: i64,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub quantity: i64,
    pub price: Decimal,
}

impl OrderItem {
    pub fn stock_request(&self) -> StockRequest {
        StockRequest {
            product_id: self.product_id,
            sku_id: self.sku_id,
            quantity: self.quantity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_status_roundtrip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderStatus::Shipped,
            OrderStatus::Delivered,
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Refunded,
        ] {
            assert_eq!(OrderStatus::from_id(status.id()), Some(status));
        }
        assert_eq!(OrderStatus::from_id(99), None);
    }

    #[test]
    fn test_permitted_edges() {
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Paid));
        assert!(OrderStatus::Pending.can_transition_to(OrderStatus::Cancelled));
        assert!(OrderStatus::Paid.can_transition_to(OrderStatus::Refunded));
        // No path back to pending, ever
        assert!(!OrderStatus::Paid.can_transition_to(OrderStatus::Pending));
        assert!(!OrderStatus::Cancelled.can_transition_to(OrderStatus::Paid));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Refunded));
    }

    #[test]
    fn test_terminal_states() {
        assert!(OrderStatus::Completed.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Refunded.is_terminal());
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Paid.is_terminal());
    }

    #[test]
    fn test_payment_status_roundtrip() {
        for status in [
            OrderPaymentStatus::Pending,
            OrderPaymentStatus::Paying,
            OrderPaymentStatus::Paid,
            OrderPaymentStatus::Refunded,
            OrderPaymentStatus::Failed,
            OrderPaymentStatus::Cancelled,
        ] {
            assert_eq!(OrderPaymentStatus::from_id(status.id()), Some(status));
        }
    }
}
