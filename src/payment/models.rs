//! Payment row types, methods, and request/response shapes.

use super::state::PaymentState;
use crate::core_types::{OrderId, PaymentId, RefundId, UserId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported payment methods. Stored as SMALLINT; the wire name (`alipay`,
/// `wechat`, ...) is the config and API vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum PaymentMethod {
    Alipay = 1,
    Wechat = 2,
    Unionpay = 3,
    Balance = 4,
}

impl PaymentMethod {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            1 => Some(PaymentMethod::Alipay),
            2 => Some(PaymentMethod::Wechat),
            3 => Some(PaymentMethod::Unionpay),
            4 => Some(PaymentMethod::Balance),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Alipay => "alipay",
            PaymentMethod::Wechat => "wechat",
            PaymentMethod::Unionpay => "unionpay",
            PaymentMethod::Balance => "balance",
        }
    }

    pub const ALL: [PaymentMethod; 4] = [
        PaymentMethod::Alipay,
        PaymentMethod::Wechat,
        PaymentMethod::Unionpay,
        PaymentMethod::Balance,
    ];
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PaymentMethod {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alipay" => Ok(PaymentMethod::Alipay),
            "wechat" => Ok(PaymentMethod::Wechat),
            "unionpay" => Ok(PaymentMethod::Unionpay),
            "balance" => Ok(PaymentMethod::Balance),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Payment {
    pub id: PaymentId,
    pub payment_no: String,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub method: i16,
    pub status: i16,
    pub amount: Decimal,
    pub actual_amount: Option<Decimal>,
    pub third_party_id: Option<String>,
    pub expired_at: DateTime<Utc>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Payment {
    pub fn state(&self) -> Option<PaymentState> {
        PaymentState::from_id(self.status)
    }

    pub fn method(&self) -> Option<PaymentMethod> {
        PaymentMethod::from_id(self.method)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expired_at
    }
}

/// Refund status, stored as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum RefundStatus {
    Pending = 0,
    Success = 10,
    Failed = -10,
}

impl RefundStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(RefundStatus::Pending),
            10 => Some(RefundStatus::Success),
            -10 => Some(RefundStatus::Failed),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RefundStatus::Pending => "PENDING",
            RefundStatus::Success => "SUCCESS",
            RefundStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentRefund {
    pub id: RefundId,
    pub refund_no: String,
    pub payment_id: PaymentId,
    pub refund_amount: Decimal,
    pub status: i16,
    pub reason: Option<String>,
    pub refunded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PaymentRefund {
    pub fn status(&self) -> Option<RefundStatus> {
        RefundStatus::from_id(self.status)
    }
}

/// Append-only audit record of one state transition.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PaymentLog {
    pub id: i64,
    pub payment_id: PaymentId,
    pub payment_no: String,
    pub from_status: i16,
    pub to_status: i16,
    pub actor: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Inbound create request.
#[derive(Debug, Clone, Deserialize)]
pub struct CreatePaymentRequest {
    pub order_id: OrderId,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub subject: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub notify_url: Option<String>,
    #[serde(default)]
    pub return_url: Option<String>,
    /// Override for the default 30-minute expiry window
    #[serde(default)]
    pub expired_minutes: Option<i64>,
}

/// Opaque, provider-shaped handoff data returned to the caller.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentResponse {
    pub payment_id: PaymentId,
    pub payment_no: String,
    pub method: PaymentMethod,
    pub amount: Decimal,
    /// QR URL, prepay id, or redirect URL depending on the provider
    pub payment_data: serde_json::Value,
    pub expired_at: DateTime<Utc>,
}

/// Lookup key for [`query`](crate::payment::PaymentOrchestrator::query).
#[derive(Debug, Clone)]
pub enum QueryBy {
    PaymentId(PaymentId),
    PaymentNo(String),
    OrderId(OrderId),
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefundRequest {
    pub payment_id: PaymentId,
    pub refund_amount: Decimal,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefundResponse {
    pub refund_id: RefundId,
    pub refund_no: String,
    pub status: String,
}
