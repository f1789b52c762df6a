//! Provider-facing request/response shapes and the core status vocabulary
//! adapters map into.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

/// Core view of a provider-side trade status. Adapters translate their
/// native vocabularies (`TRADE_SUCCESS`, `NOTPAY`, `respCode=00`, ...)
/// into this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderTradeStatus {
    /// Trade registered, buyer has not paid
    Pending,
    /// Terminal success
    Success,
    /// Terminal failure
    Failed,
    /// Trade closed/expired at the provider without payment
    Closed,
}

impl ProviderTradeStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProviderTradeStatus::Pending)
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCreateRequest {
    pub payment_no: String,
    pub amount: Decimal,
    pub currency: String,
    pub subject: String,
    pub description: String,
    pub notify_url: String,
    pub return_url: String,
    pub expired_at: DateTime<Utc>,
    /// Wallet debits need the payer; external providers ignore it
    pub user_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderCreateResponse {
    /// Provider trade id when issued at creation (some issue it at
    /// settlement only)
    pub third_party_id: Option<String>,
    /// Opaque handoff data, provider-shaped
    pub payment_data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ProviderQueryResponse {
    pub status: ProviderTradeStatus,
    pub third_party_id: Option<String>,
    pub paid_amount: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct ProviderRefundRequest {
    pub payment_no: String,
    pub refund_no: String,
    pub refund_amount: Decimal,
    pub total_amount: Decimal,
    pub reason: String,
    pub third_party_id: Option<String>,
    pub user_id: i64,
}

#[derive(Debug, Clone)]
pub struct ProviderRefundResponse {
    pub provider_refund_id: Option<String>,
}

/// Normalized callback payload, produced by `parse_callback`.
///
/// Amounts are already converted to major units.
#[derive(Debug, Clone)]
pub struct CallbackNotice {
    pub out_trade_no: String,
    pub third_party_id: String,
    pub amount: Decimal,
    pub status: ProviderTradeStatus,
    pub notify_id: String,
    pub notify_time: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!ProviderTradeStatus::Pending.is_terminal());
        assert!(ProviderTradeStatus::Success.is_terminal());
        assert!(ProviderTradeStatus::Failed.is_terminal());
        assert!(ProviderTradeStatus::Closed.is_terminal());
    }
}
