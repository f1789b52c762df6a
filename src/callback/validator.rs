//! Ordered callback checks, short-circuiting on first failure:
//!
//! 1. required fields (adapter parse)
//! 2. notify-time freshness (±5 minutes, boundary inclusive)
//! 3. notify-id uniqueness (1 h seen-set)
//! 4. provider signature
//! 5. payment record exists
//! 6. exact amount equality (adapters already normalized units)
//! 7. payment in a settleable state
//! 8. `(method, out_trade_no, third_party_id)` idempotency (24 h seen-set)
//!
//! Checks 3 and 8 together give at-most-once settlement under provider
//! at-least-once delivery; callbacks older than the freshness window are
//! resolved by the reconciliation query path instead.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use crate::payment::db::{PaymentDb, PaymentDbError};
use crate::payment::models::{Payment, PaymentMethod};
use crate::payment::state::PaymentState;
use crate::providers::{CallbackNotice, PaymentProvider, ProviderError, ProviderRegistry};

use super::seen_store::TtlSeenStore;

/// ±5 minutes, inclusive.
pub const FRESHNESS_WINDOW_SECS: i64 = 300;

/// Notify-id replay window.
pub const NOTIFY_SEEN_TTL: Duration = Duration::from_secs(3600);

/// Idempotency suppression window.
pub const PROCESSED_SEEN_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("no provider registered for method {0}")]
    UnsupportedMethod(PaymentMethod),
    #[error("malformed callback: {0}")]
    Malformed(String),
    #[error("notify time is {age_secs}s old, beyond the freshness window")]
    StaleTimestamp { age_secs: i64 },
    #[error("notify time is {ahead_secs}s in the future")]
    FutureTimestamp { ahead_secs: i64 },
    #[error("notify id {0} already seen")]
    ReplayedNotifyId(String),
    #[error("signature verification failed")]
    BadSignature,
    #[error("no payment with payment_no {0}")]
    UnknownPayment(String),
    #[error("amount mismatch: expected {expected}, callback reported {reported}")]
    AmountMismatch {
        expected: rust_decimal::Decimal,
        reported: rust_decimal::Decimal,
    },
    #[error("payment is in terminal state {0}")]
    TerminalState(PaymentState),
    #[error("callback already processed")]
    AlreadyProcessed,
    #[error("database error: {0}")]
    Database(#[from] PaymentDbError),
}

impl CallbackError {
    /// Stable audit code recorded with every rejection.
    pub fn code(&self) -> &'static str {
        match self {
            CallbackError::UnsupportedMethod(_) => "UNSUPPORTED_METHOD",
            CallbackError::Malformed(_) => "MALFORMED",
            CallbackError::StaleTimestamp { .. } => "STALE_TIMESTAMP",
            CallbackError::FutureTimestamp { .. } => "FUTURE_TIMESTAMP",
            CallbackError::ReplayedNotifyId(_) => "REPLAYED_NOTIFY_ID",
            CallbackError::BadSignature => "BAD_SIGNATURE",
            CallbackError::UnknownPayment(_) => "UNKNOWN_PAYMENT",
            CallbackError::AmountMismatch { .. } => "AMOUNT_MISMATCH",
            CallbackError::TerminalState(_) => "TERMINAL_STATE",
            CallbackError::AlreadyProcessed => "ALREADY_PROCESSED",
            CallbackError::Database(_) => "INTERNAL",
        }
    }

    /// Duplicates are acknowledged to the provider without reprocessing;
    /// real rejections are nacked.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            CallbackError::ReplayedNotifyId(_)
                | CallbackError::AlreadyProcessed
                | CallbackError::TerminalState(_)
        )
    }
}

impl From<ProviderError> for CallbackError {
    fn from(e: ProviderError) -> Self {
        CallbackError::Malformed(e.to_string())
    }
}

/// A callback that passed every check and may settle its payment.
#[derive(Debug)]
pub struct ValidatedCallback {
    pub payment: Payment,
    pub notice: CallbackNotice,
}

pub struct CallbackValidator {
    payments: Arc<PaymentDb>,
    providers: Arc<ProviderRegistry>,
    notify_seen: TtlSeenStore,
    processed_seen: TtlSeenStore,
    verify_signature: bool,
}

impl CallbackValidator {
    pub fn new(
        payments: Arc<PaymentDb>,
        providers: Arc<ProviderRegistry>,
        verify_signature: bool,
    ) -> Self {
        Self {
            payments,
            providers,
            notify_seen: TtlSeenStore::new(NOTIFY_SEEN_TTL),
            processed_seen: TtlSeenStore::new(PROCESSED_SEEN_TTL),
            verify_signature,
        }
    }

    pub async fn validate(
        &self,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
    ) -> Result<ValidatedCallback, CallbackError> {
        self.validate_at(method, params, Utc::now()).await
    }

    pub async fn validate_at(
        &self,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<ValidatedCallback, CallbackError> {
        let provider = self
            .providers
            .get(method)
            .ok_or(CallbackError::UnsupportedMethod(method))?;

        // Checks 1-4 need no storage beyond the seen-set
        let notice = self.precheck(provider.as_ref(), method, params, now)?;

        // 5. payment record exists
        let payment = self
            .payments
            .get_by_no(&notice.out_trade_no)
            .await?
            .ok_or_else(|| CallbackError::UnknownPayment(notice.out_trade_no.clone()))?;

        // 6. exact amount equality (adapter already normalized units)
        if notice.amount != payment.amount {
            warn!(
                payment_no = %payment.payment_no,
                expected = %payment.amount,
                reported = %notice.amount,
                "Callback amount mismatch"
            );
            return Err(CallbackError::AmountMismatch {
                expected: payment.amount,
                reported: notice.amount,
            });
        }

        // 7. settleable state precondition
        match payment.state() {
            Some(state) if state.is_settleable() => {}
            Some(state) => return Err(CallbackError::TerminalState(state)),
            None => {
                return Err(CallbackError::Malformed(format!(
                    "payment {} has unknown status id {}",
                    payment.payment_no, payment.status
                )));
            }
        }

        // 8. idempotency suppression
        if self.processed_seen.contains(&processed_key(method, &notice)) {
            return Err(CallbackError::AlreadyProcessed);
        }

        Ok(ValidatedCallback { payment, notice })
    }

    /// Checks 1-4: parse, freshness, notify-id uniqueness, signature.
    fn precheck(
        &self,
        provider: &dyn PaymentProvider,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> Result<CallbackNotice, CallbackError> {
        // 1. required fields present and well-formed
        let notice = provider.parse_callback(params)?;

        // 2. freshness, boundary inclusive
        let age_secs = (now - notice.notify_time).num_seconds();
        if age_secs > FRESHNESS_WINDOW_SECS {
            return Err(CallbackError::StaleTimestamp { age_secs });
        }
        if age_secs < -FRESHNESS_WINDOW_SECS {
            return Err(CallbackError::FutureTimestamp {
                ahead_secs: -age_secs,
            });
        }

        // 3. notify-id uniqueness within its TTL
        let notify_key = format!("{}:{}", method, notice.notify_id);
        if !self.notify_seen.insert_if_absent(&notify_key) {
            return Err(CallbackError::ReplayedNotifyId(notice.notify_id.clone()));
        }

        // 4. signature
        if self.verify_signature && !provider.verify_callback(params) {
            return Err(CallbackError::BadSignature);
        }

        Ok(notice)
    }

    /// Record a settled callback in the idempotency set. Called by the
    /// orchestrator at handler return.
    pub fn mark_processed(&self, method: PaymentMethod, notice: &CallbackNotice) {
        self.processed_seen
            .insert_if_absent(&processed_key(method, notice));
    }

    /// Periodic hygiene for both seen-sets.
    pub fn purge_expired(&self) {
        self.notify_seen.purge_expired();
        self.processed_seen.purge_expired();
    }
}

fn processed_key(method: PaymentMethod, notice: &CallbackNotice) -> String {
    format!(
        "{}:{}:{}",
        method, notice.out_trade_no, notice.third_party_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::mock::MockProvider;
    use rust_decimal_macros::dec;

    fn validator_with_mock() -> (CallbackValidator, Arc<MockProvider>) {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let mock = Arc::new(MockProvider::new(PaymentMethod::Alipay));
        let mut registry = ProviderRegistry::new();
        registry.register(mock.clone());
        (
            CallbackValidator::new(
                Arc::new(PaymentDb::new(pool)),
                Arc::new(registry),
                true,
            ),
            mock,
        )
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[tokio::test]
    async fn test_freshness_boundary_inclusive() {
        let (validator, mock) = validator_with_mock();
        let provider: &dyn PaymentProvider = mock.as_ref();

        // Exactly at the window boundary: accepted
        let at_boundary = now() - chrono::Duration::seconds(FRESHNESS_WINDOW_SECS);
        let params = MockProvider::signed_callback("PAY1", dec!(10.00), "n1", at_boundary);
        assert!(
            validator
                .precheck(provider, PaymentMethod::Alipay, &params, now())
                .is_ok()
        );

        // One second beyond: rejected
        let beyond = now() - chrono::Duration::seconds(FRESHNESS_WINDOW_SECS + 1);
        let params = MockProvider::signed_callback("PAY1", dec!(10.00), "n2", beyond);
        assert!(matches!(
            validator.precheck(provider, PaymentMethod::Alipay, &params, now()),
            Err(CallbackError::StaleTimestamp { .. })
        ));
    }

    #[tokio::test]
    async fn test_future_timestamp_rejected() {
        let (validator, mock) = validator_with_mock();
        let future = now() + chrono::Duration::seconds(FRESHNESS_WINDOW_SECS + 60);
        let params = MockProvider::signed_callback("PAY1", dec!(10.00), "n3", future);
        assert!(matches!(
            validator.precheck(mock.as_ref(), PaymentMethod::Alipay, &params, now()),
            Err(CallbackError::FutureTimestamp { .. })
        ));
    }

    #[tokio::test]
    async fn test_notify_id_replay_rejected() {
        let (validator, mock) = validator_with_mock();
        let params = MockProvider::signed_callback("PAY1", dec!(10.00), "dup", now());
        assert!(
            validator
                .precheck(mock.as_ref(), PaymentMethod::Alipay, &params, now())
                .is_ok()
        );
        // Fresh timestamp but recycled notify id
        let replay = MockProvider::signed_callback("PAY1", dec!(10.00), "dup", now());
        assert!(matches!(
            validator.precheck(mock.as_ref(), PaymentMethod::Alipay, &replay, now()),
            Err(CallbackError::ReplayedNotifyId(_))
        ));
    }

    #[tokio::test]
    async fn test_tampered_signature_rejected() {
        let (validator, mock) = validator_with_mock();
        let mut params = MockProvider::signed_callback("PAY1", dec!(10.00), "n4", now());
        params.insert("total_amount".to_string(), "999.00".to_string());
        assert!(matches!(
            validator.precheck(mock.as_ref(), PaymentMethod::Alipay, &params, now()),
            Err(CallbackError::BadSignature)
        ));
    }

    #[tokio::test]
    async fn test_missing_field_rejected_first() {
        let (validator, mock) = validator_with_mock();
        let mut params = MockProvider::signed_callback("PAY1", dec!(10.00), "n5", now());
        params.remove("trade_no");
        assert!(matches!(
            validator.precheck(mock.as_ref(), PaymentMethod::Alipay, &params, now()),
            Err(CallbackError::Malformed(_))
        ));
    }

    #[test]
    fn test_duplicate_classification() {
        assert!(CallbackError::AlreadyProcessed.is_duplicate());
        assert!(CallbackError::ReplayedNotifyId("x".into()).is_duplicate());
        assert!(CallbackError::TerminalState(PaymentState::Paid).is_duplicate());
        assert!(!CallbackError::BadSignature.is_duplicate());
        assert!(!CallbackError::StaleTimestamp { age_secs: 400 }.is_duplicate());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(CallbackError::BadSignature.code(), "BAD_SIGNATURE");
        assert_eq!(
            CallbackError::UnknownPayment("p".into()).code(),
            "UNKNOWN_PAYMENT"
        );
        assert_eq!(
            CallbackError::StaleTimestamp { age_secs: 301 }.code(),
            "STALE_TIMESTAMP"
        );
    }
}
