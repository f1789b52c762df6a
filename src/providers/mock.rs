//! Scriptable in-memory provider for orchestrator and validator tests.
//!
//! Signs callbacks alipay-style (MD5 over the canonical query) with a
//! fixed test secret so the full verify path is exercised.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use super::signing::{canonical_query, md5_sign, signature_matches};
use super::types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};
use super::{PaymentProvider, ProviderError};
use crate::payment::PaymentMethod;

pub const MOCK_SECRET: &str = "mock-provider-secret";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct MockProvider {
    method: PaymentMethod,
    pub create_calls: AtomicU32,
    pub query_calls: AtomicU32,
    pub refund_calls: AtomicU32,
    pub close_calls: AtomicU32,
    fail_create: AtomicBool,
    fail_create_transient: AtomicBool,
    fail_refund: AtomicBool,
    query_status: Mutex<ProviderTradeStatus>,
}

impl MockProvider {
    pub fn new(method: PaymentMethod) -> Self {
        Self {
            method,
            create_calls: AtomicU32::new(0),
            query_calls: AtomicU32::new(0),
            refund_calls: AtomicU32::new(0),
            close_calls: AtomicU32::new(0),
            fail_create: AtomicBool::new(false),
            fail_create_transient: AtomicBool::new(false),
            fail_refund: AtomicBool::new(false),
            query_status: Mutex::new(ProviderTradeStatus::Pending),
        }
    }

    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_create_transient(&self) {
        self.fail_create_transient.store(true, Ordering::SeqCst);
    }

    pub fn fail_refund(&self) {
        self.fail_refund.store(true, Ordering::SeqCst);
    }

    pub fn set_query_status(&self, status: ProviderTradeStatus) {
        *self.query_status.lock().unwrap() = status;
    }

    /// Build a correctly signed success callback for this provider.
    pub fn signed_callback(
        payment_no: &str,
        amount: Decimal,
        notify_id: &str,
        notify_time: DateTime<Utc>,
    ) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = BTreeMap::new();
        params.insert("out_trade_no".to_string(), payment_no.to_string());
        params.insert(
            "trade_no".to_string(),
            format!("MOCKTRADE-{}", payment_no),
        );
        params.insert("total_amount".to_string(), format!("{:.2}", amount));
        params.insert("trade_status".to_string(), "TRADE_SUCCESS".to_string());
        params.insert("notify_id".to_string(), notify_id.to_string());
        params.insert(
            "notify_time".to_string(),
            notify_time.format(TIME_FORMAT).to_string(),
        );
        let sign = md5_sign(&canonical_query(&params), MOCK_SECRET);
        params.insert("sign".to_string(), sign);
        params.insert("sign_type".to_string(), "MD5".to_string());
        params
    }
}

#[async_trait]
impl PaymentProvider for MockProvider {
    fn method(&self) -> PaymentMethod {
        self.method
    }

    async fn create_payment(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_create_transient.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("mock network error".to_string()));
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(ProviderError::Terminal("mock create rejected".to_string()));
        }
        Ok(ProviderCreateResponse {
            third_party_id: Some(format!("MOCKTRADE-{}", request.payment_no)),
            payment_data: serde_json::json!({
                "qr_url": format!("https://pay.example/qr/{}", request.payment_no),
            }),
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        let status = *self.query_status.lock().unwrap();
        Ok(ProviderQueryResponse {
            status,
            third_party_id: Some(format!("MOCKTRADE-{}", payment_no)),
            paid_amount: None,
        })
    }

    async fn close_payment(&self, _payment_no: &str) -> Result<(), ProviderError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn refund(
        &self,
        _request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_refund.load(Ordering::SeqCst) {
            return Err(ProviderError::Terminal("mock refund rejected".to_string()));
        }
        Ok(ProviderRefundResponse {
            provider_refund_id: Some("MOCKREFUND-1".to_string()),
        })
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> bool {
        let Some(provided) = params.get("sign") else {
            return false;
        };
        let expected = md5_sign(&canonical_query(params), MOCK_SECRET);
        signature_matches(&expected, provided)
    }

    fn parse_callback(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallbackNotice, ProviderError> {
        let get = |key: &str| {
            params
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| ProviderError::Malformed(format!("missing {}", key)))
        };
        let amount_raw = get("total_amount")?;
        let amount = Decimal::from_str(&amount_raw)
            .map_err(|_| ProviderError::Malformed(format!("bad total_amount {}", amount_raw)))?;
        let time_raw = get("notify_time")?;
        let notify_time = NaiveDateTime::parse_from_str(&time_raw, TIME_FORMAT)
            .map_err(|_| ProviderError::Malformed(format!("bad notify_time {}", time_raw)))?
            .and_utc();
        let status = match get("trade_status")?.as_str() {
            "TRADE_SUCCESS" => ProviderTradeStatus::Success,
            "WAIT_BUYER_PAY" => ProviderTradeStatus::Pending,
            "TRADE_CLOSED" => ProviderTradeStatus::Closed,
            _ => ProviderTradeStatus::Failed,
        };

        Ok(CallbackNotice {
            out_trade_no: get("out_trade_no")?,
            third_party_id: get("trade_no")?,
            amount,
            status,
            notify_id: get("notify_id")?,
            notify_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_scripted_create_failure() {
        let provider = MockProvider::new(PaymentMethod::Alipay);
        provider.fail_create();
        let request = ProviderCreateRequest {
            payment_no: "PAY1".to_string(),
            amount: dec!(10),
            currency: "CNY".to_string(),
            subject: "t".to_string(),
            description: String::new(),
            notify_url: String::new(),
            return_url: String::new(),
            expired_at: Utc::now(),
            user_id: 1,
        };
        assert!(provider.create_payment(&request).await.is_err());
        assert_eq!(provider.create_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_signed_callback_verifies_and_parses() {
        let provider = MockProvider::new(PaymentMethod::Alipay);
        let params =
            MockProvider::signed_callback("PAY9", dec!(55.50), "ntf-55", Utc::now());
        assert!(provider.verify_callback(&params));
        let notice = provider.parse_callback(&params).unwrap();
        assert_eq!(notice.out_trade_no, "PAY9");
        assert_eq!(notice.amount, dec!(55.50));
        assert_eq!(notice.status, ProviderTradeStatus::Success);
    }
}
