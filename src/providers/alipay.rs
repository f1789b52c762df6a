//! Alipay adapter: precreate (QR), query, refund, callback parsing.
//!
//! Wire shape: form-encoded canonical params signed with legacy MD5
//! (`md5(canonical ∥ secret)`), JSON responses. Amounts travel in major
//! units with two decimals. Callback carries `notify_id`, `notify_time`
//! (`%Y-%m-%d %H:%M:%S`, UTC) and `trade_status`.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use super::signing::{canonical_query, md5_sign, signature_matches};
use super::types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};
use super::{PaymentProvider, ProviderError};
use crate::config::MethodWireConfig;
use crate::payment::PaymentMethod;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Gateway success code.
const CODE_OK: &str = "10000";

pub struct AlipayProvider {
    config: MethodWireConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    code: String,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    qr_code: Option<String>,
    #[serde(default)]
    trade_no: Option<String>,
    #[serde(default)]
    trade_status: Option<String>,
    #[serde(default)]
    total_amount: Option<String>,
}

impl AlipayProvider {
    pub fn new(config: MethodWireConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn base_params(&self, method: &str) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("app_id".to_string(), self.config.app_id.clone());
        params.insert("method".to_string(), method.to_string());
        params.insert("charset".to_string(), "utf-8".to_string());
        params.insert(
            "timestamp".to_string(),
            Utc::now().format(TIME_FORMAT).to_string(),
        );
        params
    }

    fn sign(&self, params: &mut BTreeMap<String, String>) {
        let signature = md5_sign(&canonical_query(params), &self.config.secret);
        params.insert("sign".to_string(), signature);
        params.insert("sign_type".to_string(), "MD5".to_string());
    }

    async fn call(
        &self,
        mut params: BTreeMap<String, String>,
    ) -> Result<GatewayResponse, ProviderError> {
        self.sign(&mut params);
        let response = self
            .client
            .post(&self.config.gateway_url)
            .form(&params)
            .send()
            .await?;
        let body: GatewayResponse = response.json().await?;
        Ok(body)
    }

    fn map_trade_status(status: &str) -> ProviderTradeStatus {
        match status {
            "TRADE_SUCCESS" | "TRADE_FINISHED" => ProviderTradeStatus::Success,
            "WAIT_BUYER_PAY" => ProviderTradeStatus::Pending,
            "TRADE_CLOSED" => ProviderTradeStatus::Closed,
            other => {
                warn!(trade_status = other, "Unknown alipay trade status");
                ProviderTradeStatus::Failed
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for AlipayProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Alipay
    }

    async fn create_payment(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        let mut params = self.base_params("alipay.trade.precreate");
        params.insert("out_trade_no".to_string(), request.payment_no.clone());
        params.insert(
            "total_amount".to_string(),
            format!("{:.2}", request.amount),
        );
        params.insert("subject".to_string(), request.subject.clone());
        params.insert("body".to_string(), request.description.clone());
        params.insert("notify_url".to_string(), request.notify_url.clone());
        params.insert(
            "timeout_express".to_string(),
            format!(
                "{}m",
                (request.expired_at - Utc::now()).num_minutes().max(1)
            ),
        );

        let body = self.call(params).await?;
        if body.code != CODE_OK {
            return Err(ProviderError::Terminal(format!(
                "alipay precreate rejected: {} {}",
                body.code, body.msg
            )));
        }
        let qr_code = body.qr_code.ok_or_else(|| {
            ProviderError::Terminal("alipay precreate response missing qr_code".to_string())
        })?;

        Ok(ProviderCreateResponse {
            third_party_id: body.trade_no,
            payment_data: serde_json::json!({ "qr_url": qr_code }),
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        let mut params = self.base_params("alipay.trade.query");
        params.insert("out_trade_no".to_string(), payment_no.to_string());

        let body = self.call(params).await?;
        if body.code != CODE_OK {
            return Err(ProviderError::Terminal(format!(
                "alipay query rejected: {} {}",
                body.code, body.msg
            )));
        }
        let status = body
            .trade_status
            .as_deref()
            .map(Self::map_trade_status)
            .unwrap_or(ProviderTradeStatus::Pending);
        let paid_amount = body
            .total_amount
            .as_deref()
            .and_then(|raw| Decimal::from_str(raw).ok());

        Ok(ProviderQueryResponse {
            status,
            third_party_id: body.trade_no,
            paid_amount,
        })
    }

    async fn close_payment(&self, payment_no: &str) -> Result<(), ProviderError> {
        let mut params = self.base_params("alipay.trade.close");
        params.insert("out_trade_no".to_string(), payment_no.to_string());

        let body = self.call(params).await?;
        // Closing an unknown/already-closed trade is success for us
        if body.code != CODE_OK {
            return Err(ProviderError::Terminal(format!(
                "alipay close rejected: {} {}",
                body.code, body.msg
            )));
        }
        Ok(())
    }

    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError> {
        let mut params = self.base_params("alipay.trade.refund");
        params.insert("out_trade_no".to_string(), request.payment_no.clone());
        params.insert("out_request_no".to_string(), request.refund_no.clone());
        params.insert(
            "refund_amount".to_string(),
            format!("{:.2}", request.refund_amount),
        );
        params.insert("refund_reason".to_string(), request.reason.clone());

        let body = self.call(params).await?;
        if body.code != CODE_OK {
            return Err(ProviderError::Terminal(format!(
                "alipay refund rejected: {} {}",
                body.code, body.msg
            )));
        }
        Ok(ProviderRefundResponse {
            provider_refund_id: body.trade_no,
        })
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> bool {
        let Some(provided) = params.get("sign") else {
            return false;
        };
        let expected = md5_sign(&canonical_query(params), &self.config.secret);
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

        let out_trade_no = get("out_trade_no")?;
        let trade_no = get("trade_no")?;
        let amount_raw = get("total_amount")?;
        let amount = Decimal::from_str(&amount_raw)
            .map_err(|_| ProviderError::Malformed(format!("bad total_amount {}", amount_raw)))?;
        let notify_id = get("notify_id")?;
        let notify_time_raw = get("notify_time")?;
        let notify_time: DateTime<Utc> =
            NaiveDateTime::parse_from_str(&notify_time_raw, TIME_FORMAT)
                .map_err(|_| {
                    ProviderError::Malformed(format!("bad notify_time {}", notify_time_raw))
                })?
                .and_utc();
        let status = Self::map_trade_status(&get("trade_status")?);

        Ok(CallbackNotice {
            out_trade_no,
            third_party_id: trade_no,
            amount,
            status,
            notify_id,
            notify_time,
        })
    }
}
