//! WeChat Pay adapter: unified order, query, refund, callback parsing.
//!
//! Wire shape: canonical params with `nonce_str`, signed HMAC-SHA256 over
//! `canonical&key=secret` (uppercase hex), JSON responses. Amounts travel
//! as `total_fee` in minor units (fen); the adapter converts to major
//! units at the boundary. `nonce_str` doubles as the notify identifier and
//! `time_end` (`%Y%m%d%H%M%S`, UTC) as the notify time.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use super::signing::{canonical_query, hmac_sha256_sign, md5_key_sign, signature_matches};
use super::types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};
use super::{PaymentProvider, ProviderError};
use crate::config::MethodWireConfig;
use crate::payment::PaymentMethod;

const TIME_FORMAT: &str = "%Y%m%d%H%M%S";

pub struct WechatProvider {
    config: MethodWireConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    return_code: String,
    #[serde(default)]
    return_msg: String,
    #[serde(default)]
    result_code: Option<String>,
    #[serde(default)]
    err_code_des: Option<String>,
    #[serde(default)]
    prepay_id: Option<String>,
    #[serde(default)]
    code_url: Option<String>,
    #[serde(default)]
    trade_state: Option<String>,
    #[serde(default)]
    transaction_id: Option<String>,
    #[serde(default)]
    total_fee: Option<i64>,
    #[serde(default)]
    refund_id: Option<String>,
}

/// Minor units (fen) to major units (yuan).
fn fen_to_yuan(fen: i64) -> Decimal {
    Decimal::new(fen, 2)
}

/// Major units to fen, exact or error (providers reject sub-fen amounts).
fn yuan_to_fen(amount: Decimal) -> Result<i64, ProviderError> {
    let scaled = amount * Decimal::from(100);
    if scaled.fract() != Decimal::ZERO {
        return Err(ProviderError::Terminal(format!(
            "amount {} has sub-fen precision",
            amount
        )));
    }
    scaled
        .try_into()
        .map_err(|_| ProviderError::Terminal(format!("amount {} out of range", amount)))
}

fn nonce_str() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut rng = rand::thread_rng();
    (0..32)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect()
}

impl WechatProvider {
    pub fn new(config: MethodWireConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn base_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("appid".to_string(), self.config.app_id.clone());
        params.insert("nonce_str".to_string(), nonce_str());
        params
    }

    /// Compute the signature the way `sign_type` configures: legacy MD5 or
    /// HMAC-SHA256, both over `canonical&key=secret`, uppercase hex.
    fn compute_signature(&self, params: &BTreeMap<String, String>) -> String {
        let canonical = canonical_query(params);
        if self.config.sign_type.eq_ignore_ascii_case("MD5") {
            md5_key_sign(&canonical, &self.config.secret)
        } else {
            hmac_sha256_sign(
                &format!("{}&key={}", canonical, self.config.secret),
                &self.config.secret,
            )
            .to_uppercase()
        }
    }

    fn sign(&self, params: &mut BTreeMap<String, String>) {
        let signature = self.compute_signature(params);
        params.insert("sign".to_string(), signature);
        params.insert("sign_type".to_string(), self.config.sign_type.clone());
    }

    async fn call(
        &self,
        path: &str,
        mut params: BTreeMap<String, String>,
    ) -> Result<GatewayResponse, ProviderError> {
        self.sign(&mut params);
        let url = format!("{}{}", self.config.gateway_url, path);
        let response = self.client.post(&url).form(&params).send().await?;
        let body: GatewayResponse = response.json().await?;

        if body.return_code != "SUCCESS" {
            // Communication-level failure is retryable
            return Err(ProviderError::Transient(format!(
                "wechat return_code {}: {}",
                body.return_code, body.return_msg
            )));
        }
        Ok(body)
    }

    fn map_trade_state(state: &str) -> ProviderTradeStatus {
        match state {
            "SUCCESS" => ProviderTradeStatus::Success,
            "NOTPAY" | "USERPAYING" => ProviderTradeStatus::Pending,
            "CLOSED" | "REVOKED" => ProviderTradeStatus::Closed,
            "PAYERROR" => ProviderTradeStatus::Failed,
            other => {
                warn!(trade_state = other, "Unknown wechat trade state");
                ProviderTradeStatus::Failed
            }
        }
    }
}

#[async_trait]
impl PaymentProvider for WechatProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Wechat
    }

    async fn create_payment(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("out_trade_no".to_string(), request.payment_no.clone());
        params.insert(
            "total_fee".to_string(),
            yuan_to_fen(request.amount)?.to_string(),
        );
        params.insert("body".to_string(), request.subject.clone());
        params.insert("notify_url".to_string(), request.notify_url.clone());
        params.insert("trade_type".to_string(), "NATIVE".to_string());
        params.insert(
            "time_expire".to_string(),
            request.expired_at.format(TIME_FORMAT).to_string(),
        );

        let body = self.call("/pay/unifiedorder", params).await?;
        if body.result_code.as_deref() != Some("SUCCESS") {
            return Err(ProviderError::Terminal(format!(
                "wechat unifiedorder rejected: {}",
                body.err_code_des.unwrap_or_default()
            )));
        }
        let prepay_id = body.prepay_id.ok_or_else(|| {
            ProviderError::Terminal("wechat response missing prepay_id".to_string())
        })?;

        Ok(ProviderCreateResponse {
            third_party_id: None,
            payment_data: serde_json::json!({
                "prepay_id": prepay_id,
                "code_url": body.code_url,
            }),
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("out_trade_no".to_string(), payment_no.to_string());

        let body = self.call("/pay/orderquery", params).await?;
        if body.result_code.as_deref() != Some("SUCCESS") {
            return Err(ProviderError::Terminal(format!(
                "wechat orderquery rejected: {}",
                body.err_code_des.unwrap_or_default()
            )));
        }
        let status = body
            .trade_state
            .as_deref()
            .map(Self::map_trade_state)
            .unwrap_or(ProviderTradeStatus::Pending);

        Ok(ProviderQueryResponse {
            status,
            third_party_id: body.transaction_id,
            paid_amount: body.total_fee.map(fen_to_yuan),
        })
    }

    async fn close_payment(&self, payment_no: &str) -> Result<(), ProviderError> {
        let mut params = self.base_params();
        params.insert("out_trade_no".to_string(), payment_no.to_string());

        let body = self.call("/pay/closeorder", params).await?;
        if body.result_code.as_deref() != Some("SUCCESS") {
            return Err(ProviderError::Terminal(format!(
                "wechat closeorder rejected: {}",
                body.err_code_des.unwrap_or_default()
            )));
        }
        Ok(())
    }

    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("out_trade_no".to_string(), request.payment_no.clone());
        params.insert("out_refund_no".to_string(), request.refund_no.clone());
        params.insert(
            "total_fee".to_string(),
            yuan_to_fen(request.total_amount)?.to_string(),
        );
        params.insert(
            "refund_fee".to_string(),
            yuan_to_fen(request.refund_amount)?.to_string(),
        );
        params.insert("refund_desc".to_string(), request.reason.clone());

        let body = self.call("/secapi/pay/refund", params).await?;
        if body.result_code.as_deref() != Some("SUCCESS") {
            return Err(ProviderError::Terminal(format!(
                "wechat refund rejected: {}",
                body.err_code_des.unwrap_or_default()
            )));
        }
        Ok(ProviderRefundResponse {
            provider_refund_id: body.refund_id,
        })
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> bool {
        let Some(provided) = params.get("sign") else {
            return false;
        };
        let expected = self.compute_signature(params);
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
        let transaction_id = get("transaction_id")?;
        let fee_raw = get("total_fee")?;
        let fen: i64 = fee_raw
            .parse()
            .map_err(|_| ProviderError::Malformed(format!("bad total_fee {}", fee_raw)))?;
        let notify_id = get("nonce_str")?;
        let time_raw = get("time_end")?;
        let notify_time: DateTime<Utc> = NaiveDateTime::parse_from_str(&time_raw, TIME_FORMAT)
            .map_err(|_| ProviderError::Malformed(format!("bad time_end {}", time_raw)))?
            .and_utc();
        let status = match get("result_code")?.as_str() {
            "SUCCESS" => ProviderTradeStatus::Success,
            _ => ProviderTradeStatus::Failed,
        };

        Ok(CallbackNotice {
            out_trade_no,
            third_party_id: transaction_id,
            amount: fen_to_yuan(fen),
            status,
            notify_id,
            notify_time,
        })
    }
}
