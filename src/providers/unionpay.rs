//! UnionPay adapter: front-consume order, query, refund, callback parsing.
//!
//! Wire shape: canonical params signed HMAC-SHA256 (lowercase hex over the
//! canonical string with the merchant secret), JSON responses. Amounts
//! travel as `txnAmt` in minor units (fen). `respCode == "00"` is success;
//! the callback carries `queryId` (provider trade id), `notifyId` and
//! `txnTime` (`%Y%m%d%H%M%S`, UTC).

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;

use super::signing::{canonical_query, hmac_sha256_sign, signature_matches};
use super::types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};
use super::{PaymentProvider, ProviderError};
use crate::config::MethodWireConfig;
use crate::payment::PaymentMethod;

const TIME_FORMAT: &str = "%Y%m%d%H%M%S";

/// Success response code.
const RESP_OK: &str = "00";
/// "In processing" response code.
const RESP_PROCESSING: &str = "03";

pub struct UnionpayProvider {
    config: MethodWireConfig,
    client: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(rename = "respCode")]
    resp_code: String,
    #[serde(rename = "respMsg", default)]
    resp_msg: String,
    #[serde(rename = "tn", default)]
    tn: Option<String>,
    #[serde(rename = "queryId", default)]
    query_id: Option<String>,
    #[serde(rename = "txnAmt", default)]
    txn_amt: Option<i64>,
    #[serde(rename = "origRespCode", default)]
    orig_resp_code: Option<String>,
}

fn fen_to_yuan(fen: i64) -> Decimal {
    Decimal::new(fen, 2)
}

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

impl UnionpayProvider {
    pub fn new(config: MethodWireConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self { config, client }
    }

    fn base_params(&self) -> BTreeMap<String, String> {
        let mut params = BTreeMap::new();
        params.insert("version".to_string(), "5.1.0".to_string());
        params.insert("merId".to_string(), self.config.app_id.clone());
        params.insert(
            "txnTime".to_string(),
            Utc::now().format(TIME_FORMAT).to_string(),
        );
        params
    }

    fn sign(&self, params: &mut BTreeMap<String, String>) {
        let signature = hmac_sha256_sign(&canonical_query(params), &self.config.secret);
        params.insert("sign".to_string(), signature);
        params.insert("sign_type".to_string(), "HMAC-SHA256".to_string());
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
        Ok(body)
    }
}

#[async_trait]
impl PaymentProvider for UnionpayProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Unionpay
    }

    async fn create_payment(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("orderId".to_string(), request.payment_no.clone());
        params.insert(
            "txnAmt".to_string(),
            yuan_to_fen(request.amount)?.to_string(),
        );
        params.insert("orderDesc".to_string(), request.subject.clone());
        params.insert("backUrl".to_string(), request.notify_url.clone());
        params.insert("frontUrl".to_string(), request.return_url.clone());
        params.insert(
            "payTimeout".to_string(),
            request.expired_at.format(TIME_FORMAT).to_string(),
        );

        let body = self.call("/gateway/api/order", params).await?;
        if body.resp_code != RESP_OK {
            return Err(ProviderError::Terminal(format!(
                "unionpay order rejected: {} {}",
                body.resp_code, body.resp_msg
            )));
        }
        let tn = body.tn.ok_or_else(|| {
            ProviderError::Terminal("unionpay response missing tn".to_string())
        })?;

        Ok(ProviderCreateResponse {
            third_party_id: body.query_id,
            payment_data: serde_json::json!({ "tn": tn }),
        })
    }

    async fn query_payment(
        &self,
        payment_no: &str,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("orderId".to_string(), payment_no.to_string());

        let body = self.call("/gateway/api/query", params).await?;
        if body.resp_code != RESP_OK {
            return Err(ProviderError::Terminal(format!(
                "unionpay query rejected: {} {}",
                body.resp_code, body.resp_msg
            )));
        }

        // The query response echoes the original transaction's result
        let status = match body.orig_resp_code.as_deref() {
            Some(RESP_OK) => ProviderTradeStatus::Success,
            Some(RESP_PROCESSING) | None => ProviderTradeStatus::Pending,
            Some(_) => ProviderTradeStatus::Failed,
        };

        Ok(ProviderQueryResponse {
            status,
            third_party_id: body.query_id,
            paid_amount: body.txn_amt.map(fen_to_yuan),
        })
    }

    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError> {
        let mut params = self.base_params();
        params.insert("orderId".to_string(), request.refund_no.clone());
        params.insert(
            "origQryId".to_string(),
            request.third_party_id.clone().unwrap_or_default(),
        );
        params.insert(
            "txnAmt".to_string(),
            yuan_to_fen(request.refund_amount)?.to_string(),
        );

        let body = self.call("/gateway/api/refund", params).await?;
        if body.resp_code != RESP_OK {
            return Err(ProviderError::Terminal(format!(
                "unionpay refund rejected: {} {}",
                body.resp_code, body.resp_msg
            )));
        }
        Ok(ProviderRefundResponse {
            provider_refund_id: body.query_id,
        })
    }

    fn verify_callback(&self, params: &BTreeMap<String, String>) -> bool {
        let Some(provided) = params.get("sign") else {
            return false;
        };
        let expected = hmac_sha256_sign(&canonical_query(params), &self.config.secret);
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

        let out_trade_no = get("orderId")?;
        let query_id = get("queryId")?;
        let amt_raw = get("txnAmt")?;
        let fen: i64 = amt_raw
            .parse()
            .map_err(|_| ProviderError::Malformed(format!("bad txnAmt {}", amt_raw)))?;
        let notify_id = get("notifyId")?;
        let time_raw = get("txnTime")?;
        let notify_time: DateTime<Utc> = NaiveDateTime::parse_from_str(&time_raw, TIME_FORMAT)
            .map_err(|_| ProviderError::Malformed(format!("bad txnTime {}", time_raw)))?
            .and_utc();
        let status = match get("respCode")?.as_str() {
            RESP_OK => ProviderTradeStatus::Success,
            RESP_PROCESSING => ProviderTradeStatus::Pending,
            _ => ProviderTradeStatus::Failed,
        };

        Ok(CallbackNotice {
            out_trade_no,
            third_party_id: query_id,
            amount: fen_to_yuan(fen),
            status,
            notify_id,
            notify_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn provider() -> UnionpayProvider {
        UnionpayProvider::new(MethodWireConfig {
            app_id: "mer-777".to_string(),
            secret: "unionpay-secret".to_string(),
            gateway_url: "http://localhost:0".to_string(),
            notify_url: String::new(),
            return_url: String::new(),
            timeout_secs: 5,
            sign_type: "HMAC-SHA256".to_string(),
        })
    }

    fn signed_callback(secret: &str) -> BTreeMap<String, String> {
        let mut params: BTreeMap<String, String> = [
            ("orderId", "PAY789"),
            ("queryId", "UP20260801xyz"),
            ("txnAmt", "20000"),
            ("respCode", "00"),
            ("notifyId", "up-ntf-9"),
            ("txnTime", "20260801120000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        let sign = hmac_sha256_sign(&canonical_query(&params), secret);
        params.insert("sign".to_string(), sign);
        params
    }

    #[test]
    fn test_verify_and_parse_callback() {
        let provider = provider();
        let params = signed_callback("unionpay-secret");
        assert!(provider.verify_callback(&params));

        let notice = provider.parse_callback(&params).unwrap();
        assert_eq!(notice.out_trade_no, "PAY789");
        assert_eq!(notice.third_party_id, "UP20260801xyz");
        assert_eq!(notice.amount, dec!(200.00));
        assert_eq!(notice.status, ProviderTradeStatus::Success);
    }

    #[test]
    fn test_tampered_callback_rejected() {
        let provider = provider();
        let mut params = signed_callback("unionpay-secret");
        params.insert("txnAmt".to_string(), "100".to_string());
        assert!(!provider.verify_callback(&params));
    }

    #[test]
    fn test_processing_resp_code_maps_pending() {
        let provider = provider();
        let mut params = signed_callback("unionpay-secret");
        params.insert("respCode".to_string(), RESP_PROCESSING.to_string());
        let notice = provider.parse_callback(&params).unwrap();
        assert_eq!(notice.status, ProviderTradeStatus::Pending);
    }
}
