//! Internal wallet "provider": pays from the user's stored balance.
//!
//! Unlike the external channels this one settles synchronously, and its
//! "provider call" is itself the fund-moving mutation. The debit therefore
//! runs on the orchestrator's create transaction via
//! [`create_payment_in_tx`](PaymentProvider::create_payment_in_tx): a
//! failed handshake, a failed payment insert, or a failed commit rolls the
//! debit back together with the stock reservation. The wallet row uses the
//! same version-guarded update discipline as stock.
//!
//! Refund credits run outside any transaction, like every other provider's
//! refund call.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::BTreeMap;

use super::types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};
use super::{PaymentProvider, ProviderError};
use crate::core_types::{UserId, external_no};
use crate::payment::PaymentMethod;

const MAX_ATTEMPTS: u32 = 3;

pub struct BalanceProvider {
    pool: PgPool,
}

impl BalanceProvider {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn wallet_balance(&self, user_id: UserId) -> Result<Decimal, ProviderError> {
        let balance = sqlx::query_scalar::<_, Decimal>(
            "SELECT balance FROM user_wallets WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(balance.unwrap_or(Decimal::ZERO))
    }

    /// Credit (top-up or refund). Upsert keeps first-time payers cheap.
    pub async fn credit(&self, user_id: UserId, amount: Decimal) -> Result<(), ProviderError> {
        sqlx::query(
            "INSERT INTO user_wallets (user_id, balance, version)
             VALUES ($1, $2, 1)
             ON CONFLICT (user_id) DO UPDATE SET
                 balance = user_wallets.balance + EXCLUDED.balance,
                 version = user_wallets.version + 1,
                 updated_at = NOW()",
        )
        .bind(user_id)
        .bind(amount)
        .execute(&self.pool)
        .await
        .map_err(|e| ProviderError::Transient(e.to_string()))?;
        Ok(())
    }

    /// Version-guarded debit with bounded retry, applied on the caller's
    /// connection so it shares the caller's transaction fate.
    async fn debit(
        &self,
        conn: &mut PgConnection,
        user_id: UserId,
        amount: Decimal,
    ) -> Result<(), ProviderError> {
        for _attempt in 1..=MAX_ATTEMPTS {
            let row = sqlx::query("SELECT balance, version FROM user_wallets WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| ProviderError::Transient(e.to_string()))?;

            let Some(row) = row else {
                return Err(ProviderError::Terminal(format!(
                    "user {} has no wallet",
                    user_id
                )));
            };
            let balance: Decimal = row.get("balance");
            let version: i64 = row.get("version");

            if balance < amount {
                return Err(ProviderError::Terminal(format!(
                    "insufficient wallet balance: {} < {}",
                    balance, amount
                )));
            }

            let updated = sqlx::query(
                "UPDATE user_wallets
                 SET balance = balance - $1, version = version + 1, updated_at = NOW()
                 WHERE user_id = $2 AND version = $3",
            )
            .bind(amount)
            .bind(user_id)
            .bind(version)
            .execute(&mut *conn)
            .await
            .map_err(|e| ProviderError::Transient(e.to_string()))?;

            if updated.rows_affected() == 1 {
                return Ok(());
            }
        }
        Err(ProviderError::Transient(
            "wallet version conflicts exhausted".to_string(),
        ))
    }
}

#[async_trait]
impl PaymentProvider for BalanceProvider {
    fn method(&self) -> PaymentMethod {
        PaymentMethod::Balance
    }

    /// Wallet debits must share the create transaction; the standalone
    /// entry point refuses rather than moving money un-transactionally.
    async fn create_payment(
        &self,
        _request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        Err(ProviderError::Terminal(
            "balance payments settle inside the create transaction".to_string(),
        ))
    }

    async fn create_payment_in_tx(
        &self,
        conn: &mut PgConnection,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        self.debit(conn, request.user_id, request.amount).await?;
        Ok(ProviderCreateResponse {
            third_party_id: Some(external_no("BAL")),
            payment_data: serde_json::json!({ "type": "balance", "settled": true }),
        })
    }

    async fn query_payment(
        &self,
        _payment_no: &str,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        // A balance trade only exists if the debit committed
        Ok(ProviderQueryResponse {
            status: ProviderTradeStatus::Success,
            third_party_id: None,
            paid_amount: None,
        })
    }

    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError> {
        self.credit(request.user_id, request.refund_amount).await?;
        Ok(ProviderRefundResponse {
            provider_refund_id: Some(external_no("BALREF")),
        })
    }

    fn verify_callback(&self, _params: &BTreeMap<String, String>) -> bool {
        false
    }

    fn parse_callback(
        &self,
        _params: &BTreeMap<String, String>,
    ) -> Result<CallbackNotice, ProviderError> {
        Err(ProviderError::Malformed(
            "balance method has no provider callbacks".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    async fn create_test_pool() -> Option<PgPool> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await
            .ok()?;
        crate::db::schema::init_schema(&pool).await.ok()?;
        Some(pool)
    }

    fn create_request(user_id: i64, amount: Decimal) -> ProviderCreateRequest {
        ProviderCreateRequest {
            payment_no: external_no("PAY"),
            amount,
            currency: "CNY".to_string(),
            subject: "wallet purchase".to_string(),
            description: String::new(),
            notify_url: String::new(),
            return_url: String::new(),
            expired_at: Utc::now() + chrono::Duration::minutes(30),
            user_id,
        }
    }

    #[tokio::test]
    async fn test_standalone_create_refused() {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let provider = BalanceProvider::new(pool);
        let err = provider
            .create_payment(&create_request(1, dec!(1.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Terminal(_)));
    }

    #[tokio::test]
    async fn test_debit_and_refund_roundtrip() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };
        let provider = BalanceProvider::new(pool.clone());
        let user_id = 910_000 + rand::random::<u16>() as i64;

        provider.credit(user_id, dec!(100.00)).await.unwrap();
        assert_eq!(provider.wallet_balance(user_id).await.unwrap(), dec!(100.00));

        let mut tx = pool.begin().await.unwrap();
        let response = provider
            .create_payment_in_tx(&mut tx, &create_request(user_id, dec!(40.00)))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        assert!(response.third_party_id.unwrap().starts_with("BAL"));
        assert_eq!(provider.wallet_balance(user_id).await.unwrap(), dec!(60.00));

        provider
            .refund(&ProviderRefundRequest {
                payment_no: "PAYx".to_string(),
                refund_no: external_no("REF"),
                refund_amount: dec!(40.00),
                total_amount: dec!(40.00),
                reason: "test".to_string(),
                third_party_id: None,
                user_id,
            })
            .await
            .unwrap();
        assert_eq!(provider.wallet_balance(user_id).await.unwrap(), dec!(100.00));
    }

    #[tokio::test]
    async fn test_uncommitted_debit_rolls_back() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };
        let provider = BalanceProvider::new(pool.clone());
        let user_id = 930_000 + rand::random::<u16>() as i64;
        provider.credit(user_id, dec!(50.00)).await.unwrap();

        {
            let mut tx = pool.begin().await.unwrap();
            provider
                .create_payment_in_tx(&mut tx, &create_request(user_id, dec!(20.00)))
                .await
                .unwrap();
            // Dropped without commit: the debit must vanish with it
        }
        assert_eq!(provider.wallet_balance(user_id).await.unwrap(), dec!(50.00));
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_terminal() {
        let pool = match create_test_pool().await {
            Some(p) => p,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };
        let provider = BalanceProvider::new(pool.clone());
        let user_id = 920_000 + rand::random::<u16>() as i64;
        provider.credit(user_id, dec!(1.00)).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let err = provider
            .create_payment_in_tx(&mut tx, &create_request(user_id, dec!(5.00)))
            .await
            .unwrap_err();
        drop(tx);
        assert!(matches!(err, ProviderError::Terminal(_)));
        // Nothing was deducted
        assert_eq!(provider.wallet_balance(user_id).await.unwrap(), dec!(1.00));
    }
}
