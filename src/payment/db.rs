//! Payment persistence layer.
//!
//! Every state transition is guarded twice: the caller holds the
//! `payment:settle:<no>` lock, and the row update itself checks the
//! expected prior state under `FOR UPDATE`. A transition that finds the
//! payment already moved returns `false` instead of erroring, which is what
//! makes callback redelivery and reconciliation races no-ops.
//!
//! Each applied transition appends a `payment_logs` row in the same
//! transaction; the log table is append-only.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;
use tracing::info;

use super::models::{Payment, PaymentMethod, PaymentRefund, RefundStatus};
use super::state::PaymentState;
use crate::core_types::{OrderId, PaymentId, RefundId, UserId};

#[derive(Debug, Error)]
pub enum PaymentDbError {
    #[error("payment {0} not found")]
    NotFound(i64),
    #[error("refund {0} not found")]
    RefundNotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Fields for a new payment row (always inserted in `Pending`).
#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payment_no: String,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub expired_at: DateTime<Utc>,
}

/// Settlement details recorded together with a transition.
#[derive(Debug, Clone, Default)]
pub struct SettleUpdate {
    pub third_party_id: Option<String>,
    pub actual_amount: Option<Decimal>,
}

const PAYMENT_COLUMNS: &str = "id, payment_no, order_id, user_id, method, status, amount, \
     actual_amount, third_party_id, expired_at, paid_at, created_at, updated_at";

pub struct PaymentDb {
    pool: PgPool,
}

impl PaymentDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a pending payment inside the caller's transaction (the create
    /// path shares one transaction with the stock reservation).
    pub async fn insert_in_tx(
        &self,
        conn: &mut PgConnection,
        new: &NewPayment,
    ) -> Result<Payment, PaymentDbError> {
        let payment: Payment = sqlx::query_as(&format!(
            "INSERT INTO payments
                 (payment_no, order_id, user_id, method, status, amount, expired_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(&new.payment_no)
        .bind(new.order_id)
        .bind(new.user_id)
        .bind(new.method.id())
        .bind(PaymentState::Pending.id())
        .bind(new.amount)
        .bind(new.expired_at)
        .fetch_one(&mut *conn)
        .await?;

        self.append_log(
            &mut *conn,
            payment.id,
            &payment.payment_no,
            PaymentState::Pending,
            PaymentState::Pending,
            "orchestrator",
            Some("payment created"),
        )
        .await?;

        Ok(payment)
    }

    /// CAS transition inside the caller's transaction.
    pub async fn transition_in_tx(
        &self,
        conn: &mut PgConnection,
        payment_id: PaymentId,
        allowed_from: &[PaymentState],
        to: PaymentState,
        actor: &str,
        note: Option<&str>,
        settle: Option<&SettleUpdate>,
    ) -> Result<bool, PaymentDbError> {
        let row = sqlx::query("SELECT payment_no, status FROM payments WHERE id = $1 FOR UPDATE")
            .bind(payment_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(PaymentDbError::NotFound(payment_id))?;

        let payment_no: String = row.get("payment_no");
        let status_id: i16 = row.get("status");
        let Some(current) = PaymentState::from_id(status_id) else {
            return Ok(false);
        };
        if !allowed_from.contains(&current) || !current.can_transition_to(to) {
            return Ok(false);
        }

        let (third_party_id, actual_amount) = match settle {
            Some(update) => (update.third_party_id.clone(), update.actual_amount),
            None => (None, None),
        };

        sqlx::query(
            "UPDATE payments
             SET status = $1,
                 third_party_id = COALESCE($2, third_party_id),
                 actual_amount = COALESCE($3, actual_amount),
                 paid_at = CASE WHEN $4 THEN NOW() ELSE paid_at END,
                 updated_at = NOW()
             WHERE id = $5",
        )
        .bind(to.id())
        .bind(third_party_id)
        .bind(actual_amount)
        .bind(to == PaymentState::Paid)
        .bind(payment_id)
        .execute(&mut *conn)
        .await?;

        self.append_log(&mut *conn, payment_id, &payment_no, current, to, actor, note)
            .await?;

        info!(
            payment_no = %payment_no,
            from = %current,
            to = %to,
            actor,
            "Payment state advanced"
        );
        Ok(true)
    }

    /// CAS transition in its own transaction. Returns false when the
    /// payment had already left the allowed states.
    pub async fn transition(
        &self,
        payment_id: PaymentId,
        allowed_from: &[PaymentState],
        to: PaymentState,
        actor: &str,
        note: Option<&str>,
        settle: Option<&SettleUpdate>,
    ) -> Result<bool, PaymentDbError> {
        let mut tx = self.pool.begin().await?;
        let applied = self
            .transition_in_tx(&mut tx, payment_id, allowed_from, to, actor, note, settle)
            .await?;
        tx.commit().await?;
        Ok(applied)
    }

    async fn append_log(
        &self,
        conn: &mut PgConnection,
        payment_id: PaymentId,
        payment_no: &str,
        from: PaymentState,
        to: PaymentState,
        actor: &str,
        note: Option<&str>,
    ) -> Result<(), PaymentDbError> {
        sqlx::query(
            "INSERT INTO payment_logs (payment_id, payment_no, from_status, to_status, actor, note)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(payment_id)
        .bind(payment_no)
        .bind(from.id())
        .bind(to.id())
        .bind(actor)
        .bind(note)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn get(&self, payment_id: PaymentId) -> Result<Option<Payment>, PaymentDbError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"
        ))
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    pub async fn get_by_no(&self, payment_no: &str) -> Result<Option<Payment>, PaymentDbError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_no = $1"
        ))
        .bind(payment_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// Latest payment for an order, any state.
    pub async fn latest_by_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Payment>, PaymentDbError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE order_id = $1 ORDER BY id DESC LIMIT 1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// The single in-flight payment an order may have, if any.
    pub async fn active_by_order(
        &self,
        order_id: OrderId,
    ) -> Result<Option<Payment>, PaymentDbError> {
        let payment = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE order_id = $1 AND status IN ($2, $3)
             ORDER BY id DESC LIMIT 1"
        ))
        .bind(order_id)
        .bind(PaymentState::Pending.id())
        .bind(PaymentState::Paying.id())
        .fetch_optional(&self.pool)
        .await?;
        Ok(payment)
    }

    /// In-flight payments whose expiry window has passed (sweeper input).
    pub async fn find_expired(&self, limit: i64) -> Result<Vec<Payment>, PaymentDbError> {
        let payments = sqlx::query_as::<_, Payment>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments
             WHERE status IN ($1, $2) AND expired_at < NOW()
             ORDER BY expired_at ASC LIMIT $3"
        ))
        .bind(PaymentState::Pending.id())
        .bind(PaymentState::Paying.id())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(payments)
    }

    /// Same-day usage for limit enforcement: count and sum of today's
    /// payments that were not rejected outright.
    pub async fn daily_usage(
        &self,
        user_id: UserId,
        method: PaymentMethod,
    ) -> Result<(i64, Decimal), PaymentDbError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt, COALESCE(SUM(amount), 0) AS total
             FROM payments
             WHERE user_id = $1 AND method = $2
               AND created_at >= date_trunc('day', NOW())
               AND status >= 0",
        )
        .bind(user_id)
        .bind(method.id())
        .fetch_one(&self.pool)
        .await?;
        Ok((row.get::<i64, _>("cnt"), row.get::<Decimal, _>("total")))
    }

    // === Refunds ===

    pub async fn insert_refund(
        &self,
        payment_id: PaymentId,
        refund_no: &str,
        amount: Decimal,
        reason: &str,
    ) -> Result<PaymentRefund, PaymentDbError> {
        let refund = sqlx::query_as::<_, PaymentRefund>(
            "INSERT INTO payment_refunds (refund_no, payment_id, refund_amount, status, reason)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, refund_no, payment_id, refund_amount, status, reason,
                       refunded_at, created_at, updated_at",
        )
        .bind(refund_no)
        .bind(payment_id)
        .bind(amount)
        .bind(RefundStatus::Pending.id())
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(refund)
    }

    pub async fn set_refund_status(
        &self,
        refund_id: RefundId,
        from: RefundStatus,
        to: RefundStatus,
    ) -> Result<bool, PaymentDbError> {
        let result = sqlx::query(
            "UPDATE payment_refunds
             SET status = $1,
                 refunded_at = CASE WHEN $2 THEN NOW() ELSE refunded_at END,
                 updated_at = NOW()
             WHERE id = $3 AND status = $4",
        )
        .bind(to.id())
        .bind(to == RefundStatus::Success)
        .bind(refund_id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Sum of successfully refunded amounts for a payment.
    pub async fn refunded_total(&self, payment_id: PaymentId) -> Result<Decimal, PaymentDbError> {
        let total = sqlx::query_scalar::<_, Decimal>(
            "SELECT COALESCE(SUM(refund_amount), 0) FROM payment_refunds
             WHERE payment_id = $1 AND status = $2",
        )
        .bind(payment_id)
        .bind(RefundStatus::Success.id())
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    pub async fn refunds(&self, payment_id: PaymentId) -> Result<Vec<PaymentRefund>, PaymentDbError> {
        let refunds = sqlx::query_as::<_, PaymentRefund>(
            "SELECT id, refund_no, payment_id, refund_amount, status, reason,
                    refunded_at, created_at, updated_at
             FROM payment_refunds WHERE payment_id = $1 ORDER BY id",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(refunds)
    }

    /// Audit trail for a payment, oldest first.
    pub async fn logs(
        &self,
        payment_id: PaymentId,
    ) -> Result<Vec<super::models::PaymentLog>, PaymentDbError> {
        let logs = sqlx::query_as::<_, super::models::PaymentLog>(
            "SELECT id, payment_id, payment_no, from_status, to_status, actor, note, created_at
             FROM payment_logs WHERE payment_id = $1 ORDER BY id",
        )
        .bind(payment_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(logs)
    }
}
