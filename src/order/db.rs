//! Order persistence. All status updates are CAS-style so that retried
//! settlement events are no-ops instead of illegal transitions.

use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

use super::models::{Order, OrderItem, OrderPaymentStatus, OrderStatus};
use crate::core_types::{OrderId, UserId, external_no};
use rust_decimal::Decimal;

#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order {0} not found")]
    NotFound(i64),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct OrderDb {
    pool: PgPool,
}

/// Item description for [`OrderDb::create`].
#[derive(Debug, Clone)]
pub struct NewOrderItem {
    pub product_id: i64,
    pub sku_id: Option<i64>,
    pub quantity: i64,
    pub price: Decimal,
}

impl OrderDb {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create an order with its items at checkout. The total is the sum of
    /// item price × quantity; payment and stock mutation come later.
    pub async fn create(
        &self,
        user_id: UserId,
        items: &[NewOrderItem],
    ) -> Result<Order, OrderError> {
        let total: Decimal = items
            .iter()
            .map(|item| item.price * Decimal::from(item.quantity))
            .sum();

        let mut tx = self.pool.begin().await?;
        let order: Order = sqlx::query_as(
            "INSERT INTO orders (order_no, user_id, total_amount, status, payment_status)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING id, order_no, user_id, total_amount, status, payment_status,
                       created_at, updated_at",
        )
        .bind(external_no("ORD"))
        .bind(user_id)
        .bind(total)
        .bind(OrderStatus::Pending.id())
        .bind(OrderPaymentStatus::Pending.id())
        .fetch_one(&mut *tx)
        .await?;

        for item in items {
            sqlx::query(
                "INSERT INTO order_items (order_id, product_id, sku_id, quantity, price)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(order.id)
            .bind(item.product_id)
            .bind(item.sku_id)
            .bind(item.quantity)
            .bind(item.price)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        info!(order_no = %order.order_no, user_id, "Order created");
        Ok(order)
    }

    pub async fn get(&self, order_id: OrderId) -> Result<Option<Order>, OrderError> {
        let order = sqlx::query_as::<_, Order>(
            "SELECT id, order_no, user_id, total_amount, status, payment_status,
                    created_at, updated_at
             FROM orders WHERE id = $1",
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    pub async fn get_by_no(&self, order_no: &str) -> Result<Option<Order>, OrderError> {
        let order = sqlx::query_as::<_, Order>(
            "SELECT id, order_no, user_id, total_amount, status, payment_status,
                    created_at, updated_at
             FROM orders WHERE order_no = $1",
        )
        .bind(order_no)
        .fetch_optional(&self.pool)
        .await?;
        Ok(order)
    }

    pub async fn items(&self, order_id: OrderId) -> Result<Vec<OrderItem>, OrderError> {
        let items = sqlx::query_as::<_, OrderItem>(
            "SELECT id, order_id, product_id, sku_id, quantity, price
             FROM order_items WHERE order_id = $1 ORDER BY id",
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(items)
    }

    /// Settlement succeeded: pending order becomes paid/paid. Returns false
    /// when the order already left pending (idempotent redelivery).
    pub async fn mark_paid(&self, order_id: OrderId) -> Result<bool, OrderError> {
        self.transition(
            order_id,
            OrderStatus::Pending,
            OrderStatus::Paid,
            OrderPaymentStatus::Paid,
        )
        .await
    }

    /// Payment failed or timed out: pending order becomes cancelled.
    pub async fn mark_cancelled(
        &self,
        order_id: OrderId,
        payment_status: OrderPaymentStatus,
    ) -> Result<bool, OrderError> {
        self.transition(
            order_id,
            OrderStatus::Pending,
            OrderStatus::Cancelled,
            payment_status,
        )
        .await
    }

    /// Full refund settled: paid (or further along) order becomes refunded.
    pub async fn mark_refunded(&self, order_id: OrderId) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, payment_status = $2, updated_at = NOW()
             WHERE id = $3 AND status IN ($4, $5, $6)",
        )
        .bind(OrderStatus::Refunded.id())
        .bind(OrderPaymentStatus::Refunded.id())
        .bind(order_id)
        .bind(OrderStatus::Paid.id())
        .bind(OrderStatus::Shipped.id())
        .bind(OrderStatus::Delivered.id())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!(order_id, "Order marked refunded");
        }
        Ok(changed)
    }

    /// CAS payment_status update used while the order itself stays pending
    /// (e.g. pending -> paying on provider handshake).
    pub async fn set_payment_status(
        &self,
        order_id: OrderId,
        from: OrderPaymentStatus,
        to: OrderPaymentStatus,
    ) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders SET payment_status = $1, updated_at = NOW()
             WHERE id = $2 AND payment_status = $3",
        )
        .bind(to.id())
        .bind(order_id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// In-transaction variant of [`mark_cancelled`](Self::mark_cancelled),
    /// used by settlement handlers that restore stock in the same
    /// transaction.
    pub async fn mark_cancelled_in_tx(
        &self,
        conn: &mut sqlx::PgConnection,
        order_id: OrderId,
        payment_status: OrderPaymentStatus,
    ) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, payment_status = $2, updated_at = NOW()
             WHERE id = $3 AND status = $4",
        )
        .bind(OrderStatus::Cancelled.id())
        .bind(payment_status.id())
        .bind(order_id)
        .bind(OrderStatus::Pending.id())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// In-transaction variant of [`mark_refunded`](Self::mark_refunded).
    pub async fn mark_refunded_in_tx(
        &self,
        conn: &mut sqlx::PgConnection,
        order_id: OrderId,
    ) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, payment_status = $2, updated_at = NOW()
             WHERE id = $3 AND status IN ($4, $5, $6)",
        )
        .bind(OrderStatus::Refunded.id())
        .bind(OrderPaymentStatus::Refunded.id())
        .bind(order_id)
        .bind(OrderStatus::Paid.id())
        .bind(OrderStatus::Shipped.id())
        .bind(OrderStatus::Delivered.id())
        .execute(conn)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn transition(
        &self,
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
        payment_status: OrderPaymentStatus,
    ) -> Result<bool, OrderError> {
        let result = sqlx::query(
            "UPDATE orders SET status = $1, payment_status = $2, updated_at = NOW()
             WHERE id = $3 AND status = $4",
        )
        .bind(to.id())
        .bind(payment_status.id())
        .bind(order_id)
        .bind(from.id())
        .execute(&self.pool)
        .await?;

        let changed = result.rows_affected() > 0;
        if changed {
            info!(order_id, from = %from, to = %to, "Order status advanced");
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    async fn create_test_db() -> Option<OrderDb> {
        let database_url = std::env::var("DATABASE_URL").ok()?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(2)
            .connect(&database_url)
            .await
            .ok()?;
        crate::db::schema::init_schema(&pool).await.ok()?;
        Some(OrderDb::new(pool))
    }

    #[tokio::test]
    async fn test_create_computes_total_and_mark_paid_is_idempotent() {
        let db = match create_test_db().await {
            Some(db) => db,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };

        let order = db
            .create(
                4001,
                &[
                    NewOrderItem {
                        product_id: 1,
                        sku_id: None,
                        quantity: 2,
                        price: dec!(10.50),
                    },
                    NewOrderItem {
                        product_id: 2,
                        sku_id: None,
                        quantity: 1,
                        price: dec!(5.00),
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(order.total_amount, dec!(26.00));
        assert_eq!(db.items(order.id).await.unwrap().len(), 2);

        assert!(db.mark_paid(order.id).await.unwrap());
        // Redelivery is a no-op, not an error
        assert!(!db.mark_paid(order.id).await.unwrap());

        let reloaded = db.get(order.id).await.unwrap().unwrap();
        assert_eq!(reloaded.status(), Some(OrderStatus::Paid));
        assert_eq!(reloaded.payment_status(), Some(OrderPaymentStatus::Paid));
    }

    #[tokio::test]
    async fn test_cancel_only_from_pending() {
        let db = match create_test_db().await {
            Some(db) => db,
            None => {
                eprintln!("Skipping test - database not available");
                return;
            }
        };

        let order = db
            .create(
                4002,
                &[NewOrderItem {
                    product_id: 1,
                    sku_id: None,
                    quantity: 1,
                    price: dec!(9.99),
                }],
            )
            .await
            .unwrap();

        assert!(db.mark_paid(order.id).await.unwrap());
        // Paid orders cannot be cancelled by a late timeout event
        assert!(
            !db.mark_cancelled(order.id, OrderPaymentStatus::Cancelled)
                .await
                .unwrap()
        );
        assert!(db.mark_refunded(order.id).await.unwrap());
    }
}
