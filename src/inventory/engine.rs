//! Atomic stock deduction and restoration.
//!
//! Two layers guard every mutation:
//!
//! 1. A per-resource TTL lock serializes writers at coarse granularity and
//!    keeps retry storms off the hot rows.
//! 2. A version-guarded conditional update inside the transaction is the
//!    correctness guarantee that survives lock expiry.
//!
//! All requests of one call commit or roll back together. Locks are taken
//! before the transaction opens and released after it ends, in reverse
//! acquisition order.

use sqlx::{PgConnection, PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::models::{StockCheck, StockRequest, StockResult};
use crate::lock::{DEFAULT_LOCK_TTL, LockError, LockManager, LockToken};
use crate::metrics::Metrics;

/// Version-conflict retry budget per row.
const MAX_ATTEMPTS: u32 = 3;

/// Waiting budget for each per-resource lock.
const LOCK_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("product {product_id} not found")]
    ProductNotFound { product_id: i64 },
    #[error("sku {sku_id} not found")]
    SkuNotFound { sku_id: i64 },
    #[error("insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: i64,
        requested: i64,
        available: i64,
    },
    #[error("version conflicts exhausted after {attempts} attempts on {key}")]
    ConcurrencyExhausted { key: String, attempts: u32 },
    #[error("invalid quantity {quantity}")]
    InvalidQuantity { quantity: i64 },
    #[error(transparent)]
    LockBusy(#[from] LockError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Clone, Copy)]
enum Direction {
    Deduct,
    Restore,
}

pub struct InventoryEngine {
    pool: PgPool,
    locks: Arc<LockManager>,
    metrics: Arc<Metrics>,
}

impl InventoryEngine {
    pub fn new(pool: PgPool, locks: Arc<LockManager>, metrics: Arc<Metrics>) -> Self {
        Self {
            pool,
            locks,
            metrics,
        }
    }

    /// Deduct the listed quantities atomically. Either every request
    /// commits or none does.
    pub async fn deduct(&self, requests: &[StockRequest]) -> Result<Vec<StockResult>, InventoryError> {
        self.run_locked(requests, Direction::Deduct).await
    }

    /// Inverse of [`deduct`](Self::deduct), used on cancellation, refund or
    /// payment timeout. `sold_count` is floored at zero.
    pub async fn restore(&self, requests: &[StockRequest]) -> Result<Vec<StockResult>, InventoryError> {
        self.run_locked(requests, Direction::Restore).await
    }

    /// Non-binding read-only availability check.
    pub async fn check(&self, requests: &[StockRequest]) -> Result<Vec<StockCheck>, InventoryError> {
        validate(requests)?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let available = match request.sku_id {
                Some(sku_id) => {
                    sqlx::query_scalar::<_, i64>("SELECT stock FROM product_skus WHERE id = $1")
                        .bind(sku_id)
                        .fetch_optional(&self.pool)
                        .await?
                        .ok_or(InventoryError::SkuNotFound { sku_id })?
                }
                None => {
                    sqlx::query_scalar::<_, i64>("SELECT stock FROM products WHERE id = $1")
                        .bind(request.product_id)
                        .fetch_optional(&self.pool)
                        .await?
                        .ok_or(InventoryError::ProductNotFound {
                            product_id: request.product_id,
                        })?
                }
            };
            results.push(StockCheck {
                product_id: request.product_id,
                sku_id: request.sku_id,
                requested: request.quantity,
                available,
                sufficient: available >= request.quantity,
            });
        }
        Ok(results)
    }

    /// Take the per-resource locks for `requests`. Callers that own the
    /// surrounding transaction (the payment create path) use this together
    /// with [`deduct_in_tx`](Self::deduct_in_tx) and must release via
    /// [`release_locks`](Self::release_locks) after the transaction ends.
    pub async fn lock_requests(
        &self,
        requests: &[StockRequest],
    ) -> Result<Vec<LockToken>, InventoryError> {
        let mut tokens: Vec<LockToken> = Vec::with_capacity(requests.len());
        for request in requests {
            match self
                .locks
                .acquire_with_retry(&request.lock_key(), DEFAULT_LOCK_TTL, LOCK_DEADLINE)
                .await
            {
                Ok(token) => {
                    self.metrics.record_lock(true);
                    tokens.push(token);
                }
                Err(busy) => {
                    self.metrics.record_lock(false);
                    self.release_locks(tokens);
                    return Err(busy.into());
                }
            }
        }
        Ok(tokens)
    }

    /// Release in reverse-acquisition order.
    pub fn release_locks(&self, mut tokens: Vec<LockToken>) {
        while let Some(token) = tokens.pop() {
            if !self.locks.release(&token) {
                warn!(key = %token.key, "stock lock expired before release");
            }
        }
    }

    /// Apply deductions inside a caller-owned transaction. The caller must
    /// hold the locks from [`lock_requests`](Self::lock_requests).
    pub async fn deduct_in_tx(
        &self,
        conn: &mut PgConnection,
        requests: &[StockRequest],
    ) -> Result<Vec<StockResult>, InventoryError> {
        validate(requests)?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.apply_one(conn, request, Direction::Deduct).await?);
        }
        Ok(results)
    }

    /// Apply restorations inside a caller-owned transaction.
    pub async fn restore_in_tx(
        &self,
        conn: &mut PgConnection,
        requests: &[StockRequest],
    ) -> Result<Vec<StockResult>, InventoryError> {
        validate(requests)?;
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push(self.apply_one(conn, request, Direction::Restore).await?);
        }
        Ok(results)
    }

    async fn run_locked(
        &self,
        requests: &[StockRequest],
        direction: Direction,
    ) -> Result<Vec<StockResult>, InventoryError> {
        validate(requests)?;
        let tokens = self.lock_requests(requests).await?;

        let outcome = async {
            let mut tx = self.pool.begin().await?;
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.apply_one(&mut *tx, request, direction).await?);
            }
            tx.commit().await?;
            Ok(results)
        }
        .await;

        self.release_locks(tokens);
        outcome
    }

    /// One row: read version, bounds-check, conditional update, bounded
    /// retry on version conflict with linear back-off.
    async fn apply_one(
        &self,
        conn: &mut PgConnection,
        request: &StockRequest,
        direction: Direction,
    ) -> Result<StockResult, InventoryError> {
        for attempt in 1..=MAX_ATTEMPTS {
            let row = match request.sku_id {
                Some(sku_id) => {
                    sqlx::query("SELECT stock, version FROM product_skus WHERE id = $1")
                        .bind(sku_id)
                        .fetch_optional(&mut *conn)
                        .await?
                        .ok_or(InventoryError::SkuNotFound { sku_id })?
                }
                None => sqlx::query("SELECT stock, version FROM products WHERE id = $1")
                    .bind(request.product_id)
                    .fetch_optional(&mut *conn)
                    .await?
                    .ok_or(InventoryError::ProductNotFound {
                        product_id: request.product_id,
                    })?,
            };
            let stock: i64 = row.get("stock");
            let version: i64 = row.get("version");

            if matches!(direction, Direction::Deduct) && stock < request.quantity {
                return Err(InventoryError::InsufficientStock {
                    product_id: request.product_id,
                    requested: request.quantity,
                    available: stock,
                });
            }

            let updated = match (&direction, request.sku_id) {
                (Direction::Deduct, None) => {
                    sqlx::query(
                        "UPDATE products
                         SET stock = stock - $1, sold_count = sold_count + $1,
                             version = version + 1, updated_at = NOW()
                         WHERE id = $2 AND version = $3",
                    )
                    .bind(request.quantity)
                    .bind(request.product_id)
                    .bind(version)
                    .execute(&mut *conn)
                    .await?
                }
                (Direction::Deduct, Some(sku_id)) => {
                    sqlx::query(
                        "UPDATE product_skus
                         SET stock = stock - $1, version = version + 1, updated_at = NOW()
                         WHERE id = $2 AND version = $3",
                    )
                    .bind(request.quantity)
                    .bind(sku_id)
                    .bind(version)
                    .execute(&mut *conn)
                    .await?
                }
                (Direction::Restore, None) => {
                    sqlx::query(
                        "UPDATE products
                         SET stock = stock + $1,
                             sold_count = GREATEST(sold_count - $1, 0),
                             version = version + 1, updated_at = NOW()
                         WHERE id = $2 AND version = $3",
                    )
                    .bind(request.quantity)
                    .bind(request.product_id)
                    .bind(version)
                    .execute(&mut *conn)
                    .await?
                }
                (Direction::Restore, Some(sku_id)) => {
                    sqlx::query(
                        "UPDATE product_skus
                         SET stock = stock + $1, version = version + 1, updated_at = NOW()
                         WHERE id = $2 AND version = $3",
                    )
                    .bind(request.quantity)
                    .bind(sku_id)
                    .bind(version)
                    .execute(&mut *conn)
                    .await?
                }
            };

            if updated.rows_affected() == 1 {
                // SKU rows carry their own stock; the parent product only
                // aggregates sold_count via a raw counter increment.
                if request.sku_id.is_some() {
                    let delta_sql = match direction {
                        Direction::Deduct => {
                            "UPDATE products SET sold_count = sold_count + $1, updated_at = NOW()
                             WHERE id = $2"
                        }
                        Direction::Restore => {
                            "UPDATE products
                             SET sold_count = GREATEST(sold_count - $1, 0), updated_at = NOW()
                             WHERE id = $2"
                        }
                    };
                    sqlx::query(delta_sql)
                        .bind(request.quantity)
                        .bind(request.product_id)
                        .execute(&mut *conn)
                        .await?;
                }

                let remaining = match direction {
                    Direction::Deduct => stock - request.quantity,
                    Direction::Restore => stock + request.quantity,
                };
                return Ok(StockResult {
                    product_id: request.product_id,
                    sku_id: request.sku_id,
                    quantity: request.quantity,
                    remaining_stock: remaining,
                });
            }

            // Version moved under us despite the coarse lock (expiry or an
            // out-of-band writer). Back off linearly and re-read.
            debug!(
                key = %request.lock_key(),
                attempt,
                "stock version conflict, retrying"
            );
            tokio::time::sleep(retry_backoff(attempt)).await;
        }

        Err(InventoryError::ConcurrencyExhausted {
            key: request.lock_key(),
            attempts: MAX_ATTEMPTS,
        })
    }
}

fn validate(requests: &[StockRequest]) -> Result<(), InventoryError> {
    for request in requests {
        if request.quantity <= 0 {
            return Err(InventoryError::InvalidQuantity {
                quantity: request.quantity,
            });
        }
    }
    Ok(())
}

/// 10 ms × attempt, linear.
fn retry_backoff(attempt: u32) -> Duration {
    Duration::from_millis(10 * attempt as u64)
}
