//! Settlement event handlers.
//!
//! Each event is applied in its own DB transaction and written to be
//! idempotent: the order transition is a CAS, and stock restoration only
//! runs when that CAS actually applied, so a redelivered event changes
//! nothing.

use async_trait::async_trait;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::dispatcher::EventHandler;
use super::event::{SyncEvent, SyncEventType};
use crate::inventory::{InventoryEngine, InventoryError, StockRequest};
use crate::order::db::{OrderDb, OrderError};
use crate::order::models::OrderPaymentStatus;

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub struct SettlementHandler {
    pool: PgPool,
    orders: Arc<OrderDb>,
    inventory: Arc<InventoryEngine>,
}

impl SettlementHandler {
    pub fn new(pool: PgPool, orders: Arc<OrderDb>, inventory: Arc<InventoryEngine>) -> Self {
        Self {
            pool,
            orders,
            inventory,
        }
    }

    async fn on_payment_success(&self, event: &SyncEvent) -> Result<(), HandlerError> {
        // Stock was already reserved at create; only the order flips
        let applied = self.orders.mark_paid(event.order_id).await?;
        if applied {
            info!(order_id = event.order_id, event = %event.event_type, "Order settled as paid");
        }
        Ok(())
    }

    /// Cancel the order and give the reservation back, atomically.
    async fn cancel_and_restore(
        &self,
        event: &SyncEvent,
        payment_status: OrderPaymentStatus,
    ) -> Result<(), HandlerError> {
        let items = self.orders.items(event.order_id).await?;
        let requests: Vec<StockRequest> = items.iter().map(|item| item.stock_request()).collect();

        let tokens = self.inventory.lock_requests(&requests).await?;
        let outcome = async {
            let mut tx = self.pool.begin().await?;
            let applied = self
                .orders
                .mark_cancelled_in_tx(&mut tx, event.order_id, payment_status)
                .await?;
            if applied {
                self.inventory.restore_in_tx(&mut tx, &requests).await?;
            }
            tx.commit().await?;
            Ok::<bool, HandlerError>(applied)
        }
        .await;
        self.inventory.release_locks(tokens);

        if outcome? {
            info!(
                order_id = event.order_id,
                event = %event.event_type,
                "Order cancelled, reserved stock restored"
            );
        }
        Ok(())
    }

    async fn on_refund_success(&self, event: &SyncEvent) -> Result<(), HandlerError> {
        let full_refund = event
            .payload
            .get("full_refund")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !full_refund {
            // A scalar partial refund cannot be mapped back to items;
            // stock stays committed and only the money moved
            info!(
                order_id = event.order_id,
                "Partial refund settled, stock unchanged"
            );
            return Ok(());
        }

        let items = self.orders.items(event.order_id).await?;
        let requests: Vec<StockRequest> = items.iter().map(|item| item.stock_request()).collect();

        let tokens = self.inventory.lock_requests(&requests).await?;
        let outcome = async {
            let mut tx = self.pool.begin().await?;
            let applied = self
                .orders
                .mark_refunded_in_tx(&mut tx, event.order_id)
                .await?;
            if applied {
                self.inventory.restore_in_tx(&mut tx, &requests).await?;
            }
            tx.commit().await?;
            Ok::<bool, HandlerError>(applied)
        }
        .await;
        self.inventory.release_locks(tokens);

        if outcome? {
            info!(order_id = event.order_id, "Order refunded, stock restored");
        }
        Ok(())
    }
}

#[async_trait]
impl EventHandler for SettlementHandler {
    async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError> {
        match event.event_type {
            SyncEventType::PaymentSuccess => self.on_payment_success(event).await,
            SyncEventType::PaymentFailed => {
                self.cancel_and_restore(event, OrderPaymentStatus::Failed)
                    .await
            }
            SyncEventType::PaymentCanceled => {
                self.cancel_and_restore(event, OrderPaymentStatus::Cancelled)
                    .await
            }
            SyncEventType::RefundSuccess => self.on_refund_success(event).await,
            SyncEventType::RefundFailed => {
                warn!(
                    payment_id = event.payment_id,
                    order_id = event.order_id,
                    payload = %event.payload,
                    "Refund failed at provider"
                );
                Ok(())
            }
        }
    }
}
