//! Payment orchestrator: create, query/reconcile, refund, callback settle.
//!
//! Owns the payment record lifecycle and is the only component that drives
//! payment state transitions. Per-payment transitions are serialized under
//! the `payment:settle:<no>` lock before any sync event is emitted, which
//! is what gives the dispatcher its per-payment ordering guarantee.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

use super::config_store::{ConfigStoreError, PaymentConfigStore};
use super::db::{NewPayment, PaymentDb, PaymentDbError, SettleUpdate};
use super::models::{
    CreatePaymentRequest, CreatePaymentResponse, Payment, PaymentMethod, PaymentRefund, QueryBy,
    RefundRequest, RefundResponse, RefundStatus,
};
use super::state::PaymentState;
use crate::callback::{CallbackError, CallbackValidator};
use crate::core_types::{OrderId, external_no};
use crate::dispatch::{DispatchError, SyncDispatcher, SyncEvent, SyncEventType};
use crate::inventory::{InventoryEngine, InventoryError, StockRequest};
use crate::lock::{DEFAULT_LOCK_TTL, LockError, LockManager, settle_key};
use crate::metrics::Metrics;
use crate::order::db::{OrderDb, OrderError};
use crate::order::models::{OrderPaymentStatus, OrderStatus};
use crate::providers::{
    ProviderCreateRequest, ProviderError, ProviderQueryResponse, ProviderRefundRequest,
    ProviderRegistry, ProviderTradeStatus,
};

/// Default payment expiry window.
const DEFAULT_EXPIRY_MINUTES: i64 = 30;

/// Waiting budget for the settle lock.
const SETTLE_LOCK_DEADLINE: Duration = Duration::from_secs(10);

/// Provider query retry schedule: exponential back-off, 3 attempts.
const QUERY_ATTEMPTS: u32 = 3;
const QUERY_BACKOFF_BASE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    #[error("payment {0} not found")]
    PaymentNotFound(String),
    #[error("order is already paid")]
    AlreadyPaid,
    #[error("amount {amount} does not match order total {total}")]
    AmountMismatch { amount: Decimal, total: Decimal },
    #[error("daily limit exceeded: {0}")]
    DailyLimitExceeded(String),
    #[error("refund {requested} exceeds refundable remainder {remaining}")]
    RefundExceedsPaid {
        requested: Decimal,
        remaining: Decimal,
    },
    #[error("payment is not refundable in state {0}")]
    NotRefundable(PaymentState),
    #[error("no provider registered for method {0}")]
    NoProvider(PaymentMethod),
    #[error(transparent)]
    Config(#[from] ConfigStoreError),
    #[error(transparent)]
    Inventory(#[from] InventoryError),
    #[error(transparent)]
    LockBusy(#[from] LockError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Callback(#[from] CallbackError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Db(#[from] PaymentDbError),
    #[error(transparent)]
    Order(#[from] OrderError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl PaymentError {
    /// Whether the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        match self {
            PaymentError::LockBusy(_) | PaymentError::Dispatch(_) => true,
            PaymentError::Inventory(InventoryError::ConcurrencyExhausted { .. }) => true,
            PaymentError::Inventory(InventoryError::LockBusy(_)) => true,
            PaymentError::Provider(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Outcome reported to the callback transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackOutcome {
    /// Settlement applied, events emitted
    Settled,
    /// Provider reported terminal failure/closure; recorded
    FailureRecorded,
    /// Duplicate or non-terminal notice; acknowledged without effect
    Ignored,
}

/// Full payment view returned by query.
#[derive(Debug, serde::Serialize)]
pub struct PaymentView {
    pub payment: Payment,
    pub refunds: Vec<PaymentRefund>,
    pub refunded_amount: Decimal,
}

pub struct PaymentOrchestrator {
    pool: PgPool,
    payments: Arc<PaymentDb>,
    orders: Arc<OrderDb>,
    inventory: Arc<InventoryEngine>,
    providers: Arc<ProviderRegistry>,
    configs: Arc<PaymentConfigStore>,
    validator: Arc<CallbackValidator>,
    dispatcher: Arc<SyncDispatcher>,
    locks: Arc<LockManager>,
    metrics: Arc<Metrics>,
}

impl PaymentOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: PgPool,
        payments: Arc<PaymentDb>,
        orders: Arc<OrderDb>,
        inventory: Arc<InventoryEngine>,
        providers: Arc<ProviderRegistry>,
        configs: Arc<PaymentConfigStore>,
        validator: Arc<CallbackValidator>,
        dispatcher: Arc<SyncDispatcher>,
        locks: Arc<LockManager>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            payments,
            orders,
            inventory,
            providers,
            configs,
            validator,
            dispatcher,
            locks,
            metrics,
        }
    }

    pub fn payments(&self) -> &Arc<PaymentDb> {
        &self.payments
    }

    /// Open a payment for an order: validate, reserve stock, insert the
    /// record, hand off to the provider, all in one transaction.
    pub async fn create(
        &self,
        request: CreatePaymentRequest,
    ) -> Result<CreatePaymentResponse, PaymentError> {
        let started = Instant::now();
        let method = request.method;

        // 1. Method enabled and amount within configured bounds
        let method_config = self.configs.validate_amount(method, request.amount)?;
        if request.amount <= Decimal::ZERO {
            return Err(PaymentError::Validation("amount must be positive".into()));
        }

        // 2. Order exists, is payable, and the amount matches its total
        let order = self
            .orders
            .get(request.order_id)
            .await?
            .ok_or(PaymentError::OrderNotFound(request.order_id))?;
        if order.payment_status() == Some(OrderPaymentStatus::Paid) {
            return Err(PaymentError::AlreadyPaid);
        }
        match order.status() {
            Some(OrderStatus::Pending) => {}
            Some(status) => {
                return Err(PaymentError::Validation(format!(
                    "order {} is not payable in state {}",
                    order.id, status
                )));
            }
            None => {
                return Err(PaymentError::Validation(format!(
                    "order {} has unknown status id {}",
                    order.id, order.status
                )));
            }
        }
        if request.amount != order.total_amount {
            return Err(PaymentError::AmountMismatch {
                amount: request.amount,
                total: order.total_amount,
            });
        }

        // Duplicate create: hand back the in-flight payment instead of
        // opening a second one (one non-terminal payment per order)
        if let Some(existing) = self.payments.active_by_order(order.id).await? {
            info!(
                order_id = order.id,
                payment_no = %existing.payment_no,
                "Returning existing in-flight payment for duplicate create"
            );
            return Ok(CreatePaymentResponse {
                payment_id: existing.id,
                payment_no: existing.payment_no.clone(),
                method,
                amount: existing.amount,
                payment_data: serde_json::Value::Null,
                expired_at: existing.expired_at,
            });
        }

        // 3. Per-method daily caps
        let (today_count, today_total) =
            self.payments.daily_usage(order.user_id, method).await?;
        if today_count + 1 > method_config.daily_max_count {
            return Err(PaymentError::DailyLimitExceeded(format!(
                "count {} at daily cap {}",
                today_count, method_config.daily_max_count
            )));
        }
        if today_total + request.amount > method_config.daily_max_amount {
            return Err(PaymentError::DailyLimitExceeded(format!(
                "amount {} would exceed daily cap {}",
                today_total + request.amount,
                method_config.daily_max_amount
            )));
        }

        let provider = self
            .providers
            .get(method)
            .ok_or(PaymentError::NoProvider(method))?;

        let expiry_minutes = request
            .expired_minutes
            .unwrap_or(DEFAULT_EXPIRY_MINUTES)
            .clamp(1, 24 * 60);
        let expired_at = Utc::now() + ChronoDuration::minutes(expiry_minutes);
        let payment_no = external_no("PAY");

        // 4-7. Reservation, record insert and provider handshake share one
        // transaction: a failed handshake rolls the reservation back
        let items = self.orders.items(order.id).await?;
        if items.is_empty() {
            return Err(PaymentError::Validation(format!(
                "order {} has no items",
                order.id
            )));
        }
        let stock_requests: Vec<StockRequest> =
            items.iter().map(|item| item.stock_request()).collect();

        let tokens = self.inventory.lock_requests(&stock_requests).await?;
        let outcome = async {
            let mut tx = self.pool.begin().await?;
            self.inventory
                .deduct_in_tx(&mut tx, &stock_requests)
                .await?;

            let payment = self
                .payments
                .insert_in_tx(
                    &mut tx,
                    &NewPayment {
                        payment_no: payment_no.clone(),
                        order_id: order.id,
                        user_id: order.user_id,
                        method,
                        amount: request.amount,
                        expired_at,
                    },
                )
                .await?;

            // Runs on the reservation transaction: a provider whose create
            // moves funds (the wallet method) commits and rolls back with
            // the reservation and the payment row
            let provider_response = provider
                .create_payment_in_tx(
                    &mut tx,
                    &ProviderCreateRequest {
                        payment_no: payment_no.clone(),
                        amount: request.amount,
                        currency: "CNY".to_string(),
                        subject: request.subject.clone(),
                        description: request.description.clone(),
                        notify_url: request.notify_url.clone().unwrap_or_default(),
                        return_url: request.return_url.clone().unwrap_or_default(),
                        expired_at,
                        user_id: order.user_id,
                    },
                )
                .await?;

            self.payments
                .transition_in_tx(
                    &mut tx,
                    payment.id,
                    &[PaymentState::Pending],
                    PaymentState::Paying,
                    "orchestrator",
                    Some("provider handshake ok"),
                    Some(&SettleUpdate {
                        third_party_id: provider_response.third_party_id.clone(),
                        actual_amount: None,
                    }),
                )
                .await?;

            tx.commit().await?;
            Ok::<_, PaymentError>((payment, provider_response))
        }
        .await;
        self.inventory.release_locks(tokens);
        let (payment, provider_response) = outcome?;

        // Mirror paying onto the order row (best effort; the settle path
        // re-drives it anyway)
        self.orders
            .set_payment_status(
                order.id,
                OrderPaymentStatus::Pending,
                OrderPaymentStatus::Paying,
            )
            .await?;

        // The wallet method settles synchronously at create
        if method == PaymentMethod::Balance {
            self.settle_success(
                &payment,
                provider_response.third_party_id.clone(),
                Some(request.amount),
                "balance",
            )
            .await?;
        }

        self.metrics
            .record_create(method.as_str(), started.elapsed().as_millis() as u64);
        info!(
            payment_no = %payment_no,
            order_id = order.id,
            method = %method,
            amount = %request.amount,
            "Payment created"
        );

        Ok(CreatePaymentResponse {
            payment_id: payment.id,
            payment_no,
            method,
            amount: request.amount,
            payment_data: provider_response.payment_data,
            expired_at,
        })
    }

    /// Stored payment view plus, for in-flight payments, a synchronous
    /// reconciliation against the provider. A lost callback is recovered
    /// here: a provider-side terminal state drives the same transition
    /// path as the callback would have.
    pub async fn query(&self, by: QueryBy) -> Result<PaymentView, PaymentError> {
        let payment = match &by {
            QueryBy::PaymentId(id) => self.payments.get(*id).await?,
            QueryBy::PaymentNo(no) => self.payments.get_by_no(no).await?,
            QueryBy::OrderId(order_id) => self.payments.latest_by_order(*order_id).await?,
        }
        .ok_or_else(|| PaymentError::PaymentNotFound(format!("{:?}", by)))?;

        match payment.state() {
            Some(state) if state.is_settleable() => self.reconcile(&payment).await?,
            // A completed full refund whose payment flip was interrupted
            // leaves a paid row with refunded_total == amount; repair here
            Some(PaymentState::Paid) => self.reconcile_refunded(&payment).await,
            _ => {}
        }

        // Reload after a possible transition
        let payment = self
            .payments
            .get(payment.id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(payment.payment_no.clone()))?;
        let refunds = self.payments.refunds(payment.id).await?;
        let refunded_amount = self.payments.refunded_total(payment.id).await?;
        Ok(PaymentView {
            payment,
            refunds,
            refunded_amount,
        })
    }

    /// Poll the provider and drive any terminal answer into our state.
    async fn reconcile(&self, payment: &Payment) -> Result<(), PaymentError> {
        let Some(method) = payment.method() else {
            return Ok(());
        };
        let provider = self
            .providers
            .get(method)
            .ok_or(PaymentError::NoProvider(method))?;

        let response = match self.query_with_backoff(provider.as_ref(), payment).await {
            Ok(response) => response,
            Err(e) if e.is_transient() => {
                // Leave the payment as is; the sweeper or a later query
                // will try again
                warn!(payment_no = %payment.payment_no, error = %e, "Reconciliation query failed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        match response.status {
            ProviderTradeStatus::Success => {
                self.settle_success(
                    payment,
                    response.third_party_id,
                    response.paid_amount,
                    "reconciliation",
                )
                .await?;
            }
            ProviderTradeStatus::Failed => {
                self.settle_terminal(
                    payment,
                    PaymentState::Failed,
                    SyncEventType::PaymentFailed,
                    "reconciliation",
                )
                .await?;
            }
            ProviderTradeStatus::Closed => {
                self.settle_terminal(
                    payment,
                    PaymentState::Cancelled,
                    SyncEventType::PaymentCanceled,
                    "reconciliation",
                )
                .await?;
            }
            ProviderTradeStatus::Pending => {
                if payment.is_expired(Utc::now()) {
                    // Best effort: close the trade at the provider so a
                    // late buyer cannot pay into a cancelled payment
                    if let Err(e) = provider.close_payment(&payment.payment_no).await {
                        warn!(
                            payment_no = %payment.payment_no,
                            error = %e,
                            "Provider close failed before expiry cancel"
                        );
                    }
                    self.settle_terminal(
                        payment,
                        PaymentState::Cancelled,
                        SyncEventType::PaymentCanceled,
                        "expiry",
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    /// Flip a fully-refunded payment to `Refunded` under the settle lock.
    async fn finalize_full_refund(
        &self,
        payment: &Payment,
        note: &str,
    ) -> Result<bool, PaymentError> {
        let lock = self
            .locks
            .acquire_with_retry(
                &settle_key(&payment.payment_no),
                DEFAULT_LOCK_TTL,
                SETTLE_LOCK_DEADLINE,
            )
            .await?;
        let result = self
            .payments
            .transition(
                payment.id,
                &[PaymentState::Paid],
                PaymentState::Refunded,
                "refund",
                Some(note),
                None,
            )
            .await;
        self.locks.release(&lock);
        Ok(result?)
    }

    /// Best-effort repair for a paid row whose successful full refund
    /// never flipped it. Failures stay local: the view is still served
    /// and the next query retries.
    async fn reconcile_refunded(&self, payment: &Payment) {
        match self.payments.refunded_total(payment.id).await {
            Ok(refunded) if refunded >= payment.amount => {
                match self
                    .finalize_full_refund(payment, "refund reconciliation")
                    .await
                {
                    Ok(true) => info!(
                        payment_no = %payment.payment_no,
                        "Deferred refund flip applied by reconciliation"
                    ),
                    Ok(false) => {}
                    Err(e) => warn!(
                        payment_no = %payment.payment_no,
                        error = %e,
                        "Deferred refund flip failed, will retry on next query"
                    ),
                }
            }
            Ok(_) => {}
            Err(e) => warn!(
                payment_no = %payment.payment_no,
                error = %e,
                "Refund reconciliation lookup failed"
            ),
        }
    }

    async fn query_with_backoff(
        &self,
        provider: &dyn crate::providers::PaymentProvider,
        payment: &Payment,
    ) -> Result<ProviderQueryResponse, ProviderError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match provider.query_payment(&payment.payment_no).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < QUERY_ATTEMPTS => {
                    let delay = QUERY_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Validate and apply a provider callback.
    pub async fn process_callback(
        &self,
        method: PaymentMethod,
        params: &BTreeMap<String, String>,
    ) -> Result<CallbackOutcome, PaymentError> {
        match self.validator.validate(method, params).await {
            Ok(validated) => {
                self.metrics.record_callback(method.as_str());
                let outcome = match validated.notice.status {
                    ProviderTradeStatus::Success => {
                        self.settle_success(
                            &validated.payment,
                            Some(validated.notice.third_party_id.clone()),
                            Some(validated.notice.amount),
                            "callback",
                        )
                        .await?;
                        CallbackOutcome::Settled
                    }
                    ProviderTradeStatus::Failed => {
                        self.settle_terminal(
                            &validated.payment,
                            PaymentState::Failed,
                            SyncEventType::PaymentFailed,
                            "callback",
                        )
                        .await?;
                        CallbackOutcome::FailureRecorded
                    }
                    ProviderTradeStatus::Closed => {
                        self.settle_terminal(
                            &validated.payment,
                            PaymentState::Cancelled,
                            SyncEventType::PaymentCanceled,
                            "callback",
                        )
                        .await?;
                        CallbackOutcome::FailureRecorded
                    }
                    // A wait-notification carries no settlement
                    ProviderTradeStatus::Pending => CallbackOutcome::Ignored,
                };
                self.validator.mark_processed(method, &validated.notice);
                Ok(outcome)
            }
            Err(e) if e.is_duplicate() => {
                self.metrics.record_replay_rejected(method.as_str());
                info!(method = %method, code = e.code(), "Duplicate callback acknowledged");
                Ok(CallbackOutcome::Ignored)
            }
            Err(e) => {
                warn!(method = %method, code = e.code(), error = %e, "Callback rejected");
                Err(e.into())
            }
        }
    }

    /// Refund a paid payment, partially or in full. The provider call runs
    /// outside any DB transaction; the settle lock plus refund-row CAS keep
    /// it correct.
    pub async fn refund(&self, request: RefundRequest) -> Result<RefundResponse, PaymentError> {
        if request.refund_amount <= Decimal::ZERO {
            return Err(PaymentError::Validation(
                "refund amount must be positive".into(),
            ));
        }

        let payment = self
            .payments
            .get(request.payment_id)
            .await?
            .ok_or_else(|| PaymentError::PaymentNotFound(request.payment_id.to_string()))?;
        let method = payment
            .method()
            .ok_or_else(|| PaymentError::Validation("payment has unknown method".into()))?;
        match payment.state() {
            Some(PaymentState::Paid) => {}
            Some(state) => return Err(PaymentError::NotRefundable(state)),
            None => return Err(PaymentError::Validation("payment has unknown state".into())),
        }

        let refunded = self.payments.refunded_total(payment.id).await?;
        let remaining = payment.amount - refunded;
        if request.refund_amount > remaining {
            return Err(PaymentError::RefundExceedsPaid {
                requested: request.refund_amount,
                remaining,
            });
        }

        let provider = self
            .providers
            .get(method)
            .ok_or(PaymentError::NoProvider(method))?;
        let refund_no = external_no("REF");
        let refund = self
            .payments
            .insert_refund(payment.id, &refund_no, request.refund_amount, &request.reason)
            .await?;

        let provider_result = provider
            .refund(&ProviderRefundRequest {
                payment_no: payment.payment_no.clone(),
                refund_no: refund_no.clone(),
                refund_amount: request.refund_amount,
                total_amount: payment.amount,
                reason: request.reason.clone(),
                third_party_id: payment.third_party_id.clone(),
                user_id: payment.user_id,
            })
            .await;

        match provider_result {
            Ok(_response) => {
                self.payments
                    .set_refund_status(refund.id, RefundStatus::Pending, RefundStatus::Success)
                    .await?;

                // Money has already moved back to the customer; from here
                // on nothing may surface an error to the caller. An
                // interrupted payment flip is repaired by the query
                // reconciliation path.
                let full_refund = refunded + request.refund_amount >= payment.amount;
                if full_refund {
                    if let Err(e) = self
                        .finalize_full_refund(
                            &payment,
                            &format!("refund {} completed", refund_no),
                        )
                        .await
                    {
                        warn!(
                            payment_no = %payment.payment_no,
                            refund_no = %refund_no,
                            error = %e,
                            "Refund settled but payment flip deferred"
                        );
                    }
                }

                if let Err(e) = self.dispatcher.publish(SyncEvent::new(
                    SyncEventType::RefundSuccess,
                    payment.id,
                    payment.order_id,
                    payment.user_id,
                    serde_json::json!({
                        "refund_no": refund_no,
                        "refund_amount": request.refund_amount.to_string(),
                        "full_refund": full_refund,
                    }),
                )) {
                    warn!(
                        payment_no = %payment.payment_no,
                        refund_no = %refund_no,
                        error = %e,
                        "Refund settled but sync event not published"
                    );
                }

                info!(
                    payment_no = %payment.payment_no,
                    refund_no = %refund_no,
                    amount = %request.refund_amount,
                    full_refund,
                    "Refund succeeded"
                );
                Ok(RefundResponse {
                    refund_id: refund.id,
                    refund_no,
                    status: RefundStatus::Success.as_str().to_string(),
                })
            }
            Err(e) => {
                self.payments
                    .set_refund_status(refund.id, RefundStatus::Pending, RefundStatus::Failed)
                    .await?;
                // Log-only event keeps the audit trail complete
                let _ = self.dispatcher.publish(SyncEvent::new(
                    SyncEventType::RefundFailed,
                    payment.id,
                    payment.order_id,
                    payment.user_id,
                    serde_json::json!({
                        "refund_no": refund_no,
                        "error": e.to_string(),
                    }),
                ));
                warn!(
                    payment_no = %payment.payment_no,
                    refund_no = %refund_no,
                    error = %e,
                    "Refund failed at provider"
                );
                Err(e.into())
            }
        }
    }

    /// Settle a payment as paid under the settle lock and emit the
    /// success event. Returns false when the payment had already settled
    /// (idempotent redelivery). Settlement always passes through paying:
    /// a committed payment row is never in pending.
    pub(crate) async fn settle_success(
        &self,
        payment: &Payment,
        third_party_id: Option<String>,
        actual_amount: Option<Decimal>,
        actor: &str,
    ) -> Result<bool, PaymentError> {
        let lock = self
            .locks
            .acquire_with_retry(
                &settle_key(&payment.payment_no),
                DEFAULT_LOCK_TTL,
                SETTLE_LOCK_DEADLINE,
            )
            .await?;

        let result = self
            .payments
            .transition(
                payment.id,
                &[PaymentState::Paying],
                PaymentState::Paid,
                actor,
                None,
                Some(&SettleUpdate {
                    third_party_id,
                    actual_amount,
                }),
            )
            .await;
        self.locks.release(&lock);

        let applied = result?;
        if applied {
            if let Some(method) = payment.method() {
                self.metrics.record_success(method.as_str());
            }
            self.dispatcher.publish(SyncEvent::new(
                SyncEventType::PaymentSuccess,
                payment.id,
                payment.order_id,
                payment.user_id,
                serde_json::json!({ "actor": actor }),
            ))?;
        }
        Ok(applied)
    }

    /// Settle a payment into a non-paid terminal state and emit the
    /// matching event.
    pub(crate) async fn settle_terminal(
        &self,
        payment: &Payment,
        to: PaymentState,
        event_type: SyncEventType,
        actor: &str,
    ) -> Result<bool, PaymentError> {
        let lock = self
            .locks
            .acquire_with_retry(
                &settle_key(&payment.payment_no),
                DEFAULT_LOCK_TTL,
                SETTLE_LOCK_DEADLINE,
            )
            .await?;

        let result = self
            .payments
            .transition(
                payment.id,
                &[PaymentState::Pending, PaymentState::Paying],
                to,
                actor,
                None,
                None,
            )
            .await;
        self.locks.release(&lock);

        let applied = result?;
        if applied {
            if let Some(method) = payment.method() {
                self.metrics.record_failure(method.as_str());
            }
            self.dispatcher.publish(SyncEvent::new(
                event_type,
                payment.id,
                payment.order_id,
                payment.user_id,
                serde_json::json!({ "actor": actor }),
            ))?;
        }
        Ok(applied)
    }
}
