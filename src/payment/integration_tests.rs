//! End-to-end flows over a real PostgreSQL database.
//!
//! Each test wires the full component graph with a scriptable mock
//! provider and skips silently when `DATABASE_URL` is not set.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::{CallbackError, CallbackValidator};
use crate::dispatch::{
    DispatcherConfig, MemoryDeadLetterSink, SettlementHandler, SyncDispatcher,
};
use crate::inventory::InventoryEngine;
use crate::lock::LockManager;
use crate::metrics::Metrics;
use crate::order::db::{NewOrderItem, OrderDb};
use crate::order::models::{OrderPaymentStatus, OrderStatus};
use crate::providers::mock::MockProvider;
use crate::providers::{ProviderRegistry, ProviderTradeStatus};

use super::config_store::{MethodConfig, PaymentConfigStore};
use super::db::PaymentDb;
use super::models::{
    CreatePaymentRequest, PaymentMethod, QueryBy, RefundRequest,
};
use super::orchestrator::{CallbackOutcome, PaymentError, PaymentOrchestrator};
use super::state::PaymentState;

struct Harness {
    pool: PgPool,
    orchestrator: Arc<PaymentOrchestrator>,
    orders: Arc<OrderDb>,
    payments: Arc<PaymentDb>,
    validator: Arc<CallbackValidator>,
    mock: Arc<MockProvider>,
    _shutdown: tokio::sync::watch::Sender<bool>,
}

async fn harness() -> Option<Harness> {
    let database_url = std::env::var("DATABASE_URL").ok()?;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(8)
        .connect(&database_url)
        .await
        .ok()?;
    crate::db::schema::init_schema(&pool).await.ok()?;

    let locks = Arc::new(LockManager::new());
    let metrics = Arc::new(Metrics::new());
    let payments = Arc::new(PaymentDb::new(pool.clone()));
    let orders = Arc::new(OrderDb::new(pool.clone()));
    let inventory = Arc::new(InventoryEngine::new(
        pool.clone(),
        locks.clone(),
        metrics.clone(),
    ));

    let configs = Arc::new(PaymentConfigStore::empty(pool.clone()));
    configs.publish_local(MethodConfig::defaults(PaymentMethod::Alipay));

    let mock = Arc::new(MockProvider::new(PaymentMethod::Alipay));
    let mut registry = ProviderRegistry::new();
    registry.register(mock.clone());
    let registry = Arc::new(registry);

    let validator = Arc::new(CallbackValidator::new(
        payments.clone(),
        registry.clone(),
        true,
    ));

    let handler = Arc::new(SettlementHandler::new(
        pool.clone(),
        orders.clone(),
        inventory.clone(),
    ));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let (dispatcher, _handles) = SyncDispatcher::spawn(
        DispatcherConfig {
            retry_delay: Duration::from_millis(20),
            retry_scan_interval: Duration::from_millis(10),
            ..DispatcherConfig::default()
        },
        handler,
        Arc::new(MemoryDeadLetterSink::default()),
        metrics.clone(),
        shutdown_rx,
    );

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        pool.clone(),
        payments.clone(),
        orders.clone(),
        inventory.clone(),
        registry,
        configs,
        validator.clone(),
        Arc::new(dispatcher),
        locks,
        metrics,
    ));

    Some(Harness {
        pool,
        orchestrator,
        orders,
        payments,
        validator,
        mock,
        _shutdown: shutdown_tx,
    })
}

async fn seed_product(pool: &PgPool, stock: i64, price: Decimal) -> i64 {
    sqlx::query_scalar::<_, i64>(
        "INSERT INTO products (name, price, stock) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(format!("flow-product-{}", uuid::Uuid::new_v4()))
    .bind(price)
    .bind(stock)
    .fetch_one(pool)
    .await
    .unwrap()
}

async fn product_stock(pool: &PgPool, product_id: i64) -> (i64, i64) {
    let row = sqlx::query("SELECT stock, sold_count FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_one(pool)
        .await
        .unwrap();
    (row.get("stock"), row.get("sold_count"))
}

/// Poll until `check` passes or two seconds elapse.
async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

fn create_request(order_id: i64, amount: Decimal) -> CreatePaymentRequest {
    CreatePaymentRequest {
        order_id,
        method: PaymentMethod::Alipay,
        amount,
        subject: "integration purchase".to_string(),
        description: String::new(),
        notify_url: None,
        return_url: None,
        expired_minutes: None,
    }
}

#[tokio::test]
async fn test_happy_purchase_with_duplicate_callback() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 10, dec!(100.00)).await;
    let order = h
        .orders
        .create(
            7001,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(100.00),
            }],
        )
        .await
        .unwrap();

    // Create reserves stock and hands off to the provider
    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(100.00)))
        .await
        .unwrap();
    assert_eq!(product_stock(&h.pool, product_id).await, (9, 1));
    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paying));
    assert!(payment.third_party_id.is_some());

    // Provider callback settles the payment and flips the order
    let params =
        MockProvider::signed_callback(&response.payment_no, dec!(100.00), "ntf-happy", Utc::now());
    let outcome = h
        .orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Settled);

    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paid));

    let orders = h.orders.clone();
    let order_id = order.id;
    assert!(
        wait_for(|| {
            let orders = orders.clone();
            async move {
                orders
                    .get(order_id)
                    .await
                    .unwrap()
                    .map(|o| o.status() == Some(OrderStatus::Paid))
                    .unwrap_or(false)
            }
        })
        .await,
        "order never flipped to paid"
    );
    // No stock change at settlement, reservation already holds it
    assert_eq!(product_stock(&h.pool, product_id).await, (9, 1));

    // Redelivery with the identical notify-id is acknowledged silently
    let outcome = h
        .orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Ignored);
    assert_eq!(product_stock(&h.pool, product_id).await, (9, 1));
}

#[tokio::test]
async fn test_duplicate_create_returns_existing_payment() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 5, dec!(50.00)).await;
    let order = h
        .orders
        .create(
            7002,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(50.00),
            }],
        )
        .await
        .unwrap();

    let first = h
        .orchestrator
        .create(create_request(order.id, dec!(50.00)))
        .await
        .unwrap();
    let second = h
        .orchestrator
        .create(create_request(order.id, dec!(50.00)))
        .await
        .unwrap();

    assert_eq!(first.payment_no, second.payment_no);
    // The duplicate create reserved nothing
    assert_eq!(product_stock(&h.pool, product_id).await, (4, 1));
}

#[tokio::test]
async fn test_create_rejections() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 5, dec!(30.00)).await;
    let order = h
        .orders
        .create(
            7003,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(30.00),
            }],
        )
        .await
        .unwrap();

    // Amount must equal the order total
    let err = h
        .orchestrator
        .create(create_request(order.id, dec!(31.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::AmountMismatch { .. }));

    // Unknown order
    let err = h
        .orchestrator
        .create(create_request(-1, dec!(30.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::OrderNotFound(_)));

    // Provider rejection rolls the reservation back
    h.mock.fail_create();
    let err = h
        .orchestrator
        .create(create_request(order.id, dec!(30.00)))
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::Provider(_)));
    assert_eq!(product_stock(&h.pool, product_id).await, (5, 0));
}

#[tokio::test]
async fn test_payment_timeout_cancels_and_restores() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 3, dec!(20.00)).await;
    let order = h
        .orders
        .create(
            7004,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 2,
                price: dec!(10.00),
            }],
        )
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(20.00)))
        .await
        .unwrap();
    assert_eq!(product_stock(&h.pool, product_id).await, (1, 2));

    // Expire the payment; the provider still reports not-paid
    sqlx::query("UPDATE payments SET expired_at = NOW() - INTERVAL '1 second' WHERE id = $1")
        .bind(response.payment_id)
        .execute(&h.pool)
        .await
        .unwrap();
    h.mock.set_query_status(ProviderTradeStatus::Pending);

    let view = h
        .orchestrator
        .query(QueryBy::PaymentId(response.payment_id))
        .await
        .unwrap();
    assert_eq!(view.payment.state(), Some(PaymentState::Cancelled));
    // The trade was closed at the provider before the local cancel
    assert_eq!(
        h.mock.close_calls.load(std::sync::atomic::Ordering::SeqCst),
        1
    );

    let orders = h.orders.clone();
    let order_id = order.id;
    assert!(
        wait_for(|| {
            let orders = orders.clone();
            async move {
                orders
                    .get(order_id)
                    .await
                    .unwrap()
                    .map(|o| o.status() == Some(OrderStatus::Cancelled))
                    .unwrap_or(false)
            }
        })
        .await,
        "order never cancelled"
    );
    // Reservation released
    assert_eq!(product_stock(&h.pool, product_id).await, (3, 0));

    let reloaded = h.orders.get(order.id).await.unwrap().unwrap();
    assert_eq!(
        reloaded.payment_status(),
        Some(OrderPaymentStatus::Cancelled)
    );
}

#[tokio::test]
async fn test_reconciliation_settles_lost_callback() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 2, dec!(15.00)).await;
    let order = h
        .orders
        .create(
            7005,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(15.00),
            }],
        )
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(15.00)))
        .await
        .unwrap();

    // The callback never arrives, but the provider settled the trade
    h.mock.set_query_status(ProviderTradeStatus::Success);
    let view = h
        .orchestrator
        .query(QueryBy::OrderId(order.id))
        .await
        .unwrap();
    assert_eq!(view.payment.state(), Some(PaymentState::Paid));
    assert_eq!(view.payment.id, response.payment_id);

    // Query on a settled payment is read-only from here on
    let again = h
        .orchestrator
        .query(QueryBy::PaymentNo(response.payment_no.clone()))
        .await
        .unwrap();
    assert_eq!(again.payment.state(), Some(PaymentState::Paid));
    assert_eq!(again.payment.updated_at, view.payment.updated_at);
}

#[tokio::test]
async fn test_full_refund_flow() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 4, dec!(200.00)).await;
    let order = h
        .orders
        .create(
            7006,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(200.00),
            }],
        )
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(200.00)))
        .await
        .unwrap();
    let params =
        MockProvider::signed_callback(&response.payment_no, dec!(200.00), "ntf-ref", Utc::now());
    h.orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();

    // Refund more than paid is rejected
    let err = h
        .orchestrator
        .refund(RefundRequest {
            payment_id: response.payment_id,
            refund_amount: dec!(200.01),
            reason: "customer".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::RefundExceedsPaid { .. }));

    // Exact remaining amount refunds fully
    let refund = h
        .orchestrator
        .refund(RefundRequest {
            payment_id: response.payment_id,
            refund_amount: dec!(200.00),
            reason: "customer".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(refund.status, "SUCCESS");

    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Refunded));

    let orders = h.orders.clone();
    let order_id = order.id;
    assert!(
        wait_for(|| {
            let orders = orders.clone();
            async move {
                orders
                    .get(order_id)
                    .await
                    .unwrap()
                    .map(|o| o.status() == Some(OrderStatus::Refunded))
                    .unwrap_or(false)
            }
        })
        .await,
        "order never refunded"
    );
    // Stock restored on full refund
    assert_eq!(product_stock(&h.pool, product_id).await, (4, 0));

    // A second refund attempt finds nothing refundable
    let err = h
        .orchestrator
        .refund(RefundRequest {
            payment_id: response.payment_id,
            refund_amount: dec!(1.00),
            reason: "again".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, PaymentError::NotRefundable(_)));
}

#[tokio::test]
async fn test_partial_refund_keeps_stock() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 2, dec!(100.00)).await;
    let order = h
        .orders
        .create(
            7007,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(100.00),
            }],
        )
        .await
        .unwrap();

    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(100.00)))
        .await
        .unwrap();
    let params =
        MockProvider::signed_callback(&response.payment_no, dec!(100.00), "ntf-part", Utc::now());
    h.orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();

    let refund = h
        .orchestrator
        .refund(RefundRequest {
            payment_id: response.payment_id,
            refund_amount: dec!(40.00),
            reason: "partial".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(refund.status, "SUCCESS");

    // Payment stays paid, order stays paid, stock stays committed
    tokio::time::sleep(Duration::from_millis(100)).await;
    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paid));
    assert_eq!(
        h.payments.refunded_total(response.payment_id).await.unwrap(),
        dec!(40.00)
    );
    assert_eq!(product_stock(&h.pool, product_id).await, (1, 1));
}

#[tokio::test]
async fn test_query_repairs_interrupted_refund_flip() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 2, dec!(120.00)).await;
    let order = h
        .orders
        .create(
            7010,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(120.00),
            }],
        )
        .await
        .unwrap();
    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(120.00)))
        .await
        .unwrap();
    let params =
        MockProvider::signed_callback(&response.payment_no, dec!(120.00), "ntf-wedge", Utc::now());
    h.orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();

    // Simulate a full refund whose payment flip was interrupted: the
    // refund row is SUCCESS for the whole amount, the payment still paid
    let refund = h
        .payments
        .insert_refund(
            response.payment_id,
            &crate::core_types::external_no("REF"),
            dec!(120.00),
            "customer",
        )
        .await
        .unwrap();
    assert!(
        h.payments
            .set_refund_status(
                refund.id,
                super::models::RefundStatus::Pending,
                super::models::RefundStatus::Success,
            )
            .await
            .unwrap()
    );
    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paid));

    // Query reconciliation flips the stranded row
    let view = h
        .orchestrator
        .query(QueryBy::PaymentId(response.payment_id))
        .await
        .unwrap();
    assert_eq!(view.payment.state(), Some(PaymentState::Refunded));
    assert_eq!(view.refunded_amount, dec!(120.00));
}

#[tokio::test]
async fn test_replay_and_tamper_rejection() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 2, dec!(60.00)).await;
    let order = h
        .orders
        .create(
            7008,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(60.00),
            }],
        )
        .await
        .unwrap();
    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(60.00)))
        .await
        .unwrap();

    let notify_time = Utc::now();
    let params = MockProvider::signed_callback(
        &response.payment_no,
        dec!(60.00),
        "ntf-replay",
        notify_time,
    );
    h.orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap();

    // Exact bytes replayed 10 minutes later: stale timestamp
    let err = h
        .validator
        .validate_at(
            PaymentMethod::Alipay,
            &params,
            notify_time + chrono::Duration::minutes(10),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallbackError::StaleTimestamp { .. }));

    // Fresh timestamp but the old notify-id: replay, acknowledged silently
    let replay = MockProvider::signed_callback(
        &response.payment_no,
        dec!(60.00),
        "ntf-replay",
        Utc::now(),
    );
    let outcome = h
        .orchestrator
        .process_callback(PaymentMethod::Alipay, &replay)
        .await
        .unwrap();
    assert_eq!(outcome, CallbackOutcome::Ignored);

    // Tampered payload: signature rejection, payment state untouched
    let mut tampered = MockProvider::signed_callback(
        &response.payment_no,
        dec!(60.00),
        "ntf-tamper",
        Utc::now(),
    );
    tampered.insert("total_amount".to_string(), "0.01".to_string());
    let err = h
        .orchestrator
        .process_callback(PaymentMethod::Alipay, &tampered)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaymentError::Callback(CallbackError::BadSignature)
    ));
    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paid));
}

#[tokio::test]
async fn test_amount_mismatch_callback_rejected() {
    let Some(h) = harness().await else {
        eprintln!("Skipping test - database not available");
        return;
    };

    let product_id = seed_product(&h.pool, 2, dec!(80.00)).await;
    let order = h
        .orders
        .create(
            7009,
            &[NewOrderItem {
                product_id,
                sku_id: None,
                quantity: 1,
                price: dec!(80.00),
            }],
        )
        .await
        .unwrap();
    let response = h
        .orchestrator
        .create(create_request(order.id, dec!(80.00)))
        .await
        .unwrap();

    // Correctly signed but for the wrong amount
    let params = MockProvider::signed_callback(
        &response.payment_no,
        dec!(8.00),
        "ntf-amount",
        Utc::now(),
    );
    let err = h
        .orchestrator
        .process_callback(PaymentMethod::Alipay, &params)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PaymentError::Callback(CallbackError::AmountMismatch { .. })
    ));
    let payment = h.payments.get(response.payment_id).await.unwrap().unwrap();
    assert_eq!(payment.state(), Some(PaymentState::Paying));
}
