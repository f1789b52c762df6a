//! mallx - Transactional Commerce Core
//!
//! Process wiring: load config, init logging, connect PostgreSQL, build
//! the component graph (explicit dependency injection, no hidden
//! singletons), start the background workers, wait for shutdown.
//!
//! ```text
//! ┌────────┐   ┌───────────┐   ┌──────────────┐   ┌────────────┐
//! │ Config │──▶│ DB + Pool │──▶│ Orchestrator │──▶│  Workers   │
//! │ (YAML) │   │ (schema)  │   │ + providers  │   │ (dispatch) │
//! └────────┘   └───────────┘   └──────────────┘   └────────────┘
//! ```

use anyhow::Context;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use mallx::callback::CallbackValidator;
use mallx::config::AppConfig;
use mallx::db::{Database, schema};
use mallx::dispatch::{
    DispatcherConfig, PgDeadLetterSink, SettlementHandler, SyncDispatcher,
};
use mallx::inventory::InventoryEngine;
use mallx::lock::LockManager;
use mallx::metrics::Metrics;
use mallx::order::OrderDb;
use mallx::payment::config_store::{self, PaymentConfigStore};
use mallx::payment::{ExpirySweeper, PaymentDb, PaymentMethod, PaymentOrchestrator};
use mallx::providers::{
    ProviderRegistry, alipay::AlipayProvider, balance::BalanceProvider,
    unionpay::UnionpayProvider, wechat::WechatProvider,
};

/// Metrics snapshot log cadence.
const METRICS_LOG_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

fn config_path() -> PathBuf {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("MALLX_CONFIG").ok())
        .unwrap_or_else(|| "config.yaml".to_string())
        .into()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let path = config_path();
    let config = AppConfig::load(&path)
        .with_context(|| format!("loading config from {}", path.display()))?;
    let _log_guard = mallx::logging::init_logging(&config.log);
    info!(environment = config.environment.as_str(), "Starting mallx");

    // === Storage ===
    let database = Database::connect(&config.database.url, config.database.max_connections)
        .await
        .context("connecting to PostgreSQL")?;
    schema::init_schema(database.pool())
        .await
        .context("initializing schema")?;
    let pool = database.pool().clone();

    // === Shared state ===
    let locks = Arc::new(LockManager::new());
    let metrics = Arc::new(Metrics::new());
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // === Domain components ===
    let payments = Arc::new(PaymentDb::new(pool.clone()));
    let orders = Arc::new(OrderDb::new(pool.clone()));
    let inventory = Arc::new(InventoryEngine::new(
        pool.clone(),
        locks.clone(),
        metrics.clone(),
    ));
    let configs = Arc::new(
        PaymentConfigStore::load(pool.clone())
            .await
            .context("loading payment configs")?,
    );

    let mut registry = ProviderRegistry::new();
    for (name, wire) in &config.methods {
        match name.parse::<PaymentMethod>() {
            Ok(PaymentMethod::Alipay) => {
                registry.register(Arc::new(AlipayProvider::new(wire.clone())))
            }
            Ok(PaymentMethod::Wechat) => {
                registry.register(Arc::new(WechatProvider::new(wire.clone())))
            }
            Ok(PaymentMethod::Unionpay) => {
                registry.register(Arc::new(UnionpayProvider::new(wire.clone())))
            }
            Ok(PaymentMethod::Balance) => {
                registry.register(Arc::new(BalanceProvider::new(pool.clone())))
            }
            Err(_) => anyhow::bail!("unknown payment method in config: {}", name),
        }
    }
    // The wallet method needs no wire config
    if registry.get(PaymentMethod::Balance).is_none() {
        registry.register(Arc::new(BalanceProvider::new(pool.clone())));
    }
    let registry = Arc::new(registry);
    info!(methods = ?registry.methods(), "Providers registered");

    let validator = Arc::new(CallbackValidator::new(
        payments.clone(),
        registry.clone(),
        config.callback.verify_signature,
    ));

    // === Sync dispatcher + workers ===
    let handler = Arc::new(SettlementHandler::new(
        pool.clone(),
        orders.clone(),
        inventory.clone(),
    ));
    let dead_letters = Arc::new(PgDeadLetterSink::new(pool.clone()));
    let dispatcher_config = DispatcherConfig {
        max_retries: config.callback.max_retries,
        retry_delay: std::time::Duration::from_secs(config.callback.retry_interval_secs),
        ..DispatcherConfig::default()
    };
    let (dispatcher, mut worker_handles) = SyncDispatcher::spawn(
        dispatcher_config,
        handler,
        dead_letters,
        metrics.clone(),
        shutdown_rx.clone(),
    );
    let dispatcher = Arc::new(dispatcher);

    let orchestrator = Arc::new(PaymentOrchestrator::new(
        pool.clone(),
        payments.clone(),
        orders.clone(),
        inventory.clone(),
        registry.clone(),
        configs.clone(),
        validator.clone(),
        dispatcher.clone(),
        locks.clone(),
        metrics.clone(),
    ));

    // === Background workers ===
    worker_handles.push(tokio::spawn(config_store::config_refresher(
        configs.clone(),
        config_store::REFRESH_INTERVAL,
        shutdown_rx.clone(),
    )));
    {
        let sweeper = ExpirySweeper::with_defaults(orchestrator.clone());
        let shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            sweeper.run(shutdown).await;
        }));
    }
    {
        let metrics = metrics.clone();
        let locks = locks.clone();
        let validator = validator.clone();
        let mut shutdown = shutdown_rx.clone();
        worker_handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(METRICS_LOG_INTERVAL) => {}
                    _ = shutdown.changed() => return,
                }
                locks.purge_expired();
                validator.purge_expired();
                let snapshot = metrics.snapshot();
                info!(
                    dispatched = snapshot.events_dispatched,
                    dead_lettered = snapshot.events_dead_lettered,
                    lock_hit_rate = ?snapshot.lock_hit_rate,
                    methods = snapshot.methods.len(),
                    "Metrics snapshot"
                );
                for method in &snapshot.methods {
                    info!(
                        method = %method.method,
                        created = method.created,
                        succeeded = method.succeeded,
                        failed = method.failed,
                        callbacks = method.callbacks,
                        p50_ms = ?method.p50_ms,
                        p99_ms = ?method.p99_ms,
                        "Method metrics"
                    );
                }
            }
        }));
    }

    info!("mallx started; waiting for shutdown signal");
    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;

    info!("Shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);
    for handle in worker_handles {
        let _ = handle.await;
    }
    info!("mallx stopped");
    Ok(())
}
