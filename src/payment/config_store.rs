//! Hot-reloadable per-method payment configuration.
//!
//! The `payment_configs` table is the persistent authority; this store is
//! the in-memory copy the hot path reads. Refresh never crashes the
//! process: an invalid or unreadable reload keeps the last good snapshot
//! and logs for alerting.

use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use sqlx::{PgPool, Row};
use std::sync::RwLock;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use super::models::PaymentMethod;

/// Default refresh cadence.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum ConfigStoreError {
    #[error("payment method {0} is not configured")]
    Unknown(PaymentMethod),
    #[error("payment method {0} is disabled")]
    Disabled(PaymentMethod),
    #[error("amount {amount} outside [{min}, {max}] for {method}")]
    AmountOutOfBounds {
        method: PaymentMethod,
        amount: Decimal,
        min: Decimal,
        max: Decimal,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Business configuration for one payment method.
#[derive(Debug, Clone)]
pub struct MethodConfig {
    pub method: PaymentMethod,
    pub enabled: bool,
    pub display_name: String,
    pub min_amount: Decimal,
    pub max_amount: Decimal,
    pub daily_max_amount: Decimal,
    pub daily_max_count: i64,
    /// Opaque credentials blob (JSON), consumed by the provider adapters
    pub credentials: Option<String>,
}

impl MethodConfig {
    pub fn defaults(method: PaymentMethod) -> Self {
        Self {
            method,
            enabled: true,
            display_name: method.as_str().to_string(),
            min_amount: Decimal::new(1, 2), // 0.01
            max_amount: Decimal::from(50_000),
            daily_max_amount: Decimal::from(200_000),
            daily_max_count: 100,
            credentials: None,
        }
    }
}

pub struct PaymentConfigStore {
    pool: PgPool,
    configs: RwLock<FxHashMap<PaymentMethod, MethodConfig>>,
}

impl PaymentConfigStore {
    /// Load the initial snapshot. An empty table is seeded with defaults
    /// for every known method so a fresh deployment is usable.
    pub async fn load(pool: PgPool) -> Result<Self, ConfigStoreError> {
        let store = Self {
            pool,
            configs: RwLock::new(FxHashMap::default()),
        };
        if store.fetch_all().await?.is_empty() {
            info!("payment_configs empty, seeding defaults");
            for method in PaymentMethod::ALL {
                store.persist(&MethodConfig::defaults(method)).await?;
            }
        }
        store.reload().await?;
        Ok(store)
    }

    async fn fetch_all(&self) -> Result<Vec<MethodConfig>, ConfigStoreError> {
        let rows = sqlx::query(
            "SELECT method, enabled, display_name, min_amount, max_amount,
                    daily_max_amount, daily_max_count, credentials
             FROM payment_configs",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut configs = Vec::with_capacity(rows.len());
        for row in rows {
            let method_id: i16 = row.get("method");
            let Some(method) = PaymentMethod::from_id(method_id) else {
                warn!(method_id, "ignoring payment_configs row with unknown method");
                continue;
            };
            configs.push(MethodConfig {
                method,
                enabled: row.get("enabled"),
                display_name: row.get("display_name"),
                min_amount: row.get("min_amount"),
                max_amount: row.get("max_amount"),
                daily_max_amount: row.get("daily_max_amount"),
                daily_max_count: row.get("daily_max_count"),
                credentials: row.get("credentials"),
            });
        }
        Ok(configs)
    }

    /// Re-read the table and atomically replace the in-memory snapshot.
    pub async fn reload(&self) -> Result<usize, ConfigStoreError> {
        let configs = self.fetch_all().await?;
        let count = configs.len();
        let mut map = FxHashMap::default();
        for config in configs {
            map.insert(config.method, config);
        }
        *self.configs.write().unwrap() = map;
        Ok(count)
    }

    pub fn get(&self, method: PaymentMethod) -> Option<MethodConfig> {
        self.configs.read().unwrap().get(&method).cloned()
    }

    pub fn is_enabled(&self, method: PaymentMethod) -> bool {
        self.configs
            .read()
            .unwrap()
            .get(&method)
            .map(|config| config.enabled)
            .unwrap_or(false)
    }

    /// Hot-path amount validation: method known, enabled, min ≤ amount ≤ max.
    pub fn validate_amount(
        &self,
        method: PaymentMethod,
        amount: Decimal,
    ) -> Result<MethodConfig, ConfigStoreError> {
        let config = self
            .get(method)
            .ok_or(ConfigStoreError::Unknown(method))?;
        if !config.enabled {
            return Err(ConfigStoreError::Disabled(method));
        }
        if amount < config.min_amount || amount > config.max_amount {
            return Err(ConfigStoreError::AmountOutOfBounds {
                method,
                amount,
                min: config.min_amount,
                max: config.max_amount,
            });
        }
        Ok(config)
    }

    /// Admin path: persist first, publish to memory after.
    pub async fn upsert(&self, config: MethodConfig) -> Result<(), ConfigStoreError> {
        self.persist(&config).await?;
        self.configs
            .write()
            .unwrap()
            .insert(config.method, config);
        Ok(())
    }

    pub async fn remove(&self, method: PaymentMethod) -> Result<(), ConfigStoreError> {
        sqlx::query("DELETE FROM payment_configs WHERE method = $1")
            .bind(method.id())
            .execute(&self.pool)
            .await?;
        self.configs.write().unwrap().remove(&method);
        Ok(())
    }

    async fn persist(&self, config: &MethodConfig) -> Result<(), ConfigStoreError> {
        sqlx::query(
            "INSERT INTO payment_configs
                 (method, enabled, display_name, min_amount, max_amount,
                  daily_max_amount, daily_max_count, credentials, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
             ON CONFLICT (method) DO UPDATE SET
                 enabled = EXCLUDED.enabled,
                 display_name = EXCLUDED.display_name,
                 min_amount = EXCLUDED.min_amount,
                 max_amount = EXCLUDED.max_amount,
                 daily_max_amount = EXCLUDED.daily_max_amount,
                 daily_max_count = EXCLUDED.daily_max_count,
                 credentials = EXCLUDED.credentials,
                 updated_at = NOW()",
        )
        .bind(config.method.id())
        .bind(config.enabled)
        .bind(&config.display_name)
        .bind(config.min_amount)
        .bind(config.max_amount)
        .bind(config.daily_max_amount)
        .bind(config.daily_max_count)
        .bind(&config.credentials)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Test/bootstrap hook: publish to memory only.
    pub fn publish_local(&self, config: MethodConfig) {
        self.configs
            .write()
            .unwrap()
            .insert(config.method, config);
    }

    /// Construct a store with no backing rows loaded (tests).
    pub fn empty(pool: PgPool) -> Self {
        Self {
            pool,
            configs: RwLock::new(FxHashMap::default()),
        }
    }
}

/// Background refresher. Reload failures keep the old snapshot.
pub async fn config_refresher(
    store: std::sync::Arc<PaymentConfigStore>,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    info!(interval_secs = interval.as_secs(), "Starting config refresher");
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                info!("Config refresher stopping");
                return;
            }
        }
        match store.reload().await {
            Ok(count) => info!(methods = count, "Payment config reloaded"),
            Err(e) => error!(error = %e, "Config reload failed, keeping old configuration"),
        }
    }
}
