//! mallx - Transactional Commerce Core
//!
//! The subsystem that coordinates inventory reservation, the payment order
//! lifecycle across third-party providers, callback validation with
//! anti-replay guarantees, and event-driven order-state synchronization.
//!
//! # Modules
//!
//! - [`core_types`] - Shared id aliases and number generation
//! - [`config`] - Application configuration and environment rules
//! - [`db`] - PostgreSQL pool wrapper and schema
//! - [`lock`] - TTL locks with owner fencing
//! - [`inventory`] - Atomic stock deduction/restoration
//! - [`order`] - Order records and status transitions
//! - [`payment`] - Payment records, state machine, config store,
//!   orchestrator, expiry sweeper
//! - [`providers`] - Per-provider adapters and canonical signing
//! - [`callback`] - Callback validation and TTL seen-sets
//! - [`dispatch`] - Settlement event queue, workers, retry, dead letter
//! - [`security`] - Callback/admin gate and signed session tokens
//! - [`metrics`] - Per-method counters and latency sampling

pub mod core_types;

pub mod config;
pub mod logging;

pub mod callback;
pub mod db;
pub mod dispatch;
pub mod inventory;
pub mod lock;
pub mod metrics;
pub mod order;
pub mod payment;
pub mod providers;
pub mod security;

// Convenient re-exports at crate root
pub use callback::{CallbackError, CallbackValidator};
pub use config::AppConfig;
pub use db::Database;
pub use dispatch::{SyncDispatcher, SyncEvent, SyncEventType};
pub use inventory::{InventoryEngine, InventoryError, StockRequest};
pub use lock::LockManager;
pub use metrics::Metrics;
pub use order::OrderDb;
pub use payment::{
    CallbackOutcome, PaymentConfigStore, PaymentDb, PaymentError, PaymentMethod,
    PaymentOrchestrator, PaymentState,
};
pub use providers::{PaymentProvider, ProviderError, ProviderRegistry};
pub use security::SecurityGate;
