//! Payment domain: records, state machine, config store, orchestrator.

pub mod config_store;
pub mod db;
#[cfg(test)]
mod integration_tests;
pub mod models;
pub mod orchestrator;
pub mod state;
pub mod sweeper;

pub use config_store::{ConfigStoreError, MethodConfig, PaymentConfigStore};
pub use db::{NewPayment, PaymentDb, SettleUpdate};
pub use models::{
    CreatePaymentRequest, CreatePaymentResponse, Payment, PaymentLog, PaymentMethod,
    PaymentRefund, QueryBy, RefundRequest, RefundResponse, RefundStatus,
};
pub use orchestrator::{CallbackOutcome, PaymentError, PaymentOrchestrator, PaymentView};
pub use state::PaymentState;
pub use sweeper::{ExpirySweeper, SweeperConfig};
