//! Orders and order items.
//!
//! Orders are created at checkout and only mutated by the payment flow:
//! the orchestrator and the sync dispatcher drive `status` and
//! `payment_status` along the permitted edges. Orders are never deleted.

pub mod db;
pub mod models;

pub use db::OrderDb;
pub use models::{Order, OrderItem, OrderPaymentStatus, OrderStatus};
