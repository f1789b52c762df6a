//! Inventory: products, SKUs, and atomic stock mutation.
//!
//! Stock is mutated only through [`InventoryEngine`], which layers a coarse
//! per-resource lock over a version-guarded conditional update.

pub mod engine;
pub mod models;

pub use engine::{InventoryEngine, InventoryError};
pub use models::{Product, ProductSku, ProductStatus, StockCheck, StockRequest, StockResult};
