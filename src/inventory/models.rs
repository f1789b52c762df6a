//! Inventory row types and stock operation requests.

use crate::core_types::{ProductId, SkuId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Product listing status, stored as SMALLINT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum ProductStatus {
    Inactive = 0,
    Active = 1,
    Draft = 2,
}

impl ProductStatus {
    #[inline]
    pub fn id(&self) -> i16 {
        *self as i16
    }

    pub fn from_id(id: i16) -> Option<Self> {
        match id {
            0 => Some(ProductStatus::Inactive),
            1 => Some(ProductStatus::Active),
            2 => Some(ProductStatus::Draft),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Decimal,
    pub stock: i64,
    pub sold_count: i64,
    pub version: i64,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SKU stock is authoritative when an order item names one; the parent
/// product then only tracks aggregate sold_count.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ProductSku {
    pub id: SkuId,
    pub product_id: ProductId,
    pub price: Decimal,
    pub stock: i64,
    pub version: i64,
    pub status: i16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stock mutation request. `sku_id = None` targets the product row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRequest {
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub quantity: i64,
}

impl StockRequest {
    pub fn product(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            sku_id: None,
            quantity,
        }
    }

    pub fn sku(product_id: ProductId, sku_id: SkuId, quantity: i64) -> Self {
        Self {
            product_id,
            sku_id: Some(sku_id),
            quantity,
        }
    }

    /// Lock key for the authoritative stock row.
    pub fn lock_key(&self) -> String {
        match self.sku_id {
            Some(sku_id) => crate::lock::sku_key(sku_id),
            None => crate::lock::product_key(self.product_id),
        }
    }
}

/// Per-request outcome of a committed deduction/restoration.
#[derive(Debug, Clone, Serialize)]
pub struct StockResult {
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub quantity: i64,
    pub remaining_stock: i64,
}

/// Non-binding availability check result.
#[derive(Debug, Clone, Serialize)]
pub struct StockCheck {
    pub product_id: ProductId,
    pub sku_id: Option<SkuId>,
    pub requested: i64,
    pub available: i64,
    pub sufficient: bool,
}
