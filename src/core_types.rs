//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.
//! They provide semantic meaning and enable future type evolution.

/// User ID - globally unique, immutable after assignment.
pub type UserId = i64;

/// Product ID - primary key of the products table.
pub type ProductId = i64;

/// SKU ID - primary key of the product_skus table.
///
/// When an order item names a SKU, the SKU row is the authoritative
/// stock source; the parent product only tracks aggregate sold_count.
pub type SkuId = i64;

/// Order ID - primary key of the orders table.
pub type OrderId = i64;

/// Payment ID - primary key of the payments table.
pub type PaymentId = i64;

/// Refund ID - primary key of the payment_refunds table.
pub type RefundId = i64;

/// Generate an external-unique number with the given prefix (e.g. "PAY").
///
/// ULID bodies are monotonic-ish per millisecond, so numbers sort roughly
/// by creation time, which keeps provider dashboards readable.
pub fn external_no(prefix: &str) -> String {
    format!("{}{}", prefix, ulid::Ulid::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_no_format() {
        let a = external_no("PAY");
        let b = external_no("PAY");
        assert!(a.starts_with("PAY"));
        assert_ne!(a, b);
        // ULID body is always 26 chars
        assert_eq!(a.len(), 3 + 26);
    }
}
