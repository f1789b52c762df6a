//! Payment provider adapters.
//!
//! Each adapter owns its provider's wire concerns: canonical parameter
//! ordering, signature algorithm, amount units, status vocabulary. The
//! orchestrator only ever sees the [`PaymentProvider`] trait and the core
//! status enum. Adding a provider is implementing the trait and registering
//! it.

pub mod alipay;
pub mod balance;
pub mod mock;
pub mod signing;
pub mod types;
pub mod unionpay;
pub mod wechat;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use sqlx::PgConnection;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::payment::PaymentMethod;
pub use types::{
    CallbackNotice, ProviderCreateRequest, ProviderCreateResponse, ProviderQueryResponse,
    ProviderRefundRequest, ProviderRefundResponse, ProviderTradeStatus,
};

#[derive(Debug, Error)]
pub enum ProviderError {
    /// Network-level failure; the operation may be retried (queries only).
    #[error("transient provider error: {0}")]
    Transient(String),
    /// Provider answered with a business rejection; retrying cannot help.
    #[error("provider rejected request: {0}")]
    Terminal(String),
    /// Callback payload did not parse as this provider's format.
    #[error("malformed callback: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        // Connectivity and timeouts are retryable; a well-formed HTTP error
        // response is a business answer
        if e.is_timeout() || e.is_connect() || e.is_request() {
            ProviderError::Transient(e.to_string())
        } else {
            ProviderError::Terminal(e.to_string())
        }
    }
}

/// One third-party payment channel.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    fn method(&self) -> PaymentMethod;

    /// Open a trade at the provider; returns opaque handoff data (QR URL,
    /// prepay id, redirect URL). Never retried by callers.
    async fn create_payment(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError>;

    /// Create-path entry point used by the orchestrator, which runs it
    /// inside the reservation transaction. External providers ignore the
    /// connection; a provider whose create itself moves funds (the wallet
    /// method) must apply that mutation on `conn` so it commits and rolls
    /// back with the reservation and the payment row.
    async fn create_payment_in_tx(
        &self,
        _conn: &mut PgConnection,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderCreateResponse, ProviderError> {
        self.create_payment(request).await
    }

    /// Poll the provider's view of a trade. Safe to retry.
    async fn query_payment(&self, payment_no: &str)
    -> Result<ProviderQueryResponse, ProviderError>;

    /// Close an unpaid trade at the provider so a late buyer cannot pay
    /// into a locally cancelled payment. Best-effort; providers without a
    /// close call rely on their own expiry.
    async fn close_payment(&self, _payment_no: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    /// Ask the provider to move money back.
    async fn refund(
        &self,
        request: &ProviderRefundRequest,
    ) -> Result<ProviderRefundResponse, ProviderError>;

    /// Recompute the callback signature over the canonical parameter set.
    fn verify_callback(&self, params: &BTreeMap<String, String>) -> bool;

    /// Normalize a raw callback parameter map into the core shape.
    fn parse_callback(
        &self,
        params: &BTreeMap<String, String>,
    ) -> Result<CallbackNotice, ProviderError>;
}

/// Method -> adapter lookup, fixed after process init.
pub struct ProviderRegistry {
    providers: FxHashMap<PaymentMethod, Arc<dyn PaymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, provider: Arc<dyn PaymentProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: PaymentMethod) -> Option<Arc<dyn PaymentProvider>> {
        self.providers.get(&method).cloned()
    }

    pub fn methods(&self) -> Vec<PaymentMethod> {
        let mut methods: Vec<PaymentMethod> = self.providers.keys().copied().collect();
        methods.sort_by_key(|m| m.id());
        methods
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::mock::MockProvider;

    #[test]
    fn test_registry_resolution() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(MockProvider::new(PaymentMethod::Alipay)));
        registry.register(Arc::new(MockProvider::new(PaymentMethod::Wechat)));

        assert!(registry.get(PaymentMethod::Alipay).is_some());
        assert!(registry.get(PaymentMethod::Unionpay).is_none());
        assert_eq!(
            registry.methods(),
            vec![PaymentMethod::Alipay, PaymentMethod::Wechat]
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(ProviderError::Transient("timeout".into()).is_transient());
        assert!(!ProviderError::Terminal("bad sign".into()).is_transient());
    }
}
