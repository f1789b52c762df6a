//! Expiry sweeper.
//!
//! Background worker that scans for in-flight payments whose expiry window
//! has passed and resolves them through the reconciliation path: a
//! provider-side success still settles, anything else cancels and releases
//! the reservation.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

use super::models::QueryBy;
use super::orchestrator::PaymentOrchestrator;

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan for expired payments
    pub scan_interval: Duration,
    /// Maximum payments to resolve per scan
    pub batch_size: i64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(60),
            batch_size: 100,
        }
    }
}

pub struct ExpirySweeper {
    orchestrator: Arc<PaymentOrchestrator>,
    config: SweeperConfig,
}

impl ExpirySweeper {
    pub fn new(orchestrator: Arc<PaymentOrchestrator>, config: SweeperConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    pub fn with_defaults(orchestrator: Arc<PaymentOrchestrator>) -> Self {
        Self::new(orchestrator, SweeperConfig::default())
    }

    /// Run until shutdown, scanning on a fixed interval.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            scan_interval_secs = self.config.scan_interval.as_secs(),
            batch_size = self.config.batch_size,
            "Starting expiry sweeper"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.scan_interval) => {}
                _ = shutdown.changed() => {
                    info!("Expiry sweeper stopping");
                    return;
                }
            }
            if let Err(e) = self.sweep_once().await {
                error!(error = %e, "Expiry sweep failed");
            }
        }
    }

    /// One scan cycle. Returns how many payments were looked at.
    pub async fn sweep_once(&self) -> Result<usize, super::orchestrator::PaymentError> {
        let expired = self
            .orchestrator
            .payments()
            .find_expired(self.config.batch_size)
            .await?;

        if expired.is_empty() {
            debug!("No expired payments found");
            return Ok(0);
        }
        info!(count = expired.len(), "Resolving expired payments");

        let mut resolved = 0;
        for payment in &expired {
            // query() reconciles: provider success settles, otherwise the
            // elapsed expiry cancels and restores stock via the dispatcher
            match self
                .orchestrator
                .query(QueryBy::PaymentId(payment.id))
                .await
            {
                Ok(view) => {
                    debug!(
                        payment_no = %payment.payment_no,
                        status = view.payment.status,
                        "Expired payment resolved"
                    );
                    resolved += 1;
                }
                Err(e) => {
                    error!(
                        payment_no = %payment.payment_no,
                        error = %e,
                        "Failed to resolve expired payment"
                    );
                }
            }
        }
        Ok(resolved)
    }
}
