//! Bounded event queue, worker pool, retry worker, dead-letter tail.
//!
//! Publishers use non-blocking try-send and surface backpressure to the
//! caller. A failed handler re-queues the event with a growing delay;
//! after `max_retries` the event is persisted to the dead-letter table for
//! operator intervention and never retried automatically.
//!
//! There is no cross-payment ordering. Per-payment ordering holds because
//! the orchestrator serializes transitions under the settle lock before
//! emitting events.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::event::SyncEvent;
use super::handlers::HandlerError;
use crate::metrics::Metrics;

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_capacity: usize,
    pub workers: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub retry_scan_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            workers: 4,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            retry_scan_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("sync event queue is full")]
    QueueFull,
    #[error("dispatcher is shut down")]
    Closed,
}

/// Applies one event. Implementations must be idempotent.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &SyncEvent) -> Result<(), HandlerError>;
}

/// Terminal destination after retry exhaustion.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, event: &SyncEvent, error: &str);
}

/// Persists dead letters to `sync_dead_letters`.
pub struct PgDeadLetterSink {
    pool: PgPool,
}

impl PgDeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterSink for PgDeadLetterSink {
    async fn record(&self, event: &SyncEvent, error: &str) {
        let payload = event.payload.to_string();
        let result = sqlx::query(
            "INSERT INTO sync_dead_letters
                 (event_type, payment_id, order_id, user_id, payload, retry_count, error)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.event_type.as_str())
        .bind(event.payment_id)
        .bind(event.order_id)
        .bind(event.user_id)
        .bind(payload)
        .bind(event.retry_count as i32)
        .bind(error)
        .execute(&self.pool)
        .await;
        if let Err(e) = result {
            // Last resort: the event survives only in the error log
            error!(
                event_id = %event.id,
                event = %event.event_type,
                payment_id = event.payment_id,
                error = %e,
                "Failed to persist dead letter"
            );
        }
    }
}

/// Collects dead letters in memory (tests).
#[derive(Default)]
pub struct MemoryDeadLetterSink {
    pub events: Mutex<Vec<SyncEvent>>,
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, event: &SyncEvent, _error: &str) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub struct SyncDispatcher {
    sender: mpsc::Sender<SyncEvent>,
    metrics: Arc<Metrics>,
}

impl SyncDispatcher {
    /// Start the worker pool and retry worker. Handles exit on shutdown
    /// after draining their in-flight event.
    pub fn spawn(
        config: DispatcherConfig,
        handler: Arc<dyn EventHandler>,
        dead_letters: Arc<dyn DeadLetterSink>,
        metrics: Arc<Metrics>,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (sender, receiver) = mpsc::channel::<SyncEvent>(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let retry_pending: Arc<Mutex<Vec<SyncEvent>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::with_capacity(config.workers + 1);
        for worker_id in 0..config.workers {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                config.clone(),
                receiver.clone(),
                handler.clone(),
                dead_letters.clone(),
                retry_pending.clone(),
                metrics.clone(),
                shutdown.clone(),
            )));
        }
        handles.push(tokio::spawn(retry_loop(
            config,
            sender.clone(),
            retry_pending,
            shutdown,
        )));

        (Self { sender, metrics }, handles)
    }

    /// Non-blocking publish; a full queue is a backpressure error for the
    /// caller, never a silent drop.
    pub fn publish(&self, event: SyncEvent) -> Result<(), DispatchError> {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.metrics.record_dispatch();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(event = %event.event_type, payment_id = event.payment_id, "Sync queue full");
                Err(DispatchError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Closed),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    config: DispatcherConfig,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<SyncEvent>>>,
    handler: Arc<dyn EventHandler>,
    dead_letters: Arc<dyn DeadLetterSink>,
    retry_pending: Arc<Mutex<Vec<SyncEvent>>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(worker_id, "Sync worker started");
    loop {
        let event = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                event = receiver.recv() => event,
                _ = shutdown.changed() => None,
            }
        };
        let Some(mut event) = event else {
            info!(worker_id, "Sync worker stopping");
            return;
        };

        match handler.handle(&event).await {
            Ok(()) => {
                debug!(worker_id, event_id = %event.id, event = %event.event_type, "Event applied");
            }
            Err(e) => {
                event.retry_count += 1;
                if event.retry_count > config.max_retries {
                    error!(
                        event_id = %event.id,
                        event = %event.event_type,
                        payment_id = event.payment_id,
                        retries = event.retry_count - 1,
                        error = %e,
                        "Event retries exhausted, dead-lettering"
                    );
                    metrics.record_dead_letter();
                    dead_letters.record(&event, &e.to_string()).await;
                } else {
                    let delay = config.retry_delay * event.retry_count;
                    event.next_retry_at = Some(
                        Utc::now()
                            + chrono::Duration::from_std(delay)
                                .unwrap_or_else(|_| chrono::Duration::seconds(5)),
                    );
                    warn!(
                        event_id = %event.id,
                        event = %event.event_type,
                        retry = event.retry_count,
                        delay_secs = delay.as_secs(),
                        error = %e,
                        "Event failed, scheduling retry"
                    );
                    retry_pending.lock().unwrap().push(event);
                }
            }
        }
    }
}

/// Re-injects retry events whose `next_retry_at` has passed.
async fn retry_loop(
    config: DispatcherConfig,
    sender: mpsc::Sender<SyncEvent>,
    retry_pending: Arc<Mutex<Vec<SyncEvent>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.retry_scan_interval) => {}
            _ = shutdown.changed() => {
                info!("Retry worker stopping");
                return;
            }
        }

        let now = Utc::now();
        let due: Vec<SyncEvent> = {
            let mut pending = retry_pending.lock().unwrap();
            let (ready, later): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|event| event.next_retry_at.map(|at| at <= now).unwrap_or(true));
            *pending = later;
            ready
        };

        for event in due {
            if let Err(mpsc::error::TrySendError::Full(event)) = sender.try_send(event) {
                // Main queue saturated; keep waiting
                retry_pending.lock().unwrap().push(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::event::SyncEventType;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: u32,
    }

    impl CountingHandler {
        fn new(fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_first,
            }
        }
    }

    #[async_trait]
    impl EventHandler for CountingHandler {
        async fn handle(&self, _event: &SyncEvent) -> Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(HandlerError::Database(sqlx::Error::PoolClosed))
            } else {
                Ok(())
            }
        }
    }

    fn test_event() -> SyncEvent {
        SyncEvent::new(
            SyncEventType::PaymentSuccess,
            1,
            2,
            3,
            serde_json::json!({}),
        )
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            queue_capacity: 16,
            workers: 2,
            max_retries: 3,
            retry_delay: Duration::from_millis(10),
            retry_scan_interval: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_event_applied_once() {
        let handler = Arc::new(CountingHandler::new(0));
        let sink = Arc::new(MemoryDeadLetterSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handles) = SyncDispatcher::spawn(
            fast_config(),
            handler.clone(),
            sink.clone(),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        dispatcher.publish(test_event()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(sink.events.lock().unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let handler = Arc::new(CountingHandler::new(2));
        let sink = Arc::new(MemoryDeadLetterSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handles) = SyncDispatcher::spawn(
            fast_config(),
            handler.clone(),
            sink.clone(),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        dispatcher.publish(test_event()).unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Two failures, then success on the third delivery
        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(sink.events.lock().unwrap().is_empty());

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_dead_letter_after_exhaustion() {
        let handler = Arc::new(CountingHandler::new(u32::MAX));
        let sink = Arc::new(MemoryDeadLetterSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handles) = SyncDispatcher::spawn(
            fast_config(),
            handler.clone(),
            sink.clone(),
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        dispatcher.publish(test_event()).unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        // 1 initial + 3 retries, then dead-lettered
        assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
        let dead = sink.events.lock().unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].retry_count, 4);

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_backpressure_on_full_queue() {
        // No workers: nothing drains the queue
        let config = DispatcherConfig {
            queue_capacity: 1,
            workers: 0,
            ..fast_config()
        };
        let handler = Arc::new(CountingHandler::new(0));
        let sink = Arc::new(MemoryDeadLetterSink::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (dispatcher, handles) = SyncDispatcher::spawn(
            config,
            handler,
            sink,
            Arc::new(Metrics::new()),
            shutdown_rx,
        );

        dispatcher.publish(test_event()).unwrap();
        assert_eq!(
            dispatcher.publish(test_event()),
            Err(DispatchError::QueueFull)
        );

        shutdown_tx.send(true).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
