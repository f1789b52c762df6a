//! Event-driven settlement sync.
//!
//! The orchestrator emits typed events after payment transitions; a bounded
//! queue and worker pool apply them to orders and stock with bounded retry
//! and a persisted dead-letter tail.

pub mod dispatcher;
pub mod event;
pub mod handlers;

pub use dispatcher::{
    DeadLetterSink, DispatchError, DispatcherConfig, EventHandler, MemoryDeadLetterSink,
    PgDeadLetterSink, SyncDispatcher,
};
pub use event::{SyncEvent, SyncEventType};
pub use handlers::SettlementHandler;
