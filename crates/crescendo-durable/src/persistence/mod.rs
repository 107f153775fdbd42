//! Persistence for saga runs, the step ledger, pending events, and the
//! dead-letter queue
//!
//! Exactly four tables; no other durable core state. All operations are
//! single statements — correctness comes from idempotent replay, not from
//! transactions spanning steps.

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryDurableStore;
pub use postgres::PostgresDurableStore;
pub use store::{
    DeadLetterEvent, DurableStore, Pagination, PendingEvent, SagaRun, SagaStatus, StepRecord,
    StepState, StoreError,
};
