//! # Crescendo Durable Engine
//!
//! A PostgreSQL-backed saga engine and durable event router for reliable,
//! crash-resumable business transactions.
//!
//! ## Features
//!
//! - **Idempotent step replay**: every step execution is recorded in a
//!   ledger; re-running a saga replays cached results instead of repeating
//!   side effects
//! - **Automatic retries**: capped exponential backoff for saga steps,
//!   fixed delay tables for event delivery
//! - **Compensation**: sagas register undo functions and roll back in
//!   reverse order, gated by a point-of-no-return marker
//! - **At-least-once events**: failed deliveries are persisted, retried on
//!   a coalesced timer, and dead-lettered for operator replay
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      SagaCoordinator                         │
//! │  (step sequencing, replay, retries, compensation)           │
//! └─────────────────────────────────────────────────────────────┘
//!            │                                  │
//!            ▼                                  ▼
//! ┌──────────────────────────┐   ┌──────────────────────────────┐
//! │       DurableStore        │   │        EventRouter           │
//! │  (PostgreSQL: saga_runs,  │◀──│  (sync delivery, retry       │
//! │   saga_steps, pending_    │   │   queue sweep, DLQ)          │
//! │   events, dead_letters)   │   └──────────────────────────────┘
//! └──────────────────────────┘                 │
//!            ▲                                  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WakeupScheduler                          │
//! │  (one replaceable timer per key; fires saga resumes and     │
//! │   the router's coalesced retry sweep)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use crescendo_durable::prelude::*;
//!
//! let mut saga = SagaCoordinator::new("redemption-r1", store, scheduler, SagaConfig::default());
//! saga.init_saga(json!({"code": "XK-42"})).await?;
//!
//! let license = saga
//!     .execute_step_with_rollback(
//!         "grant-license",
//!         || async { Ok(StepOutput::new(grant().await?).with_undo(json!({"code": "XK-42"}))) },
//!         compensation(|undo| async move { revoke(undo).await }),
//!         StepOptions::default(),
//!     )
//!     .await?;
//!
//! match license {
//!     StepOutcome::Completed(l) => { /* next step */ }
//!     StepOutcome::Retrying { .. } => { /* park; a wake-up is scheduled */ }
//!     StepOutcome::Failed(e) => { saga.compensate_all().await?; saga.fail(e.message).await?; }
//! }
//! ```

pub mod persistence;
pub mod retry;
pub mod router;
pub mod saga;
pub mod scheduler;

/// Prelude for common imports
pub mod prelude {
    pub use crate::persistence::{
        DeadLetterEvent, DurableStore, InMemoryDurableStore, Pagination, PendingEvent,
        PostgresDurableStore, SagaRun, SagaStatus, StepRecord, StepState, StoreError,
    };
    pub use crate::retry::{EventBackoff, StepBackoff};
    pub use crate::router::{
        EventEnvelope, EventHandler, EventRouter, HandlerError, PublishOutcome, RouterConfig,
    };
    pub use crate::saga::{
        compensation, CompensationFn, EngineError, SagaConfig, SagaCoordinator, SagaInit,
        StepError, StepOptions, StepOutcome, StepOutput,
    };
    pub use crate::scheduler::{TokioWakeupScheduler, WakeupScheduler};
}

// Re-export key types at crate root
pub use persistence::{
    DurableStore, InMemoryDurableStore, PostgresDurableStore, SagaStatus, StepState, StoreError,
};
pub use retry::{EventBackoff, StepBackoff};
pub use router::{
    EventEnvelope, EventHandler, EventRouter, HandlerError, PublishError, PublishOutcome,
    ReplayOutcome, RouterConfig, RouterError,
};
pub use saga::{
    compensation, CompensationFn, EngineError, SagaConfig, SagaCoordinator, SagaInit, StepError,
    StepOptions, StepOutcome, StepOutput,
};
pub use scheduler::{
    RecordingScheduler, SchedulerError, TokioWakeupScheduler, WakeupFn, WakeupScheduler,
};
