//! Durable event routing
//!
//! Producers publish raw JSON; the router validates it into an
//! [`EventEnvelope`], routes on its `type` field, and guarantees
//! at-least-once delivery: synchronous attempt first, then persisted
//! retries on a fixed delay table, then the dead-letter queue.

mod event;
mod router;

pub use event::{EventEnvelope, EventHandler, HandlerError, ValidationError};
pub use router::{
    EventRouter, PublishError, PublishOutcome, ReplayOutcome, RouterConfig, RouterError,
    SweepStats, ROUTER_WAKEUP_KEY,
};
