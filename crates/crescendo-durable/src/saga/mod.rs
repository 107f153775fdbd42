//! Saga execution engine
//!
//! A saga is a multi-step business transaction whose progress survives
//! process restarts. Steps are re-executable: a step that already
//! succeeded replays its cached result instead of running again, so the
//! whole saga function can simply be re-run from the top after a crash or
//! a scheduled retry.

mod coordinator;
mod step;

pub use coordinator::{
    CompensationFailure, EngineError, SagaConfig, SagaCoordinator, SagaInit,
};
pub use step::{compensation, CompensationFn, StepError, StepOptions, StepOutcome, StepOutput};
