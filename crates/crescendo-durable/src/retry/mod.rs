//! Backoff policies shared by the saga engine and the event router
//!
//! Two deliberately different policies:
//! - saga steps use capped exponential backoff
//! - event retries use a short fixed table, clamped at the last entry
//!
//! Both are pure functions of the attempt number. All scheduling state
//! lives in the store, never in these types.

mod backoff;

pub use backoff::{EventBackoff, StepBackoff};
