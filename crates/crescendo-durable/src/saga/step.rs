//! Step handler contracts

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Error type for step failures
///
/// The `retryable` flag is the failure classification: the handler author
/// decides which of their errors are transient. The engine retries only
/// retryable errors, and only while attempts remain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepError {
    /// Error message
    pub message: String,

    /// Error type/code for programmatic handling
    pub error_type: Option<String>,

    /// Whether this error is retryable
    pub retryable: bool,
}

impl StepError {
    /// Create a new retryable error
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: true,
        }
    }

    /// Create a non-retryable error
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: None,
            retryable: false,
        }
    }

    /// Set the error type
    pub fn with_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for StepError {}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Successful step output: the result plus an optional undo payload
///
/// The undo payload is data only (never code); it is persisted alongside
/// the result and handed back to the compensation function if the saga
/// later rolls back.
#[derive(Debug, Clone)]
pub struct StepOutput<T> {
    pub result: T,
    pub undo_payload: Option<serde_json::Value>,
}

impl<T> StepOutput<T> {
    /// Step output with no undo payload
    pub fn new(result: T) -> Self {
        Self {
            result,
            undo_payload: None,
        }
    }

    /// Attach an undo payload
    pub fn with_undo(mut self, undo_payload: serde_json::Value) -> Self {
        self.undo_payload = Some(undo_payload);
        self
    }
}

/// Options for step execution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepOptions {
    /// Maximum time for one handler invocation
    ///
    /// The race is cooperative: a timed-out handler's side effect may
    /// still complete later, unobserved by the engine.
    #[serde(with = "duration_millis")]
    pub timeout: Duration,

    /// Maximum number of attempts (including the first)
    pub max_retries: u32,
}

impl Default for StepOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
        }
    }
}

impl StepOptions {
    /// Set the per-attempt timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the attempt cap
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Three-way outcome of a step execution
///
/// `Retrying` is not a failure: the engine has persisted the retry and
/// scheduled a wake-up, and the caller must park the saga without running
/// compensation.
#[derive(Debug, Clone)]
pub enum StepOutcome<T> {
    /// Step succeeded (freshly, or replayed from the ledger)
    Completed(T),

    /// Step failed retryably; a wake-up is scheduled
    Retrying {
        /// Attempts made so far
        attempt: u32,

        /// When the step will run again
        next_retry_at: DateTime<Utc>,
    },

    /// Step failed terminally (non-retryable error or retries exhausted)
    Failed(StepError),
}

impl<T> StepOutcome<T> {
    /// The completed value, if any
    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, Self::Retrying { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// Compensation function: undoes one succeeded step
///
/// Takes the undo payload persisted when the step succeeded. Failures are
/// collected by [`compensate_all`](super::SagaCoordinator::compensate_all),
/// never re-thrown to abort the sweep.
pub type CompensationFn = Arc<
    dyn Fn(Option<serde_json::Value>) -> BoxFuture<'static, Result<(), StepError>>
        + Send
        + Sync,
>;

/// Box an async closure into a [`CompensationFn`]
pub fn compensation<F, Fut>(f: F) -> CompensationFn
where
    F: Fn(Option<serde_json::Value>) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), StepError>> + Send + 'static,
{
    Arc::new(move |undo| Box::pin(f(undo)))
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
