//! DurableStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Saga run not found
    #[error("saga run not found: {0}")]
    RunNotFound(String),

    /// Saga run already exists (callers treat this as "resume")
    #[error("saga run already exists: {0}")]
    RunAlreadyExists(String),

    /// Step ledger row not found
    #[error("step not found: {saga_id}/{step_name}")]
    StepNotFound { saga_id: String, step_name: String },

    /// Pending or dead-lettered event not found
    #[error("event not found: {0}")]
    EventNotFound(Uuid),

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Saga run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Steps are executing (or the saga is parked waiting on a retry)
    Running,

    /// All steps succeeded
    Completed,

    /// Terminally failed
    Failed,

    /// Rolling back previously succeeded steps
    Compensating,
}

impl SagaStatus {
    /// Whether the run can accept further step executions
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether the run has reached a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Compensating => write!(f, "compensating"),
        }
    }
}

/// One saga instance, keyed by its business id
#[derive(Debug, Clone)]
pub struct SagaRun {
    pub id: String,
    pub status: SagaStatus,
    pub params: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Point-of-no-return marker, set at most once
    pub fulfilled_at: Option<DateTime<Utc>>,

    /// Human-readable failure reason, set on terminal failure
    pub error: Option<String>,
}

/// Step ledger state
///
/// Legal transitions: `Pending -> {Succeeded, Failed}`,
/// `Failed -> Compensated`, `Succeeded -> Compensated`. A `Succeeded` row
/// is authoritative: its cached result is never overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Succeeded,
    Failed,
    Compensated,
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Compensated => write!(f, "compensated"),
        }
    }
}

/// One row of the step ledger, keyed by `(saga_id, step_name)`
///
/// `result` is the cached step output: `Some(value)` for a meaningful
/// result, `None` for a step that succeeded without producing a value.
/// "Never ran" is the absence of the row, not a sentinel inside it.
#[derive(Debug, Clone)]
pub struct StepRecord {
    pub saga_id: String,
    pub step_name: String,
    pub state: StepState,

    /// Number of execution attempts so far (1-based once the step ran)
    pub attempt: u32,

    pub result: Option<serde_json::Value>,

    /// Compensation payload captured on success (data only, never code)
    pub undo_payload: Option<serde_json::Value>,

    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// An event whose synchronous delivery failed, awaiting retry
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub id: Uuid,
    pub event: serde_json::Value,

    /// Wake-up retries performed so far (the synchronous attempt is not
    /// counted; a row only exists because that attempt failed)
    pub attempts: u32,

    pub next_retry_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// An event that exhausted its delivery retries
#[derive(Debug, Clone)]
pub struct DeadLetterEvent {
    pub id: Uuid,
    pub event: serde_json::Value,

    /// Last failure reason
    pub error: String,

    /// Total attempt count at the time of dead-lettering
    pub attempts: u32,

    pub first_failed_at: DateTime<Utc>,
    pub last_failed_at: DateTime<Utc>,

    /// Retention cutoff; rows past this are eligible for purging
    pub expires_at: DateTime<Utc>,
}

/// Pagination parameters for the administrative surface
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: u32,
    pub limit: u32,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 100,
        }
    }
}

/// Store for saga runs, the step ledger, pending events, and dead letters
///
/// Implementations must be thread-safe. Every mutation must be committed
/// before the engine reports success to a caller — after a crash the
/// engine resumes purely from these tables.
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    // =========================================================================
    // Saga Run Operations
    // =========================================================================

    /// Create a new saga run in `Running` state
    ///
    /// Fails with [`StoreError::RunAlreadyExists`] if the id is taken, so
    /// callers can distinguish "started" from "resume".
    async fn create_run(&self, saga_id: &str, params: serde_json::Value)
        -> Result<(), StoreError>;

    /// Fetch a saga run
    async fn get_run(&self, saga_id: &str) -> Result<SagaRun, StoreError>;

    /// Update run status (and failure reason, for terminal failures)
    ///
    /// Always touches `updated_at`. Safe to call on an already-terminal
    /// run.
    async fn update_run_status(
        &self,
        saga_id: &str,
        status: SagaStatus,
        error: Option<String>,
    ) -> Result<(), StoreError>;

    /// Set the point-of-no-return marker
    ///
    /// Idempotent: the first call wins, later calls keep the original
    /// timestamp.
    async fn mark_fulfilled(&self, saga_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Step Ledger Operations
    // =========================================================================

    /// Fetch a step ledger row, if the step ever ran
    async fn get_step(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError>;

    /// Record the start of an execution attempt
    ///
    /// Inserts or updates the row with `state = Pending` and an
    /// incremented attempt counter. Returns the new attempt number.
    async fn begin_step_attempt(&self, saga_id: &str, step_name: &str)
        -> Result<u32, StoreError>;

    /// Record step success with its cached result and undo payload
    ///
    /// Clears `last_error` and `next_retry_at`. If the row is already
    /// `Succeeded` this is a no-op: the original cached output stands.
    async fn record_step_success(
        &self,
        saga_id: &str,
        step_name: &str,
        result: Option<serde_json::Value>,
        undo_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Record a retryable failure and when the step should run again
    async fn record_step_retry(
        &self,
        saga_id: &str,
        step_name: &str,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError>;

    /// Record a terminal step failure
    async fn record_step_failure(
        &self,
        saga_id: &str,
        step_name: &str,
        last_error: &str,
    ) -> Result<(), StoreError>;

    /// Mark a step's undo as applied
    async fn record_step_compensated(&self, saga_id: &str, step_name: &str)
        -> Result<(), StoreError>;

    /// List all ledger rows for a saga (admin/debugging)
    async fn list_steps(&self, saga_id: &str) -> Result<Vec<StepRecord>, StoreError>;

    // =========================================================================
    // Pending Event Operations
    // =========================================================================

    /// Persist an event whose synchronous delivery failed
    async fn insert_pending_event(&self, event: PendingEvent) -> Result<(), StoreError>;

    /// Events due for retry (`next_retry_at <= now`), ascending by
    /// `next_retry_at`
    async fn due_pending_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingEvent>, StoreError>;

    /// Update retry bookkeeping after a failed delivery attempt
    async fn update_pending_event(
        &self,
        id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError>;

    /// Remove a pending event (delivered, dead-lettered, or corrupt)
    async fn delete_pending_event(&self, id: Uuid) -> Result<(), StoreError>;

    /// Number of events awaiting retry
    async fn pending_event_count(&self) -> Result<u64, StoreError>;

    /// Pending events ordered by `next_retry_at`, paginated
    async fn list_pending_events(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<PendingEvent>, StoreError>;

    /// Earliest `next_retry_at` across all pending events, for timer
    /// coalescing
    async fn earliest_pending_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    // =========================================================================
    // Dead Letter Queue Operations
    // =========================================================================

    /// Insert a dead-lettered event
    async fn insert_dead_letter(&self, entry: DeadLetterEvent) -> Result<(), StoreError>;

    /// Fetch a dead-lettered event
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterEvent, StoreError>;

    /// Update the failure reason after an unsuccessful replay
    async fn update_dead_letter_error(
        &self,
        id: Uuid,
        error: &str,
        last_failed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Remove a dead-lettered event (replay success or admin delete)
    async fn delete_dead_letter(&self, id: Uuid) -> Result<(), StoreError>;

    /// Dead letters ordered most-recent-first, paginated
    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEvent>, StoreError>;

    /// Number of dead-lettered events
    async fn dead_letter_count(&self) -> Result<u64, StoreError>;

    /// Delete dead letters whose retention window has passed
    ///
    /// Returns the number of rows removed.
    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;
}
