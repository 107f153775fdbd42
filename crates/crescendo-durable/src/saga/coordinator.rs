//! Saga coordinator
//!
//! One coordinator instance drives one saga id. The host substrate
//! guarantees single-threaded semantics per id, so the coordinator holds
//! no locks of its own: all durable state lives in the store, and the only
//! in-memory state is the compensation stack for the current invocation.
//!
//! A resumed saga rebuilds that stack implicitly: the caller re-runs the
//! same saga function, replayed steps short-circuit to their cached
//! results, and each `execute_step_with_rollback` re-registers its
//! compensation with the undo payload read back from the ledger.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{info, instrument, warn};

use crate::persistence::{DurableStore, SagaStatus, StepState, StoreError};
use crate::retry::StepBackoff;
use crate::scheduler::{SchedulerError, WakeupScheduler};

use super::step::{CompensationFn, StepError, StepOptions, StepOutcome, StepOutput};

/// Errors from saga engine operations
///
/// These are infrastructure failures. Domain outcomes — a step retrying or
/// terminally failing — are values inside [`StepOutcome`], never errors.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The saga is not accepting step executions
    #[error("saga {saga_id} is not running (status: {status})")]
    NotRunning {
        saga_id: String,
        status: SagaStatus,
    },
}

/// Outcome of initializing a saga
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SagaInit {
    /// A new run was created and is now running
    Started,

    /// A run with this id already exists — resume, don't reinitialize
    AlreadyExists,
}

/// Configuration for a saga coordinator
#[derive(Debug, Clone, Default)]
pub struct SagaConfig {
    /// Backoff policy for step retries
    pub backoff: StepBackoff,

    /// Step whose success implies the point of no return
    ///
    /// Crash-safety fallback: if the side effect committed but the process
    /// died before writing the `fulfilled_at` marker, this step's ledger
    /// row still gates compensation.
    pub ponr_step: Option<String>,
}

impl SagaConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backoff policy
    pub fn with_backoff(mut self, backoff: StepBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Designate the point-of-no-return step
    pub fn with_ponr_step(mut self, step_name: impl Into<String>) -> Self {
        self.ponr_step = Some(step_name.into());
        self
    }
}

/// A compensation that could not be applied
#[derive(Debug, Clone)]
pub struct CompensationFailure {
    pub step_name: String,
    pub error: StepError,
}

struct CompensationEntry {
    step_name: String,
    undo_payload: Option<serde_json::Value>,
    compensate: CompensationFn,
}

/// Drives one saga: step sequencing, replay, retries, compensation
///
/// # Example
///
/// ```ignore
/// use crescendo_durable::prelude::*;
///
/// let mut saga = SagaCoordinator::new("redemption-r1", store, scheduler, SagaConfig::default());
///
/// saga.init_saga(serde_json::json!({"code": "XYZ"})).await?;
///
/// let granted = saga
///     .execute_step("grant-license", || async {
///         Ok(StepOutput::new(42u64))
///     }, StepOptions::default())
///     .await?;
/// ```
pub struct SagaCoordinator<S: DurableStore> {
    saga_id: String,
    store: Arc<S>,
    scheduler: Arc<dyn WakeupScheduler>,
    config: SagaConfig,

    /// Cached run status; refreshed on init and terminal transitions
    status: Option<SagaStatus>,

    /// Compensation stack for the current invocation only (never persisted)
    compensations: Vec<CompensationEntry>,
}

impl<S: DurableStore> SagaCoordinator<S> {
    /// Create a coordinator for the given saga id
    pub fn new(
        saga_id: impl Into<String>,
        store: Arc<S>,
        scheduler: Arc<dyn WakeupScheduler>,
        config: SagaConfig,
    ) -> Self {
        Self {
            saga_id: saga_id.into(),
            store,
            scheduler,
            config,
            status: None,
            compensations: Vec::new(),
        }
    }

    /// The saga's business id
    pub fn saga_id(&self) -> &str {
        &self.saga_id
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Initialize the saga run
    ///
    /// Idempotent at the call site: an existing run yields
    /// [`SagaInit::AlreadyExists`] and the caller resumes instead of
    /// reinitializing.
    #[instrument(skip(self, params), fields(saga_id = %self.saga_id))]
    pub async fn init_saga(&mut self, params: serde_json::Value) -> Result<SagaInit, EngineError> {
        match self.store.create_run(&self.saga_id, params).await {
            Ok(()) => {
                self.status = Some(SagaStatus::Running);
                info!(saga_id = %self.saga_id, "saga started");
                Ok(SagaInit::Started)
            }
            Err(StoreError::RunAlreadyExists(_)) => {
                let run = self.store.get_run(&self.saga_id).await?;
                self.status = Some(run.status);
                info!(saga_id = %self.saga_id, status = %run.status, "saga already exists, resuming");
                Ok(SagaInit::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Execute one named step, with idempotent replay
    ///
    /// If the ledger already records this step as succeeded, the cached
    /// result is returned and the handler is not invoked. Otherwise the
    /// handler runs, raced against the step timeout.
    pub async fn execute_step<T, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        opts: StepOptions,
    ) -> Result<StepOutcome<T>, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput<T>, StepError>>,
    {
        let (outcome, _undo) = self.run_step(name, handler, &opts).await?;
        Ok(outcome)
    }

    /// Execute one named step and register its compensation
    ///
    /// Identical to [`execute_step`](Self::execute_step); on success
    /// (fresh or replayed) the compensation is pushed onto the in-memory
    /// stack with the persisted undo payload.
    pub async fn execute_step_with_rollback<T, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        compensate: CompensationFn,
        opts: StepOptions,
    ) -> Result<StepOutcome<T>, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput<T>, StepError>>,
    {
        let (outcome, undo_payload) = self.run_step(name, handler, &opts).await?;

        if outcome.is_completed() {
            self.compensations.push(CompensationEntry {
                step_name: name.to_string(),
                undo_payload,
                compensate,
            });
        }

        Ok(outcome)
    }

    /// Mark the point of no return
    ///
    /// Set at most once; safe to call again.
    #[instrument(skip(self), fields(saga_id = %self.saga_id))]
    pub async fn mark_point_of_no_return(&self) -> Result<(), EngineError> {
        self.store.mark_fulfilled(&self.saga_id).await?;
        info!(saga_id = %self.saga_id, "point of no return reached");
        Ok(())
    }

    /// Whether the point of no return has been reached
    ///
    /// True if the marker is set, or if the designated PONR step's ledger
    /// row is succeeded (the marker write may have been lost to a crash).
    pub async fn is_point_of_no_return_reached(&self) -> Result<bool, EngineError> {
        let run = self.store.get_run(&self.saga_id).await?;
        if run.fulfilled_at.is_some() {
            return Ok(true);
        }

        if let Some(ponr_step) = &self.config.ponr_step {
            if let Some(record) = self.store.get_step(&self.saga_id, ponr_step).await? {
                return Ok(record.state == StepState::Succeeded);
            }
        }

        Ok(false)
    }

    /// Run every registered compensation in reverse registration order
    ///
    /// Transitions the run to `Compensating` first. The sweep never aborts
    /// early: failures are collected and returned for logging/alerting,
    /// successes mark their step `Compensated`.
    #[instrument(skip(self), fields(saga_id = %self.saga_id))]
    pub async fn compensate_all(&mut self) -> Result<Vec<CompensationFailure>, EngineError> {
        self.store
            .update_run_status(&self.saga_id, SagaStatus::Compensating, None)
            .await?;
        self.status = Some(SagaStatus::Compensating);

        let entries = std::mem::take(&mut self.compensations);
        let mut failures = Vec::new();

        for entry in entries.into_iter().rev() {
            match (entry.compensate)(entry.undo_payload.clone()).await {
                Ok(()) => {
                    self.store
                        .record_step_compensated(&self.saga_id, &entry.step_name)
                        .await?;
                    info!(saga_id = %self.saga_id, step = %entry.step_name, "step compensated");
                }
                Err(error) => {
                    warn!(
                        saga_id = %self.saga_id,
                        step = %entry.step_name,
                        %error,
                        "compensation failed, continuing sweep"
                    );
                    failures.push(CompensationFailure {
                        step_name: entry.step_name,
                        error,
                    });
                }
            }
        }

        Ok(failures)
    }

    /// Terminal transition to `Completed`
    #[instrument(skip(self), fields(saga_id = %self.saga_id))]
    pub async fn complete(&mut self) -> Result<(), EngineError> {
        self.store
            .update_run_status(&self.saga_id, SagaStatus::Completed, None)
            .await?;
        self.status = Some(SagaStatus::Completed);
        info!(saga_id = %self.saga_id, "saga completed");
        Ok(())
    }

    /// Terminal transition to `Failed` with a human-readable reason
    #[instrument(skip(self), fields(saga_id = %self.saga_id))]
    pub async fn fail(&mut self, reason: impl Into<String> + std::fmt::Debug) -> Result<(), EngineError> {
        let reason = reason.into();
        self.store
            .update_run_status(&self.saga_id, SagaStatus::Failed, Some(reason.clone()))
            .await?;
        self.status = Some(SagaStatus::Failed);
        warn!(saga_id = %self.saga_id, %reason, "saga failed");
        Ok(())
    }

    /// Current run status, read fresh from the store
    pub async fn status(&mut self) -> Result<SagaStatus, EngineError> {
        let run = self.store.get_run(&self.saga_id).await?;
        self.status = Some(run.status);
        Ok(run.status)
    }

    /// Whether the run accepts further step executions
    pub async fn is_running(&mut self) -> Result<bool, EngineError> {
        Ok(self.status().await?.is_running())
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Core step execution; returns the outcome plus the undo payload that
    /// belongs to a completed step (fresh or read back from the ledger)
    async fn run_step<T, F, Fut>(
        &mut self,
        name: &str,
        handler: F,
        opts: &StepOptions,
    ) -> Result<(StepOutcome<T>, Option<serde_json::Value>), EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<StepOutput<T>, StepError>>,
    {
        self.ensure_running().await?;

        // Replay check: a succeeded row is authoritative
        if let Some(record) = self.store.get_step(&self.saga_id, name).await? {
            if record.state == StepState::Succeeded {
                let cached = record.result.clone().unwrap_or(serde_json::Value::Null);
                let value: T = serde_json::from_value(cached)?;
                info!(saga_id = %self.saga_id, step = name, "replaying cached step result");
                return Ok((StepOutcome::Completed(value), record.undo_payload));
            }
        }

        let attempt = self.store.begin_step_attempt(&self.saga_id, name).await?;

        // Cooperative race: the loser's side effect is not cancelled
        let handler_result = match tokio::time::timeout(opts.timeout, handler()).await {
            Ok(result) => result,
            Err(_) => Err(StepError::retryable(format!(
                "step timed out after {:?}",
                opts.timeout
            ))),
        };

        match handler_result {
            Ok(output) => {
                let result_json = serde_json::to_value(&output.result)?;
                // A JSON-null result is stored as "no meaningful value"
                let stored = if result_json.is_null() {
                    None
                } else {
                    Some(result_json)
                };

                self.store
                    .record_step_success(&self.saga_id, name, stored, output.undo_payload.clone())
                    .await?;

                info!(saga_id = %self.saga_id, step = name, attempt, "step succeeded");
                Ok((StepOutcome::Completed(output.result), output.undo_payload))
            }
            Err(error) if error.retryable && attempt < opts.max_retries => {
                let delay = self.config.backoff.delay_for_attempt(attempt);
                let next_retry_at = Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600));

                self.store
                    .record_step_retry(&self.saga_id, name, next_retry_at, &error.message)
                    .await?;
                self.scheduler.schedule(&self.saga_id, next_retry_at).await?;

                warn!(
                    saga_id = %self.saga_id,
                    step = name,
                    attempt,
                    %error,
                    ?delay,
                    "step failed, retry scheduled"
                );
                Ok((
                    StepOutcome::Retrying {
                        attempt,
                        next_retry_at,
                    },
                    None,
                ))
            }
            Err(error) => {
                self.store
                    .record_step_failure(&self.saga_id, name, &error.message)
                    .await?;

                warn!(
                    saga_id = %self.saga_id,
                    step = name,
                    attempt,
                    %error,
                    "step failed terminally"
                );
                Ok((StepOutcome::Failed(error), None))
            }
        }
    }

    /// Re-entrancy gate: only a `Running` saga accepts step executions
    async fn ensure_running(&mut self) -> Result<(), EngineError> {
        let status = match self.status {
            Some(status) => status,
            None => {
                let run = self.store.get_run(&self.saga_id).await?;
                self.status = Some(run.status);
                run.status
            }
        };

        if !status.is_running() {
            return Err(EngineError::NotRunning {
                saga_id: self.saga_id.clone(),
                status,
            });
        }
        Ok(())
    }
}
