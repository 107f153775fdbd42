//! Durable event router
//!
//! Delivery is attempted synchronously at publish time. On failure the
//! event is persisted to the retry queue and swept by a single coalesced
//! wake-up timer; events that exhaust their attempts land in the
//! dead-letter queue for operator replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    DeadLetterEvent, DurableStore, Pagination, PendingEvent, StoreError,
};
use crate::retry::EventBackoff;
use crate::scheduler::{SchedulerError, WakeupScheduler};

use super::event::{EventEnvelope, EventHandler, ValidationError};

/// Scheduler key for the router's coalesced retry timer
///
/// All pending events share one timer, re-armed for the earliest
/// `next_retry_at` after every queue mutation.
pub const ROUTER_WAKEUP_KEY: &str = "event-router";

/// Errors from publishing an event
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The payload failed envelope validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No handler is registered for the event type
    #[error("no handler registered for event type: {0}")]
    NoRoute(String),

    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

impl From<RouterError> for PublishError {
    fn from(err: RouterError) -> Self {
        match err {
            RouterError::Store(e) => Self::Store(e),
            RouterError::Scheduler(e) => Self::Scheduler(e),
        }
    }
}

/// Errors from sweep and administrative operations
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Scheduler error
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Outcome of a publish: both variants are success for the producer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The handler consumed the event synchronously
    Delivered,

    /// Synchronous delivery failed; the event is queued for retry
    Queued {
        /// When the first retry is due
        next_retry_at: DateTime<Utc>,
    },
}

/// Outcome of replaying a dead-lettered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Delivered; the dead-letter row is gone
    Delivered,

    /// Still failing; the row remains with an updated error
    Failed(String),
}

/// Counters from one retry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub delivered: u64,
    pub retried: u64,
    pub dead_lettered: u64,

    /// Corrupt rows removed without delivery
    pub dropped: u64,
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Total delivery attempts per event, counting the synchronous one
    pub max_attempts: u32,

    /// Delay table for retry scheduling
    pub backoff: EventBackoff,

    /// How long dead letters are retained before purging
    pub dlq_retention: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: EventBackoff::default(),
            dlq_retention: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl RouterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total attempt cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the retry delay table
    pub fn with_backoff(mut self, backoff: EventBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set the dead-letter retention window
    pub fn with_dlq_retention(mut self, retention: Duration) -> Self {
        self.dlq_retention = retention;
        self
    }
}

/// Routes typed events to handlers with durable retry and a DLQ
pub struct EventRouter<S: DurableStore> {
    store: Arc<S>,
    scheduler: Arc<dyn WakeupScheduler>,
    config: RouterConfig,
    routes: HashMap<String, Arc<dyn EventHandler>>,
}

impl<S: DurableStore> EventRouter<S> {
    pub fn new(store: Arc<S>, scheduler: Arc<dyn WakeupScheduler>, config: RouterConfig) -> Self {
        Self {
            store,
            scheduler,
            config,
            routes: HashMap::new(),
        }
    }

    /// Register the handler for an event type (builder-style, set up
    /// before serving traffic)
    pub fn register(mut self, event_type: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.routes.insert(event_type.into(), handler);
        self
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Publish an event
    ///
    /// Validates, attempts synchronous delivery, and on handler failure
    /// persists the event for retry. A queued event is a success from the
    /// producer's point of view: only validation, an unknown type, or an
    /// infrastructure fault surface as errors.
    #[instrument(skip(self, payload))]
    pub async fn publish(&self, payload: serde_json::Value) -> Result<PublishOutcome, PublishError> {
        let envelope = EventEnvelope::from_value(&payload)?;

        let handler = self
            .routes
            .get(&envelope.event_type)
            .ok_or_else(|| PublishError::NoRoute(envelope.event_type.clone()))?;

        match handler.handle(&envelope).await {
            Ok(()) => {
                info!(event_id = %envelope.id, event_type = %envelope.event_type, "event delivered");
                Ok(PublishOutcome::Delivered)
            }
            Err(error) => {
                let now = Utc::now();
                let next_retry_at = now + to_chrono(self.config.backoff.delay_for_attempt(0));

                // Persist the normalized envelope, not the raw payload, so
                // the event id stays stable across retries
                let stored = serde_json::to_value(&envelope)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

                self.store
                    .insert_pending_event(PendingEvent {
                        id: envelope.id,
                        event: stored,
                        attempts: 0,
                        next_retry_at,
                        last_error: Some(error.message.clone()),
                        created_at: now,
                    })
                    .await?;
                self.arm_timer().await?;

                warn!(
                    event_id = %envelope.id,
                    event_type = %envelope.event_type,
                    %error,
                    %next_retry_at,
                    "synchronous delivery failed, event queued"
                );
                Ok(PublishOutcome::Queued { next_retry_at })
            }
        }
    }

    /// Wake-up entry point: sweep everything due as of now
    pub async fn on_wakeup(&self) -> Result<SweepStats, RouterError> {
        self.sweep(Utc::now()).await
    }

    /// Retry every pending event due at `now`, oldest deadline first
    ///
    /// Rows at the attempt cap are dead-lettered without another delivery;
    /// rows whose stored payload no longer parses are dropped. Finishes by
    /// re-arming the timer for the earliest remaining deadline.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepStats, RouterError> {
        let mut stats = SweepStats::default();

        for pending in self.store.due_pending_events(now).await? {
            let envelope = match EventEnvelope::from_value(&pending.event) {
                Ok(envelope) => envelope,
                Err(error) => {
                    warn!(event_id = %pending.id, %error, "dropping corrupt pending event");
                    self.store.delete_pending_event(pending.id).await?;
                    stats.dropped += 1;
                    continue;
                }
            };

            // Total attempts = 1 synchronous + `attempts` wake-up retries.
            // At the cap the event is dead-lettered with the last stored
            // error instead of burning one more delivery.
            if pending.attempts + 1 >= self.config.max_attempts {
                self.dead_letter(&pending, now).await?;
                stats.dead_lettered += 1;
                continue;
            }

            let result = match self.routes.get(&envelope.event_type) {
                Some(handler) => handler.handle(&envelope).await,
                None => Err(super::event::HandlerError::new(format!(
                    "no handler registered for event type: {}",
                    envelope.event_type
                ))),
            };

            match result {
                Ok(()) => {
                    self.store.delete_pending_event(pending.id).await?;
                    info!(event_id = %pending.id, event_type = %envelope.event_type, "event delivered on retry");
                    stats.delivered += 1;
                }
                Err(error) => {
                    let attempts = pending.attempts + 1;
                    let next_retry_at = now + to_chrono(self.config.backoff.delay_for_attempt(attempts));
                    self.store
                        .update_pending_event(pending.id, attempts, next_retry_at, &error.message)
                        .await?;
                    warn!(
                        event_id = %pending.id,
                        event_type = %envelope.event_type,
                        attempts,
                        %error,
                        %next_retry_at,
                        "retry delivery failed"
                    );
                    stats.retried += 1;
                }
            }
        }

        self.arm_timer().await?;

        if stats != SweepStats::default() {
            info!(
                delivered = stats.delivered,
                retried = stats.retried,
                dead_lettered = stats.dead_lettered,
                dropped = stats.dropped,
                "retry sweep finished"
            );
        }
        Ok(stats)
    }

    /// Number of events awaiting retry
    pub async fn pending_count(&self) -> Result<u64, RouterError> {
        Ok(self.store.pending_event_count().await?)
    }

    /// Pending events ordered by deadline
    pub async fn list_pending(&self, pagination: Pagination) -> Result<Vec<PendingEvent>, RouterError> {
        Ok(self.store.list_pending_events(pagination).await?)
    }

    /// Number of dead-lettered events
    pub async fn dead_letter_count(&self) -> Result<u64, RouterError> {
        Ok(self.store.dead_letter_count().await?)
    }

    /// Dead letters, most recent first
    pub async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEvent>, RouterError> {
        Ok(self.store.list_dead_letters(pagination).await?)
    }

    /// Replay one dead-lettered event immediately
    ///
    /// One delivery attempt, outside the retry loop: success removes the
    /// row, failure updates its error and leaves it for another try.
    #[instrument(skip(self))]
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<ReplayOutcome, RouterError> {
        let entry = self.store.get_dead_letter(id).await?;

        let result = match EventEnvelope::from_value(&entry.event) {
            Ok(envelope) => match self.routes.get(&envelope.event_type) {
                Some(handler) => handler.handle(&envelope).await,
                None => Err(super::event::HandlerError::new(format!(
                    "no handler registered for event type: {}",
                    envelope.event_type
                ))),
            },
            Err(error) => Err(super::event::HandlerError::new(error.to_string())),
        };

        match result {
            Ok(()) => {
                self.store.delete_dead_letter(id).await?;
                info!(event_id = %id, "dead letter replayed successfully");
                Ok(ReplayOutcome::Delivered)
            }
            Err(error) => {
                self.store
                    .update_dead_letter_error(id, &error.message, Utc::now())
                    .await?;
                warn!(event_id = %id, %error, "dead letter replay failed");
                Ok(ReplayOutcome::Failed(error.message))
            }
        }
    }

    /// Remove one dead-lettered event
    pub async fn delete_dead_letter(&self, id: Uuid) -> Result<(), RouterError> {
        self.store.delete_dead_letter(id).await?;
        info!(event_id = %id, "dead letter deleted");
        Ok(())
    }

    /// Purge dead letters past their retention window
    pub async fn purge_expired(&self) -> Result<u64, RouterError> {
        let purged = self.store.purge_expired_dead_letters(Utc::now()).await?;
        if purged > 0 {
            info!(purged, "expired dead letters purged");
        }
        Ok(purged)
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Move a pending event to the dead-letter queue
    async fn dead_letter(&self, pending: &PendingEvent, now: DateTime<Utc>) -> Result<(), StoreError> {
        let error = pending
            .last_error
            .clone()
            .unwrap_or_else(|| "delivery failed".to_string());

        warn!(
            event_id = %pending.id,
            attempts = pending.attempts + 1,
            %error,
            "delivery attempts exhausted, moving to dead letter queue"
        );

        self.store
            .insert_dead_letter(DeadLetterEvent {
                id: pending.id,
                event: pending.event.clone(),
                error,
                attempts: pending.attempts + 1,
                first_failed_at: pending.created_at,
                last_failed_at: now,
                expires_at: now + to_chrono(self.config.dlq_retention),
            })
            .await?;
        self.store.delete_pending_event(pending.id).await
    }

    /// Re-arm the coalesced timer for the earliest pending deadline
    async fn arm_timer(&self) -> Result<(), RouterError> {
        if let Some(earliest) = self.store.earliest_pending_retry_at().await? {
            self.scheduler.schedule(ROUTER_WAKEUP_KEY, earliest).await?;
        }
        Ok(())
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::seconds(3600))
}
