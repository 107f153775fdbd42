//! PostgreSQL implementation of DurableStore
//!
//! Production persistence using PostgreSQL with:
//! - One row per saga run, upserted step ledger rows
//! - Single-statement mutations (no cross-step transactions)
//! - Indexes on `next_retry_at` for cheap due-event scans
//!
//! The schema lives in `migrations/`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;

/// PostgreSQL implementation of DurableStore
///
/// Uses a connection pool for efficient database access.
///
/// # Example
///
/// ```ignore
/// use crescendo_durable::PostgresDurableStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresDurableStore::new(pool);
/// ```
#[derive(Clone)]
pub struct PostgresDurableStore {
    pool: PgPool,
}

impl PostgresDurableStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn parse_saga_status(s: &str) -> Result<SagaStatus, StoreError> {
    match s {
        "running" => Ok(SagaStatus::Running),
        "completed" => Ok(SagaStatus::Completed),
        "failed" => Ok(SagaStatus::Failed),
        "compensating" => Ok(SagaStatus::Compensating),
        other => Err(StoreError::Serialization(format!(
            "unknown saga status: {other}"
        ))),
    }
}

fn parse_step_state(s: &str) -> Result<StepState, StoreError> {
    match s {
        "pending" => Ok(StepState::Pending),
        "succeeded" => Ok(StepState::Succeeded),
        "failed" => Ok(StepState::Failed),
        "compensated" => Ok(StepState::Compensated),
        other => Err(StoreError::Serialization(format!(
            "unknown step state: {other}"
        ))),
    }
}

fn run_from_row(row: &sqlx::postgres::PgRow) -> Result<SagaRun, StoreError> {
    let status: String = row.get("status");
    Ok(SagaRun {
        id: row.get("id"),
        status: parse_saga_status(&status)?,
        params: row.get("params"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        fulfilled_at: row.get("fulfilled_at"),
        error: row.get("error"),
    })
}

fn step_from_row(row: &sqlx::postgres::PgRow) -> Result<StepRecord, StoreError> {
    let state: String = row.get("state");
    Ok(StepRecord {
        saga_id: row.get("saga_id"),
        step_name: row.get("step_name"),
        state: parse_step_state(&state)?,
        attempt: row.get::<i32, _>("attempt") as u32,
        result: row.get("result"),
        undo_payload: row.get("undo_payload"),
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
        updated_at: row.get("updated_at"),
    })
}

fn pending_from_row(row: &sqlx::postgres::PgRow) -> PendingEvent {
    PendingEvent {
        id: row.get("id"),
        event: row.get("event"),
        attempts: row.get::<i32, _>("attempts") as u32,
        next_retry_at: row.get("next_retry_at"),
        last_error: row.get("last_error"),
        created_at: row.get("created_at"),
    }
}

fn dead_letter_from_row(row: &sqlx::postgres::PgRow) -> DeadLetterEvent {
    DeadLetterEvent {
        id: row.get("id"),
        event: row.get("event"),
        error: row.get("error"),
        attempts: row.get::<i32, _>("attempts") as u32,
        first_failed_at: row.get("first_failed_at"),
        last_failed_at: row.get("last_failed_at"),
        expires_at: row.get("expires_at"),
    }
}

#[async_trait]
impl DurableStore for PostgresDurableStore {
    #[instrument(skip(self, params))]
    async fn create_run(
        &self,
        saga_id: &str,
        params: serde_json::Value,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO saga_runs (id, status, params)
            VALUES ($1, 'running', $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(saga_id)
        .bind(&params)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to create saga run: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunAlreadyExists(saga_id.to_string()));
        }

        debug!(saga_id, "created saga run");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_run(&self, saga_id: &str) -> Result<SagaRun, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, status, params, created_at, updated_at, fulfilled_at, error
            FROM saga_runs
            WHERE id = $1
            "#,
        )
        .bind(saga_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or_else(|| StoreError::RunNotFound(saga_id.to_string()))?;

        run_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn update_run_status(
        &self,
        saga_id: &str,
        status: SagaStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE saga_runs
            SET status = $2, error = COALESCE($3, error), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(saga_id)
        .bind(status.to_string())
        .bind(&error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(saga_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn mark_fulfilled(&self, saga_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE saga_runs
            SET fulfilled_at = COALESCE(fulfilled_at, NOW()), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(saga_id)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RunNotFound(saga_id.to_string()));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_step(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT saga_id, step_name, state, attempt, result, undo_payload,
                   next_retry_at, last_error, updated_at
            FROM saga_steps
            WHERE saga_id = $1 AND step_name = $2
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        row.as_ref().map(step_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn begin_step_attempt(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            r#"
            INSERT INTO saga_steps (saga_id, step_name, state, attempt)
            VALUES ($1, $2, 'pending', 1)
            ON CONFLICT (saga_id, step_name) DO UPDATE
            SET state = 'pending', attempt = saga_steps.attempt + 1, updated_at = NOW()
            RETURNING attempt
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to begin step attempt: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get::<i32, _>("attempt") as u32)
    }

    #[instrument(skip(self, result, undo_payload))]
    async fn record_step_success(
        &self,
        saga_id: &str,
        step_name: &str,
        result: Option<serde_json::Value>,
        undo_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        // The state guard keeps a succeeded row's cached output permanent
        let outcome = sqlx::query(
            r#"
            UPDATE saga_steps
            SET state = 'succeeded', result = $3, undo_payload = $4,
                next_retry_at = NULL, last_error = NULL, updated_at = NOW()
            WHERE saga_id = $1 AND step_name = $2 AND state <> 'succeeded'
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .bind(&result)
        .bind(&undo_payload)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            // Either already succeeded (fine) or the row is missing
            let exists = self.get_step(saga_id, step_name).await?;
            if exists.is_none() {
                return Err(StoreError::StepNotFound {
                    saga_id: saga_id.to_string(),
                    step_name: step_name.to_string(),
                });
            }
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_step_retry(
        &self,
        saga_id: &str,
        step_name: &str,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE saga_steps
            SET next_retry_at = $3, last_error = $4, updated_at = NOW()
            WHERE saga_id = $1 AND step_name = $2
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_step_failure(
        &self,
        saga_id: &str,
        step_name: &str,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE saga_steps
            SET state = 'failed', last_error = $3, next_retry_at = NULL, updated_at = NOW()
            WHERE saga_id = $1 AND step_name = $2
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn record_step_compensated(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE saga_steps
            SET state = 'compensated', updated_at = NOW()
            WHERE saga_id = $1 AND step_name = $2
            "#,
        )
        .bind(saga_id)
        .bind(step_name)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_steps(&self, saga_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT saga_id, step_name, state, attempt, result, undo_payload,
                   next_retry_at, last_error, updated_at
            FROM saga_steps
            WHERE saga_id = $1
            ORDER BY step_name
            "#,
        )
        .bind(saga_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        rows.iter().map(step_from_row).collect()
    }

    #[instrument(skip(self, event))]
    async fn insert_pending_event(&self, event: PendingEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO pending_events (id, event, attempts, next_retry_at, last_error, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(&event.event)
        .bind(event.attempts as i32)
        .bind(event.next_retry_at)
        .bind(&event.last_error)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert pending event: {}", e);
            StoreError::Database(e.to_string())
        })?;

        debug!(event_id = %event.id, "persisted pending event");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn due_pending_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event, attempts, next_retry_at, last_error, created_at
            FROM pending_events
            WHERE next_retry_at <= $1
            ORDER BY next_retry_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(pending_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn update_pending_event(
        &self,
        id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE pending_events
            SET attempts = $2, next_retry_at = $3, last_error = $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(attempts as i32)
        .bind(next_retry_at)
        .bind(last_error)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_pending_event(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn pending_event_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM pending_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    #[instrument(skip(self))]
    async fn list_pending_events(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<PendingEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event, attempts, next_retry_at, last_error, created_at
            FROM pending_events
            ORDER BY next_retry_at ASC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(pending_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn earliest_pending_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT MIN(next_retry_at) AS earliest FROM pending_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get("earliest"))
    }

    #[instrument(skip(self, entry))]
    async fn insert_dead_letter(&self, entry: DeadLetterEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO dead_letter_events
                (id, event, error, attempts, first_failed_at, last_failed_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(entry.id)
        .bind(&entry.event)
        .bind(&entry.error)
        .bind(entry.attempts as i32)
        .bind(entry.first_failed_at)
        .bind(entry.last_failed_at)
        .bind(entry.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to insert dead letter: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterEvent, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, event, error, attempts, first_failed_at, last_failed_at, expires_at
            FROM dead_letter_events
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?
        .ok_or(StoreError::EventNotFound(id))?;

        Ok(dead_letter_from_row(&row))
    }

    #[instrument(skip(self))]
    async fn update_dead_letter_error(
        &self,
        id: Uuid,
        error: &str,
        last_failed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE dead_letter_events
            SET error = $2, last_failed_at = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(last_failed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        if outcome.rows_affected() == 0 {
            return Err(StoreError::EventNotFound(id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM dead_letter_events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, event, error, attempts, first_failed_at, last_failed_at, expires_at
            FROM dead_letter_events
            ORDER BY last_failed_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(pagination.limit as i64)
        .bind(pagination.offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(rows.iter().map(dead_letter_from_row).collect())
    }

    #[instrument(skip(self))]
    async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM dead_letter_events")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(row.get::<i64, _>("count") as u64)
    }

    #[instrument(skip(self))]
    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let outcome = sqlx::query("DELETE FROM dead_letter_events WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(outcome.rows_affected())
    }
}
