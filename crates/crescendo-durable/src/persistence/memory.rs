//! In-memory implementation of DurableStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;

/// In-memory implementation of DurableStore
///
/// This is primarily for testing. It stores all data in memory and
/// provides the same semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use crescendo_durable::InMemoryDurableStore;
///
/// let store = InMemoryDurableStore::new();
/// ```
pub struct InMemoryDurableStore {
    runs: RwLock<HashMap<String, SagaRun>>,
    steps: RwLock<HashMap<(String, String), StepRecord>>,
    pending: RwLock<HashMap<Uuid, PendingEvent>>,
    dlq: RwLock<HashMap<Uuid, DeadLetterEvent>>,
}

impl InMemoryDurableStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            steps: RwLock::new(HashMap::new()),
            pending: RwLock::new(HashMap::new()),
            dlq: RwLock::new(HashMap::new()),
        }
    }

    /// Number of saga runs
    pub fn run_count(&self) -> usize {
        self.runs.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.runs.write().clear();
        self.steps.write().clear();
        self.pending.write().clear();
        self.dlq.write().clear();
    }
}

impl Default for InMemoryDurableStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DurableStore for InMemoryDurableStore {
    async fn create_run(
        &self,
        saga_id: &str,
        params: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        if runs.contains_key(saga_id) {
            return Err(StoreError::RunAlreadyExists(saga_id.to_string()));
        }

        let now = Utc::now();
        runs.insert(
            saga_id.to_string(),
            SagaRun {
                id: saga_id.to_string(),
                status: SagaStatus::Running,
                params,
                created_at: now,
                updated_at: now,
                fulfilled_at: None,
                error: None,
            },
        );
        Ok(())
    }

    async fn get_run(&self, saga_id: &str) -> Result<SagaRun, StoreError> {
        self.runs
            .read()
            .get(saga_id)
            .cloned()
            .ok_or_else(|| StoreError::RunNotFound(saga_id.to_string()))
    }

    async fn update_run_status(
        &self,
        saga_id: &str,
        status: SagaStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(saga_id)
            .ok_or_else(|| StoreError::RunNotFound(saga_id.to_string()))?;

        run.status = status;
        if error.is_some() {
            run.error = error;
        }
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_fulfilled(&self, saga_id: &str) -> Result<(), StoreError> {
        let mut runs = self.runs.write();
        let run = runs
            .get_mut(saga_id)
            .ok_or_else(|| StoreError::RunNotFound(saga_id.to_string()))?;

        if run.fulfilled_at.is_none() {
            run.fulfilled_at = Some(Utc::now());
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn get_step(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<Option<StepRecord>, StoreError> {
        Ok(self
            .steps
            .read()
            .get(&(saga_id.to_string(), step_name.to_string()))
            .cloned())
    }

    async fn begin_step_attempt(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<u32, StoreError> {
        let mut steps = self.steps.write();
        let key = (saga_id.to_string(), step_name.to_string());

        let record = steps.entry(key).or_insert_with(|| StepRecord {
            saga_id: saga_id.to_string(),
            step_name: step_name.to_string(),
            state: StepState::Pending,
            attempt: 0,
            result: None,
            undo_payload: None,
            next_retry_at: None,
            last_error: None,
            updated_at: Utc::now(),
        });

        record.state = StepState::Pending;
        record.attempt += 1;
        record.updated_at = Utc::now();
        Ok(record.attempt)
    }

    async fn record_step_success(
        &self,
        saga_id: &str,
        step_name: &str,
        result: Option<serde_json::Value>,
        undo_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let record = steps
            .get_mut(&(saga_id.to_string(), step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            })?;

        // A succeeded row is permanent; never overwrite its cached output
        if record.state == StepState::Succeeded {
            return Ok(());
        }

        record.state = StepState::Succeeded;
        record.result = result;
        record.undo_payload = undo_payload;
        record.next_retry_at = None;
        record.last_error = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_step_retry(
        &self,
        saga_id: &str,
        step_name: &str,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let record = steps
            .get_mut(&(saga_id.to_string(), step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            })?;

        record.next_retry_at = Some(next_retry_at);
        record.last_error = Some(last_error.to_string());
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_step_failure(
        &self,
        saga_id: &str,
        step_name: &str,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let record = steps
            .get_mut(&(saga_id.to_string(), step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            })?;

        record.state = StepState::Failed;
        record.last_error = Some(last_error.to_string());
        record.next_retry_at = None;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn record_step_compensated(
        &self,
        saga_id: &str,
        step_name: &str,
    ) -> Result<(), StoreError> {
        let mut steps = self.steps.write();
        let record = steps
            .get_mut(&(saga_id.to_string(), step_name.to_string()))
            .ok_or_else(|| StoreError::StepNotFound {
                saga_id: saga_id.to_string(),
                step_name: step_name.to_string(),
            })?;

        record.state = StepState::Compensated;
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn list_steps(&self, saga_id: &str) -> Result<Vec<StepRecord>, StoreError> {
        let mut records: Vec<_> = self
            .steps
            .read()
            .values()
            .filter(|r| r.saga_id == saga_id)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.step_name.cmp(&b.step_name));
        Ok(records)
    }

    async fn insert_pending_event(&self, event: PendingEvent) -> Result<(), StoreError> {
        self.pending.write().insert(event.id, event);
        Ok(())
    }

    async fn due_pending_events(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PendingEvent>, StoreError> {
        let mut due: Vec<_> = self
            .pending
            .read()
            .values()
            .filter(|e| e.next_retry_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|e| e.next_retry_at);
        Ok(due)
    }

    async fn update_pending_event(
        &self,
        id: Uuid,
        attempts: u32,
        next_retry_at: DateTime<Utc>,
        last_error: &str,
    ) -> Result<(), StoreError> {
        let mut pending = self.pending.write();
        let event = pending.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;

        event.attempts = attempts;
        event.next_retry_at = next_retry_at;
        event.last_error = Some(last_error.to_string());
        Ok(())
    }

    async fn delete_pending_event(&self, id: Uuid) -> Result<(), StoreError> {
        self.pending.write().remove(&id);
        Ok(())
    }

    async fn pending_event_count(&self) -> Result<u64, StoreError> {
        Ok(self.pending.read().len() as u64)
    }

    async fn list_pending_events(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<PendingEvent>, StoreError> {
        let mut events: Vec<_> = self.pending.read().values().cloned().collect();
        events.sort_by_key(|e| e.next_retry_at);

        Ok(events
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn earliest_pending_retry_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.pending.read().values().map(|e| e.next_retry_at).min())
    }

    async fn insert_dead_letter(&self, entry: DeadLetterEvent) -> Result<(), StoreError> {
        self.dlq.write().insert(entry.id, entry);
        Ok(())
    }

    async fn get_dead_letter(&self, id: Uuid) -> Result<DeadLetterEvent, StoreError> {
        self.dlq
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::EventNotFound(id))
    }

    async fn update_dead_letter_error(
        &self,
        id: Uuid,
        error: &str,
        last_failed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut dlq = self.dlq.write();
        let entry = dlq.get_mut(&id).ok_or(StoreError::EventNotFound(id))?;

        entry.error = error.to_string();
        entry.last_failed_at = last_failed_at;
        Ok(())
    }

    async fn delete_dead_letter(&self, id: Uuid) -> Result<(), StoreError> {
        self.dlq.write().remove(&id);
        Ok(())
    }

    async fn list_dead_letters(
        &self,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEvent>, StoreError> {
        let mut entries: Vec<_> = self.dlq.read().values().cloned().collect();
        entries.sort_by(|a, b| b.last_failed_at.cmp(&a.last_failed_at));

        Ok(entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn dead_letter_count(&self) -> Result<u64, StoreError> {
        Ok(self.dlq.read().len() as u64)
    }

    async fn purge_expired_dead_letters(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut dlq = self.dlq.write();
        let before = dlq.len();
        dlq.retain(|_, e| e.expires_at > now);
        Ok((before - dlq.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_create_run_rejects_duplicate() {
        let store = InMemoryDurableStore::new();

        store.create_run("r1", json!({"user": "u1"})).await.unwrap();

        let result = store.create_run("r1", json!({})).await;
        assert!(matches!(result, Err(StoreError::RunAlreadyExists(_))));

        let run = store.get_run("r1").await.unwrap();
        assert_eq!(run.status, SagaStatus::Running);
        assert_eq!(run.params, json!({"user": "u1"}));
    }

    #[tokio::test]
    async fn test_mark_fulfilled_is_idempotent() {
        let store = InMemoryDurableStore::new();
        store.create_run("r1", json!({})).await.unwrap();

        store.mark_fulfilled("r1").await.unwrap();
        let first = store.get_run("r1").await.unwrap().fulfilled_at;
        assert!(first.is_some());

        store.mark_fulfilled("r1").await.unwrap();
        let second = store.get_run("r1").await.unwrap().fulfilled_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_step_attempt_counter() {
        let store = InMemoryDurableStore::new();
        store.create_run("r1", json!({})).await.unwrap();

        assert!(store.get_step("r1", "charge").await.unwrap().is_none());

        assert_eq!(store.begin_step_attempt("r1", "charge").await.unwrap(), 1);
        assert_eq!(store.begin_step_attempt("r1", "charge").await.unwrap(), 2);

        let record = store.get_step("r1", "charge").await.unwrap().unwrap();
        assert_eq!(record.attempt, 2);
        assert_eq!(record.state, StepState::Pending);
    }

    #[tokio::test]
    async fn test_succeeded_step_is_permanent() {
        let store = InMemoryDurableStore::new();
        store.create_run("r1", json!({})).await.unwrap();
        store.begin_step_attempt("r1", "charge").await.unwrap();

        store
            .record_step_success("r1", "charge", Some(json!(42)), None)
            .await
            .unwrap();

        // A second success write must not replace the cached output
        store
            .record_step_success("r1", "charge", Some(json!(99)), None)
            .await
            .unwrap();

        let record = store.get_step("r1", "charge").await.unwrap().unwrap();
        assert_eq!(record.result, Some(json!(42)));
    }

    #[tokio::test]
    async fn test_step_retry_bookkeeping() {
        let store = InMemoryDurableStore::new();
        store.create_run("r1", json!({})).await.unwrap();
        store.begin_step_attempt("r1", "charge").await.unwrap();

        let at = Utc::now() + chrono::Duration::seconds(2);
        store
            .record_step_retry("r1", "charge", at, "upstream 503")
            .await
            .unwrap();

        let record = store.get_step("r1", "charge").await.unwrap().unwrap();
        assert_eq!(record.state, StepState::Pending);
        assert_eq!(record.next_retry_at, Some(at));
        assert_eq!(record.last_error.as_deref(), Some("upstream 503"));

        // Success clears retry bookkeeping
        store
            .record_step_success("r1", "charge", None, None)
            .await
            .unwrap();
        let record = store.get_step("r1", "charge").await.unwrap().unwrap();
        assert_eq!(record.state, StepState::Succeeded);
        assert!(record.next_retry_at.is_none());
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_due_pending_events_ordering() {
        let store = InMemoryDurableStore::new();
        let now = Utc::now();

        for (i, offset) in [3i64, 1, 2].iter().enumerate() {
            store
                .insert_pending_event(PendingEvent {
                    id: Uuid::now_v7(),
                    event: json!({"n": i}),
                    attempts: 0,
                    next_retry_at: now - chrono::Duration::seconds(*offset),
                    last_error: None,
                    created_at: now,
                })
                .await
                .unwrap();
        }

        // One not yet due
        store
            .insert_pending_event(PendingEvent {
                id: Uuid::now_v7(),
                event: json!({"n": 99}),
                attempts: 0,
                next_retry_at: now + chrono::Duration::seconds(60),
                last_error: None,
                created_at: now,
            })
            .await
            .unwrap();

        let due = store.due_pending_events(now).await.unwrap();
        assert_eq!(due.len(), 3);
        assert!(due.windows(2).all(|w| w[0].next_retry_at <= w[1].next_retry_at));

        let earliest = store.earliest_pending_retry_at().await.unwrap().unwrap();
        assert_eq!(earliest, due[0].next_retry_at);
    }

    #[tokio::test]
    async fn test_purge_expired_dead_letters() {
        let store = InMemoryDurableStore::new();
        let now = Utc::now();

        for expired in [true, false] {
            store
                .insert_dead_letter(DeadLetterEvent {
                    id: Uuid::now_v7(),
                    event: json!({}),
                    error: "handler failed".to_string(),
                    attempts: 3,
                    first_failed_at: now,
                    last_failed_at: now,
                    expires_at: if expired {
                        now - chrono::Duration::days(1)
                    } else {
                        now + chrono::Duration::days(29)
                    },
                })
                .await
                .unwrap();
        }

        let purged = store.purge_expired_dead_letters(now).await.unwrap();
        assert_eq!(purged, 1);
        assert_eq!(store.dead_letter_count().await.unwrap(), 1);
    }
}
