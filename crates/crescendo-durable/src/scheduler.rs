//! Wake-up scheduling
//!
//! Both the saga engine and the event router rely on a host-provided
//! single-shot timer: "wake this key up at this time". The trait here is
//! the narrowest possible contract for that. Scheduling is advisory — on
//! every wake-up the owner recomputes its work from the store, because the
//! process may have restarted between scheduling and firing.
//!
//! One timer per key: scheduling a wake-up for a key replaces any wake-up
//! already pending for it.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::debug;

/// Error type for scheduling operations
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The underlying timer mechanism rejected the request
    #[error("scheduling failed: {0}")]
    Schedule(String),
}

/// Single-shot wake-up timer, keyed by saga id or router key
#[async_trait]
pub trait WakeupScheduler: Send + Sync + 'static {
    /// Schedule a wake-up for `key` at `at`
    ///
    /// Replaces any wake-up already scheduled for the same key. A time in
    /// the past fires as soon as possible.
    async fn schedule(&self, key: &str, at: DateTime<Utc>) -> Result<(), SchedulerError>;
}

/// Callback invoked when a scheduled wake-up fires
pub type WakeupFn = Arc<dyn Fn(String) -> BoxFuture<'static, ()> + Send + Sync>;

/// Tokio-backed wake-up scheduler
///
/// Spawns one sleeping task per key and invokes the injected callback with
/// the key when the deadline passes. Rescheduling a key aborts the
/// previous task, so at most one wake-up is pending per key.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use crescendo_durable::TokioWakeupScheduler;
///
/// let scheduler = TokioWakeupScheduler::new(Arc::new(|key: String| {
///     Box::pin(async move {
///         // resume the saga / run a router sweep for `key`
///         let _ = key;
///     })
/// }));
/// ```
pub struct TokioWakeupScheduler {
    on_wakeup: WakeupFn,
    timers: Arc<DashMap<String, TimerEntry>>,
    generation: std::sync::atomic::AtomicU64,
}

struct TimerEntry {
    generation: u64,
    handle: tokio::task::JoinHandle<()>,
}

impl TokioWakeupScheduler {
    /// Create a scheduler that invokes `on_wakeup` when a timer fires
    pub fn new(on_wakeup: WakeupFn) -> Self {
        Self {
            on_wakeup,
            timers: Arc::new(DashMap::new()),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Cancel the pending wake-up for a key, if any
    pub fn cancel(&self, key: &str) {
        if let Some((_, entry)) = self.timers.remove(key) {
            entry.handle.abort();
        }
    }

    /// Number of keys with a pending wake-up
    pub fn pending_count(&self) -> usize {
        self.timers.len()
    }
}

impl Drop for TokioWakeupScheduler {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().handle.abort();
        }
    }
}

#[async_trait]
impl WakeupScheduler for TokioWakeupScheduler {
    async fn schedule(&self, key: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let callback = Arc::clone(&self.on_wakeup);
        let key_owned = key.to_string();
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let timers = Arc::clone(&self.timers);

        debug!(key, ?delay, "scheduling wake-up");

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback(key_owned.clone()).await;
            // Drop our own entry, but only if the key was not rescheduled
            // while the callback ran
            timers.remove_if(&key_owned, |_, entry| entry.generation == generation);
        });

        if let Some(previous) = self
            .timers
            .insert(key.to_string(), TimerEntry { generation, handle })
        {
            previous.handle.abort();
        }

        Ok(())
    }
}

/// Recording scheduler for tests
///
/// Records every `(key, at)` pair without spawning timers; tests fire
/// wake-ups by calling the component under test directly. Matches the
/// replace-per-key semantics of the real scheduler via `next_for`.
#[derive(Default)]
pub struct RecordingScheduler {
    scheduled: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl RecordingScheduler {
    /// Create an empty recording scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded schedule calls, in order
    pub fn all(&self) -> Vec<(String, DateTime<Utc>)> {
        self.scheduled.lock().clone()
    }

    /// Total number of schedule calls observed
    pub fn call_count(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Number of schedule calls observed for a key
    pub fn calls_for(&self, key: &str) -> usize {
        self.scheduled.lock().iter().filter(|(k, _)| k == key).count()
    }

    /// The effective (latest) wake-up time for a key
    pub fn next_for(&self, key: &str) -> Option<DateTime<Utc>> {
        self.scheduled
            .lock()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, at)| *at)
    }

    /// Forget everything recorded so far
    pub fn clear(&self) {
        self.scheduled.lock().clear();
    }
}

#[async_trait]
impl WakeupScheduler for RecordingScheduler {
    async fn schedule(&self, key: &str, at: DateTime<Utc>) -> Result<(), SchedulerError> {
        self.scheduled.lock().push((key.to_string(), at));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_tokio_scheduler_fires_callback() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let scheduler = TokioWakeupScheduler::new(Arc::new(move |_key| {
            let fired = Arc::clone(&fired_clone);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }));

        scheduler.schedule("saga-1", Utc::now()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_replaces_pending_timer() {
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);

        let scheduler = TokioWakeupScheduler::new(Arc::new(move |_key| {
            let fired = Arc::clone(&fired_clone);
            Box::pin(async move {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        }));

        // First wake-up far in the future, then rescheduled to now
        let far = Utc::now() + chrono::Duration::seconds(3600);
        scheduler.schedule("saga-1", far).await.unwrap();
        scheduler.schedule("saga-1", Utc::now()).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Only the replacement fired, and its entry is gone
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tokio_scheduler_drops_entries_after_firing() {
        let scheduler = TokioWakeupScheduler::new(Arc::new(|_key| Box::pin(async {})));

        scheduler.schedule("saga-1", Utc::now()).await.unwrap();
        scheduler.schedule("saga-2", Utc::now()).await.unwrap();
        let far = Utc::now() + chrono::Duration::seconds(3600);
        scheduler.schedule("saga-3", far).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Fired timers clean up after themselves; the distant one remains
        assert_eq!(scheduler.pending_count(), 1);
        scheduler.cancel("saga-3");
        assert_eq!(scheduler.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_recording_scheduler_latest_wins() {
        let scheduler = RecordingScheduler::new();

        let first = Utc::now();
        let second = first + chrono::Duration::seconds(10);

        scheduler.schedule("router", first).await.unwrap();
        scheduler.schedule("router", second).await.unwrap();

        assert_eq!(scheduler.call_count(), 2);
        assert_eq!(scheduler.next_for("router"), Some(second));
        assert_eq!(scheduler.next_for("other"), None);
    }
}
