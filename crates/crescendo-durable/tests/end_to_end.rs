//! End-to-end lifecycle tests against the in-memory store
//!
//! Each saga invocation uses a fresh coordinator over a shared store,
//! simulating how a host re-enters the saga function after a crash or a
//! scheduled wake-up: progress must come from the ledger, never from
//! coordinator memory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

use crescendo_durable::prelude::*;
use crescendo_durable::{RecordingScheduler, ReplayOutcome};

/// Per-step invocation counters for asserting replay behavior
#[derive(Default)]
struct Counters {
    validate: AtomicUsize,
    charge: AtomicUsize,
    fulfill: AtomicUsize,
}

/// One pass through the redemption saga, as a host would run it on every
/// entry (initial request, wake-up, or crash-resume)
async fn run_redemption(
    store: &Arc<InMemoryDurableStore>,
    scheduler: &Arc<RecordingScheduler>,
    counters: &Arc<Counters>,
    charge_failures: usize,
) -> SagaStatus {
    let mut saga = SagaCoordinator::new(
        "redemption-r1",
        Arc::clone(store),
        Arc::clone(scheduler) as Arc<dyn WakeupScheduler>,
        SagaConfig::default().with_ponr_step("fulfill"),
    );
    saga.init_saga(json!({"code": "XK-42"})).await.unwrap();

    let c = Arc::clone(counters);
    let validated = saga
        .execute_step(
            "validate-code",
            move || async move {
                c.validate.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::new("premium-tier".to_string()))
            },
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(validated.value().map(String::as_str), Some("premium-tier"));

    let c = Arc::clone(counters);
    let charged: StepOutcome<u64> = saga
        .execute_step_with_rollback(
            "charge",
            move || async move {
                let attempt = c.charge.fetch_add(1, Ordering::SeqCst) + 1;
                if attempt <= charge_failures {
                    Err(StepError::retryable("billing backend unavailable"))
                } else {
                    Ok(StepOutput::new(999).with_undo(json!({"charge_id": 999})))
                }
            },
            compensation(|_| async { Ok(()) }),
            StepOptions::default(),
        )
        .await
        .unwrap();

    match charged {
        StepOutcome::Completed(_) => {}
        StepOutcome::Retrying { .. } => return saga.status().await.unwrap(),
        StepOutcome::Failed(e) => {
            if !saga.is_point_of_no_return_reached().await.unwrap() {
                saga.compensate_all().await.unwrap();
            }
            saga.fail(e.message).await.unwrap();
            return saga.status().await.unwrap();
        }
    }

    let c = Arc::clone(counters);
    let fulfilled: StepOutcome<()> = saga
        .execute_step(
            "fulfill",
            move || async move {
                c.fulfill.fetch_add(1, Ordering::SeqCst);
                Ok(StepOutput::new(()))
            },
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert!(fulfilled.is_completed());
    saga.mark_point_of_no_return().await.unwrap();

    saga.complete().await.unwrap();
    saga.status().await.unwrap()
}

#[test_log::test(tokio::test)]
async fn test_saga_survives_retries_across_invocations() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let counters = Arc::new(Counters::default());

    // Charge fails twice; each failure parks the saga with a wake-up
    let status = run_redemption(&store, &scheduler, &counters, 2).await;
    assert_eq!(status, SagaStatus::Running);
    assert_eq!(scheduler.calls_for("redemption-r1"), 1);

    let status = run_redemption(&store, &scheduler, &counters, 2).await;
    assert_eq!(status, SagaStatus::Running);
    assert_eq!(scheduler.calls_for("redemption-r1"), 2);

    let status = run_redemption(&store, &scheduler, &counters, 2).await;
    assert_eq!(status, SagaStatus::Completed);

    // Replay kept the earlier steps to one real execution each
    assert_eq!(counters.validate.load(Ordering::SeqCst), 1);
    assert_eq!(counters.charge.load(Ordering::SeqCst), 3);
    assert_eq!(counters.fulfill.load(Ordering::SeqCst), 1);

    // The ledger reflects the history
    let charge = store.get_step("redemption-r1", "charge").await.unwrap().unwrap();
    assert_eq!(charge.state, StepState::Succeeded);
    assert_eq!(charge.attempt, 3);
    assert_eq!(charge.result, Some(json!(999)));

    let run = store.get_run("redemption-r1").await.unwrap();
    assert!(run.fulfilled_at.is_some());
}

#[test_log::test(tokio::test)]
async fn test_saga_completed_run_replays_to_completion_without_side_effects() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let counters = Arc::new(Counters::default());

    assert_eq!(
        run_redemption(&store, &scheduler, &counters, 0).await,
        SagaStatus::Completed
    );

    // A duplicate request after completion must not execute anything: the
    // coordinator rejects steps on a terminal run
    let mut saga = SagaCoordinator::new(
        "redemption-r1",
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn WakeupScheduler>,
        SagaConfig::default(),
    );
    assert_eq!(
        saga.init_saga(json!({"code": "XK-42"})).await.unwrap(),
        SagaInit::AlreadyExists
    );
    assert!(!saga.is_running().await.unwrap());

    let result: Result<StepOutcome<String>, _> = saga
        .execute_step(
            "validate-code",
            || async { panic!("must not run") },
            StepOptions::default(),
        )
        .await;
    assert!(matches!(result, Err(EngineError::NotRunning { .. })));
    assert_eq!(counters.validate.load(Ordering::SeqCst), 1);
}

#[test_log::test(tokio::test)]
async fn test_saga_rolls_back_before_point_of_no_return() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());

    let mut saga = SagaCoordinator::new(
        "redemption-r2",
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn WakeupScheduler>,
        SagaConfig::default().with_ponr_step("fulfill"),
    );
    saga.init_saga(json!({"code": "DUP-1"})).await.unwrap();

    let undone = Arc::new(AtomicUsize::new(0));
    let undone_clone = Arc::clone(&undone);
    let reserved: StepOutcome<()> = saga
        .execute_step_with_rollback(
            "reserve",
            || async { Ok(StepOutput::new(()).with_undo(json!({"hold": "h-1"}))) },
            compensation(move |undo| {
                let undone = Arc::clone(&undone_clone);
                async move {
                    assert_eq!(undo, Some(json!({"hold": "h-1"})));
                    undone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert!(reserved.is_completed());

    let charged: StepOutcome<u64> = saga
        .execute_step(
            "charge",
            || async { Err(StepError::non_retryable("code already redeemed")) },
            StepOptions::default(),
        )
        .await
        .unwrap();
    let StepOutcome::Failed(error) = charged else {
        panic!("expected terminal failure");
    };

    assert!(!saga.is_point_of_no_return_reached().await.unwrap());
    let failures = saga.compensate_all().await.unwrap();
    assert!(failures.is_empty());
    saga.fail(error.message).await.unwrap();

    assert_eq!(undone.load(Ordering::SeqCst), 1);
    let reserve = store.get_step("redemption-r2", "reserve").await.unwrap().unwrap();
    assert_eq!(reserve.state, StepState::Compensated);
    let run = store.get_run("redemption-r2").await.unwrap();
    assert_eq!(run.status, SagaStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("code already redeemed"));
}

#[test_log::test(tokio::test)]
async fn test_saga_failure_after_point_of_no_return_skips_compensation() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());

    let mut saga = SagaCoordinator::new(
        "redemption-r3",
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn WakeupScheduler>,
        SagaConfig::default().with_ponr_step("fulfill"),
    );
    saga.init_saga(json!({"code": "XK-9"})).await.unwrap();

    let undone = Arc::new(AtomicUsize::new(0));
    let undone_clone = Arc::clone(&undone);
    let reserved: StepOutcome<()> = saga
        .execute_step_with_rollback(
            "reserve",
            || async { Ok(StepOutput::new(()).with_undo(json!({"hold": "h-3"}))) },
            compensation(move |_| {
                let undone = Arc::clone(&undone_clone);
                async move {
                    undone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert!(reserved.is_completed());

    // The external effect commits here: licenses are granted, no undo
    let fulfilled: StepOutcome<()> = saga
        .execute_step(
            "fulfill",
            || async { Ok(StepOutput::new(())) },
            StepOptions::default(),
        )
        .await
        .unwrap();
    assert!(fulfilled.is_completed());
    saga.mark_point_of_no_return().await.unwrap();

    let settled: StepOutcome<()> = saga
        .execute_step(
            "record-settlement",
            || async { Err(StepError::non_retryable("ledger rejected entry")) },
            StepOptions::default(),
        )
        .await
        .unwrap();
    let StepOutcome::Failed(error) = settled else {
        panic!("expected terminal failure");
    };

    // Past the point of no return: record the failure, roll nothing back
    assert!(saga.is_point_of_no_return_reached().await.unwrap());
    saga.fail(error.message).await.unwrap();

    assert_eq!(undone.load(Ordering::SeqCst), 0);

    // Failed directly, never through Compensating
    let run = store.get_run("redemption-r3").await.unwrap();
    assert_eq!(run.status, SagaStatus::Failed);
    assert_eq!(run.error.as_deref(), Some("ledger rejected entry"));

    let reserve = store.get_step("redemption-r3", "reserve").await.unwrap().unwrap();
    assert_eq!(reserve.state, StepState::Succeeded);
}

/// Handler that fails a fixed number of times, then delivers
struct FlakyHandler {
    fail_times: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, _event: &EventEnvelope) -> Result<(), HandlerError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.fail_times {
            Err(HandlerError::new("downstream service 503"))
        } else {
            Ok(())
        }
    }
}

#[test_log::test(tokio::test)]
async fn test_event_lifecycle_from_publish_to_dead_letter_to_replay() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let handler = Arc::new(FlakyHandler {
        fail_times: 3,
        calls: AtomicUsize::new(0),
    });
    let router = EventRouter::new(
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn WakeupScheduler>,
        RouterConfig::default(),
    )
    .register("license.granted", Arc::clone(&handler) as Arc<dyn EventHandler>);

    // Synchronous attempt fails: queued, not an error
    let outcome = router
        .publish(json!({"type": "license.granted", "user": "u-7"}))
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Queued { .. }));
    assert_eq!(router.pending_count().await.unwrap(), 1);

    // Sweep past each retry deadline (1s, then 4s); third wake-up hits the
    // attempt cap and dead-letters without another delivery
    let mut now = Utc::now();
    for step_secs in [2, 5, 20] {
        now += chrono::Duration::seconds(step_secs);
        router.sweep(now).await.unwrap();
    }

    assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
    assert_eq!(router.pending_count().await.unwrap(), 0);
    assert_eq!(router.dead_letter_count().await.unwrap(), 1);

    let dead = router.list_dead_letters(Pagination::default()).await.unwrap();
    assert_eq!(dead[0].attempts, 3);
    assert_eq!(dead[0].error, "downstream service 503");

    // The handler has recovered; operator replay drains the DLQ
    let outcome = router.replay_dead_letter(dead[0].id).await.unwrap();
    assert_eq!(outcome, ReplayOutcome::Delivered);
    assert_eq!(router.dead_letter_count().await.unwrap(), 0);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 4);
}

#[test_log::test(tokio::test)]
async fn test_saga_and_router_share_one_store() {
    let store = Arc::new(InMemoryDurableStore::new());
    let scheduler = Arc::new(RecordingScheduler::new());
    let counters = Arc::new(Counters::default());

    let handler = Arc::new(FlakyHandler {
        fail_times: 1,
        calls: AtomicUsize::new(0),
    });
    let router = EventRouter::new(
        Arc::clone(&store),
        Arc::clone(&scheduler) as Arc<dyn WakeupScheduler>,
        RouterConfig::default(),
    )
    .register("license.granted", Arc::clone(&handler) as Arc<dyn EventHandler>);

    // Saga completes; its completion event misses synchronously and rides
    // the retry queue independently of the saga's own state
    let status = run_redemption(&store, &scheduler, &counters, 0).await;
    assert_eq!(status, SagaStatus::Completed);

    let outcome = router
        .publish(json!({"type": "license.granted", "saga": "redemption-r1"}))
        .await
        .unwrap();
    assert!(matches!(outcome, PublishOutcome::Queued { .. }));

    let stats = router
        .sweep(Utc::now() + chrono::Duration::seconds(2))
        .await
        .unwrap();
    assert_eq!(stats.delivered, 1);
    assert_eq!(router.pending_count().await.unwrap(), 0);

    // Both subsystems left the shared store consistent
    assert_eq!(
        store.get_run("redemption-r1").await.unwrap().status,
        SagaStatus::Completed
    );
    assert_eq!(store.pending_event_count().await.unwrap(), 0);
}
