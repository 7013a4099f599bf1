use std::time::Duration;

use fieldsync_core::{DailyHoursEntry, MutationOp, UserId, WorkOrderId};
use fieldsync_engine::{
    EngineError, RemoteError, SyncError, SyncNotification, SyncStatus,
};
use fieldsync_harness::{
    FakeBackend, PushOutcome, TestDevice, assigned_work_orders, init_tracing,
};
use tokio::sync::broadcast;

type TestResult = Result<(), Box<dyn std::error::Error>>;

fn tech() -> UserId {
    TestDevice::profile().user_id
}

fn seeded_device(count: usize) -> Result<TestDevice, EngineError> {
    init_tracing();
    let backend = FakeBackend::new();
    let orders = assigned_work_orders(count);
    backend.assign(&tech(), orders.clone());
    TestDevice::seeded(backend, TestDevice::config(), &orders)
}

fn drain_notifications(rx: &mut broadcast::Receiver<SyncNotification>) -> Vec<SyncNotification> {
    let mut seen = Vec::new();
    while let Ok(n) = rx.try_recv() {
        seen.push(n);
    }
    seen
}

fn connectivity_down() -> RemoteError {
    RemoteError::Connectivity("upstream paused".into())
}

// ============================================================================
// Ordering and partial failure
// ============================================================================

#[tokio::test(start_paused = true)]
async fn scenario_b_failure_mid_drain_keeps_rest_queued_in_order() -> TestResult {
    let device = seeded_device(2)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    let wo2 = WorkOrderId::from("wo-2");

    engine.offline_add_comment(&wo1, "one")?;
    engine.offline_add_comment(&wo2, "two")?;
    engine.offline_add_comment(&wo1, "three")?;
    let queued: Vec<_> = engine.pending_mutations()?.iter().map(|e| e.mutation_id()).collect();

    device.backend.fail_entity(&wo2, connectivity_down());
    device.go_online().await;

    let err = engine.force_sync().await.unwrap_err();
    assert_eq!(err, SyncError::Remote(connectivity_down()));

    assert_eq!(device.backend.applied(), vec![queued[0]]);
    let remaining: Vec<_> = engine.pending_mutations()?.iter().map(|e| e.mutation_id()).collect();
    assert_eq!(remaining, vec![queued[1], queued[2]]);

    let state = engine.state();
    assert_eq!(state.sync_status, SyncStatus::Error);
    assert_eq!(state.pending_sync_count, 2);
    assert!(state.last_error.is_some());

    // wo-1's first comment is confirmed, its second still rides on top.
    let wo = engine.get_work_order(&wo1)?.ok_or("missing")?;
    assert!(wo.locally_modified);
    assert_eq!(wo.comments().count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn per_entity_order_holds_across_a_pause() -> TestResult {
    let device = seeded_device(2)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    let wo2 = WorkOrderId::from("wo-2");

    engine.offline_add_comment(&wo1, "first")?;
    engine.offline_check_in(&wo2, None)?;
    engine.offline_add_comment(&wo1, "second")?;
    engine.offline_add_comment(&wo1, "third")?;
    let queued: Vec<_> = engine.pending_mutations()?.iter().map(|e| e.mutation_id()).collect();

    device.backend.fail_entity(&wo2, connectivity_down());
    device.go_online().await;
    assert!(engine.force_sync().await.is_err());
    assert!(engine.force_sync().await.is_err());

    device.backend.heal(&wo2);
    let report = engine.force_sync().await?;
    assert_eq!(report.synced, 3);

    assert_eq!(device.backend.applied(), queued);
    let server = device.backend.work_order(&wo1).ok_or("missing")?;
    let texts: Vec<_> = server.comments().map(|n| n.text.as_str()).collect();
    assert_eq!(texts, vec!["first", "second", "third"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn backoff_retry_drains_once_backend_recovers() -> TestResult {
    let device = seeded_device(1)?;
    let wo1 = WorkOrderId::from("wo-1");
    device.engine.offline_add_comment(&wo1, "queued")?;

    device.backend.fail_entity(&wo1, connectivity_down());
    device.go_online().await;
    assert!(device.engine.force_sync().await.is_err());
    device.backend.heal(&wo1);

    // First backoff is the 1s base delay.
    let mut state = device.engine.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| s.pending_sync_count == 0),
    )
    .await??;
    assert_eq!(device.engine.state().sync_status, SyncStatus::Success);
    Ok(())
}

// ============================================================================
// Idempotence
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lost_ack_replay_does_not_double_apply() -> TestResult {
    let device = seeded_device(1)?;
    let wo1 = WorkOrderId::from("wo-1");
    device.engine.offline_add_daily_hours(
        &wo1,
        DailyHoursEntry {
            user_id: tech(),
            work_date: "2026-10-17".into(),
            hours_regular: 4.0,
            hours_overtime: 0.0,
            miles: 22.0,
            notes: None,
        },
    )?;
    device.engine.offline_add_comment(&wo1, "replaced filter")?;

    device.backend.drop_next_ack();
    device.go_online().await;
    assert!(matches!(
        device.engine.force_sync().await,
        Err(SyncError::Remote(RemoteError::Connectivity(_)))
    ));
    assert_eq!(device.engine.state().pending_sync_count, 2);

    let report = device.engine.force_sync().await?;
    assert_eq!(report.synced, 2);

    let outcomes: Vec<_> = device.backend.push_log().iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        vec![PushOutcome::Applied, PushOutcome::Replayed, PushOutcome::Applied]
    );
    let server = device.backend.work_order(&wo1).ok_or("missing")?;
    assert_eq!(server.total_hours(), 4.0);
    assert_eq!(server.comments().count(), 1);

    let local = device.engine.get_work_order(&wo1)?.ok_or("missing")?;
    assert_eq!(local.total_hours(), 4.0);
    assert!(!local.locally_modified);
    Ok(())
}

// ============================================================================
// Timeouts, stuck mutations, dead letters
// ============================================================================

#[tokio::test(start_paused = true)]
async fn slow_push_times_out_and_stays_queued() -> TestResult {
    let device = seeded_device(1)?;
    let wo1 = WorkOrderId::from("wo-1");
    device.engine.offline_add_comment(&wo1, "waiting")?;

    device.backend.set_delay(Some(Duration::from_secs(30)));
    device.go_online().await;

    let err = device.engine.force_sync().await.unwrap_err();
    assert_eq!(err, SyncError::Remote(RemoteError::Timeout(Duration::from_secs(10))));

    let pending = device.engine.pending_mutations()?;
    let head = pending[0].as_ready().ok_or("corrupt")?;
    assert_eq!(head.attempt_count, 1);
    assert!(head.last_error.as_deref().is_some_and(|e| e.contains("timed out")));
    assert!(device.backend.applied().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn mutation_sticks_after_three_failures_and_can_be_retried() -> TestResult {
    let device = seeded_device(1)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    engine.offline_add_comment(&wo1, "stubborn")?;
    let mutation_id = engine.pending_mutations()?[0].mutation_id();

    let mut notes = engine.subscribe_notifications();
    device.backend.fail_entity(&wo1, connectivity_down());
    device.go_online().await;

    assert!(matches!(engine.force_sync().await, Err(SyncError::Remote(_))));
    assert!(matches!(engine.force_sync().await, Err(SyncError::Remote(_))));
    assert!(matches!(engine.force_sync().await, Err(SyncError::Stuck { .. })));

    let stuck: Vec<_> = drain_notifications(&mut notes)
        .into_iter()
        .filter(|n| matches!(n, SyncNotification::MutationStuck { .. }))
        .collect();
    assert_eq!(stuck.len(), 1);
    assert!(matches!(
        &stuck[0],
        SyncNotification::MutationStuck { mutation_id: id, attempts: 3, .. } if *id == mutation_id
    ));

    let state = engine.state();
    assert_eq!(state.stuck_count, 1);
    assert_eq!(state.pending_sync_count, 1);
    assert_eq!(state.sync_status, SyncStatus::Error);

    // Not pushed again and not announced again.
    assert!(matches!(engine.force_sync().await, Err(SyncError::Stuck { .. })));
    assert_eq!(device.backend.push_attempts(), 3);
    assert!(drain_notifications(&mut notes)
        .iter()
        .all(|n| !matches!(n, SyncNotification::MutationStuck { .. })));

    device.backend.heal(&wo1);
    engine.retry_stuck(mutation_id)?;
    assert_eq!(engine.state().stuck_count, 0);

    let mut state = engine.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| s.pending_sync_count == 0),
    )
    .await??;
    assert_eq!(device.backend.applied(), vec![mutation_id]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stuck_work_order_does_not_hold_back_the_others() -> TestResult {
    let device = seeded_device(2)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    let wo2 = WorkOrderId::from("wo-2");

    engine.offline_check_in(&wo1, None)?;
    engine.offline_add_comment(&wo2, "other building")?;
    engine.offline_add_comment(&wo1, "queued behind the check-in")?;
    let queued: Vec<_> = engine.pending_mutations()?.iter().map(|e| e.mutation_id()).collect();

    device.backend.fail_entity(&wo1, connectivity_down());
    device.go_online().await;
    assert!(matches!(engine.force_sync().await, Err(SyncError::Remote(_))));
    assert!(matches!(engine.force_sync().await, Err(SyncError::Remote(_))));
    assert!(device.backend.applied().is_empty());

    // Third failure sticks wo-1; the same drain still delivers wo-2.
    let err = engine.force_sync().await.unwrap_err();
    assert!(matches!(err, SyncError::Stuck { ref entity_id, .. } if *entity_id == wo1));
    assert_eq!(device.backend.applied(), vec![queued[1]]);
    let server = device.backend.work_order(&wo2).ok_or("missing")?;
    assert_eq!(server.comments().count(), 1);
    assert!(!engine.get_work_order(&wo2)?.ok_or("missing")?.locally_modified);

    let remaining: Vec<_> = engine.pending_mutations()?.iter().map(|e| e.mutation_id()).collect();
    assert_eq!(remaining, vec![queued[0], queued[2]]);
    let state = engine.state();
    assert_eq!(state.pending_sync_count, 2);
    assert_eq!(state.stuck_count, 1);

    // Later drains leave wo-1 alone, so its comment never overtakes the check-in.
    tokio::time::sleep(Duration::from_secs(600)).await;
    assert!(matches!(engine.force_sync().await, Err(SyncError::Stuck { .. })));
    assert_eq!(device.backend.push_attempts(), 4);
    assert_eq!(engine.state().pending_sync_count, 2);

    device.backend.heal(&wo1);
    engine.retry_stuck(queued[0])?;
    let mut state = engine.subscribe_state();
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| s.pending_sync_count == 0),
    )
    .await??;
    assert_eq!(device.backend.applied(), vec![queued[1], queued[0], queued[2]]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discarding_a_stuck_mutation_rolls_back_its_effect() -> TestResult {
    let device = seeded_device(1)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    engine.offline_add_comment(&wo1, "never arrives")?;
    let mutation_id = engine.pending_mutations()?[0].mutation_id();

    device.backend.fail_entity(&wo1, connectivity_down());
    device.go_online().await;
    for _ in 0..3 {
        let _ = engine.force_sync().await;
    }
    assert_eq!(engine.state().stuck_count, 1);

    let mut notes = engine.subscribe_notifications();
    engine.discard_mutation(mutation_id)?;

    let state = engine.state();
    assert_eq!(state.pending_sync_count, 0);
    assert_eq!(state.stuck_count, 0);
    let wo = engine.get_work_order(&wo1)?.ok_or("missing")?;
    assert_eq!(wo.comments().count(), 0);
    assert!(!wo.locally_modified);

    let letters = engine.dead_letters()?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].error, "discarded by user");
    assert!(matches!(
        drain_notifications(&mut notes).as_slice(),
        [SyncNotification::MutationDeadLettered { .. }]
    ));

    assert!(matches!(
        engine.discard_mutation(mutation_id),
        Err(EngineError::MutationNotFound(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn rejected_mutation_is_dead_lettered_once_and_drain_continues() -> TestResult {
    let device = seeded_device(2)?;
    let engine = &device.engine;
    let wo1 = WorkOrderId::from("wo-1");
    let wo2 = WorkOrderId::from("wo-2");

    engine.offline_complete_work_order(&wo1)?;
    engine.offline_add_comment(&wo2, "still on site")?;
    device.backend.reject_entity(&wo1, "work order already closed");

    let mut notes = engine.subscribe_notifications();
    device.go_online().await;
    let report = engine.force_sync().await?;
    assert_eq!(report.synced, 1);
    assert_eq!(report.dead_lettered, 1);

    let state = engine.state();
    assert_eq!(state.pending_sync_count, 0);
    assert_eq!(state.sync_status, SyncStatus::Error);

    let dead: Vec<_> = drain_notifications(&mut notes)
        .into_iter()
        .filter(|n| matches!(n, SyncNotification::MutationDeadLettered { .. }))
        .collect();
    assert_eq!(dead.len(), 1);

    // The rejected completion no longer shows locally.
    let wo = engine.get_work_order(&wo1)?.ok_or("missing")?;
    assert!(!wo.is_completed());
    assert!(!wo.locally_modified);
    assert!(engine.get_completed_work_orders()?.is_empty());

    let letters = engine.dead_letters()?;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].op, Some(MutationOp::Complete));
    assert!(letters[0].error.contains("already closed"));

    // Nothing left to surface on the next drain.
    engine.force_sync().await?;
    assert!(drain_notifications(&mut notes)
        .iter()
        .all(|n| !matches!(n, SyncNotification::MutationDeadLettered { .. })));
    Ok(())
}

// ============================================================================
// force_sync
// ============================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_force_sync_calls_share_one_drain() -> TestResult {
    let device = seeded_device(1)?;
    device.engine.offline_add_comment(&"wo-1".into(), "once")?;
    device.backend.set_delay(Some(Duration::from_secs(1)));
    device.go_online().await;

    let (a, b) = tokio::join!(device.engine.force_sync(), device.engine.force_sync());
    assert_eq!(a?, b?);
    assert_eq!(device.backend.push_attempts(), 1);
    assert_eq!(device.engine.state().pending_sync_count, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn force_sync_while_offline_is_refused() -> TestResult {
    let device = seeded_device(1)?;
    device.engine.offline_add_comment(&"wo-1".into(), "later")?;

    assert_eq!(device.engine.force_sync().await, Err(SyncError::Offline));
    assert_eq!(device.backend.push_attempts(), 0);
    assert_eq!(device.engine.state().pending_sync_count, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn empty_queue_drain_succeeds() -> TestResult {
    let device = seeded_device(1)?;
    device.go_online().await;
    let report = device.engine.force_sync().await?;
    assert_eq!(report.synced, 0);
    assert_eq!(device.engine.state().sync_status, SyncStatus::Success);
    Ok(())
}
