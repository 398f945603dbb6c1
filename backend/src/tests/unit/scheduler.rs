// Trigger table, overlap rule and shutdown drain

use chrono::Duration;
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};
use tokio_util::sync::CancellationToken;

use crate::automation::{
    AutomationError, EligibilityWindow, ExecutionSettings, FireDecision, Recurrence,
    SchedulerConfig, WorkflowDefinition, WorkflowRegistry,
};
use crate::tests::fixtures::{fixed_now, staff, Harness};
use crate::tests::helpers::wait_until;
use crate::tests::init_test_logging;
use ndis_shared::{AuditOutcome, EntityType, TriggerState};

const ONBOARDING: &str = "onboarding_reminder";

fn interval_workflow(every_secs: u64) -> Arc<WorkflowDefinition> {
    Arc::new(
        WorkflowDefinition::new(
            ONBOARDING,
            EntityType::Staff,
            Recurrence::every(every_secs),
            EligibilityWindow::days(3, 4).unwrap().with_grace(Duration::days(1)).unwrap(),
            "profile_completion",
        )
        .incomplete_profiles_only(),
    )
}

fn config(shutdown_ms: u64) -> SchedulerConfig {
    SchedulerConfig {
        tick_interval: StdDuration::from_millis(20),
        shutdown_timeout: StdDuration::from_millis(shutdown_ms),
    }
}

#[tokio::test]
async fn test_scenario_b_overlapping_tick_is_skipped() {
    init_test_logging();
    let harness = Harness::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.close_gate();

    let mut scheduler = harness.scheduler(config(5_000));
    scheduler.register(interval_workflow(60)).unwrap();

    let first = scheduler.tick();
    assert_eq!(first.fired, vec![ONBOARDING.to_string()]);
    let gateway = harness.gateway.clone();
    wait_until(StdDuration::from_secs(2), || gateway.attempts().len() == 1).await;

    // Scheduler stall: the next due time passes while the first run is held.
    harness.clock.advance(Duration::seconds(61));
    tokio::time::sleep(StdDuration::from_millis(50)).await;

    let second = scheduler.tick();
    assert!(second.fired.is_empty());
    assert_eq!(second.skipped, vec![ONBOARDING.to_string()]);

    let status = scheduler.workflow_status(ONBOARDING).unwrap();
    assert_eq!(status.state, TriggerState::Running);
    assert_eq!(status.skipped_overlaps, 1);

    harness.gateway.open_gate();
    scheduler.wait_for_in_flight().await;

    assert_eq!(harness.gateway.attempts().len(), 1);
    assert_eq!(harness.ledger.entries().len(), 1);
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);

    let status = scheduler.workflow_status(ONBOARDING).unwrap();
    assert_eq!(status.state, TriggerState::Idle);
    assert_eq!(status.last_outcome.unwrap().completed, 1);
}

#[tokio::test]
async fn test_calendar_trigger_waits_for_its_slot() {
    init_test_logging();
    let harness = Harness::new();
    let mut scheduler = harness.scheduler(config(1_000));
    let registry = WorkflowRegistry::builtin().unwrap();
    scheduler
        .register(registry.get("orientation_reminder").unwrap().clone())
        .unwrap();

    // Registered exactly at 09:00: the next slot is tomorrow.
    let tomorrow = fixed_now() + Duration::days(1);
    let status = scheduler.workflow_status("orientation_reminder").unwrap();
    assert_eq!(status.next_due_at, Some(tomorrow));

    assert!(scheduler.tick().fired.is_empty());

    harness.clock.set(tomorrow);
    assert_eq!(scheduler.tick().fired, vec!["orientation_reminder".to_string()]);
    scheduler.wait_for_in_flight().await;

    let status = scheduler.workflow_status("orientation_reminder").unwrap();
    assert_eq!(status.next_due_at, Some(tomorrow + Duration::days(1)));
    assert_eq!(status.last_fired_at, Some(tomorrow));
}

#[tokio::test]
async fn test_long_pause_yields_one_catch_up_firing() {
    init_test_logging();
    let harness = Harness::new();
    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register(interval_workflow(60)).unwrap();

    assert_eq!(scheduler.tick().fired.len(), 1);
    scheduler.wait_for_in_flight().await;

    harness.clock.advance(Duration::hours(10));
    assert_eq!(scheduler.tick().fired.len(), 1);
    scheduler.wait_for_in_flight().await;

    // Rescheduled from now, not from the missed slots.
    let status = scheduler.workflow_status(ONBOARDING).unwrap();
    assert_eq!(
        status.next_due_at,
        Some(fixed_now() + Duration::hours(10) + Duration::seconds(60))
    );
    assert!(scheduler.tick().fired.is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let harness = Harness::new();
    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register(interval_workflow(60)).unwrap();

    let result = scheduler.register(interval_workflow(120));
    assert!(matches!(result, Err(AutomationError::DuplicateWorkflow(name)) if name == ONBOARDING));
    assert_eq!(scheduler.status().len(), 1);
}

#[tokio::test]
async fn test_builtin_registry_status_view() {
    let harness = Harness::new();
    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register_all(&WorkflowRegistry::builtin().unwrap()).unwrap();

    let status = scheduler.status();
    assert_eq!(status.len(), 6);
    assert!(status.iter().all(|s| s.state == TriggerState::Idle));
    assert!(status.iter().all(|s| s.next_due_at.is_some() && s.last_fired_at.is_none()));

    let welcome = status.iter().find(|s| s.name == "staff_welcome").unwrap();
    assert_eq!(welcome.next_due_at, Some(fixed_now()));
}

#[tokio::test]
async fn test_trigger_now_follows_overlap_rule() {
    init_test_logging();
    let harness = Harness::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.close_gate();

    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register(interval_workflow(3_600)).unwrap();

    assert!(matches!(
        scheduler.trigger_now("exit_survey"),
        Err(AutomationError::UnknownWorkflow(_))
    ));
    assert_eq!(scheduler.trigger_now(ONBOARDING).unwrap(), FireDecision::Fired);
    assert_eq!(scheduler.trigger_now(ONBOARDING).unwrap(), FireDecision::Skipped);

    harness.gateway.open_gate();
    scheduler.wait_for_in_flight().await;
    assert_eq!(harness.gateway.attempts().len(), 1);
}

#[tokio::test]
async fn test_store_timeout_abandons_firing_but_keeps_schedule() {
    init_test_logging();
    let harness = Harness::with_settings(ExecutionSettings {
        operation_timeout: StdDuration::from_millis(100),
        ..ExecutionSettings::default()
    });
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.store.set_hanging(true);

    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register(interval_workflow(60)).unwrap();

    assert_eq!(scheduler.tick().fired, vec![ONBOARDING.to_string()]);
    scheduler.wait_for_in_flight().await;

    let status = scheduler.workflow_status(ONBOARDING).unwrap();
    assert_eq!(status.state, TriggerState::Idle);
    assert_eq!(status.next_due_at, Some(fixed_now() + Duration::seconds(60)));
    assert!(status.last_outcome.is_none());
    assert!(status.last_error.unwrap().contains("timed out"));
    assert!(harness.gateway.attempts().is_empty());
    assert!(harness.ledger.entries().is_empty());

    // The store recovers: the next slot runs normally and clears the error.
    harness.store.set_hanging(false);
    harness.clock.advance(Duration::seconds(60));
    assert_eq!(scheduler.tick().fired.len(), 1);
    scheduler.wait_for_in_flight().await;

    let status = scheduler.workflow_status(ONBOARDING).unwrap();
    assert!(status.last_error.is_none());
    assert_eq!(status.last_outcome.unwrap().completed, 1);
}

#[tokio::test]
async fn test_shutdown_drains_in_flight_execution() {
    init_test_logging();
    let harness = Harness::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.close_gate();

    let mut scheduler = harness.scheduler(config(5_000));
    scheduler.register(interval_workflow(60)).unwrap();
    scheduler.tick();

    let gateway = harness.gateway.clone();
    wait_until(StdDuration::from_secs(2), || gateway.attempts().len() == 1).await;

    let opener = async {
        tokio::time::sleep(StdDuration::from_millis(30)).await;
        harness.gateway.open_gate();
    };
    tokio::join!(scheduler.shutdown(), opener);

    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);
    assert!(scheduler
        .status()
        .iter()
        .all(|s| s.state == TriggerState::Stopped));

    assert!(scheduler.tick().fired.is_empty());
    assert!(matches!(scheduler.trigger_now(ONBOARDING), Err(AutomationError::ShutDown)));
}

#[tokio::test]
async fn test_shutdown_timeout_abandons_stuck_execution() {
    init_test_logging();
    let harness = Harness::with_settings(ExecutionSettings {
        operation_timeout: StdDuration::from_secs(30),
        ..ExecutionSettings::default()
    });
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.hang_for("staff1@ndis.test");

    let mut scheduler = harness.scheduler(config(100));
    scheduler.register(interval_workflow(60)).unwrap();
    scheduler.tick();

    let gateway = harness.gateway.clone();
    wait_until(StdDuration::from_secs(2), || gateway.attempts().len() == 1).await;

    let started = Instant::now();
    scheduler.shutdown().await;

    assert!(started.elapsed() < StdDuration::from_secs(2));
    assert!(harness.ledger.entries().is_empty());
    assert!(scheduler
        .status()
        .iter()
        .all(|s| s.state == TriggerState::Stopped));
}

#[tokio::test]
async fn test_run_loop_fires_until_cancelled() {
    init_test_logging();
    let harness = Harness::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));

    let mut scheduler = harness.scheduler(config(1_000));
    scheduler.register(interval_workflow(60)).unwrap();
    let scheduler = Arc::new(scheduler);

    let cancel = CancellationToken::new();
    let handle = {
        let scheduler = scheduler.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { scheduler.run(cancel).await })
    };

    let ledger = harness.ledger.clone();
    wait_until(StdDuration::from_secs(2), || {
        ledger.count(ONBOARDING, 1, AuditOutcome::Completed) == 1
    })
    .await;

    cancel.cancel();
    tokio::time::timeout(StdDuration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();

    assert!(scheduler.is_shut_down());
    assert_eq!(harness.gateway.attempts().len(), 1);
    assert!(scheduler
        .status()
        .iter()
        .all(|s| s.state == TriggerState::Stopped));
}
