// Dispatch-then-record protocol, retries and ledger bias

use chrono::Duration;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::automation::{ExecutionSettings, LedgerBias, WorkflowDefinition, WorkflowRegistry};
use crate::tests::fixtures::{compliance_document, fixed_now, staff, Harness};
use crate::tests::helpers::wait_until;
use crate::tests::init_test_logging;
use ndis_shared::AuditOutcome;

const ONBOARDING: &str = "onboarding_reminder";

fn builtin(name: &str) -> Arc<WorkflowDefinition> {
    WorkflowRegistry::builtin().unwrap().get(name).unwrap().clone()
}

fn settings(timeout_ms: u64, bias: LedgerBias) -> ExecutionSettings {
    ExecutionSettings {
        operation_timeout: std::time::Duration::from_millis(timeout_ms),
        max_concurrency: 4,
        ledger_bias: bias,
    }
}

#[tokio::test]
async fn test_scenario_a_completed_entity_drops_out() {
    init_test_logging();
    let harness = Harness::new();
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 1);
    assert_eq!(report.counts.completed, 1);
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);

    let sent = harness.gateway.delivered();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].recipient, "staff1@ndis.test");
    assert_eq!(sent[0].subject, "Profile Completion Reminder");
    assert!(sent[0].body.contains("Hired on: 2026-03-07"));

    // Next tick: not in the eligible set.
    harness.clock.advance(Duration::minutes(1));
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 0);
    assert_eq!(harness.gateway.delivered().len(), 1);
}

#[tokio::test]
async fn test_scenario_c_timeout_is_failed_then_retried() {
    init_test_logging();
    let harness = Harness::with_settings(settings(100, LedgerBias::Retry));
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(7, fixed_now() - Duration::days(3)));
    harness.gateway.hang_for("staff7@ndis.test");

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.failed, 1);

    let entries = harness.ledger.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].outcome, AuditOutcome::Failed);
    assert!(entries[0].details.contains("timed out"));

    harness.gateway.recover("staff7@ndis.test");
    harness.clock.advance(Duration::minutes(5));

    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.completed, 1);
    assert_eq!(harness.gateway.attempts().len(), 2);
    assert_eq!(harness.ledger.count(ONBOARDING, 7, AuditOutcome::Completed), 1);
}

#[tokio::test]
async fn test_scenario_d_renewed_document_is_eligible_again() {
    init_test_logging();
    let harness = Harness::new();
    let workflow = builtin("compliance_renewal");
    let cancel = CancellationToken::new();
    let now = fixed_now();
    harness.store.insert(compliance_document(3, now + Duration::days(10)));

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.completed, 1);

    // Same expiry date: already notified.
    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 0);

    // Renewed with a new expiry date: new epoch.
    harness.store.update(compliance_document(3, now + Duration::days(25)));
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.completed, 1);

    let mut epochs: Vec<String> = harness
        .ledger
        .entries()
        .into_iter()
        .filter(|e| e.outcome == AuditOutcome::Completed)
        .map(|e| e.epoch_key)
        .collect();
    epochs.sort();
    assert_eq!(epochs, vec!["2026-03-20".to_string(), "2026-04-04".to_string()]);
    assert_eq!(harness.gateway.delivered_to("holder3@ndis.test"), 2);
}

#[tokio::test]
async fn test_failures_are_isolated_per_entity() {
    init_test_logging();
    let harness = Harness::new();
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    for id in 1..=3 {
        harness.store.insert(staff(id, fixed_now() - Duration::days(3)));
    }
    harness.gateway.fail_for("staff2@ndis.test");

    let mut no_email = staff(4, fixed_now() - Duration::days(3));
    no_email.recipient_email = None;
    harness.store.insert(no_email);

    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 4);
    assert_eq!(report.counts.completed, 2);
    assert_eq!(report.counts.failed, 2);
    assert_eq!(harness.ledger.count(ONBOARDING, 2, AuditOutcome::Failed), 1);
    assert_eq!(harness.ledger.count(ONBOARDING, 4, AuditOutcome::Failed), 1);
}

#[tokio::test]
async fn test_store_failure_abandons_firing() {
    init_test_logging();
    let harness = Harness::new();
    harness.store.set_failing(true);

    let result = harness
        .executor
        .execute(builtin(ONBOARDING), &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert!(harness.gateway.attempts().is_empty());
}

#[tokio::test]
async fn test_overlapping_executions_record_one_completion() {
    init_test_logging();
    let harness = Harness::new();
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.close_gate();

    let gateway = harness.gateway.clone();
    let opener = async move {
        wait_until(std::time::Duration::from_secs(2), || !gateway.attempts().is_empty()).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        gateway.open_gate();
    };

    let (first, second, _) = tokio::join!(
        harness.executor.execute(workflow.clone(), &cancel),
        harness.executor.execute(workflow.clone(), &cancel),
        opener,
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.counts.completed + second.counts.completed, 1);
    assert_eq!(first.counts.already_completed + second.counts.already_completed, 1);
    assert_eq!(harness.gateway.attempts().len(), 1);
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);
}

#[tokio::test]
async fn test_separate_writers_cannot_record_two_completions() {
    init_test_logging();
    let harness = Harness::new();
    let other = harness.second_executor();
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.gateway.close_gate();

    let gateway = harness.gateway.clone();
    let opener = async move {
        wait_until(std::time::Duration::from_secs(2), || gateway.attempts().len() == 2).await;
        gateway.open_gate();
    };

    let (first, second, _) = tokio::join!(
        harness.executor.execute(workflow.clone(), &cancel),
        other.execute(workflow.clone(), &cancel),
        opener,
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.counts.completed + second.counts.completed, 1);
    assert_eq!(first.counts.already_completed + second.counts.already_completed, 1);
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);
}

#[tokio::test]
async fn test_retry_bias_leaves_unconfirmed_entity_eligible() {
    init_test_logging();
    let harness = Harness::with_settings(settings(500, LedgerBias::Retry));
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.ledger.fail_appends(true);

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.unconfirmed, 1);
    assert!(harness.executor.pending().is_empty());

    harness.ledger.fail_appends(false);
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.completed, 1);
    assert_eq!(harness.gateway.delivered().len(), 2);
}

#[tokio::test]
async fn test_suppress_bias_holds_entry_until_durable() {
    init_test_logging();
    let harness = Harness::with_settings(settings(500, LedgerBias::Suppress));
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.ledger.fail_appends(true);

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.unconfirmed, 1);
    assert_eq!(harness.executor.pending().len(), 1);

    // Still failing: entity suppressed, nothing re-sent.
    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 0);
    assert_eq!(harness.executor.pending().len(), 1);

    // Ledger back: the held entry is flushed at the start of the firing.
    harness.ledger.fail_appends(false);
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 0);
    assert!(harness.executor.pending().is_empty());
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);
    assert_eq!(harness.gateway.delivered().len(), 1);
}

#[tokio::test]
async fn test_append_timeout_after_delivery_under_retry_bias() {
    init_test_logging();
    let harness = Harness::with_settings(settings(100, LedgerBias::Retry));
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.ledger.hang_appends(true);

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.unconfirmed, 1);
    assert_eq!(report.counts.completed, 0);
    assert!(harness.executor.pending().is_empty());
    assert_eq!(harness.gateway.delivered().len(), 1);

    harness.ledger.hang_appends(false);
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.completed, 1);
    assert_eq!(harness.gateway.delivered().len(), 2);
}

#[tokio::test]
async fn test_append_timeout_after_delivery_under_suppress_bias() {
    init_test_logging();
    let harness = Harness::with_settings(settings(100, LedgerBias::Suppress));
    let workflow = builtin(ONBOARDING);
    let cancel = CancellationToken::new();
    harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
    harness.ledger.hang_appends(true);

    let report = harness.executor.execute(workflow.clone(), &cancel).await.unwrap();
    assert_eq!(report.counts.unconfirmed, 1);
    assert_eq!(harness.executor.pending().len(), 1);

    harness.ledger.hang_appends(false);
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();
    assert_eq!(report.counts.eligible, 0);
    assert!(harness.executor.pending().is_empty());
    assert_eq!(harness.ledger.count(ONBOARDING, 1, AuditOutcome::Completed), 1);
    assert_eq!(harness.gateway.delivered().len(), 1);
}

#[tokio::test]
async fn test_append_timeout_after_failed_dispatch_is_failed() {
    init_test_logging();
    for bias in [LedgerBias::Retry, LedgerBias::Suppress] {
        let harness = Harness::with_settings(settings(100, bias));
        harness.store.insert(staff(1, fixed_now() - Duration::days(3)));
        harness.gateway.fail_for("staff1@ndis.test");
        harness.ledger.hang_appends(true);

        let report = harness
            .executor
            .execute(builtin(ONBOARDING), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.counts.failed, 1, "bias {:?}", bias);
        assert_eq!(report.counts.unconfirmed, 0, "bias {:?}", bias);
        assert!(harness.executor.pending().is_empty(), "bias {:?}", bias);
        assert!(harness.ledger.entries().is_empty(), "bias {:?}", bias);
    }
}

#[tokio::test]
async fn test_cancelled_execution_starts_no_new_entities() {
    init_test_logging();
    let harness = Harness::new();
    let workflow = builtin(ONBOARDING);
    for id in 1..=3 {
        harness.store.insert(staff(id, fixed_now() - Duration::days(3)));
    }

    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = harness.executor.execute(workflow, &cancel).await.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.counts.completed, 0);
    assert!(harness.gateway.attempts().is_empty());
}

#[tokio::test]
async fn test_cancel_lets_current_entity_finish() {
    init_test_logging();
    let harness = Harness::with_settings(ExecutionSettings {
        operation_timeout: std::time::Duration::from_secs(2),
        max_concurrency: 1,
        ledger_bias: LedgerBias::Retry,
    });
    let workflow = builtin(ONBOARDING);
    for id in 1..=3 {
        harness.store.insert(staff(id, fixed_now() - Duration::days(3)));
    }
    harness.gateway.close_gate();

    let cancel = CancellationToken::new();
    let gateway = harness.gateway.clone();
    let canceller = {
        let cancel = cancel.clone();
        async move {
            wait_until(std::time::Duration::from_secs(2), || gateway.attempts().len() == 1).await;
            cancel.cancel();
            gateway.open_gate();
        }
    };

    let (report, _) = tokio::join!(harness.executor.execute(workflow, &cancel), canceller);
    let report = report.unwrap();

    assert!(report.cancelled);
    assert_eq!(report.counts.completed, 1);
    assert_eq!(harness.gateway.attempts().len(), 1);
    assert_eq!(harness.ledger.entries().len(), 1);
}
