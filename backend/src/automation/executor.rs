// Workflow Executor - runs one firing: eligible entities -> dispatch -> ledger

use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::pin::pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::clock::Clock;
use super::dispatcher::{DeliveryGateway, NotificationDispatcher};
use super::eligibility::{EligibilityEngine, EligibleEntity};
use super::error::{LedgerError, StoreError};
use super::ledger::{AuditLedger, KeyedLocks, LedgerKey, PendingAppends};
use super::registry::WorkflowDefinition;
use super::store::RecordStore;
use super::templates::TemplateCatalog;
use ndis_shared::{AuditEntry, AuditOutcome, OutcomeCounts};

/// What to assume when a notification went out but its `completed` entry
/// could not be confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerBias {
    /// Leave the entity eligible; a later firing may send again.
    #[default]
    Retry,
    /// Hold the entry in memory, treat the entity as notified and keep
    /// retrying the append at the start of each firing.
    Suppress,
}

impl FromStr for LedgerBias {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "retry" => Ok(Self::Retry),
            "suppress" => Ok(Self::Suppress),
            other => Err(format!("unknown ledger bias '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutionSettings {
    pub operation_timeout: Duration,
    pub max_concurrency: usize,
    pub ledger_bias: LedgerBias,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(15),
            max_concurrency: 8,
            ledger_bias: LedgerBias::Retry,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityOutcome {
    Completed,
    Failed,
    /// Dispatched, append not confirmed.
    Unconfirmed,
    /// A completed entry was already on the ledger when the lock was taken.
    AlreadyCompleted,
    /// Not started because shutdown was requested.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub workflow: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub counts: OutcomeCounts,
    pub cancelled: bool,
}

impl ExecutionReport {
    fn new(workflow: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            workflow: workflow.to_string(),
            started_at,
            finished_at: started_at,
            counts: OutcomeCounts::default(),
            cancelled: false,
        }
    }

    fn record(&mut self, outcome: EntityOutcome) {
        let counts = &mut self.counts;
        counts.eligible += 1;
        match outcome {
            EntityOutcome::Completed => counts.completed += 1,
            EntityOutcome::Failed => counts.failed += 1,
            EntityOutcome::Unconfirmed => counts.unconfirmed += 1,
            EntityOutcome::AlreadyCompleted => counts.already_completed += 1,
            EntityOutcome::Abandoned => counts.abandoned += 1,
        }
    }
}

pub struct WorkflowExecutor {
    eligibility: EligibilityEngine,
    dispatcher: NotificationDispatcher,
    ledger: Arc<dyn AuditLedger>,
    locks: KeyedLocks,
    pending: Arc<PendingAppends>,
    clock: Arc<dyn Clock>,
    settings: ExecutionSettings,
}

impl WorkflowExecutor {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn AuditLedger>,
        gateway: Arc<dyn DeliveryGateway>,
        templates: Arc<TemplateCatalog>,
        clock: Arc<dyn Clock>,
        settings: ExecutionSettings,
    ) -> Self {
        let pending = Arc::new(PendingAppends::new());
        let timeout = settings.operation_timeout;

        Self {
            eligibility: EligibilityEngine::new(store, ledger.clone(), pending.clone(), timeout),
            dispatcher: NotificationDispatcher::new(gateway, templates, timeout),
            ledger,
            locks: KeyedLocks::new(),
            pending,
            clock,
            settings,
        }
    }

    pub fn pending(&self) -> &PendingAppends {
        &self.pending
    }

    /// Run one firing of `workflow`. Entities are processed concurrently up
    /// to the configured limit; once `cancel` fires no new entity is started.
    pub async fn execute(
        &self,
        workflow: Arc<WorkflowDefinition>,
        cancel: &CancellationToken,
    ) -> Result<ExecutionReport, StoreError> {
        let started_at = self.clock.now();
        self.flush_pending(&workflow.name).await;

        let eligible = self.eligibility.eligible(workflow.clone(), started_at).await?;
        let mut report = ExecutionReport::new(&workflow.name, started_at);

        // The cancellation future is `!Unpin`, so the stream is pinned in place.
        let mut outcomes = pin!(eligible
            .take_until(cancel.cancelled())
            .map(|candidate| self.process(&workflow, candidate, cancel))
            .buffer_unordered(self.settings.max_concurrency.max(1)));

        while let Some(outcome) = outcomes.next().await {
            report.record(outcome);
        }

        report.cancelled = cancel.is_cancelled();
        report.finished_at = self.clock.now();

        let counts = &report.counts;
        info!(
            workflow = %report.workflow,
            eligible = counts.eligible,
            completed = counts.completed,
            failed = counts.failed,
            unconfirmed = counts.unconfirmed,
            already_completed = counts.already_completed,
            abandoned = counts.abandoned,
            cancelled = report.cancelled,
            "Workflow execution finished"
        );

        Ok(report)
    }

    async fn process(
        &self,
        workflow: &WorkflowDefinition,
        candidate: EligibleEntity,
        cancel: &CancellationToken,
    ) -> EntityOutcome {
        if cancel.is_cancelled() {
            return EntityOutcome::Abandoned;
        }

        let key = candidate.key;
        let _guard = self.locks.lock(&key).await;

        // Another execution may have completed this key since eligibility ran.
        if self.pending.contains(&key) {
            return EntityOutcome::AlreadyCompleted;
        }
        match tokio::time::timeout(self.settings.operation_timeout, self.ledger.latest_outcome(&key)).await {
            Ok(Ok(Some(AuditOutcome::Completed))) => return EntityOutcome::AlreadyCompleted,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!(workflow = %key.workflow, entity_id = key.entity_id, error = %e, "Ledger re-check failed, not dispatching");
                return EntityOutcome::Failed;
            }
            Err(_) => {
                warn!(workflow = %key.workflow, entity_id = key.entity_id, "Ledger re-check timed out, not dispatching");
                return EntityOutcome::Failed;
            }
        }

        let result = self
            .dispatcher
            .dispatch(workflow, &candidate.entity, self.clock.now())
            .await;
        let delivered = result.is_delivered();
        let outcome = if delivered {
            AuditOutcome::Completed
        } else {
            AuditOutcome::Failed
        };
        let entry = key.entry(outcome, result.details(), self.clock.now());

        match self.append(&entry).await {
            Ok(()) if delivered => {
                info!(
                    workflow = %key.workflow,
                    entity_type = %key.entity_type,
                    entity_id = key.entity_id,
                    epoch = %key.epoch,
                    outcome = %outcome,
                    "Notification recorded"
                );
                EntityOutcome::Completed
            }
            Ok(()) => {
                warn!(
                    workflow = %key.workflow,
                    entity_type = %key.entity_type,
                    entity_id = key.entity_id,
                    epoch = %key.epoch,
                    outcome = %outcome,
                    details = %entry.details,
                    "Notification failed, entity stays eligible"
                );
                EntityOutcome::Failed
            }
            Err(LedgerError::DuplicateCompleted { .. }) => {
                warn!(
                    workflow = %key.workflow,
                    entity_id = key.entity_id,
                    epoch = %key.epoch,
                    "Completed entry recorded by another writer"
                );
                EntityOutcome::AlreadyCompleted
            }
            Err(e) => {
                error!(
                    event = "ledger_write_failed",
                    workflow = %key.workflow,
                    entity_type = %key.entity_type,
                    entity_id = key.entity_id,
                    epoch = %key.epoch,
                    outcome = %outcome,
                    bias = ?self.settings.ledger_bias,
                    error = %e,
                    "Audit ledger append could not be confirmed"
                );
                if !delivered {
                    return EntityOutcome::Failed;
                }
                if self.settings.ledger_bias == LedgerBias::Suppress {
                    self.pending.hold(entry);
                }
                EntityOutcome::Unconfirmed
            }
        }
    }

    async fn append(&self, entry: &AuditEntry) -> Result<(), LedgerError> {
        let timeout = self.settings.operation_timeout;
        tokio::time::timeout(timeout, self.ledger.append(entry))
            .await
            .map_err(|_| LedgerError::Timeout(timeout))?
    }

    /// Retry appends held under `LedgerBias::Suppress` for one workflow.
    async fn flush_pending(&self, workflow: &str) {
        for entry in self.pending.for_workflow(workflow) {
            let key = LedgerKey::of(&entry);
            let _guard = self.locks.lock(&key).await;

            match self.append(&entry).await {
                Ok(()) | Err(LedgerError::DuplicateCompleted { .. }) => {
                    info!(
                        workflow = %key.workflow,
                        entity_id = key.entity_id,
                        epoch = %key.epoch,
                        "Pending ledger entry confirmed"
                    );
                    self.pending.release(&key);
                }
                Err(e) => {
                    error!(
                        event = "ledger_write_failed",
                        workflow = %key.workflow,
                        entity_id = key.entity_id,
                        epoch = %key.epoch,
                        error = %e,
                        "Pending ledger entry still unconfirmed"
                    );
                }
            }
        }
    }
}
