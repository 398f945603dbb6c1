// Eligibility Query Engine - newly eligible entities for one workflow firing

use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::error::StoreError;
use super::ledger::{AuditLedger, LedgerKey, PendingAppends};
use super::registry::{WindowPosition, WorkflowDefinition};
use super::store::{CandidateQuery, RecordStore};
use ndis_shared::{AuditOutcome, Entity};

/// A candidate that passed the window test and has no completed entry for
/// its epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EligibleEntity {
    pub entity: Entity,
    pub key: LedgerKey,
    pub position: WindowPosition,
}

/// Pure eligibility predicate: inside the window (or its grace extension)
/// and not yet completed for this epoch.
pub fn is_eligible(
    workflow: &WorkflowDefinition,
    entity: &Entity,
    now: DateTime<Utc>,
    latest: Option<AuditOutcome>,
) -> bool {
    workflow.window_position(entity, now).is_eligible() && latest != Some(AuditOutcome::Completed)
}

pub struct EligibilityEngine {
    store: Arc<dyn RecordStore>,
    ledger: Arc<dyn AuditLedger>,
    pending: Arc<PendingAppends>,
    timeout: Duration,
}

impl EligibilityEngine {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn AuditLedger>,
        pending: Arc<PendingAppends>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            ledger,
            pending,
            timeout,
        }
    }

    /// Query the store once, then lazily check each candidate against the
    /// ledger as the stream is polled. A store failure abandons the firing;
    /// a ledger lookup failure only skips that entity.
    pub async fn eligible(
        &self,
        workflow: Arc<WorkflowDefinition>,
        now: DateTime<Utc>,
    ) -> Result<BoxStream<'static, EligibleEntity>, StoreError> {
        let query = CandidateQuery::for_workflow(&workflow, now);
        let candidates = tokio::time::timeout(self.timeout, self.store.candidates(&query))
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        let ledger = self.ledger.clone();
        let pending = self.pending.clone();
        let timeout = self.timeout;

        let eligible = stream::iter(candidates).filter_map(move |entity| {
            let workflow = workflow.clone();
            let ledger = ledger.clone();
            let pending = pending.clone();

            async move {
                let position = workflow.window_position(&entity, now);
                if !position.is_eligible() {
                    return None;
                }

                let key = LedgerKey::new(
                    workflow.name.clone(),
                    entity.entity_type,
                    entity.entity_id,
                    workflow.epoch.key_for(&entity),
                );
                if pending.contains(&key) {
                    return None;
                }

                let latest = match tokio::time::timeout(timeout, ledger.latest_outcome(&key)).await {
                    Ok(Ok(latest)) => latest,
                    Ok(Err(e)) => {
                        warn!(
                            workflow = %key.workflow,
                            entity_id = key.entity_id,
                            error = %e,
                            "Ledger lookup failed, skipping entity this firing"
                        );
                        return None;
                    }
                    Err(_) => {
                        warn!(
                            workflow = %key.workflow,
                            entity_id = key.entity_id,
                            "Ledger lookup timed out, skipping entity this firing"
                        );
                        return None;
                    }
                };

                if !is_eligible(&workflow, &entity, now, latest) {
                    return None;
                }

                if position == WindowPosition::CatchUp {
                    info!(
                        workflow = %key.workflow,
                        entity_type = %key.entity_type,
                        entity_id = key.entity_id,
                        epoch = %key.epoch,
                        "Entity eligible in catch-up grace period"
                    );
                }

                Some(EligibleEntity {
                    entity,
                    key,
                    position,
                })
            }
        });

        Ok(eligible.boxed())
    }
}
