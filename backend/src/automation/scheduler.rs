// Scheduler Core - trigger table, tick loop and graceful drain

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use super::error::{AutomationError, AutomationResult, StoreError};
use super::executor::{ExecutionReport, WorkflowExecutor};
use super::registry::{WorkflowDefinition, WorkflowRegistry};
use ndis_shared::{OutcomeCounts, TriggerState, WorkflowStatusView};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireDecision {
    Fired,
    /// Previous execution still in flight.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fired: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug)]
struct TriggerSlot {
    phase: TriggerState,
    next_due_at: Option<DateTime<Utc>>,
    last_fired_at: Option<DateTime<Utc>>,
    last_outcome: Option<OutcomeCounts>,
    last_error: Option<String>,
    skipped_overlaps: u64,
}

struct Trigger {
    definition: Arc<WorkflowDefinition>,
    state: Mutex<TriggerSlot>,
}

impl Trigger {
    fn state(&self) -> std::sync::MutexGuard<'_, TriggerSlot> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Returns the trigger to `Idle` when an execution ends, including when the
/// task panics or is aborted.
struct RunningGuard {
    trigger: Arc<Trigger>,
}

impl RunningGuard {
    fn finish(&self, result: &Result<ExecutionReport, StoreError>) {
        let mut state = self.trigger.state();
        match result {
            Ok(report) => {
                state.last_outcome = Some(report.counts.clone());
                state.last_error = None;
            }
            Err(e) => {
                state.last_error = Some(e.to_string());
            }
        }
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let mut state = self.trigger.state();
        if state.phase == TriggerState::Running {
            state.phase = TriggerState::Idle;
        }
    }
}

pub struct Scheduler {
    triggers: Vec<Arc<Trigger>>,
    executor: Arc<WorkflowExecutor>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    in_flight: Mutex<JoinSet<()>>,
    executions_cancel: CancellationToken,
    shut_down: AtomicBool,
}

impl Scheduler {
    pub fn new(executor: Arc<WorkflowExecutor>, clock: Arc<dyn Clock>, config: SchedulerConfig) -> Self {
        Self {
            triggers: Vec::new(),
            executor,
            clock,
            config,
            in_flight: Mutex::new(JoinSet::new()),
            executions_cancel: CancellationToken::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Add a trigger. Its first due time is computed from the wall clock now.
    pub fn register(&mut self, definition: Arc<WorkflowDefinition>) -> AutomationResult<()> {
        if self.find(&definition.name).is_some() {
            return Err(AutomationError::DuplicateWorkflow(definition.name.clone()));
        }
        definition
            .recurrence
            .validate()
            .map_err(|reason| AutomationError::InvalidWorkflow {
                workflow: definition.name.clone(),
                reason,
            })?;

        let next_due_at = definition.recurrence.first_due(self.clock.now());
        info!(workflow = %definition.name, next_due_at = ?next_due_at, "Registered workflow trigger");

        self.triggers.push(Arc::new(Trigger {
            definition,
            state: Mutex::new(TriggerSlot {
                phase: TriggerState::Idle,
                next_due_at,
                last_fired_at: None,
                last_outcome: None,
                last_error: None,
                skipped_overlaps: 0,
            }),
        }));
        Ok(())
    }

    pub fn register_all(&mut self, registry: &WorkflowRegistry) -> AutomationResult<()> {
        for definition in registry.workflows() {
            self.register(definition.clone())?;
        }
        Ok(())
    }

    fn find(&self, name: &str) -> Option<&Arc<Trigger>> {
        self.triggers.iter().find(|t| t.name() == name)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Fire every trigger whose due time has passed. The next due time is
    /// recomputed from `now`, so a long pause yields one catch-up firing.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        if self.is_shut_down() {
            return report;
        }

        self.reap_finished();
        let now = self.clock.now();

        for trigger in &self.triggers {
            {
                let mut state = trigger.state();
                let due = state.next_due_at.is_some_and(|due| due <= now);
                if !due || state.phase == TriggerState::Stopped {
                    continue;
                }
                state.next_due_at = trigger.definition.recurrence.next_after(now);
            }

            match self.fire(trigger, now) {
                FireDecision::Fired => report.fired.push(trigger.name().to_string()),
                FireDecision::Skipped => report.skipped.push(trigger.name().to_string()),
            }
        }

        if !report.fired.is_empty() || !report.skipped.is_empty() {
            debug!(fired = ?report.fired, skipped = ?report.skipped, "Scheduler tick");
        }
        report
    }

    /// Fire one workflow immediately, outside its recurrence.
    pub fn trigger_now(&self, name: &str) -> AutomationResult<FireDecision> {
        if self.is_shut_down() {
            return Err(AutomationError::ShutDown);
        }
        let trigger = self
            .find(name)
            .ok_or_else(|| AutomationError::UnknownWorkflow(name.to_string()))?;

        info!(workflow = %name, "Manual workflow trigger");
        Ok(self.fire(trigger, self.clock.now()))
    }

    fn fire(&self, trigger: &Arc<Trigger>, now: DateTime<Utc>) -> FireDecision {
        {
            let mut state = trigger.state();
            if state.phase != TriggerState::Idle {
                state.skipped_overlaps += 1;
                warn!(
                    event = "skipped_overlap",
                    workflow = %trigger.name(),
                    skipped_overlaps = state.skipped_overlaps,
                    "Workflow still running, skipping this firing"
                );
                return FireDecision::Skipped;
            }
            state.phase = TriggerState::Running;
            state.last_fired_at = Some(now);
        }

        let guard = RunningGuard {
            trigger: trigger.clone(),
        };
        let executor = self.executor.clone();
        let cancel = self.executions_cancel.clone();

        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.spawn(async move {
            let workflow = guard.trigger.definition.clone();
            let result = executor.execute(workflow.clone(), &cancel).await;
            if let Err(e) = &result {
                error!(workflow = %workflow.name, error = %e, "Workflow firing abandoned");
            }
            guard.finish(&result);
        });

        FireDecision::Fired
    }

    fn reap_finished(&self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        while let Some(result) = in_flight.try_join_next() {
            log_join_result(result);
        }
    }

    /// Wait until no execution is in flight.
    pub async fn wait_for_in_flight(&self) {
        loop {
            let mut running = {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                std::mem::take(&mut *in_flight)
            };
            if running.is_empty() {
                return;
            }
            while let Some(result) = running.join_next().await {
                log_join_result(result);
            }
        }
    }

    /// Run the tick loop until `cancel` fires, then drain.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            workflows = self.triggers.len(),
            tick_secs = self.config.tick_interval.as_secs(),
            "Automation scheduler started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick();
                }
            }
        }

        self.shutdown().await;
    }

    /// Stop firing, let in-flight executions finish their current entity,
    /// abort whatever is left after the shutdown timeout.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Automation scheduler shutting down");
        self.executions_cancel.cancel();

        let drained = tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_in_flight()).await;
        if drained.is_err() {
            let abandoned: Vec<String> = self
                .triggers
                .iter()
                .filter(|t| t.state().phase == TriggerState::Running)
                .map(|t| t.name().to_string())
                .collect();
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            in_flight.abort_all();
            warn!(
                event = "shutdown_abandoned",
                workflows = ?abandoned,
                timeout_secs = self.config.shutdown_timeout.as_secs(),
                "Shutdown timeout reached, abandoning in-flight executions"
            );
        }

        for trigger in &self.triggers {
            trigger.state().phase = TriggerState::Stopped;
        }
        info!("Automation scheduler stopped");
    }

    pub fn status(&self) -> Vec<WorkflowStatusView> {
        self.triggers
            .iter()
            .map(|trigger| {
                let state = trigger.state();
                WorkflowStatusView {
                    name: trigger.name().to_string(),
                    description: trigger.definition.description.clone(),
                    state: state.phase,
                    last_fired_at: state.last_fired_at,
                    next_due_at: state.next_due_at,
                    last_outcome: state.last_outcome.clone(),
                    last_error: state.last_error.clone(),
                    skipped_overlaps: state.skipped_overlaps,
                }
            })
            .collect()
    }

    pub fn workflow_status(&self, name: &str) -> Option<WorkflowStatusView> {
        self.status().into_iter().find(|s| s.name == name)
    }
}

fn log_join_result(result: Result<(), JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(error = %e, "Workflow execution panicked");
        } else {
            debug!(error = %e, "Workflow execution cancelled");
        }
    }
}
