//! Lifecycle workers.
//!
//! Each worker owns one shard queue and drives the task-run state machine
//! from unit phase transitions:
//!
//! - `Running`   -- "started" notification only
//! - `Succeeded` -- delete the unit, advance dependents, allocate them
//! - `Failed`    -- retry within the backoff budget, else fail and suspend
//!                  everything downstream
//! - `Pending`   -- a container configuration error is an immediate
//!                  unretryable failure
//!
//! Store and substrate failures abandon the current event and are logged;
//! the loop itself never stops on an error.

use std::sync::Arc;
use std::time::Duration;

use dagrun_types::error::{EngineError, SubstrateError};
use dagrun_types::run::{
    EXIT_CODE_CONFIG_ERROR, EXIT_CODE_NOT_STARTED, FailureReason, RunId, StartedTask, TaskRunId,
    UnitStatusUpdate, UnretryableTaskFailure, WebhookTarget,
};
use dagrun_types::unit::{UnitEvent, UnitPhase, UnitSnapshot};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::{UnitAllocator, UnitSubstrate, task_from_unit};
use crate::repository::DagStore;
use crate::resolver::DependencyResolver;
use crate::webhook::WebhookNotifier;

/// Exit code reported for a failed unit.
pub fn failure_exit_code(unit: &UnitSnapshot) -> i32 {
    unit.termination()
        .map(|t| t.exit_code)
        .unwrap_or(EXIT_CODE_NOT_STARTED)
}

// ---------------------------------------------------------------------------
// LifecycleWorker
// ---------------------------------------------------------------------------

pub struct LifecycleWorker<S, U> {
    id: usize,
    store: Arc<S>,
    resolver: DependencyResolver<S>,
    allocator: UnitAllocator<U>,
    notifier: WebhookNotifier,
}

impl<S: DagStore, U: UnitSubstrate> LifecycleWorker<S, U> {
    pub fn new(
        id: usize,
        store: Arc<S>,
        allocator: UnitAllocator<U>,
        notifier: WebhookNotifier,
    ) -> Self {
        Self {
            id,
            resolver: DependencyResolver::new(Arc::clone(&store)),
            store,
            allocator,
            notifier,
        }
    }

    /// Poll `queue` once per `poll` interval, handling at most one event per
    /// tick, until `cancel` fires or the queue closes.
    pub async fn run(
        self,
        mut queue: mpsc::Receiver<UnitEvent>,
        poll: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(poll);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(worker = self.id, "worker started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match queue.try_recv() {
                    Ok(event) => self.handle_event(event).await,
                    Err(TryRecvError::Empty) => {}
                    Err(TryRecvError::Disconnected) => {
                        info!(worker = self.id, "worker queue closed");
                        break;
                    }
                },
            }
        }

        info!(worker = self.id, "worker stopped");
    }

    /// Process one unit event.
    pub async fn handle_event(&self, event: UnitEvent) {
        let unit = &event.unit;
        info!(
            worker = self.id,
            uid = %unit.uid,
            name = unit.name(),
            event = event.kind.as_str(),
            phase = %unit.phase,
            "unit event"
        );

        let (Some(task_run_id), Some(run_id)) = (unit.task_run_id(), unit.run_id()) else {
            error!(uid = %unit.uid, name = unit.name(), "unit is missing run annotations");
            return;
        };

        let mut write_state = true;
        let outcome = match unit.phase {
            UnitPhase::Succeeded => self.handle_succeeded(unit, run_id, task_run_id).await,
            UnitPhase::Failed => self.handle_failed(unit, run_id, task_run_id).await,
            UnitPhase::Running => {
                self.handle_running(unit, run_id, task_run_id).await;
                Ok(())
            }
            UnitPhase::Pending => match unit.config_error() {
                Some(reason) => {
                    write_state = false;
                    self.handle_config_error(unit, run_id, task_run_id, reason)
                        .await
                }
                None => {
                    self.handle_pending(unit, run_id, task_run_id).await;
                    Ok(())
                }
            },
            UnitPhase::Unknown => {
                info!(uid = %unit.uid, name = unit.name(), "unit status unknown");
                return;
            }
        };

        if let Err(e) = outcome {
            error!(
                worker = self.id,
                uid = %unit.uid,
                task_run_id,
                phase = %unit.phase,
                error = %e,
                "failed to process unit event"
            );
        }

        if write_state {
            if let Err(e) = self.write_status(unit, run_id, task_run_id).await {
                error!(uid = %unit.uid, task_run_id, error = %e, "failed to write unit status");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Phase handlers
    // -----------------------------------------------------------------------

    async fn handle_running(&self, unit: &UnitSnapshot, run_id: RunId, task_run_id: TaskRunId) {
        info!(uid = %unit.uid, name = unit.name(), task_run_id, "task started");
        self.notify(run_id, task_run_id, unit.task_name(), "started").await;
    }

    async fn handle_pending(&self, unit: &UnitSnapshot, run_id: RunId, task_run_id: TaskRunId) {
        debug!(uid = %unit.uid, name = unit.name(), task_run_id, "task pending");
        self.notify(run_id, task_run_id, unit.task_name(), "pending").await;
    }

    async fn handle_succeeded(
        &self,
        unit: &UnitSnapshot,
        run_id: RunId,
        task_run_id: TaskRunId,
    ) -> Result<(), EngineError> {
        info!(uid = %unit.uid, name = unit.name(), task_run_id, "task succeeded");

        if !self.delete_unit(unit, false).await? {
            return Ok(());
        }

        let next = self.resolver.advance_on_success(task_run_id).await?;
        self.notify(run_id, task_run_id, unit.task_name(), "success").await;

        if next.is_empty() {
            self.release_if_complete(unit, run_id).await;
            return Ok(());
        }

        info!(run_id, count = next.len(), "allocating next tasks");
        self.allocate_next(unit, run_id, next).await;
        Ok(())
    }

    async fn handle_failed(
        &self,
        unit: &UnitSnapshot,
        run_id: RunId,
        task_run_id: TaskRunId,
    ) -> Result<(), EngineError> {
        let exit_code = failure_exit_code(unit);
        info!(uid = %unit.uid, name = unit.name(), task_run_id, exit_code, "task failed");

        if !self.delete_unit(unit, false).await? {
            return Ok(());
        }

        if !self.store.should_rerun(task_run_id, exit_code).await? {
            self.handle_unretryable(
                unit,
                UnretryableTaskFailure {
                    run_id,
                    task_run_id,
                    exit_code,
                    reason: FailureReason::RetriesExhausted,
                },
            )
            .await;
            return Ok(());
        }

        self.retry(unit, run_id, task_run_id, exit_code).await
    }

    async fn handle_config_error(
        &self,
        unit: &UnitSnapshot,
        run_id: RunId,
        task_run_id: TaskRunId,
        reason: &str,
    ) -> Result<(), EngineError> {
        warn!(
            uid = %unit.uid,
            name = unit.name(),
            task_run_id,
            reason,
            "container configuration error, treating as failure"
        );

        if !self.delete_unit(unit, true).await? {
            return Ok(());
        }

        let update = UnitStatusUpdate {
            uid: unit.uid.clone(),
            name: unit.name().to_string(),
            namespace: unit.namespace().to_string(),
            task_run_id,
            phase: UnitPhase::Failed.as_str().to_string(),
            exit_code: Some(EXIT_CODE_CONFIG_ERROR),
            observed_at: unit.observed_at,
        };
        if let Err(e) = self.store.mark_unit_status(&update).await {
            error!(uid = %unit.uid, task_run_id, error = %e, "failed to record config error");
        }

        self.handle_unretryable(
            unit,
            UnretryableTaskFailure {
                run_id,
                task_run_id,
                exit_code: EXIT_CODE_CONFIG_ERROR,
                reason: FailureReason::ConfigError(reason.to_string()),
            },
        )
        .await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn retry(
        &self,
        unit: &UnitSnapshot,
        run_id: RunId,
        task_run_id: TaskRunId,
        exit_code: i32,
    ) -> Result<(), EngineError> {
        let Some(task_id) = unit.task_id() else {
            return Err(EngineError::NotFound(format!(
                "task id annotation on unit {}",
                unit.name()
            )));
        };

        let template = self.store.get_task_template(task_id).await?;
        let task = task_from_unit(unit, template);
        let container = &unit.spec.container;

        match self
            .allocator
            .allocate_with_env(
                &task,
                run_id,
                task_run_id,
                unit.namespace(),
                container.env.clone(),
                container.resources.clone(),
            )
            .await
        {
            Ok(uid) => {
                if let Err(e) = self.store.increment_attempts(task_run_id).await {
                    error!(task_run_id, error = %e, "failed to increment attempts");
                }
                info!(task_run_id, exit_code, new_uid = %uid, "retrying task");
            }
            Err(e) => {
                error!(task_run_id, error = %e, "failed to allocate retry unit");
                self.handle_unretryable(
                    unit,
                    UnretryableTaskFailure {
                        run_id,
                        task_run_id,
                        exit_code,
                        reason: FailureReason::AllocationFailed(e.to_string()),
                    },
                )
                .await;
            }
        }
        Ok(())
    }

    async fn allocate_next(&self, unit: &UnitSnapshot, run_id: RunId, next: Vec<StartedTask>) {
        for started in next {
            let result = self
                .allocator
                .allocate(&started.task, run_id, started.task_run_id, unit.namespace())
                .await;

            if let Err(e) = result {
                error!(
                    run_id,
                    task_run_id = started.task_run_id,
                    task = %started.task.name,
                    error = %e,
                    "failed to allocate task"
                );
                self.handle_unretryable(
                    unit,
                    UnretryableTaskFailure {
                        run_id,
                        task_run_id: started.task_run_id,
                        exit_code: EXIT_CODE_NOT_STARTED,
                        reason: FailureReason::AllocationFailed(e.to_string()),
                    },
                )
                .await;
            }
        }
    }

    /// Fail the task run for good and suspend everything downstream of it.
    async fn handle_unretryable(&self, unit: &UnitSnapshot, failure: UnretryableTaskFailure) {
        let info = self
            .store
            .task_run_info(failure.task_run_id)
            .await
            .unwrap_or_else(|_| dagrun_types::run::TaskRunInfo::unknown());

        info!(
            run_id = failure.run_id,
            task_run_id = failure.task_run_id,
            dag = %info.dag_name,
            task = %info.task_name,
            exit_code = failure.exit_code,
            reason = ?failure.reason,
            "task failed permanently"
        );

        if let Err(e) = self.store.mark_task_failed(failure.task_run_id).await {
            error!(task_run_id = failure.task_run_id, error = %e, "failed to mark task as failed");
        }

        let webhook = self.webhook(failure.run_id).await;
        let task_name = if info.task_name == "unknown" {
            unit.task_name().to_string()
        } else {
            info.task_name.clone()
        };
        if let Some(target) = &webhook {
            self.notifier.notify_task_run(
                &task_name,
                "failed",
                failure.run_id,
                failure.task_run_id,
                target,
            );
        }

        let suspended = match self
            .store
            .suspend_downstream(failure.run_id, failure.task_run_id)
            .await
        {
            Ok(names) => names,
            Err(e) => {
                error!(task_run_id = failure.task_run_id, error = %e, "failed to suspend downstream tasks");
                return;
            }
        };

        for name in &suspended {
            info!(run_id = failure.run_id, task = %name, "task suspended");
            if let Some(target) = &webhook {
                self.notifier.notify_task_run(
                    name,
                    "suspended",
                    failure.run_id,
                    failure.task_run_id,
                    target,
                );
            }
        }

        self.release_if_complete(unit, failure.run_id).await;
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Delete a unit. Returns `false` when it was already gone, meaning an
    /// earlier event for it was handled.
    async fn delete_unit(
        &self,
        unit: &UnitSnapshot,
        remove_finalizer: bool,
    ) -> Result<bool, EngineError> {
        match self
            .allocator
            .substrate()
            .delete_unit(unit.name(), unit.namespace(), remove_finalizer)
            .await
        {
            Ok(()) => Ok(true),
            Err(SubstrateError::NotFound(_)) => {
                info!(uid = %unit.uid, name = unit.name(), "unit already deleted/handled, skipping");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn release_if_complete(&self, unit: &UnitSnapshot, run_id: RunId) {
        match self.store.run_complete(run_id).await {
            Ok(false) => {}
            Ok(true) => {
                info!(run_id, "run complete");
                let Some(claim) = unit.workspace_claim() else {
                    return;
                };
                if let Err(e) = self
                    .allocator
                    .substrate()
                    .release_workspace(claim, unit.namespace())
                    .await
                {
                    error!(run_id, claim, error = %e, "failed to release workspace");
                }
            }
            Err(e) => error!(run_id, error = %e, "failed to check if run is complete"),
        }
    }

    async fn webhook(&self, run_id: RunId) -> Option<WebhookTarget> {
        match self.store.get_webhook(run_id).await {
            Ok(target) => target.filter(|t| !t.url.is_empty()),
            Err(e) => {
                error!(run_id, error = %e, "failed to get webhook details");
                None
            }
        }
    }

    async fn notify(&self, run_id: RunId, task_run_id: TaskRunId, task_name: &str, status: &str) {
        if let Some(target) = self.webhook(run_id).await {
            self.notifier
                .notify_task_run(task_name, status, run_id, task_run_id, &target);
        }
    }

    /// Persist the unit's phase with last-writer-wins semantics, ordered by
    /// the substrate's transition time.
    async fn write_status(
        &self,
        unit: &UnitSnapshot,
        run_id: RunId,
        task_run_id: TaskRunId,
    ) -> Result<(), EngineError> {
        let termination = unit.termination();
        let (exit_code, duration_secs) = match termination {
            Some(t) => (Some(t.exit_code), t.duration_secs()),
            None if unit.phase == UnitPhase::Failed => (Some(EXIT_CODE_NOT_STARTED), 0),
            None => (None, 0),
        };

        let update = UnitStatusUpdate {
            uid: unit.uid.clone(),
            name: unit.name().to_string(),
            namespace: unit.namespace().to_string(),
            task_run_id,
            phase: unit.phase.as_str().to_string(),
            exit_code,
            observed_at: unit.observed_at,
        };

        let applied = self.store.mark_unit_status(&update).await?;
        if !applied {
            debug!(uid = %unit.uid, phase = %unit.phase, "stale unit status ignored");
        }

        if applied && termination.is_some() {
            self.store.add_unit_duration(&unit.uid, duration_secs).await?;
            info!(
                uid = %unit.uid,
                task = unit.task_name(),
                phase = %unit.phase,
                duration_secs,
                "unit finished"
            );
        }

        if let Some(target) = self.webhook(run_id).await {
            self.notifier.notify_unit_event(
                unit.task_name(),
                unit.phase.as_str(),
                run_id,
                task_run_id,
                &target,
                duration_secs,
            );
        }

        debug!(uid = %unit.uid, task_run_id, phase = %unit.phase, "unit status written");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// WorkerPool
// ---------------------------------------------------------------------------

/// One lifecycle worker task per shard queue.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn<S: DagStore, U: UnitSubstrate>(
        queues: Vec<mpsc::Receiver<UnitEvent>>,
        store: Arc<S>,
        allocator: UnitAllocator<U>,
        notifier: WebhookNotifier,
        poll: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let handles = queues
            .into_iter()
            .enumerate()
            .map(|(id, queue)| {
                let worker =
                    LifecycleWorker::new(id, Arc::clone(&store), allocator.clone(), notifier.clone());
                tokio::spawn(worker.run(queue, poll, cancel.clone()))
            })
            .collect();

        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use dagrun_types::unit::{ContainerState, ContainerStatus, UnitSpec};

    fn unit(statuses: Vec<ContainerStatus>) -> UnitSnapshot {
        UnitSnapshot {
            uid: "u".into(),
            spec: UnitSpec::default(),
            phase: UnitPhase::Failed,
            container_statuses: statuses,
            init_container_statuses: vec![],
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_exit_code_without_container_status() {
        assert_eq!(failure_exit_code(&unit(vec![])), EXIT_CODE_NOT_STARTED);
    }

    #[test]
    fn test_exit_code_of_waiting_container() {
        let u = unit(vec![ContainerStatus {
            name: "a".into(),
            state: ContainerState::Waiting {
                reason: "ContainerCreating".into(),
            },
        }]);
        assert_eq!(failure_exit_code(&u), EXIT_CODE_NOT_STARTED);
    }

    #[test]
    fn test_exit_code_of_terminated_container() {
        let now = Utc::now();
        let u = unit(vec![ContainerStatus {
            name: "a".into(),
            state: ContainerState::Terminated {
                exit_code: 3,
                started_at: now,
                finished_at: now,
            },
        }]);
        assert_eq!(failure_exit_code(&u), 3);
    }
}
