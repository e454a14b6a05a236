//! Persistence Engine contract.
//!
//! `DagStore` is implemented once per backend (embedded SQLite, networked
//! Postgres) in dagrun-infra. Both implementations must give identical
//! results; the graph arithmetic they share lives in `crate::resolver` so no
//! query dialect leaks above this trait.

use chrono::{DateTime, Utc};
use dagrun_types::dag::{
    DagId, DagParameter, DagSpec, DueDag, TaskId, TaskRef, TaskSpec, WorkspaceTemplate,
};
use dagrun_types::error::RepositoryError;
use dagrun_types::run::{
    DagRun, ParameterBinding, RunId, StartedTask, TaskRun, TaskRunId, TaskRunInfo, TaskTemplate,
    UnitRecord, UnitStatusUpdate, WebhookTarget,
};

use crate::validate::TaskRefParameters;

/// Repository trait for workflow definitions, instances and task runs.
///
/// Covers four entity families:
/// - **Definitions:** versioned DAGs and reusable tasks.
/// - **Runs:** workflow instances and their parameter bindings.
/// - **Task runs:** the dependency-resolution state machine.
/// - **Units:** last-writer-wins records of units of work.
///
/// Every mutating operation runs in a single transaction that is rolled back
/// on error.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait DagStore: Send + Sync + 'static {
    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Store a definition.
    ///
    /// The first apply creates version 1. A hash that differs from the latest
    /// version inserts version N+1 and deactivates the previous one; an
    /// identical hash fails with `RepositoryError::Conflict`.
    fn insert_dag(
        &self,
        name: &str,
        namespace: &str,
        spec: &DagSpec,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<DagId, RepositoryError>> + Send;

    /// Id of the active version of a definition.
    fn find_dag(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Option<DagId>, RepositoryError>> + Send;

    /// Deactivate every version of a definition and delete its tasks.
    ///
    /// Returns the names of reusable tasks that are no longer referenced by
    /// any active definition.
    fn delete_dag(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Store a reusable task, versioned by hash like definitions.
    fn add_task(
        &self,
        name: &str,
        namespace: &str,
        spec: &TaskSpec,
        hash: &str,
    ) -> impl std::future::Future<Output = Result<TaskId, RepositoryError>> + Send;

    /// Delete every version of a reusable task.
    fn delete_task(
        &self,
        name: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Declared parameter names of the given reusable task versions.
    /// References that do not exist are absent from the result.
    fn task_ref_parameters(
        &self,
        namespace: &str,
        refs: &[TaskRef],
    ) -> impl std::future::Future<Output = Result<TaskRefParameters, RepositoryError>> + Send;

    /// Active, scheduled definitions whose next fire time is at or before
    /// `now`. Their next fire time is advanced in the same transaction.
    fn get_due_dags(
        &self,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<DueDag>, RepositoryError>> + Send;

    fn dag_parameters(
        &self,
        dag_id: DagId,
    ) -> impl std::future::Future<Output = Result<Vec<DagParameter>, RepositoryError>> + Send;

    fn get_workspace_template(
        &self,
        dag_id: DagId,
    ) -> impl std::future::Future<Output = Result<Option<WorkspaceTemplate>, RepositoryError>> + Send;

    /// Webhook configured on the definition version of a run.
    fn get_webhook(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<Option<WebhookTarget>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Insert a run with its parameter bindings. Run names are unique;
    /// a duplicate fails with `RepositoryError::Conflict`.
    fn create_run(
        &self,
        name: &str,
        dag_id: DagId,
        bindings: &[ParameterBinding],
        pvc_name: Option<&str>,
    ) -> impl std::future::Future<Output = Result<RunId, RepositoryError>> + Send;

    fn find_existing_run(
        &self,
        name: &str,
    ) -> impl std::future::Future<Output = Result<Option<RunId>, RepositoryError>> + Send;

    fn run_exists(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn get_run(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<Option<DagRun>, RepositoryError>> + Send;

    fn list_task_runs(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<Vec<TaskRun>, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Task runs
    // -----------------------------------------------------------------------

    /// Zero in-degree tasks of the run's definition, each with a running
    /// task run (attempts = 1) created on first call. Idempotent.
    fn get_starting_tasks(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<Vec<StartedTask>, RepositoryError>> + Send;

    /// Create the task run for `task_id` if it does not exist yet and return
    /// its id.
    fn mark_task_started(
        &self,
        run_id: RunId,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<TaskRunId, RepositoryError>> + Send;

    fn increment_attempts(
        &self,
        task_run_id: TaskRunId,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Mark a running task run successful and activate newly runnable tasks.
    ///
    /// Returns an empty list when the run is complete, when the task run was
    /// not running (duplicate delivery), or when the run is no longer running.
    fn advance_on_success(
        &self,
        task_run_id: TaskRunId,
    ) -> impl std::future::Future<Output = Result<Vec<StartedTask>, RepositoryError>> + Send;

    /// Mark a running task run failed, its run failed, and bump the run's
    /// failed counter.
    fn mark_task_failed(
        &self,
        task_run_id: TaskRunId,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Whether the task run should get another attempt after `exit_code`.
    /// Unknown task runs are never retried.
    fn should_rerun(
        &self,
        task_run_id: TaskRunId,
        exit_code: i32,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Suspend every task transitively depending on the task of
    /// `task_run_id` that has not started yet. Returns their names.
    fn suspend_downstream(
        &self,
        run_id: RunId,
        task_run_id: TaskRunId,
    ) -> impl std::future::Future<Output = Result<Vec<String>, RepositoryError>> + Send;

    /// Whether every task of the run reached a terminal status.
    fn run_complete(
        &self,
        run_id: RunId,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Script body and injector image of a task, for rebuilding a unit.
    fn get_task_template(
        &self,
        task_id: TaskId,
    ) -> impl std::future::Future<Output = Result<TaskTemplate, RepositoryError>> + Send;

    fn task_run_info(
        &self,
        task_run_id: TaskRunId,
    ) -> impl std::future::Future<Output = Result<TaskRunInfo, RepositoryError>> + Send;

    // -----------------------------------------------------------------------
    // Units
    // -----------------------------------------------------------------------

    /// Upsert a unit record, applied only when `observed_at` is newer than
    /// the stored timestamp. Returns whether the write was applied.
    fn mark_unit_status(
        &self,
        update: &UnitStatusUpdate,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    fn add_unit_duration(
        &self,
        uid: &str,
        duration_secs: i64,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    fn get_unit(
        &self,
        uid: &str,
    ) -> impl std::future::Future<Output = Result<Option<UnitRecord>, RepositoryError>> + Send;
}
