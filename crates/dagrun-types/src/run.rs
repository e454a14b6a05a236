//! Workflow instance (run) and task-run types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{DagId, PodTemplate, TaskId};

/// Database id of a workflow instance.
pub type RunId = i64;

/// Database id of a task run.
pub type TaskRunId = i64;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(RunStatus::Running),
            "success" => Ok(RunStatus::Success),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Lifecycle status of one task activation within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskRunStatus {
    Running,
    Success,
    Failed,
    /// Skipped permanently because an upstream task failed unretryably.
    Suspended,
}

impl TaskRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskRunStatus::Running => "running",
            TaskRunStatus::Success => "success",
            TaskRunStatus::Failed => "failed",
            TaskRunStatus::Suspended => "suspended",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskRunStatus::Running)
    }
}

impl fmt::Display for TaskRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(TaskRunStatus::Running),
            "success" => Ok(TaskRunStatus::Success),
            "failed" => Ok(TaskRunStatus::Failed),
            "suspended" => Ok(TaskRunStatus::Suspended),
            other => Err(format!("invalid task run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A workflow instance as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagRun {
    pub id: RunId,
    pub name: String,
    pub dag_id: DagId,
    pub status: RunStatus,
    pub successful_count: i64,
    pub failed_count: i64,
    pub suspended_count: i64,
    pub run_time: DateTime<Utc>,
    pub pvc_name: Option<String>,
}

/// A task activation as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRun {
    pub id: TaskRunId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub status: TaskRunStatus,
    pub attempts: i32,
}

/// Last known state of one unit of work backing a task run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub uid: String,
    pub task_run_id: TaskRunId,
    pub name: String,
    pub namespace: String,
    pub phase: String,
    pub exit_code: Option<i32>,
    pub updated_at: DateTime<Utc>,
    pub duration_secs: Option<i64>,
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// A caller-supplied parameter value for a new run.
///
/// Plain parameters are overridden through `value`, secret-backed parameters
/// through `from_secret` (the secret name, never the secret itself).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ParameterOverride {
    pub name: String,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub from_secret: String,
}

/// A resolved parameter bound to a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterBinding {
    pub name: String,
    /// Literal value, or the secret name when `is_secret` is set.
    pub value: String,
    pub is_secret: bool,
}

/// Request to start a new workflow instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    pub instance_name: String,
    pub dag_name: String,
    pub namespace: String,
    #[serde(default)]
    pub parameters: Vec<ParameterOverride>,
}

// ---------------------------------------------------------------------------
// Resolved task data
// ---------------------------------------------------------------------------

/// Everything the allocator needs to launch a unit of work for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub script: String,
    pub script_injector_image: Option<String>,
    pub parameters: Vec<ParameterBinding>,
    pub pod_template: Option<PodTemplate>,
}

/// A task that has just been given a task run and is ready for allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartedTask {
    pub task_run_id: TaskRunId,
    pub task: Task,
}

/// Script body stored for a task, needed to rebuild a unit on retry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TaskTemplate {
    pub script: Option<String>,
    pub script_injector_image: Option<String>,
}

/// Webhook configured for a run's definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookTarget {
    pub url: String,
    pub verify_ssl: bool,
}

/// Names used when logging task-run outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRunInfo {
    pub dag_name: String,
    pub task_name: String,
    pub namespace: String,
}

impl TaskRunInfo {
    pub fn unknown() -> Self {
        Self {
            dag_name: "unknown".to_string(),
            task_name: "unknown".to_string(),
            namespace: "unknown".to_string(),
        }
    }
}

/// Input to `DagStore::mark_unit_status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitStatusUpdate {
    pub uid: String,
    pub name: String,
    pub namespace: String,
    pub task_run_id: TaskRunId,
    pub phase: String,
    pub exit_code: Option<i32>,
    pub observed_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Unretryable failure
// ---------------------------------------------------------------------------

/// Exit code recorded when a unit failed before its container started.
pub const EXIT_CODE_NOT_STARTED: i32 = -1;

/// Exit code recorded when a unit could never start due to bad configuration.
pub const EXIT_CODE_CONFIG_ERROR: i32 = -2;

/// Why a task run was failed permanently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Retry budget exhausted or exit code not in the retriable set.
    RetriesExhausted,
    /// The unit was stuck pending with the given waiting reason.
    ConfigError(String),
    /// No unit could be created for the task run.
    AllocationFailed(String),
}

/// A business outcome, not a system error: drives the suspension cascade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnretryableTaskFailure {
    pub run_id: RunId,
    pub task_run_id: TaskRunId,
    pub exit_code: i32,
    pub reason: FailureReason,
}
