//! Units of work: the externally executed attempts (pods) backing task runs.
//!
//! `UnitSpec` is what the allocator asks the substrate to create;
//! `UnitSnapshot` is what the substrate reports back through its watch stream.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{PodTemplate, Resources, Volume, VolumeMount};
use crate::run::{RunId, TaskRunId};

pub const LABEL_MANAGED_BY: &str = "managed-by";
pub const LABEL_TYPE: &str = "dagrun/type";
pub const LABEL_ENGINE_ID: &str = "dagrun/id";
pub const MANAGED_BY_VALUE: &str = "dagrun";

pub const ANNOTATION_TASK_RUN_ID: &str = "dagrun/task-rid";
pub const ANNOTATION_RUN_ID: &str = "dagrun/run-id";
pub const ANNOTATION_TASK_ID: &str = "dagrun/task-id";

pub const FINALIZER_LOG_COLLECTION: &str = "dagrun/logcollection";

/// Name of the shared workspace volume mounted into every unit of a run.
pub const WORKSPACE_VOLUME: &str = "workspace";
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

// Waiting reasons that mean a container is still starting normally.
pub const STATE_CONTAINER_CREATING: &str = "ContainerCreating";
pub const STATE_POD_INITIALIZING: &str = "PodInitializing";

// Waiting reasons that mean the unit can never start.
pub const STATE_CREATE_CONTAINER_ERROR: &str = "CreateContainerError";
pub const STATE_RUN_CONTAINER_ERROR: &str = "RunContainerError";
pub const STATE_CONFIG_ERROR: &str = "CreateContainerConfigError";
pub const STATE_ERR_IMAGE_PULL: &str = "ErrImagePull";
pub const STATE_IMAGE_PULL_BACK_OFF: &str = "ImagePullBackOff";

/// Whether a waiting reason is an unrecoverable configuration error.
pub fn is_config_error_reason(reason: &str) -> bool {
    matches!(
        reason,
        STATE_CREATE_CONTAINER_ERROR
            | STATE_RUN_CONTAINER_ERROR
            | STATE_CONFIG_ERROR
            | STATE_ERR_IMAGE_PULL
            | STATE_IMAGE_PULL_BACK_OFF
    )
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// Phase of a unit of work as reported by the substrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl UnitPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitPhase::Pending => "Pending",
            UnitPhase::Running => "Running",
            UnitPhase::Succeeded => "Succeeded",
            UnitPhase::Failed => "Failed",
            UnitPhase::Unknown => "Unknown",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitPhase::Succeeded | UnitPhase::Failed)
    }
}

impl fmt::Display for UnitPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Spec (what we ask the substrate to run)
// ---------------------------------------------------------------------------

/// Value source of an environment variable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum EnvValue {
    Literal { value: String },
    SecretKeyRef { secret: String, key: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<EnvVar>,
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default)]
    pub resources: Option<Resources>,
}

/// A unit of work to create on the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UnitSpec {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub finalizers: Vec<String>,
    pub container: ContainerSpec,
    #[serde(default)]
    pub init_containers: Vec<ContainerSpec>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Scheduling overrides (node selector, affinity, service account, ...).
    #[serde(default)]
    pub scheduling: Option<PodTemplate>,
}

// ---------------------------------------------------------------------------
// Snapshot (what the substrate reports)
// ---------------------------------------------------------------------------

/// Observed state of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum ContainerState {
    Waiting {
        reason: String,
    },
    Running {
        started_at: DateTime<Utc>,
    },
    Terminated {
        exit_code: i32,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub state: ContainerState,
}

/// Container termination details.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Termination {
    pub exit_code: i32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl Termination {
    pub fn duration_secs(&self) -> i64 {
        (self.finished_at - self.started_at).num_seconds()
    }
}

/// A unit of work as last observed on the substrate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitSnapshot {
    /// Substrate-assigned unique id.
    pub uid: String,
    pub spec: UnitSpec,
    pub phase: UnitPhase,
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
    #[serde(default)]
    pub init_container_statuses: Vec<ContainerStatus>,
    /// Substrate time of the unit's most recent state transition. Status
    /// writes are ordered by this, never by arrival.
    pub observed_at: DateTime<Utc>,
}

impl UnitSnapshot {
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn namespace(&self) -> &str {
        &self.spec.namespace
    }

    /// Name of the task container (the task name).
    pub fn task_name(&self) -> &str {
        &self.spec.container.name
    }

    fn annotation_id(&self, key: &str) -> Option<i64> {
        self.spec.annotations.get(key).and_then(|v| v.parse().ok())
    }

    pub fn task_run_id(&self) -> Option<TaskRunId> {
        self.annotation_id(ANNOTATION_TASK_RUN_ID)
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.annotation_id(ANNOTATION_RUN_ID)
    }

    pub fn task_id(&self) -> Option<i64> {
        self.annotation_id(ANNOTATION_TASK_ID)
    }

    /// Termination of the main container, if it has finished.
    pub fn termination(&self) -> Option<Termination> {
        self.container_statuses.first().and_then(|s| match s.state {
            ContainerState::Terminated {
                exit_code,
                started_at,
                finished_at,
            } => Some(Termination {
                exit_code,
                started_at,
                finished_at,
            }),
            _ => None,
        })
    }

    /// Whether any container has at least started.
    pub fn has_started(&self) -> bool {
        self.container_statuses.iter().any(|s| {
            matches!(
                s.state,
                ContainerState::Running { .. } | ContainerState::Terminated { .. }
            )
        })
    }

    /// First unrecoverable waiting reason across init and main containers.
    pub fn config_error(&self) -> Option<&str> {
        self.container_statuses
            .iter()
            .chain(self.init_container_statuses.iter())
            .find_map(|s| match &s.state {
                ContainerState::Waiting { reason } if is_config_error_reason(reason) => {
                    Some(reason.as_str())
                }
                _ => None,
            })
    }

    /// Name of the workspace volume claim mounted into this unit, if any.
    pub fn workspace_claim(&self) -> Option<&str> {
        self.spec
            .volumes
            .iter()
            .find(|v| v.name == WORKSPACE_VOLUME)
            .and_then(|v| v.source.get("claimName"))
            .and_then(|v| v.as_str())
    }
}

/// Change notification from the substrate watch.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    Added(UnitSnapshot),
    Updated { old: UnitSnapshot, new: UnitSnapshot },
    Deleted(UnitSnapshot),
}

/// Kind of event delivered to a lifecycle worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitEventKind {
    Add,
    Update,
}

impl UnitEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitEventKind::Add => "add",
            UnitEventKind::Update => "update",
        }
    }
}

/// A unit status change queued on one shard.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitEvent {
    pub kind: UnitEventKind,
    pub unit: UnitSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(statuses: Vec<ContainerStatus>) -> UnitSnapshot {
        let mut annotations = BTreeMap::new();
        annotations.insert(ANNOTATION_TASK_RUN_ID.to_string(), "7".to_string());
        annotations.insert(ANNOTATION_RUN_ID.to_string(), "3".to_string());
        UnitSnapshot {
            uid: "uid-1".into(),
            spec: UnitSpec {
                name: "unit-abc".into(),
                namespace: "default".into(),
                annotations,
                ..Default::default()
            },
            phase: UnitPhase::Pending,
            container_statuses: statuses,
            init_container_statuses: vec![],
            observed_at: Utc::now(),
        }
    }

    #[test]
    fn test_annotation_ids() {
        let unit = snapshot(vec![]);
        assert_eq!(unit.task_run_id(), Some(7));
        assert_eq!(unit.run_id(), Some(3));
        assert_eq!(unit.task_id(), None);
    }

    #[test]
    fn test_config_error_detection() {
        let creating = snapshot(vec![ContainerStatus {
            name: "a".into(),
            state: ContainerState::Waiting {
                reason: STATE_CONTAINER_CREATING.into(),
            },
        }]);
        assert!(creating.config_error().is_none());

        let mut broken = snapshot(vec![]);
        broken.init_container_statuses.push(ContainerStatus {
            name: "script-copier".into(),
            state: ContainerState::Waiting {
                reason: STATE_IMAGE_PULL_BACK_OFF.into(),
            },
        });
        assert_eq!(broken.config_error(), Some(STATE_IMAGE_PULL_BACK_OFF));
    }

    #[test]
    fn test_termination_duration() {
        let start = Utc::now();
        let unit = snapshot(vec![ContainerStatus {
            name: "a".into(),
            state: ContainerState::Terminated {
                exit_code: 3,
                started_at: start,
                finished_at: start + chrono::Duration::seconds(42),
            },
        }]);
        let t = unit.termination().unwrap();
        assert_eq!(t.exit_code, 3);
        assert_eq!(t.duration_secs(), 42);
        assert!(unit.has_started());
    }
}
