//! Dependency resolution for workflow instances.
//!
//! The free functions here are the graph arithmetic shared by every
//! `DagStore` backend: stores load edges and task-run statuses inside their
//! transaction, ask these functions what to do, then write the result.
//! `DependencyResolver` is the service wrapper the engine and workers call.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use dagrun_types::dag::{DagId, DagParameter, PodTemplate, TaskId, Volume, VolumeMount};
use dagrun_types::error::{EngineError, ValidationError};
use dagrun_types::run::{
    ParameterBinding, ParameterOverride, RunId, StartedTask, Task, TaskRunId, TaskRunStatus,
};
use dagrun_types::unit::{WORKSPACE_MOUNT_PATH, WORKSPACE_VOLUME};

use crate::repository::DagStore;

/// A runs-after edge: `task` runs after `depends_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub task: TaskId,
    pub depends_on: TaskId,
}

impl Edge {
    pub fn new(task: TaskId, depends_on: TaskId) -> Self {
        Self { task, depends_on }
    }
}

// ---------------------------------------------------------------------------
// Graph arithmetic
// ---------------------------------------------------------------------------

/// Tasks with zero incoming dependency edges, sorted by id.
pub fn starting_tasks(task_ids: &[TaskId], edges: &[Edge]) -> Vec<TaskId> {
    let dependent: HashSet<TaskId> = edges.iter().map(|e| e.task).collect();
    let mut out: Vec<TaskId> = task_ids
        .iter()
        .copied()
        .filter(|id| !dependent.contains(id))
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Tasks that just became runnable.
///
/// A task qualifies when it has at least one dependency, every dependency has
/// a successful task run in this instance (`metCount == dependencyCount`),
/// and no task run exists for it yet. Sorted by id; callers must not rely on
/// any ordering between simultaneously runnable tasks.
pub fn runnable_tasks(
    task_ids: &[TaskId],
    edges: &[Edge],
    statuses: &HashMap<TaskId, TaskRunStatus>,
) -> Vec<TaskId> {
    let mut deps: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for edge in edges {
        deps.entry(edge.task).or_default().push(edge.depends_on);
    }

    let mut out: Vec<TaskId> = task_ids
        .iter()
        .copied()
        .filter(|id| !statuses.contains_key(id))
        .filter(|id| {
            deps.get(id).is_some_and(|d| {
                let met = d
                    .iter()
                    .filter(|dep| statuses.get(dep) == Some(&TaskRunStatus::Success))
                    .count();
                met == d.len()
            })
        })
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Every task transitively depending on `from`, in breadth-first order.
pub fn downstream_of(edges: &[Edge], from: TaskId) -> Vec<TaskId> {
    let mut dependents: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
    for edge in edges {
        dependents.entry(edge.depends_on).or_default().push(edge.task);
    }

    let mut seen = HashSet::from([from]);
    let mut queue = VecDeque::from([from]);
    let mut out = Vec::new();

    while let Some(current) = queue.pop_front() {
        for &next in dependents.get(&current).into_iter().flatten() {
            if seen.insert(next) {
                out.push(next);
                queue.push_back(next);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Apply caller overrides to a definition's declared parameters.
///
/// Secret-backed parameters are overridden only through `from_secret` (the
/// secret name), plain parameters only through `value`.
pub fn resolve_bindings(
    declared: &[DagParameter],
    overrides: &[ParameterOverride],
) -> Result<Vec<ParameterBinding>, ValidationError> {
    let mut bindings: Vec<ParameterBinding> = declared
        .iter()
        .map(|p| ParameterBinding {
            name: p.name.clone(),
            value: p.value.clone(),
            is_secret: p.is_secret,
        })
        .collect();

    for o in overrides {
        let binding = bindings
            .iter_mut()
            .find(|b| b.name == o.name)
            .ok_or_else(|| ValidationError::UndeclaredRunParameter(o.name.clone()))?;

        if binding.is_secret {
            if o.from_secret.is_empty() || !o.value.is_empty() {
                return Err(ValidationError::ParameterSourceMismatch(o.name.clone()));
            }
            binding.value = o.from_secret.clone();
        } else {
            if !o.from_secret.is_empty() {
                return Err(ValidationError::ParameterSourceMismatch(o.name.clone()));
            }
            binding.value = o.value.clone();
        }
    }

    Ok(bindings)
}

/// The run bindings a task declared, in declaration order.
pub fn bind_task_parameters(names: &[String], bindings: &[ParameterBinding]) -> Vec<ParameterBinding> {
    names
        .iter()
        .filter_map(|n| bindings.iter().find(|b| &b.name == n).cloned())
        .collect()
}

/// Mount the run's workspace claim into a task's unit.
pub fn attach_workspace(task: &mut Task, claim: &str) {
    let template = task.pod_template.get_or_insert_with(PodTemplate::default);

    if template.volumes.iter().any(|v| v.name == WORKSPACE_VOLUME) {
        return;
    }
    template.volumes.push(Volume {
        name: WORKSPACE_VOLUME.to_string(),
        source: serde_json::json!({ "claimName": claim }),
    });
    template.volume_mounts.push(VolumeMount {
        name: WORKSPACE_VOLUME.to_string(),
        mount_path: WORKSPACE_MOUNT_PATH.to_string(),
        read_only: false,
    });
}

// ---------------------------------------------------------------------------
// DependencyResolver
// ---------------------------------------------------------------------------

/// Transactional dependency operations over a `DagStore`.
pub struct DependencyResolver<S> {
    store: Arc<S>,
}

impl<S> Clone for DependencyResolver<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: DagStore> DependencyResolver<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Insert a run of definition version `dag_id` with resolved bindings.
    pub async fn start_instance(
        &self,
        dag_id: DagId,
        instance_name: &str,
        overrides: &[ParameterOverride],
        pvc_name: Option<&str>,
    ) -> Result<RunId, EngineError> {
        let declared = self.store.dag_parameters(dag_id).await?;
        let bindings = resolve_bindings(&declared, overrides)?;

        let run_id = self
            .store
            .create_run(instance_name, dag_id, &bindings, pvc_name)
            .await?;

        tracing::info!(run_id, dag_id, instance = instance_name, "started workflow instance");
        Ok(run_id)
    }

    pub async fn get_starting_tasks(&self, run_id: RunId) -> Result<Vec<StartedTask>, EngineError> {
        if !self.store.run_exists(run_id).await? {
            return Err(EngineError::NotFound(format!("run {run_id}")));
        }
        Ok(self.store.get_starting_tasks(run_id).await?)
    }

    pub async fn advance_on_success(
        &self,
        task_run_id: TaskRunId,
    ) -> Result<Vec<StartedTask>, EngineError> {
        let next = self.store.advance_on_success(task_run_id).await?;
        tracing::debug!(task_run_id, next = next.len(), "advanced on success");
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn statuses(entries: &[(TaskId, TaskRunStatus)]) -> HashMap<TaskId, TaskRunStatus> {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_single_task_dag() {
        assert_eq!(starting_tasks(&[1], &[]), vec![1]);
        let done = statuses(&[(1, TaskRunStatus::Success)]);
        assert!(runnable_tasks(&[1], &[], &done).is_empty());
    }

    #[test]
    fn test_join_waits_for_all_dependencies() {
        // A(1) -> C(3), B(2) -> C(3)
        let ids = [1, 2, 3];
        let edges = [Edge::new(3, 1), Edge::new(3, 2)];
        assert_eq!(starting_tasks(&ids, &edges), vec![1, 2]);

        let after_a = statuses(&[(1, TaskRunStatus::Success), (2, TaskRunStatus::Running)]);
        assert!(runnable_tasks(&ids, &edges, &after_a).is_empty());

        let after_b = statuses(&[(1, TaskRunStatus::Success), (2, TaskRunStatus::Success)]);
        assert_eq!(runnable_tasks(&ids, &edges, &after_b), vec![3]);
    }

    #[test]
    fn test_runnable_exactly_once() {
        let ids = [1, 2];
        let edges = [Edge::new(2, 1)];
        let started = statuses(&[(1, TaskRunStatus::Success), (2, TaskRunStatus::Running)]);
        assert!(runnable_tasks(&ids, &edges, &started).is_empty());
    }

    #[test]
    fn test_failed_dependency_blocks() {
        let ids = [1, 2, 3];
        let edges = [Edge::new(3, 1), Edge::new(3, 2)];
        let s = statuses(&[(1, TaskRunStatus::Success), (2, TaskRunStatus::Failed)]);
        assert!(runnable_tasks(&ids, &edges, &s).is_empty());
    }

    #[test]
    fn test_downstream_is_transitive_and_breadth_first() {
        // 1 -> 2 -> 4, 1 -> 3, 3 -> 4
        let edges = [
            Edge::new(2, 1),
            Edge::new(3, 1),
            Edge::new(4, 2),
            Edge::new(4, 3),
        ];
        let mut down = downstream_of(&edges, 1);
        assert_eq!(down.pop(), Some(4));
        down.sort_unstable();
        assert_eq!(down, vec![2, 3]);
        assert!(downstream_of(&edges, 4).is_empty());
    }

    fn declared() -> Vec<DagParameter> {
        vec![
            DagParameter {
                name: "region".into(),
                is_secret: false,
                value: "eu".into(),
            },
            DagParameter {
                name: "token".into(),
                is_secret: true,
                value: "default-token".into(),
            },
        ]
    }

    #[test]
    fn test_resolve_bindings_defaults_and_overrides() {
        let bindings = resolve_bindings(
            &declared(),
            &[
                ParameterOverride {
                    name: "region".into(),
                    value: "us".into(),
                    ..Default::default()
                },
                ParameterOverride {
                    name: "token".into(),
                    from_secret: "prod-token".into(),
                    ..Default::default()
                },
            ],
        )
        .unwrap();

        assert_eq!(bindings[0].value, "us");
        assert!(!bindings[0].is_secret);
        assert_eq!(bindings[1].value, "prod-token");
        assert!(bindings[1].is_secret);
    }

    #[test]
    fn test_resolve_bindings_rejects_undeclared() {
        let err = resolve_bindings(
            &declared(),
            &[ParameterOverride {
                name: "nope".into(),
                value: "x".into(),
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::UndeclaredRunParameter("nope".into()));
    }

    #[test]
    fn test_resolve_bindings_rejects_secret_given_as_value() {
        let err = resolve_bindings(
            &declared(),
            &[ParameterOverride {
                name: "token".into(),
                value: "plaintext".into(),
                ..Default::default()
            }],
        )
        .unwrap_err();
        assert_eq!(err, ValidationError::ParameterSourceMismatch("token".into()));
    }

    #[test]
    fn test_bind_task_parameters_filters_by_declaration() {
        let bindings = resolve_bindings(&declared(), &[]).unwrap();
        let bound = bind_task_parameters(&["token".to_string()], &bindings);
        assert_eq!(bound.len(), 1);
        assert_eq!(bound[0].name, "token");
    }

    #[test]
    fn test_attach_workspace_is_idempotent() {
        let mut task = Task {
            id: 1,
            name: "a".into(),
            image: "alpine".into(),
            command: vec![],
            args: vec![],
            script: String::new(),
            script_injector_image: None,
            parameters: vec![],
            pod_template: None,
        };
        attach_workspace(&mut task, "run-1-pvc");
        attach_workspace(&mut task, "run-1-pvc");

        let template = task.pod_template.unwrap();
        assert_eq!(template.volumes.len(), 1);
        assert_eq!(template.volumes[0].source["claimName"], "run-1-pvc");
        assert_eq!(template.volume_mounts[0].mount_path, WORKSPACE_MOUNT_PATH);
    }
}
