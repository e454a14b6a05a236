//! Engine facade: the inbound interface used by the CLI and reconcilers.
//!
//! Collaborators (store, substrate, hasher) are constructed by the caller and
//! injected here; nothing in the engine is a process-wide singleton.

use std::sync::Arc;

use dagrun_types::dag::{DagId, DagSpec, TaskId, TaskRef, TaskSpec};
use dagrun_types::error::EngineError;
use dagrun_types::run::{ParameterOverride, RunId, StartRequest, StartedTask};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::allocator::{UnitAllocator, UnitSubstrate};
use crate::hash::{ContentHasher, canonical_hash};
use crate::repository::DagStore;
use crate::resolver::DependencyResolver;
use crate::scheduler::parse_schedule;
use crate::validate::{TaskRefParameters, validate_dag, validate_task};

/// Name of the workspace claim provisioned for an instance.
pub fn workspace_claim_name(instance_name: &str) -> String {
    format!("{instance_name}-pvc")
}

pub struct Engine<S, U, H> {
    store: Arc<S>,
    resolver: DependencyResolver<S>,
    allocator: UnitAllocator<U>,
    hasher: H,
}

impl<S: DagStore, U: UnitSubstrate, H: ContentHasher> Engine<S, U, H> {
    pub fn new(store: Arc<S>, allocator: UnitAllocator<U>, hasher: H) -> Self {
        Self {
            resolver: DependencyResolver::new(Arc::clone(&store)),
            store,
            allocator,
            hasher,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn allocator(&self) -> &UnitAllocator<U> {
        &self.allocator
    }

    // -----------------------------------------------------------------------
    // Definitions
    // -----------------------------------------------------------------------

    /// Validate a definition without storing it. Reusable task references
    /// are resolved against `namespace`.
    pub async fn validate(&self, namespace: &str, spec: &DagSpec) -> Result<(), EngineError> {
        let mut refs: Vec<TaskRef> = Vec::new();
        for task_ref in spec.tasks.iter().filter_map(|t| t.task_ref.as_ref()) {
            if !refs.contains(task_ref) {
                refs.push(task_ref.clone());
            }
        }

        let task_refs = if refs.is_empty() {
            TaskRefParameters::new()
        } else {
            self.store.task_ref_parameters(namespace, &refs).await?
        };

        validate_dag(spec, &task_refs)?;
        if spec.has_schedule() {
            parse_schedule(&spec.schedule)?;
        }
        Ok(())
    }

    /// Validate a definition and store it as a new version.
    ///
    /// Storing content identical to the latest version fails with
    /// `EngineError::AlreadyExists`.
    pub async fn validate_and_store(
        &self,
        name: &str,
        namespace: &str,
        spec: &DagSpec,
    ) -> Result<DagId, EngineError> {
        self.validate(namespace, spec).await?;

        let hash = canonical_hash(&self.hasher, spec)?;
        let dag_id = self.store.insert_dag(name, namespace, spec, &hash).await?;

        info!(dag = name, namespace, dag_id, tasks = spec.tasks.len(), "stored definition");
        Ok(dag_id)
    }

    /// Remove every version of a definition together with its runs. Returns
    /// reusable task names no longer used by any active definition.
    pub async fn soft_delete(&self, name: &str, namespace: &str) -> Result<Vec<String>, EngineError> {
        let unused = self.store.delete_dag(name, namespace).await?;
        info!(dag = name, namespace, unused = unused.len(), "deleted definition");
        Ok(unused)
    }

    pub async fn add_reusable_task(
        &self,
        name: &str,
        namespace: &str,
        spec: &TaskSpec,
    ) -> Result<TaskId, EngineError> {
        validate_task(spec)?;
        let hash = canonical_hash(&self.hasher, spec)?;
        let task_id = self.store.add_task(name, namespace, spec, &hash).await?;

        info!(task = name, namespace, task_id, "stored reusable task");
        Ok(task_id)
    }

    pub async fn delete_reusable_task(&self, name: &str, namespace: &str) -> Result<(), EngineError> {
        self.store.delete_task(name, namespace).await?;
        info!(task = name, namespace, "deleted reusable task");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Runs
    // -----------------------------------------------------------------------

    /// Start an instance of the active version of `dag_name` and allocate
    /// its starting tasks.
    pub async fn start_run_from_trigger(
        &self,
        instance_name: &str,
        dag_name: &str,
        overrides: &[ParameterOverride],
        namespace: &str,
    ) -> Result<RunId, EngineError> {
        let dag_id = self
            .store
            .find_dag(dag_name, namespace)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("definition {namespace}/{dag_name}")))?;

        if self.store.find_existing_run(instance_name).await?.is_some() {
            return Err(EngineError::AlreadyExists(format!("run {instance_name}")));
        }

        let pvc = match self.store.get_workspace_template(dag_id).await? {
            Some(template) => {
                let claim = workspace_claim_name(instance_name);
                self.allocator
                    .substrate()
                    .provision_workspace(&claim, namespace, &template)
                    .await?;
                Some(claim)
            }
            None => None,
        };

        let run_id = match self
            .resolver
            .start_instance(dag_id, instance_name, overrides, pvc.as_deref())
            .await
        {
            Ok(run_id) => run_id,
            Err(e) => {
                if let Some(claim) = &pvc {
                    self.release_claim(claim, namespace).await;
                }
                return Err(e);
            }
        };

        let starting = self.resolver.get_starting_tasks(run_id).await?;
        for started in starting {
            self.allocate_starting(run_id, namespace, started).await;
        }

        Ok(run_id)
    }

    pub async fn start(&self, request: &StartRequest) -> Result<RunId, EngineError> {
        self.start_run_from_trigger(
            &request.instance_name,
            &request.dag_name,
            &request.parameters,
            &request.namespace,
        )
        .await
    }

    /// Drain start requests (from the scheduler) until `cancel` fires.
    pub async fn consume_start_requests(
        &self,
        mut requests: mpsc::Receiver<StartRequest>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = requests.recv() => match next {
                    Some(request) => {
                        if let Err(e) = self.start(&request).await {
                            error!(
                                instance = %request.instance_name,
                                dag = %request.dag_name,
                                error = %e,
                                "failed to start scheduled run"
                            );
                        }
                    }
                    None => break,
                },
            }
        }
    }

    async fn release_claim(&self, claim: &str, namespace: &str) {
        match self
            .allocator
            .substrate()
            .release_workspace(claim, namespace)
            .await
        {
            Ok(()) => info!(claim, namespace, "released workspace of unstarted run"),
            Err(e) => error!(claim, namespace, error = %e, "failed to release workspace"),
        }
    }

    /// Allocate a starting task. A task that cannot be allocated is failed so
    /// the run does not wait on it forever.
    async fn allocate_starting(&self, run_id: RunId, namespace: &str, started: StartedTask) {
        let task_run_id = started.task_run_id;
        let Err(e) = self
            .allocator
            .allocate(&started.task, run_id, task_run_id, namespace)
            .await
        else {
            return;
        };

        error!(run_id, task_run_id, task = %started.task.name, error = %e, "failed to allocate task");

        if let Err(e) = self.store.mark_task_failed(task_run_id).await {
            error!(task_run_id, error = %e, "failed to mark task as failed");
            return;
        }
        match self.store.suspend_downstream(run_id, task_run_id).await {
            Ok(names) if !names.is_empty() => {
                warn!(run_id, suspended = ?names, "suspended tasks after allocation failure");
            }
            Ok(_) => {}
            Err(e) => error!(task_run_id, error = %e, "failed to suspend downstream tasks"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_workspace_claim_name() {
        assert_eq!(workspace_claim_name("nightly-1"), "nightly-1-pvc");
    }
}
