//! Unit-of-work allocation.
//!
//! `UnitSubstrate` is the outbound port to whatever actually runs task
//! containers. `UnitAllocator` turns a resolved `Task` into a `UnitSpec` and
//! creates it, retrying with a fresh random name on collisions.

use std::collections::BTreeMap;
use std::sync::Arc;

use dagrun_types::dag::{Resources, Volume, VolumeMount, WorkspaceTemplate};
use dagrun_types::error::{EngineError, SubstrateError};
use dagrun_types::run::{RunId, Task, TaskRunId, TaskTemplate};
use dagrun_types::unit::{
    ANNOTATION_RUN_ID, ANNOTATION_TASK_ID, ANNOTATION_TASK_RUN_ID, ContainerSpec, EnvValue, EnvVar,
    FINALIZER_LOG_COLLECTION, LABEL_ENGINE_ID, LABEL_MANAGED_BY, LABEL_TYPE, MANAGED_BY_VALUE,
    UnitSnapshot, UnitSpec, WatchEvent,
};
use futures_util::stream::BoxStream;

/// Injector image used when a script task does not name one.
pub const DEFAULT_SCRIPT_INJECTOR_IMAGE: &str = "registry.access.redhat.com/ubi9/ubi-micro:latest";

const SCRIPT_VOLUME: &str = "shared-scripts";
const SCRIPT_DIR: &str = "/script";
const SCRIPT_PATH: &str = "/script/my-script.sh";
const SCRIPT_COPIER: &str = "script-copier";

/// Key inside a secret that holds a secret-backed parameter value.
pub const SECRET_KEY: &str = "secret";

// ---------------------------------------------------------------------------
// UnitSubstrate
// ---------------------------------------------------------------------------

/// Outbound port to the system that executes units of work.
pub trait UnitSubstrate: Send + Sync + 'static {
    /// Create a unit and return its substrate-assigned uid. A taken name
    /// fails with `SubstrateError::AlreadyExists`.
    fn create_unit(
        &self,
        spec: &UnitSpec,
    ) -> impl std::future::Future<Output = Result<String, SubstrateError>> + Send;

    /// Delete a unit. `remove_finalizer` strips protecting finalizers first.
    /// An already deleted unit fails with `SubstrateError::NotFound`.
    fn delete_unit(
        &self,
        name: &str,
        namespace: &str,
        remove_finalizer: bool,
    ) -> impl std::future::Future<Output = Result<(), SubstrateError>> + Send;

    fn provision_workspace(
        &self,
        claim: &str,
        namespace: &str,
        template: &WorkspaceTemplate,
    ) -> impl std::future::Future<Output = Result<(), SubstrateError>> + Send;

    fn release_workspace(
        &self,
        claim: &str,
        namespace: &str,
    ) -> impl std::future::Future<Output = Result<(), SubstrateError>> + Send;

    /// Stream of change notifications for units matching `selector`.
    fn watch(
        &self,
        selector: &BTreeMap<String, String>,
        namespace: &str,
    ) -> BoxStream<'static, WatchEvent>;
}

/// Label selector matching every task unit created by `engine_id`.
pub fn unit_selector(engine_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string()),
        (LABEL_TYPE.to_string(), "task".to_string()),
        (LABEL_ENGINE_ID.to_string(), engine_id.to_string()),
    ])
}

// ---------------------------------------------------------------------------
// UnitAllocator
// ---------------------------------------------------------------------------

pub struct UnitAllocator<U> {
    substrate: Arc<U>,
    engine_id: String,
    max_name_attempts: u32,
}

impl<U> Clone for UnitAllocator<U> {
    fn clone(&self) -> Self {
        Self {
            substrate: Arc::clone(&self.substrate),
            engine_id: self.engine_id.clone(),
            max_name_attempts: self.max_name_attempts,
        }
    }
}

impl<U: UnitSubstrate> UnitAllocator<U> {
    pub fn new(substrate: Arc<U>, engine_id: impl Into<String>, max_name_attempts: u32) -> Self {
        Self {
            substrate,
            engine_id: engine_id.into(),
            max_name_attempts: max_name_attempts.max(1),
        }
    }

    pub fn substrate(&self) -> &Arc<U> {
        &self.substrate
    }

    /// Launch a unit for a freshly activated task run.
    pub async fn allocate(
        &self,
        task: &Task,
        run_id: RunId,
        task_run_id: TaskRunId,
        namespace: &str,
    ) -> Result<String, EngineError> {
        let env = task_env(task);
        self.allocate_with_env(task, run_id, task_run_id, namespace, env, None)
            .await
    }

    /// Launch a unit with explicit environment and resource overrides.
    /// Used on retry to carry over what the failed unit ran with.
    pub async fn allocate_with_env(
        &self,
        task: &Task,
        run_id: RunId,
        task_run_id: TaskRunId,
        namespace: &str,
        env: Vec<EnvVar>,
        resources: Option<Resources>,
    ) -> Result<String, EngineError> {
        let mut spec = self.build_spec(task, run_id, task_run_id, namespace, env, resources);

        for attempt in 1..=self.max_name_attempts {
            spec.name = random_unit_name();

            match self.substrate.create_unit(&spec).await {
                Ok(uid) => {
                    tracing::info!(
                        run_id,
                        task_run_id,
                        task = %task.name,
                        unit = %spec.name,
                        %uid,
                        "allocated unit"
                    );
                    return Ok(uid);
                }
                Err(SubstrateError::AlreadyExists(name)) => {
                    tracing::warn!(attempt, unit = %name, "unit name collision, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::AllocationCollision {
            attempts: self.max_name_attempts,
        })
    }

    /// Build the unit specification for a task (name left empty).
    pub fn build_spec(
        &self,
        task: &Task,
        run_id: RunId,
        task_run_id: TaskRunId,
        namespace: &str,
        env: Vec<EnvVar>,
        resources: Option<Resources>,
    ) -> UnitSpec {
        let labels = unit_selector(&self.engine_id);
        let annotations = BTreeMap::from([
            (ANNOTATION_TASK_RUN_ID.to_string(), task_run_id.to_string()),
            (ANNOTATION_RUN_ID.to_string(), run_id.to_string()),
            (ANNOTATION_TASK_ID.to_string(), task.id.to_string()),
        ]);

        let mut container = ContainerSpec {
            name: task.name.clone(),
            image: task.image.clone(),
            env,
            ..Default::default()
        };
        let mut volumes = Vec::new();
        let mut init_containers = Vec::new();
        let template = task.pod_template.as_ref();

        if task.script.is_empty() {
            container.command = task.command.clone();
            container.args = task.args.clone();
        } else {
            container.command = vec!["bash".into(), "-c".into(), SCRIPT_PATH.into()];

            let has_volume = template.is_some_and(|t| t.volumes.iter().any(|v| v.name == SCRIPT_VOLUME));
            if !has_volume {
                volumes.push(Volume {
                    name: SCRIPT_VOLUME.to_string(),
                    source: serde_json::json!({ "emptyDir": {} }),
                });
            }

            init_containers.push(ContainerSpec {
                name: SCRIPT_COPIER.to_string(),
                image: task
                    .script_injector_image
                    .clone()
                    .filter(|i| !i.is_empty())
                    .unwrap_or_else(|| DEFAULT_SCRIPT_INJECTOR_IMAGE.to_string()),
                command: vec!["bash".into(), "-c".into(), script_copy_command(&task.script)],
                volume_mounts: vec![VolumeMount {
                    name: SCRIPT_VOLUME.to_string(),
                    mount_path: SCRIPT_DIR.to_string(),
                    read_only: false,
                }],
                ..Default::default()
            });

            let mount = VolumeMount {
                name: SCRIPT_VOLUME.to_string(),
                mount_path: SCRIPT_DIR.to_string(),
                read_only: true,
            };
            if !template.is_some_and(|t| t.volume_mounts.contains(&mount)) {
                container.volume_mounts.push(mount);
            }
        }

        if let Some(t) = template {
            volumes.extend(t.volumes.iter().cloned());
            container.volume_mounts.extend(t.volume_mounts.iter().cloned());
            container.resources = t.resources.clone();
        }
        if resources.is_some() {
            container.resources = resources;
        }

        UnitSpec {
            name: String::new(),
            namespace: namespace.to_string(),
            labels,
            annotations,
            finalizers: vec![FINALIZER_LOG_COLLECTION.to_string()],
            container,
            init_containers,
            volumes,
            scheduling: task.pod_template.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Environment variables for a task's parameters. Secret-backed parameters
/// reference key `secret` of the named secret.
pub fn task_env(task: &Task) -> Vec<EnvVar> {
    task.parameters
        .iter()
        .map(|p| EnvVar {
            name: p.name.clone(),
            value: if p.is_secret {
                EnvValue::SecretKeyRef {
                    secret: p.value.clone(),
                    key: SECRET_KEY.to_string(),
                }
            } else {
                EnvValue::Literal {
                    value: p.value.clone(),
                }
            },
        })
        .collect()
}

/// Rebuild the task a failed unit was running, for a retry.
///
/// The script body is not recoverable from the unit itself and comes from the
/// stored task template.
pub fn task_from_unit(unit: &UnitSnapshot, template: TaskTemplate) -> Task {
    let script = template.script.unwrap_or_default();
    let (command, args) = if script.is_empty() {
        (unit.spec.container.command.clone(), unit.spec.container.args.clone())
    } else {
        (Vec::new(), Vec::new())
    };

    Task {
        id: unit.task_id().unwrap_or_default(),
        name: unit.task_name().to_string(),
        image: unit.spec.container.image.clone(),
        command,
        args,
        script,
        script_injector_image: template.script_injector_image,
        parameters: Vec::new(),
        pod_template: unit.spec.scheduling.clone(),
    }
}

fn random_unit_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("task-{}", &id[..12])
}

fn script_copy_command(script: &str) -> String {
    format!(
        "printf %s {} > {SCRIPT_PATH} && chmod 555 {SCRIPT_PATH}",
        shell_quote(script)
    )
}

/// Quote a string for a POSIX shell.
fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::dag::PodTemplate;
    use dagrun_types::run::ParameterBinding;
    use std::sync::Mutex;

    /// Substrate that reports a name collision for the first `collisions`
    /// create calls.
    struct CollidingSubstrate {
        collisions: Mutex<u32>,
        created: Mutex<Vec<UnitSpec>>,
    }

    impl CollidingSubstrate {
        fn new(collisions: u32) -> Self {
            Self {
                collisions: Mutex::new(collisions),
                created: Mutex::new(Vec::new()),
            }
        }
    }

    impl UnitSubstrate for CollidingSubstrate {
        async fn create_unit(&self, spec: &UnitSpec) -> Result<String, SubstrateError> {
            let mut left = self.collisions.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(SubstrateError::AlreadyExists(spec.name.clone()));
            }
            self.created.lock().unwrap().push(spec.clone());
            Ok(format!("uid-{}", spec.name))
        }

        async fn delete_unit(&self, _: &str, _: &str, _: bool) -> Result<(), SubstrateError> {
            Ok(())
        }

        async fn provision_workspace(
            &self,
            _: &str,
            _: &str,
            _: &WorkspaceTemplate,
        ) -> Result<(), SubstrateError> {
            Ok(())
        }

        async fn release_workspace(&self, _: &str, _: &str) -> Result<(), SubstrateError> {
            Ok(())
        }

        fn watch(&self, _: &BTreeMap<String, String>, _: &str) -> BoxStream<'static, WatchEvent> {
            Box::pin(futures_util::stream::empty())
        }
    }

    fn task() -> Task {
        Task {
            id: 11,
            name: "build".into(),
            image: "alpine:3".into(),
            command: vec!["make".into()],
            args: vec!["all".into()],
            script: String::new(),
            script_injector_image: None,
            parameters: vec![
                ParameterBinding {
                    name: "REGION".into(),
                    value: "eu".into(),
                    is_secret: false,
                },
                ParameterBinding {
                    name: "TOKEN".into(),
                    value: "api-token".into(),
                    is_secret: true,
                },
            ],
            pod_template: None,
        }
    }

    #[tokio::test]
    async fn test_allocate_retries_on_collision() {
        let substrate = Arc::new(CollidingSubstrate::new(3));
        let allocator = UnitAllocator::new(substrate.clone(), "engine-a", 5);

        let uid = allocator.allocate(&task(), 1, 2, "jobs").await.unwrap();
        assert!(uid.starts_with("uid-task-"));

        let created = substrate.created.lock().unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].namespace, "jobs");
    }

    #[tokio::test]
    async fn test_allocate_gives_up_after_max_attempts() {
        let substrate = Arc::new(CollidingSubstrate::new(10));
        let allocator = UnitAllocator::new(substrate, "engine-a", 5);

        let err = allocator.allocate(&task(), 1, 2, "jobs").await.unwrap_err();
        assert!(matches!(err, EngineError::AllocationCollision { attempts: 5 }));
    }

    #[test]
    fn test_spec_labels_annotations_and_env() {
        let allocator = UnitAllocator::new(Arc::new(CollidingSubstrate::new(0)), "engine-a", 5);
        let t = task();
        let spec = allocator.build_spec(&t, 4, 9, "jobs", task_env(&t), None);

        assert_eq!(spec.labels[LABEL_ENGINE_ID], "engine-a");
        assert_eq!(spec.labels[LABEL_MANAGED_BY], MANAGED_BY_VALUE);
        assert_eq!(spec.annotations[ANNOTATION_TASK_RUN_ID], "9");
        assert_eq!(spec.annotations[ANNOTATION_RUN_ID], "4");
        assert_eq!(spec.annotations[ANNOTATION_TASK_ID], "11");
        assert_eq!(spec.finalizers, vec![FINALIZER_LOG_COLLECTION]);
        assert_eq!(spec.container.command, vec!["make"]);
        assert_eq!(spec.container.args, vec!["all"]);
        assert!(spec.init_containers.is_empty());

        assert_eq!(
            spec.container.env[1].value,
            EnvValue::SecretKeyRef {
                secret: "api-token".into(),
                key: "secret".into()
            }
        );
    }

    #[test]
    fn test_script_task_gets_injector() {
        let allocator = UnitAllocator::new(Arc::new(CollidingSubstrate::new(0)), "e", 5);
        let mut t = task();
        t.command.clear();
        t.script = "echo 'hello'".into();

        let spec = allocator.build_spec(&t, 1, 1, "default", vec![], None);
        assert_eq!(spec.container.command, vec!["bash", "-c", SCRIPT_PATH]);
        assert!(spec.container.args.is_empty());
        assert_eq!(spec.init_containers.len(), 1);
        assert_eq!(spec.init_containers[0].image, DEFAULT_SCRIPT_INJECTOR_IMAGE);
        assert!(spec.init_containers[0].command[2].contains(r#"'echo '\''hello'\'''"#));
        assert_eq!(spec.volumes[0].name, SCRIPT_VOLUME);
        assert!(spec.container.volume_mounts[0].read_only);
    }

    #[test]
    fn test_pod_template_and_resource_override() {
        let allocator = UnitAllocator::new(Arc::new(CollidingSubstrate::new(0)), "e", 5);
        let mut t = task();
        t.pod_template = Some(PodTemplate {
            service_account_name: Some("runner".into()),
            resources: Some(Resources {
                limits: BTreeMap::from([("cpu".into(), "1".into())]),
                ..Default::default()
            }),
            ..Default::default()
        });

        let spec = allocator.build_spec(&t, 1, 1, "default", vec![], None);
        assert_eq!(spec.container.resources.as_ref().unwrap().limits["cpu"], "1");
        assert_eq!(
            spec.scheduling.as_ref().unwrap().service_account_name.as_deref(),
            Some("runner")
        );

        let override_resources = Resources {
            limits: BTreeMap::from([("cpu".into(), "2".into())]),
            ..Default::default()
        };
        let spec = allocator.build_spec(&t, 1, 1, "default", vec![], Some(override_resources));
        assert_eq!(spec.container.resources.unwrap().limits["cpu"], "2");
    }

    #[test]
    fn test_task_from_unit_round_trips_script() {
        let allocator = UnitAllocator::new(Arc::new(CollidingSubstrate::new(0)), "e", 5);
        let mut t = task();
        t.script = "echo hi".into();
        let spec = allocator.build_spec(&t, 1, 1, "default", vec![], None);
        let unit = UnitSnapshot {
            uid: "u".into(),
            spec,
            phase: dagrun_types::unit::UnitPhase::Failed,
            container_statuses: vec![],
            init_container_statuses: vec![],
            observed_at: chrono::Utc::now(),
        };

        let rebuilt = task_from_unit(
            &unit,
            TaskTemplate {
                script: Some("echo hi".into()),
                script_injector_image: None,
            },
        );
        assert_eq!(rebuilt.id, 11);
        assert_eq!(rebuilt.name, "build");
        assert_eq!(rebuilt.script, "echo hi");
        assert!(rebuilt.command.is_empty());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "plain");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
