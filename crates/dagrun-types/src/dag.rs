//! Workflow definition types.
//!
//! A `DagSpec` is the graph specification produced by the DSL parser (or read
//! straight from JSON/TOML by the CLI). It is consumed unchanged by the graph
//! validator and hashed to decide whether an apply creates a new version.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Database id of a stored definition version.
pub type DagId = i64;

/// Database id of a task bound to a definition version (`DAG_Tasks` row).
pub type TaskId = i64;

/// The complete specification of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagSpec {
    /// Cron expression; empty means the definition only runs when triggered.
    #[serde(default)]
    pub schedule: String,

    #[serde(default, alias = "task")]
    pub tasks: Vec<TaskSpec>,

    #[serde(default)]
    pub parameters: Vec<DagParameterSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookSpec>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace: Option<WorkspaceSpec>,
}

impl DagSpec {
    pub fn task(&self, name: &str) -> Option<&TaskSpec> {
        self.tasks.iter().find(|t| t.name == name)
    }

    pub fn has_schedule(&self) -> bool {
        !self.schedule.trim().is_empty()
    }
}

/// A declared definition parameter.
///
/// Exactly one of `default_value` / `default_from_secret` must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagParameterSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_value: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_from_secret: String,
}

impl DagParameterSpec {
    pub fn is_secret(&self) -> bool {
        !self.default_from_secret.is_empty()
    }
}

/// One task of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub run_after: Vec<String>,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default)]
    pub conditional: Conditional,

    /// Names of definition parameters exposed to this task as env vars.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parameters: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_template: Option<PodTemplate>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub script: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_injector_image: Option<String>,

    /// When set, the task body comes from a stored reusable task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_ref: Option<TaskRef>,
}

impl TaskSpec {
    pub fn is_reference(&self) -> bool {
        self.task_ref.is_some()
    }
}

/// Retry budget for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Backoff {
    #[serde(default)]
    pub limit: u32,
}

/// Exit-code gated retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Conditional {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub retry_codes: Vec<i32>,
}

/// Reference to a named, independently versioned reusable task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskRef {
    pub name: String,
    pub version: i32,
}

/// Overrides applied to the unit of work that runs a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automount_service_account_token: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    /// Substrate-specific volume source, passed through untouched.
    #[serde(default)]
    pub source: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

/// Webhook target notified about task and unit transitions of every run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSpec {
    pub url: String,
    #[serde(default = "default_verify_ssl")]
    pub verify_ssl: bool,
}

fn default_verify_ssl() -> bool {
    true
}

/// Shared workspace volume provisioned per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub pvc: WorkspaceTemplate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_mode: Option<String>,
    /// Requested capacity, e.g. `1Gi`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
}

/// A definition that the scheduler found due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueDag {
    pub dag_id: DagId,
    pub name: String,
    pub namespace: String,
    pub workspace_enabled: bool,
}

/// A stored definition parameter (default binding).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagParameter {
    pub name: String,
    pub is_secret: bool,
    /// Literal default, or the secret name for secret-backed parameters.
    pub value: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_dag_spec_with_task_alias() {
        let json = r#"{
            "schedule": "*/5 * * * *",
            "task": [
                {"name": "a", "image": "alpine", "command": ["echo", "hi"]},
                {"name": "b", "image": "alpine", "script": "echo b", "runAfter": ["a"],
                 "backoff": {"limit": 3},
                 "conditional": {"enabled": true, "retryCodes": [3, 4]}}
            ],
            "parameters": [{"name": "p", "defaultValue": "x"}]
        }"#;
        let spec: DagSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.tasks.len(), 2);
        assert!(spec.has_schedule());
        let b = spec.task("b").unwrap();
        assert_eq!(b.run_after, vec!["a"]);
        assert_eq!(b.backoff.limit, 3);
        assert_eq!(b.conditional.retry_codes, vec![3, 4]);
        assert!(!spec.parameters[0].is_secret());
    }

    #[test]
    fn test_deserialize_from_toml() {
        let toml_str = r#"
schedule = ""

[[tasks]]
name = "only"
image = "busybox"
command = ["true"]

[webhook]
url = "http://localhost:9000/hook"
"#;
        let spec: DagSpec = toml::from_str(toml_str).unwrap();
        assert!(!spec.has_schedule());
        assert_eq!(spec.tasks[0].image, "busybox");
        let hook = spec.webhook.unwrap();
        assert!(hook.verify_ssl, "verify_ssl defaults to true");
    }

    #[test]
    fn test_serialization_is_stable() {
        let spec = DagSpec {
            tasks: vec![TaskSpec {
                name: "a".into(),
                image: "alpine".into(),
                command: vec!["echo".into()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let first = serde_json::to_string(&spec).unwrap();
        let second = serde_json::to_string(&spec.clone()).unwrap();
        assert_eq!(first, second);
    }
}
