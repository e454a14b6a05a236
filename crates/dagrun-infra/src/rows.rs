//! Column encoding shared by the SQLite and Postgres stores.
//!
//! List-valued task fields (command, args, parameter names, retry codes) and
//! pod templates are stored as JSON text in both backends, so the same
//! encode/decode helpers serve both.

use dagrun_core::resolver::{attach_workspace, bind_task_parameters};
use dagrun_core::retry::RetryPolicy;
use dagrun_types::dag::{PodTemplate, TaskSpec};
use dagrun_types::error::RepositoryError;
use dagrun_types::run::{ParameterBinding, Task};
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn to_json<T: Serialize>(value: &T) -> Result<String, RepositoryError> {
    serde_json::to_string(value).map_err(|e| RepositoryError::Query(e.to_string()))
}

pub(crate) fn from_json<T: DeserializeOwned>(raw: &str, column: &str) -> Result<T, RepositoryError> {
    serde_json::from_str(raw).map_err(|e| RepositoryError::Query(format!("invalid {column} JSON: {e}")))
}

/// Map a driver error onto the repository taxonomy.
pub(crate) fn query_error(e: sqlx::Error) -> RepositoryError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            RepositoryError::Connection
        }
        other => RepositoryError::Query(other.to_string()),
    }
}

pub(crate) fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub(crate) fn is_foreign_key_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_foreign_key_violation())
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Encoded `Tasks` columns of a task spec.
pub(crate) struct TaskColumns {
    pub image: String,
    pub command: String,
    pub args: String,
    pub script: Option<String>,
    pub script_injector_image: Option<String>,
    pub parameters: String,
    pub backoff_limit: i32,
    pub is_conditional: bool,
    pub retry_codes: String,
    pub pod_template: Option<String>,
}

impl TaskColumns {
    pub fn from_spec(spec: &TaskSpec) -> Result<Self, RepositoryError> {
        Ok(Self {
            image: spec.image.clone(),
            command: to_json(&spec.command)?,
            args: to_json(&spec.args)?,
            script: Some(spec.script.clone()).filter(|s| !s.is_empty()),
            script_injector_image: spec.script_injector_image.clone().filter(|s| !s.is_empty()),
            parameters: to_json(&spec.parameters)?,
            backoff_limit: i32::try_from(spec.backoff.limit).unwrap_or(i32::MAX),
            is_conditional: spec.conditional.enabled,
            retry_codes: to_json(&spec.conditional.retry_codes)?,
            pod_template: spec.pod_template.as_ref().map(to_json).transpose()?,
        })
    }
}

/// A definition task joined with its body, as selected by both stores.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct TaskBody {
    pub id: i64,
    pub name: String,
    pub image: String,
    pub command: String,
    pub args: String,
    pub script: Option<String>,
    pub script_injector_image: Option<String>,
    pub parameters: String,
    pub pod_template: Option<String>,
}

impl TaskBody {
    /// Resolve into allocator input: bind the run's parameters the task
    /// declared and mount the run's workspace claim, if any.
    pub fn into_task(
        self,
        bindings: &[ParameterBinding],
        pvc_name: Option<&str>,
    ) -> Result<Task, RepositoryError> {
        let names: Vec<String> = from_json(&self.parameters, "parameters")?;
        let pod_template = self
            .pod_template
            .as_deref()
            .map(|raw| from_json::<PodTemplate>(raw, "pod_template"))
            .transpose()?;

        let mut task = Task {
            id: self.id,
            name: self.name,
            image: self.image,
            command: from_json(&self.command, "command")?,
            args: from_json(&self.args, "args")?,
            script: self.script.unwrap_or_default(),
            script_injector_image: self.script_injector_image,
            parameters: bind_task_parameters(&names, bindings),
            pod_template,
        };
        if let Some(claim) = pvc_name {
            attach_workspace(&mut task, claim);
        }
        Ok(task)
    }
}

/// Select list for `TaskBody`; callers append their own `WHERE`.
pub(crate) const TASK_BODY_SELECT: &str = "SELECT dt.dag_task_id AS id, dt.name, t.image, t.command, t.args, t.script, \
     t.script_injector_image, t.parameters, t.pod_template \
     FROM DAG_Tasks dt JOIN Tasks t ON dt.task_id = t.task_id";

/// Build the retry policy from stored task settings and the attempt counter.
pub(crate) fn retry_policy(
    backoff_limit: i32,
    is_conditional: bool,
    retry_codes: &str,
    attempts: i32,
) -> Result<RetryPolicy, RepositoryError> {
    Ok(RetryPolicy {
        attempts: u32::try_from(attempts).unwrap_or(0),
        backoff_limit: u32::try_from(backoff_limit).unwrap_or(0),
        conditional: is_conditional,
        retry_codes: from_json(retry_codes, "retry_codes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::dag::{Backoff, Conditional};

    #[test]
    fn test_task_columns_encode_lists_as_json() {
        let spec = TaskSpec {
            name: "a".into(),
            image: "alpine".into(),
            command: vec!["echo".into(), "hi".into()],
            backoff: Backoff { limit: 2 },
            conditional: Conditional {
                enabled: true,
                retry_codes: vec![3],
            },
            ..Default::default()
        };
        let cols = TaskColumns::from_spec(&spec).unwrap();
        assert_eq!(cols.command, r#"["echo","hi"]"#);
        assert_eq!(cols.args, "[]");
        assert_eq!(cols.retry_codes, "[3]");
        assert!(cols.script.is_none());
        assert!(cols.pod_template.is_none());
    }

    #[test]
    fn test_task_body_binds_declared_parameters() {
        let body = TaskBody {
            id: 4,
            name: "a".into(),
            image: "alpine".into(),
            command: r#"["env"]"#.into(),
            args: "[]".into(),
            script: None,
            script_injector_image: None,
            parameters: r#"["region"]"#.into(),
            pod_template: None,
        };
        let bindings = vec![
            ParameterBinding {
                name: "region".into(),
                value: "eu".into(),
                is_secret: false,
            },
            ParameterBinding {
                name: "other".into(),
                value: "x".into(),
                is_secret: false,
            },
        ];
        let task = body.into_task(&bindings, Some("r-pvc")).unwrap();
        assert_eq!(task.parameters.len(), 1);
        assert_eq!(task.command, vec!["env"]);
        assert!(task.pod_template.is_some(), "workspace mounted");
    }

    #[test]
    fn test_retry_policy_from_columns() {
        let policy = retry_policy(1, true, "[3,4]", 1).unwrap();
        assert!(policy.should_rerun(3));
        assert!(!policy.should_rerun(5));
        assert!(retry_policy(1, false, "oops", 1).is_err());
    }
}
