//! Postgres `DagStore` implementation.
//!
//! Resolver transactions lock the run row (`SELECT ... FOR UPDATE`) before
//! reading counters or task-run statuses, so concurrent workers advancing the
//! same run serialize while different runs proceed in parallel.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dagrun_core::repository::DagStore;
use dagrun_core::resolver::{Edge, downstream_of, runnable_tasks, starting_tasks};
use dagrun_core::scheduler::next_fire_time;
use dagrun_core::validate::TaskRefParameters;
use dagrun_types::dag::{
    DagId, DagParameter, DagSpec, DueDag, TaskId, TaskRef, TaskSpec, WorkspaceTemplate,
};
use dagrun_types::error::RepositoryError;
use dagrun_types::run::{
    DagRun, ParameterBinding, RunId, RunStatus, StartedTask, TaskRun, TaskRunId, TaskRunInfo,
    TaskRunStatus, TaskTemplate, UnitRecord, UnitStatusUpdate, WebhookTarget,
};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, warn};

use crate::rows::{
    TASK_BODY_SELECT, TaskBody, TaskColumns, from_json, is_foreign_key_violation,
    is_unique_violation, query_error, retry_policy, to_json,
};

type Tx<'a> = Transaction<'a, Postgres>;

/// Postgres-backed implementation of `DagStore`.
pub struct PgDagStore {
    pool: PgPool,
}

impl PgDagStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn begin(&self) -> Result<Tx<'static>, RepositoryError> {
        self.pool.begin().await.map_err(query_error)
    }
}

fn parse_status<T: std::str::FromStr<Err = String>>(s: &str) -> Result<T, RepositoryError> {
    s.parse::<T>().map_err(RepositoryError::Query)
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

struct RunHead {
    dag_id: DagId,
    status: RunStatus,
    pvc_name: Option<String>,
}

/// Lock a run row for the rest of the transaction.
async fn lock_run(tx: &mut Tx<'_>, run_id: RunId) -> Result<RunHead, RepositoryError> {
    let (dag_id, status, pvc_name): (i64, String, Option<String>) = sqlx::query_as(
        "SELECT dag_id, status, pvc_name FROM DAG_Runs WHERE run_id = $1 FOR UPDATE",
    )
    .bind(run_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(query_error)?
    .ok_or_else(|| RepositoryError::NotFound(format!("run {run_id}")))?;

    Ok(RunHead {
        dag_id,
        status: parse_status(&status)?,
        pvc_name,
    })
}

async fn load_graph(tx: &mut Tx<'_>, dag_id: DagId) -> Result<(Vec<TaskId>, Vec<Edge>), RepositoryError> {
    let ids: Vec<(i64,)> = sqlx::query_as("SELECT dag_task_id FROM DAG_Tasks WHERE dag_id = $1")
        .bind(dag_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(query_error)?;

    let edges: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT d.dag_task_id, d.depends_on_task_id
         FROM Dependencies d JOIN DAG_Tasks dt ON d.dag_task_id = dt.dag_task_id
         WHERE dt.dag_id = $1",
    )
    .bind(dag_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(query_error)?;

    Ok((
        ids.into_iter().map(|(id,)| id).collect(),
        edges.into_iter().map(|(t, d)| Edge::new(t, d)).collect(),
    ))
}

async fn task_run_statuses(
    tx: &mut Tx<'_>,
    run_id: RunId,
) -> Result<HashMap<TaskId, TaskRunStatus>, RepositoryError> {
    let rows: Vec<(i64, String)> =
        sqlx::query_as("SELECT task_id, status FROM Task_Runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&mut **tx)
            .await
            .map_err(query_error)?;

    rows.into_iter()
        .map(|(id, status)| Ok((id, parse_status(&status)?)))
        .collect()
}

async fn run_bindings(tx: &mut Tx<'_>, run_id: RunId) -> Result<Vec<ParameterBinding>, RepositoryError> {
    let rows: Vec<(String, String, bool)> = sqlx::query_as(
        "SELECT name, value, is_secret FROM DAG_Run_Parameters WHERE run_id = $1 ORDER BY name",
    )
    .bind(run_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(query_error)?;

    Ok(rows
        .into_iter()
        .map(|(name, value, is_secret)| ParameterBinding {
            name,
            value,
            is_secret,
        })
        .collect())
}

async fn insert_task_run(
    tx: &mut Tx<'_>,
    run_id: RunId,
    task_id: TaskId,
    status: TaskRunStatus,
    attempts: i32,
) -> Result<bool, RepositoryError> {
    let result = sqlx::query(
        "INSERT INTO Task_Runs (run_id, task_id, status, attempts) VALUES ($1, $2, $3, $4)
         ON CONFLICT (run_id, task_id) DO NOTHING",
    )
    .bind(run_id)
    .bind(task_id)
    .bind(status.as_str())
    .bind(attempts)
    .execute(&mut **tx)
    .await
    .map_err(query_error)?;
    Ok(result.rows_affected() == 1)
}

async fn task_run_id_of(tx: &mut Tx<'_>, run_id: RunId, task_id: TaskId) -> Result<TaskRunId, RepositoryError> {
    let (id,): (i64,) =
        sqlx::query_as("SELECT task_run_id FROM Task_Runs WHERE run_id = $1 AND task_id = $2")
            .bind(run_id)
            .bind(task_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(query_error)?;
    Ok(id)
}

async fn start_tasks(
    tx: &mut Tx<'_>,
    run_id: RunId,
    pvc_name: Option<&str>,
    task_ids: &[TaskId],
) -> Result<Vec<StartedTask>, RepositoryError> {
    let bindings = run_bindings(tx, run_id).await?;
    let body_sql = format!("{TASK_BODY_SELECT} WHERE dt.dag_task_id = $1");
    let mut started = Vec::with_capacity(task_ids.len());

    for &task_id in task_ids {
        insert_task_run(tx, run_id, task_id, TaskRunStatus::Running, 1).await?;
        let task_run_id = task_run_id_of(tx, run_id, task_id).await?;

        let body: TaskBody = sqlx::query_as(&body_sql)
            .bind(task_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(query_error)?;

        started.push(StartedTask {
            task_run_id,
            task: body.into_task(&bindings, pvc_name)?,
        });
    }
    Ok(started)
}

async fn insert_task_body(
    tx: &mut Tx<'_>,
    name: &str,
    namespace: &str,
    spec: &TaskSpec,
    inline: bool,
    version: i32,
    hash: &str,
) -> Result<i64, RepositoryError> {
    let cols = TaskColumns::from_spec(spec)?;
    let (task_id,): (i64,) = sqlx::query_as(
        "INSERT INTO Tasks (name, namespace, version, hash, inline, image, command, args, script,
                            script_injector_image, parameters, backoff_limit, is_conditional,
                            retry_codes, pod_template)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
         RETURNING task_id",
    )
    .bind(name)
    .bind(namespace)
    .bind(version)
    .bind(hash)
    .bind(inline)
    .bind(&cols.image)
    .bind(&cols.command)
    .bind(&cols.args)
    .bind(&cols.script)
    .bind(&cols.script_injector_image)
    .bind(&cols.parameters)
    .bind(cols.backoff_limit)
    .bind(cols.is_conditional)
    .bind(&cols.retry_codes)
    .bind(&cols.pod_template)
    .fetch_one(&mut **tx)
    .await
    .map_err(query_error)?;
    Ok(task_id)
}

/// Running task run of `task_run_id`, locked, or `None` if it is not running.
async fn lock_running_task_run(
    tx: &mut Tx<'_>,
    task_run_id: TaskRunId,
) -> Result<Option<(RunId, RunHead)>, RepositoryError> {
    let (run_id,): (i64,) = sqlx::query_as("SELECT run_id FROM Task_Runs WHERE task_run_id = $1")
        .bind(task_run_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(query_error)?
        .ok_or_else(|| RepositoryError::NotFound(format!("task run {task_run_id}")))?;

    let run = lock_run(tx, run_id).await?;

    let (status,): (String,) =
        sqlx::query_as("SELECT status FROM Task_Runs WHERE task_run_id = $1 FOR UPDATE")
            .bind(task_run_id)
            .fetch_one(&mut **tx)
            .await
            .map_err(query_error)?;

    if parse_status::<TaskRunStatus>(&status)? != TaskRunStatus::Running {
        debug!(task_run_id, status = %status, "task run not running");
        return Ok(None);
    }
    Ok(Some((run_id, run)))
}

// ---------------------------------------------------------------------------
// DagStore
// ---------------------------------------------------------------------------

impl DagStore for PgDagStore {
    async fn insert_dag(
        &self,
        name: &str,
        namespace: &str,
        spec: &DagSpec,
        hash: &str,
    ) -> Result<DagId, RepositoryError> {
        let mut tx = self.begin().await?;

        let latest: Option<(i32, String)> = sqlx::query_as(
            "SELECT version, hash FROM DAGs WHERE name = $1 AND namespace = $2
             ORDER BY version DESC LIMIT 1 FOR UPDATE",
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?;

        let version = match latest {
            Some((_, ref latest_hash)) if latest_hash == hash => {
                return Err(RepositoryError::Conflict("applying the same dag".to_string()));
            }
            Some((v, _)) => v + 1,
            None => 1,
        };

        sqlx::query("UPDATE DAGs SET active = FALSE WHERE name = $1 AND namespace = $2")
            .bind(name)
            .bind(namespace)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let now = Utc::now();
        let next_fire_at = if spec.has_schedule() {
            Some(next_fire_time(&spec.schedule, now).map_err(|e| RepositoryError::Query(e.to_string()))?)
        } else {
            None
        };
        let workspace = spec.workspace.as_ref().filter(|w| w.enabled);

        let (dag_id,): (i64,) = sqlx::query_as(
            "INSERT INTO DAGs (name, namespace, version, hash, schedule, active, task_count,
                               next_fire_at, webhook_url, webhook_verify_ssl, workspace_enabled,
                               created_at)
             VALUES ($1, $2, $3, $4, $5, TRUE, $6, $7, $8, $9, $10, $11)
             RETURNING dag_id",
        )
        .bind(name)
        .bind(namespace)
        .bind(version)
        .bind(hash)
        .bind(spec.schedule.trim())
        .bind(spec.tasks.len() as i64)
        .bind(next_fire_at)
        .bind(spec.webhook.as_ref().map(|w| w.url.clone()))
        .bind(spec.webhook.as_ref().is_none_or(|w| w.verify_ssl))
        .bind(workspace.is_some())
        .bind(now)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("definition {namespace}/{name} version {version} exists"))
            } else {
                query_error(e)
            }
        })?;

        if let Some(ws) = workspace {
            sqlx::query(
                "INSERT INTO DAG_Workspaces (dag_id, access_modes, storage_class_name, volume_mode, storage)
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(dag_id)
            .bind(to_json(&ws.pvc.access_modes)?)
            .bind(&ws.pvc.storage_class_name)
            .bind(&ws.pvc.volume_mode)
            .bind(&ws.pvc.storage)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        for p in &spec.parameters {
            let value = if p.is_secret() {
                &p.default_from_secret
            } else {
                &p.default_value
            };
            sqlx::query(
                "INSERT INTO DAG_Parameters (dag_id, name, is_secret, default_value) VALUES ($1, $2, $3, $4)",
            )
            .bind(dag_id)
            .bind(&p.name)
            .bind(p.is_secret())
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        let mut dag_task_ids: HashMap<&str, i64> = HashMap::with_capacity(spec.tasks.len());
        for task in &spec.tasks {
            let task_id = match &task.task_ref {
                Some(r) => {
                    let found: Option<(i64,)> = sqlx::query_as(
                        "SELECT task_id FROM Tasks
                         WHERE name = $1 AND namespace = $2 AND version = $3 AND inline = FALSE",
                    )
                    .bind(&r.name)
                    .bind(namespace)
                    .bind(r.version)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(query_error)?;
                    found
                        .map(|(id,)| id)
                        .ok_or_else(|| RepositoryError::NotFound(format!("task {}@{}", r.name, r.version)))?
                }
                None => insert_task_body(&mut tx, &task.name, namespace, task, true, version, "").await?,
            };

            let (dag_task_id,): (i64,) = sqlx::query_as(
                "INSERT INTO DAG_Tasks (dag_id, task_id, name) VALUES ($1, $2, $3) RETURNING dag_task_id",
            )
            .bind(dag_id)
            .bind(task_id)
            .bind(&task.name)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error)?;
            dag_task_ids.insert(task.name.as_str(), dag_task_id);
        }

        for task in &spec.tasks {
            for dep in &task.run_after {
                let (Some(&from), Some(&to)) = (
                    dag_task_ids.get(task.name.as_str()),
                    dag_task_ids.get(dep.as_str()),
                ) else {
                    return Err(RepositoryError::Query(format!(
                        "task {} depends on unknown task {dep}",
                        task.name
                    )));
                };
                sqlx::query(
                    "INSERT INTO Dependencies (dag_task_id, depends_on_task_id) VALUES ($1, $2)
                     ON CONFLICT DO NOTHING",
                )
                .bind(from)
                .bind(to)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            }
        }

        tx.commit().await.map_err(query_error)?;
        debug!(dag = name, namespace, version, dag_id, "inserted definition version");
        Ok(dag_id)
    }

    async fn find_dag(&self, name: &str, namespace: &str) -> Result<Option<DagId>, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT dag_id FROM DAGs WHERE name = $1 AND namespace = $2 AND active = TRUE",
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;
        Ok(row.map(|(id,)| id))
    }

    async fn delete_dag(&self, name: &str, namespace: &str) -> Result<Vec<String>, RepositoryError> {
        let mut tx = self.begin().await?;

        let (versions,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM DAGs WHERE name = $1 AND namespace = $2")
                .bind(name)
                .bind(namespace)
                .fetch_one(&mut *tx)
                .await
                .map_err(query_error)?;
        if versions == 0 {
            return Err(RepositoryError::NotFound(format!("definition {namespace}/{name}")));
        }

        let referenced: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT t.name
             FROM Tasks t
             JOIN DAG_Tasks dt ON dt.task_id = t.task_id
             JOIN DAGs d ON d.dag_id = dt.dag_id
             WHERE d.name = $1 AND d.namespace = $2 AND t.inline = FALSE
             ORDER BY t.name",
        )
        .bind(name)
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_error)?;

        let mut unused = Vec::new();
        for (task_name,) in referenced {
            let (users,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*)
                 FROM DAG_Tasks dt
                 JOIN DAGs d ON d.dag_id = dt.dag_id
                 JOIN Tasks t ON t.task_id = dt.task_id
                 WHERE t.name = $1 AND t.namespace = $2 AND t.inline = FALSE AND d.active = TRUE
                   AND NOT (d.name = $3 AND d.namespace = $2)",
            )
            .bind(&task_name)
            .bind(namespace)
            .bind(name)
            .fetch_one(&mut *tx)
            .await
            .map_err(query_error)?;
            if users == 0 {
                unused.push(task_name);
            }
        }

        let inline: Vec<(i64,)> = sqlx::query_as(
            "SELECT t.task_id
             FROM Tasks t
             JOIN DAG_Tasks dt ON dt.task_id = t.task_id
             JOIN DAGs d ON d.dag_id = dt.dag_id
             WHERE d.name = $1 AND d.namespace = $2 AND t.inline = TRUE",
        )
        .bind(name)
        .bind(namespace)
        .fetch_all(&mut *tx)
        .await
        .map_err(query_error)?;

        // Runs, task runs, units and edges go with the definition rows.
        sqlx::query("DELETE FROM DAGs WHERE name = $1 AND namespace = $2")
            .bind(name)
            .bind(namespace)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let inline_ids: Vec<i64> = inline.into_iter().map(|(id,)| id).collect();
        if !inline_ids.is_empty() {
            sqlx::query("DELETE FROM Tasks WHERE task_id = ANY($1)")
                .bind(&inline_ids)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        info!(dag = name, namespace, versions, "deleted definition");
        Ok(unused)
    }

    async fn add_task(
        &self,
        name: &str,
        namespace: &str,
        spec: &TaskSpec,
        hash: &str,
    ) -> Result<TaskId, RepositoryError> {
        let mut tx = self.begin().await?;

        let latest: Option<(i32, String)> = sqlx::query_as(
            "SELECT version, hash FROM Tasks WHERE name = $1 AND namespace = $2 AND inline = FALSE
             ORDER BY version DESC LIMIT 1 FOR UPDATE",
        )
        .bind(name)
        .bind(namespace)
        .fetch_optional(&mut *tx)
        .await
        .map_err(query_error)?;

        let version = match latest {
            Some((_, ref latest_hash)) if latest_hash == hash => {
                return Err(RepositoryError::Conflict("applying the same task".to_string()));
            }
            Some((v, _)) => v + 1,
            None => 1,
        };

        let task_id = insert_task_body(&mut tx, name, namespace, spec, false, version, hash).await?;
        tx.commit().await.map_err(query_error)?;

        debug!(task = name, namespace, version, task_id, "inserted reusable task version");
        Ok(task_id)
    }

    async fn delete_task(&self, name: &str, namespace: &str) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("DELETE FROM Tasks WHERE name = $1 AND namespace = $2 AND inline = FALSE")
                .bind(name)
                .bind(namespace)
                .execute(&self.pool)
                .await
                .map_err(|e| {
                    if is_foreign_key_violation(&e) {
                        RepositoryError::Conflict(format!("task {name} is used by a definition"))
                    } else {
                        query_error(e)
                    }
                })?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("task {namespace}/{name}")));
        }
        Ok(())
    }

    async fn task_ref_parameters(
        &self,
        namespace: &str,
        refs: &[TaskRef],
    ) -> Result<TaskRefParameters, RepositoryError> {
        let mut out = TaskRefParameters::with_capacity(refs.len());
        for r in refs {
            let row: Option<(String,)> = sqlx::query_as(
                "SELECT parameters FROM Tasks
                 WHERE name = $1 AND namespace = $2 AND version = $3 AND inline = FALSE",
            )
            .bind(&r.name)
            .bind(namespace)
            .bind(r.version)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

            if let Some((raw,)) = row {
                out.insert(r.clone(), from_json(&raw, "parameters")?);
            }
        }
        Ok(out)
    }

    async fn get_due_dags(&self, now: DateTime<Utc>) -> Result<Vec<DueDag>, RepositoryError> {
        let mut tx = self.begin().await?;

        // SKIP LOCKED lets several engine replicas share the scan without
        // firing one definition twice.
        let rows = sqlx::query(
            "SELECT dag_id, name, namespace, schedule, next_fire_at, workspace_enabled
             FROM DAGs WHERE active = TRUE AND schedule <> ''
             FOR UPDATE SKIP LOCKED",
        )
        .fetch_all(&mut *tx)
        .await
        .map_err(query_error)?;

        let mut due = Vec::new();
        for row in rows {
            let dag_id: i64 = row.try_get("dag_id").map_err(query_error)?;
            let schedule: String = row.try_get("schedule").map_err(query_error)?;
            let next_fire_at: Option<DateTime<Utc>> = row.try_get("next_fire_at").map_err(query_error)?;

            let is_due = next_fire_at.is_some_and(|at| at <= now);
            if next_fire_at.is_some() && !is_due {
                continue;
            }

            let next = match next_fire_time(&schedule, now) {
                Ok(next) => next,
                Err(e) => {
                    warn!(dag_id, schedule = %schedule, error = %e, "skipping unparsable schedule");
                    continue;
                }
            };
            sqlx::query("UPDATE DAGs SET next_fire_at = $1 WHERE dag_id = $2")
                .bind(next)
                .bind(dag_id)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;

            if is_due {
                due.push(DueDag {
                    dag_id,
                    name: row.try_get("name").map_err(query_error)?,
                    namespace: row.try_get("namespace").map_err(query_error)?,
                    workspace_enabled: row.try_get("workspace_enabled").map_err(query_error)?,
                });
            }
        }

        tx.commit().await.map_err(query_error)?;
        Ok(due)
    }

    async fn dag_parameters(&self, dag_id: DagId) -> Result<Vec<DagParameter>, RepositoryError> {
        let rows: Vec<(String, bool, String)> = sqlx::query_as(
            "SELECT name, is_secret, default_value FROM DAG_Parameters
             WHERE dag_id = $1 ORDER BY parameter_id",
        )
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(rows
            .into_iter()
            .map(|(name, is_secret, value)| DagParameter {
                name,
                is_secret,
                value,
            })
            .collect())
    }

    async fn get_workspace_template(
        &self,
        dag_id: DagId,
    ) -> Result<Option<WorkspaceTemplate>, RepositoryError> {
        let row: Option<(String, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(
            "SELECT access_modes, storage_class_name, volume_mode, storage
             FROM DAG_Workspaces WHERE dag_id = $1",
        )
        .bind(dag_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(|(modes, storage_class_name, volume_mode, storage)| {
            Ok(WorkspaceTemplate {
                access_modes: from_json(&modes, "access_modes")?,
                storage_class_name,
                volume_mode,
                storage,
            })
        })
        .transpose()
    }

    async fn get_webhook(&self, run_id: RunId) -> Result<Option<WebhookTarget>, RepositoryError> {
        let row: Option<(Option<String>, bool)> = sqlx::query_as(
            "SELECT d.webhook_url, d.webhook_verify_ssl
             FROM DAG_Runs r JOIN DAGs d ON r.dag_id = d.dag_id
             WHERE r.run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(row.and_then(|(url, verify_ssl)| url.map(|url| WebhookTarget { url, verify_ssl })))
    }

    async fn create_run(
        &self,
        name: &str,
        dag_id: DagId,
        bindings: &[ParameterBinding],
        pvc_name: Option<&str>,
    ) -> Result<RunId, RepositoryError> {
        let mut tx = self.begin().await?;

        let (run_id,): (i64,) = sqlx::query_as(
            "INSERT INTO DAG_Runs (name, dag_id, status, run_time, pvc_name)
             VALUES ($1, $2, $3, $4, $5) RETURNING run_id",
        )
        .bind(name)
        .bind(dag_id)
        .bind(RunStatus::Running.as_str())
        .bind(Utc::now())
        .bind(pvc_name)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                RepositoryError::Conflict(format!("run {name} already exists"))
            } else {
                query_error(e)
            }
        })?;

        for b in bindings {
            sqlx::query(
                "INSERT INTO DAG_Run_Parameters (run_id, name, value, is_secret) VALUES ($1, $2, $3, $4)",
            )
            .bind(run_id)
            .bind(&b.name)
            .bind(&b.value)
            .bind(b.is_secret)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(run_id)
    }

    async fn find_existing_run(&self, name: &str) -> Result<Option<RunId>, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT run_id FROM DAG_Runs WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(row.map(|(id,)| id))
    }

    async fn run_exists(&self, run_id: RunId) -> Result<bool, RepositoryError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT run_id FROM DAG_Runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(row.is_some())
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<DagRun>, RepositoryError> {
        let row = sqlx::query(
            "SELECT run_id, name, dag_id, status, successful_count, failed_count, suspended_count,
                    run_time, pvc_name
             FROM DAG_Runs WHERE run_id = $1",
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status: String = row.try_get("status").map_err(query_error)?;

        Ok(Some(DagRun {
            id: row.try_get("run_id").map_err(query_error)?,
            name: row.try_get("name").map_err(query_error)?,
            dag_id: row.try_get("dag_id").map_err(query_error)?,
            status: parse_status(&status)?,
            successful_count: row.try_get("successful_count").map_err(query_error)?,
            failed_count: row.try_get("failed_count").map_err(query_error)?,
            suspended_count: row.try_get("suspended_count").map_err(query_error)?,
            run_time: row.try_get("run_time").map_err(query_error)?,
            pvc_name: row.try_get("pvc_name").map_err(query_error)?,
        }))
    }

    async fn list_task_runs(&self, run_id: RunId) -> Result<Vec<TaskRun>, RepositoryError> {
        let rows: Vec<(i64, i64, i64, String, i32)> = sqlx::query_as(
            "SELECT task_run_id, run_id, task_id, status, attempts FROM Task_Runs
             WHERE run_id = $1 ORDER BY task_run_id",
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter()
            .map(|(id, run_id, task_id, status, attempts)| {
                Ok(TaskRun {
                    id,
                    run_id,
                    task_id,
                    status: parse_status(&status)?,
                    attempts,
                })
            })
            .collect()
    }

    async fn get_starting_tasks(&self, run_id: RunId) -> Result<Vec<StartedTask>, RepositoryError> {
        let mut tx = self.begin().await?;
        let run = lock_run(&mut tx, run_id).await?;

        let (task_ids, edges) = load_graph(&mut tx, run.dag_id).await?;
        let mut roots = starting_tasks(&task_ids, &edges);
        if run.status != RunStatus::Running {
            // Never create task runs for a finished run; report existing ones.
            let existing = task_run_statuses(&mut tx, run_id).await?;
            roots.retain(|id| existing.contains_key(id));
        }

        let started = start_tasks(&mut tx, run_id, run.pvc_name.as_deref(), &roots).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(started)
    }

    async fn mark_task_started(&self, run_id: RunId, task_id: TaskId) -> Result<TaskRunId, RepositoryError> {
        let mut tx = self.begin().await?;
        insert_task_run(&mut tx, run_id, task_id, TaskRunStatus::Running, 1).await?;
        let id = task_run_id_of(&mut tx, run_id, task_id).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(id)
    }

    async fn increment_attempts(&self, task_run_id: TaskRunId) -> Result<(), RepositoryError> {
        let result =
            sqlx::query("UPDATE Task_Runs SET attempts = attempts + 1 WHERE task_run_id = $1")
                .bind(task_run_id)
                .execute(&self.pool)
                .await
                .map_err(query_error)?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound(format!("task run {task_run_id}")));
        }
        Ok(())
    }

    async fn advance_on_success(&self, task_run_id: TaskRunId) -> Result<Vec<StartedTask>, RepositoryError> {
        let mut tx = self.begin().await?;

        let Some((run_id, run)) = lock_running_task_run(&mut tx, task_run_id).await? else {
            return Ok(Vec::new());
        };

        sqlx::query("UPDATE Task_Runs SET status = $1 WHERE task_run_id = $2")
            .bind(TaskRunStatus::Success.as_str())
            .bind(task_run_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        sqlx::query("UPDATE DAG_Runs SET successful_count = successful_count + 1 WHERE run_id = $1")
            .bind(run_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        if run.status != RunStatus::Running {
            tx.commit().await.map_err(query_error)?;
            return Ok(Vec::new());
        }

        let (successful, task_count): (i64, i64) = sqlx::query_as(
            "SELECT r.successful_count, d.task_count
             FROM DAG_Runs r JOIN DAGs d ON r.dag_id = d.dag_id WHERE r.run_id = $1",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(query_error)?;

        if successful >= task_count {
            sqlx::query("UPDATE DAG_Runs SET status = $1 WHERE run_id = $2")
                .bind(RunStatus::Success.as_str())
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
            tx.commit().await.map_err(query_error)?;
            info!(run_id, "run succeeded");
            return Ok(Vec::new());
        }

        let (task_ids, edges) = load_graph(&mut tx, run.dag_id).await?;
        let statuses = task_run_statuses(&mut tx, run_id).await?;
        let next = runnable_tasks(&task_ids, &edges, &statuses);

        let started = start_tasks(&mut tx, run_id, run.pvc_name.as_deref(), &next).await?;
        tx.commit().await.map_err(query_error)?;
        Ok(started)
    }

    async fn mark_task_failed(&self, task_run_id: TaskRunId) -> Result<(), RepositoryError> {
        let mut tx = self.begin().await?;

        let Some((run_id, _)) = lock_running_task_run(&mut tx, task_run_id).await? else {
            return Ok(());
        };

        sqlx::query("UPDATE Task_Runs SET status = $1 WHERE task_run_id = $2")
            .bind(TaskRunStatus::Failed.as_str())
            .bind(task_run_id)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        sqlx::query(
            "UPDATE DAG_Runs SET status = $1, failed_count = failed_count + 1 WHERE run_id = $2",
        )
        .bind(RunStatus::Failed.as_str())
        .bind(run_id)
        .execute(&mut *tx)
        .await
        .map_err(query_error)?;

        tx.commit().await.map_err(query_error)?;
        Ok(())
    }

    async fn should_rerun(&self, task_run_id: TaskRunId, exit_code: i32) -> Result<bool, RepositoryError> {
        let row: Option<(i32, bool, String, i32)> = sqlx::query_as(
            "SELECT t.backoff_limit, t.is_conditional, t.retry_codes, r.attempts
             FROM Task_Runs r
             JOIN DAG_Tasks dt ON r.task_id = dt.dag_task_id
             JOIN Tasks t ON dt.task_id = t.task_id
             WHERE r.task_run_id = $1",
        )
        .bind(task_run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        match row {
            Some((limit, conditional, codes, attempts)) => {
                Ok(retry_policy(limit, conditional, &codes, attempts)?.should_rerun(exit_code))
            }
            None => Ok(false),
        }
    }

    async fn suspend_downstream(&self, run_id: RunId, task_run_id: TaskRunId) -> Result<Vec<String>, RepositoryError> {
        let mut tx = self.begin().await?;
        let run = lock_run(&mut tx, run_id).await?;

        let (task_id,): (i64,) =
            sqlx::query_as("SELECT task_id FROM Task_Runs WHERE task_run_id = $1 AND run_id = $2")
                .bind(task_run_id)
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(query_error)?
                .ok_or_else(|| RepositoryError::NotFound(format!("task run {task_run_id}")))?;

        let (_, edges) = load_graph(&mut tx, run.dag_id).await?;

        let mut suspended = Vec::new();
        for dependent in downstream_of(&edges, task_id) {
            if !insert_task_run(&mut tx, run_id, dependent, TaskRunStatus::Suspended, 0).await? {
                continue;
            }
            let (name,): (String,) =
                sqlx::query_as("SELECT name FROM DAG_Tasks WHERE dag_task_id = $1")
                    .bind(dependent)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(query_error)?;
            suspended.push(name);
        }

        if !suspended.is_empty() {
            sqlx::query("UPDATE DAG_Runs SET suspended_count = suspended_count + $1 WHERE run_id = $2")
                .bind(suspended.len() as i64)
                .bind(run_id)
                .execute(&mut *tx)
                .await
                .map_err(query_error)?;
        }

        tx.commit().await.map_err(query_error)?;
        Ok(suspended)
    }

    async fn run_complete(&self, run_id: RunId) -> Result<bool, RepositoryError> {
        let (status, successful, failed, suspended, task_count, running): (
            String,
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT r.status, r.successful_count, r.failed_count, r.suspended_count, d.task_count,
                    (SELECT COUNT(*) FROM Task_Runs tr WHERE tr.run_id = r.run_id AND tr.status = $2)
             FROM DAG_Runs r JOIN DAGs d ON r.dag_id = d.dag_id WHERE r.run_id = $1",
        )
        .bind(run_id)
        .bind(TaskRunStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?
        .ok_or_else(|| RepositoryError::NotFound(format!("run {run_id}")))?;

        if successful + failed + suspended >= task_count {
            return Ok(true);
        }
        Ok(parse_status::<RunStatus>(&status)? == RunStatus::Failed && running == 0)
    }

    async fn get_task_template(&self, task_id: TaskId) -> Result<TaskTemplate, RepositoryError> {
        let (script, script_injector_image): (Option<String>, Option<String>) = sqlx::query_as(
            "SELECT t.script, t.script_injector_image
             FROM DAG_Tasks dt JOIN Tasks t ON dt.task_id = t.task_id
             WHERE dt.dag_task_id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?
        .ok_or_else(|| RepositoryError::NotFound(format!("task {task_id}")))?;

        Ok(TaskTemplate {
            script,
            script_injector_image,
        })
    }

    async fn task_run_info(&self, task_run_id: TaskRunId) -> Result<TaskRunInfo, RepositoryError> {
        let (dag_name, task_name, namespace): (String, String, String) = sqlx::query_as(
            "SELECT d.name, dt.name, d.namespace
             FROM Task_Runs r
             JOIN DAG_Tasks dt ON r.task_id = dt.dag_task_id
             JOIN DAGs d ON dt.dag_id = d.dag_id
             WHERE r.task_run_id = $1",
        )
        .bind(task_run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?
        .ok_or_else(|| RepositoryError::NotFound(format!("task run {task_run_id}")))?;

        Ok(TaskRunInfo {
            dag_name,
            task_name,
            namespace,
        })
    }

    async fn mark_unit_status(&self, update: &UnitStatusUpdate) -> Result<bool, RepositoryError> {
        // The WHERE on the upsert makes the timestamp comparison atomic.
        let result = sqlx::query(
            "INSERT INTO Task_Pods (uid, task_run_id, name, namespace, phase, exit_code, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             ON CONFLICT (uid) DO UPDATE SET
                 phase = EXCLUDED.phase,
                 exit_code = EXCLUDED.exit_code,
                 updated_at = EXCLUDED.updated_at
             WHERE Task_Pods.updated_at < EXCLUDED.updated_at",
        )
        .bind(&update.uid)
        .bind(update.task_run_id)
        .bind(&update.name)
        .bind(&update.namespace)
        .bind(&update.phase)
        .bind(update.exit_code)
        .bind(update.observed_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn add_unit_duration(&self, uid: &str, duration_secs: i64) -> Result<(), RepositoryError> {
        sqlx::query("UPDATE Task_Pods SET duration_secs = $1 WHERE uid = $2")
            .bind(duration_secs)
            .bind(uid)
            .execute(&self.pool)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn get_unit(&self, uid: &str) -> Result<Option<UnitRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT uid, task_run_id, name, namespace, phase, exit_code, updated_at, duration_secs
             FROM Task_Pods WHERE uid = $1",
        )
        .bind(uid)
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(UnitRecord {
            uid: row.try_get("uid").map_err(query_error)?,
            task_run_id: row.try_get("task_run_id").map_err(query_error)?,
            name: row.try_get("name").map_err(query_error)?,
            namespace: row.try_get("namespace").map_err(query_error)?,
            phase: row.try_get("phase").map_err(query_error)?,
            exit_code: row.try_get("exit_code").map_err(query_error)?,
            updated_at: row.try_get("updated_at").map_err(query_error)?,
            duration_secs: row.try_get("duration_secs").map_err(query_error)?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::config::PostgresConfig;

    /// Store against `DAGRUN_TEST_PG_URL`, or `None` when it is unset.
    async fn test_store() -> Option<PgDagStore> {
        let url = std::env::var("DAGRUN_TEST_PG_URL").ok()?;
        let config = PostgresConfig {
            url,
            max_connections: 4,
        };
        let pool = super::super::pool::connect(&config).await.unwrap();
        Some(PgDagStore::new(pool))
    }

    fn spec() -> DagSpec {
        DagSpec {
            tasks: vec![
                TaskSpec {
                    name: "a".into(),
                    image: "alpine".into(),
                    command: vec!["true".into()],
                    ..Default::default()
                },
                TaskSpec {
                    name: "b".into(),
                    image: "alpine".into(),
                    command: vec!["true".into()],
                    run_after: vec!["a".into()],
                    ..Default::default()
                },
            ],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pg_run_lifecycle() {
        let Some(store) = test_store().await else {
            return;
        };
        let name = format!("pg-{}", uuid::Uuid::new_v4());
        let dag_id = store.insert_dag(&name, "default", &spec(), &name).await.unwrap();

        let run_id = store
            .create_run(&format!("{name}-run"), dag_id, &[], None)
            .await
            .unwrap();
        let starting = store.get_starting_tasks(run_id).await.unwrap();
        assert_eq!(starting.len(), 1);
        assert_eq!(starting[0].task.name, "a");

        let next = store.advance_on_success(starting[0].task_run_id).await.unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].task.name, "b");
        assert!(store.advance_on_success(starting[0].task_run_id).await.unwrap().is_empty());

        store.advance_on_success(next[0].task_run_id).await.unwrap();
        let run = store.get_run(run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert!(store.run_complete(run_id).await.unwrap());

        store.delete_dag(&name, "default").await.unwrap();
    }

    #[tokio::test]
    async fn test_pg_same_hash_is_conflict() {
        let Some(store) = test_store().await else {
            return;
        };
        let name = format!("pg-{}", uuid::Uuid::new_v4());
        store.insert_dag(&name, "default", &spec(), "h1").await.unwrap();
        let err = store.insert_dag(&name, "default", &spec(), "h1").await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
        store.delete_dag(&name, "default").await.unwrap();
    }
}
