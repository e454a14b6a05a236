//! `dagrun run`: start a run and drive it to completion in-process.

use std::time::Duration;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use dagrun_core::repository::DagStore;
use dagrun_types::run::{ParameterOverride, RunId, RunStatus, TaskRunStatus};

use crate::services::Services;
use crate::state::AppState;

const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Split `NAME=VALUE` arguments into overrides.
pub fn parse_overrides(params: &[String], secret_params: &[String]) -> Result<Vec<ParameterOverride>> {
    let split = |raw: &String| -> Result<(String, String)> {
        let (name, value) = raw
            .split_once('=')
            .with_context(|| format!("expected NAME=VALUE, got '{raw}'"))?;
        if name.is_empty() {
            bail!("parameter name missing in '{raw}'");
        }
        Ok((name.to_string(), value.to_string()))
    };

    let mut overrides = Vec::with_capacity(params.len() + secret_params.len());
    for raw in params {
        let (name, value) = split(raw)?;
        overrides.push(ParameterOverride {
            name,
            value,
            from_secret: String::new(),
        });
    }
    for raw in secret_params {
        let (name, secret) = split(raw)?;
        overrides.push(ParameterOverride {
            name,
            value: String::new(),
            from_secret: secret,
        });
    }
    Ok(overrides)
}

pub async fn run<S: DagStore>(
    state: &AppState<S>,
    dag: &str,
    instance: Option<String>,
    namespace: &str,
    overrides: Vec<ParameterOverride>,
    json: bool,
) -> Result<()> {
    let instance = instance.unwrap_or_else(dagrun_core::scheduler::scheduled_run_name);
    let mut namespaces = state.config.namespaces.clone();
    if !namespaces.iter().any(|ns| ns == namespace) {
        namespaces.push(namespace.to_string());
    }
    let services = Services::start(state, &namespaces, false)?;

    let outcome = async {
        let run_id = state
            .engine
            .start_run_from_trigger(&instance, dag, &overrides, namespace)
            .await?;
        if !json {
            println!("  {} Started run '{}' (id {})", style("▶").cyan(), style(&instance).bold(), run_id);
        }
        wait_for_completion(state, run_id).await
    };

    let result = tokio::select! {
        r = outcome => r,
        _ = crate::shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
    };
    services.shutdown().await;
    let run_id = result?;

    report(state, run_id, json).await
}

async fn wait_for_completion<S: DagStore>(state: &AppState<S>, run_id: RunId) -> Result<RunId> {
    loop {
        if state.store.run_complete(run_id).await? {
            let running = state
                .store
                .list_task_runs(run_id)
                .await?
                .iter()
                .any(|tr| tr.status == TaskRunStatus::Running);
            if !running {
                return Ok(run_id);
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn report<S: DagStore>(state: &AppState<S>, run_id: RunId, json: bool) -> Result<()> {
    let run = state
        .store
        .get_run(run_id)
        .await?
        .with_context(|| format!("run {run_id} disappeared"))?;
    let mut rows = Vec::new();
    for tr in state.store.list_task_runs(run_id).await? {
        let info = state.store.task_run_info(tr.id).await?;
        rows.push((info.task_name, tr.status, tr.attempts));
    }

    if json {
        let tasks: Vec<_> = rows
            .iter()
            .map(|(name, status, attempts)| {
                serde_json::json!({ "task": name, "status": status.as_str(), "attempts": attempts })
            })
            .collect();
        println!(
            "{}",
            serde_json::json!({ "run": run.name, "status": run.status.as_str(), "tasks": tasks })
        );
    } else {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Task", "Status", "Attempts"]);
        for (name, status, attempts) in &rows {
            let color = match status {
                TaskRunStatus::Success => Color::Green,
                TaskRunStatus::Failed => Color::Red,
                TaskRunStatus::Suspended => Color::Yellow,
                TaskRunStatus::Running => Color::Cyan,
            };
            table.add_row(vec![
                Cell::new(name),
                Cell::new(status.as_str()).fg(color),
                Cell::new(attempts),
            ]);
        }
        println!("{table}");
    }

    if run.status == RunStatus::Failed {
        bail!("run '{}' failed", run.name);
    }
    if !json {
        println!("  {} Run '{}' succeeded", style("✓").green().bold(), style(&run.name).bold());
    }
    Ok(())
}
