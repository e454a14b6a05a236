//! Definition and reusable task commands: validate, apply, delete.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, ContentArrangement, Table, presets};
use console::style;
use serde::de::DeserializeOwned;

use dagrun_core::repository::DagStore;
use dagrun_core::validate::summarize;
use dagrun_types::dag::{DagSpec, TaskSpec};

use crate::state::AppState;

/// Parse a `.toml` or `.json` file.
pub fn load_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        Some("json") => serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display())),
        _ => bail!("{}: expected a .json or .toml file", path.display()),
    }
}

/// Explicit name, or the file stem.
pub fn resource_name(path: &Path, name: Option<String>) -> Result<String> {
    match name {
        Some(n) if !n.is_empty() => Ok(n),
        _ => path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(str::to_string)
            .with_context(|| format!("cannot derive a name from {}", path.display())),
    }
}

pub async fn validate<S: DagStore>(state: &AppState<S>, file: &Path, json: bool) -> Result<()> {
    let spec: DagSpec = load_file(file)?;
    state.engine.validate("default", &spec).await?;
    let summary = summarize(&spec);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("  {} {} is valid", style("✓").green().bold(), style(file.display()).bold());

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Task", "Runs after"]);
    for name in &summary.task_names {
        let after = summary
            .dependencies
            .get(name)
            .map(|deps| deps.join(", "))
            .unwrap_or_default();
        table.add_row(vec![Cell::new(name), Cell::new(after)]);
    }
    println!("{table}");

    println!("  roots:  {}", summary.root_tasks.join(", "));
    println!("  leaves: {}", summary.leaf_tasks.join(", "));
    if summary.has_schedule {
        println!("  schedule: {}", summary.schedule);
    }
    Ok(())
}

pub async fn apply<S: DagStore>(
    state: &AppState<S>,
    file: &Path,
    name: Option<String>,
    namespace: &str,
    json: bool,
) -> Result<()> {
    let spec: DagSpec = load_file(file)?;
    let name = resource_name(file, name)?;
    let dag_id = state.engine.validate_and_store(&name, namespace, &spec).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "applied": true, "name": name, "namespace": namespace, "dagId": dag_id })
        );
    } else {
        println!(
            "  {} Definition '{}' applied in {} (id {})",
            style("✓").green().bold(),
            style(&name).bold(),
            namespace,
            dag_id
        );
    }
    Ok(())
}

pub async fn delete<S: DagStore>(state: &AppState<S>, name: &str, namespace: &str, json: bool) -> Result<()> {
    let unused = state.engine.soft_delete(name, namespace).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "deleted": true, "name": name, "unusedTasks": unused })
        );
    } else {
        println!("  {} Definition '{}' deleted", style("✓").green().bold(), style(name).bold());
        if !unused.is_empty() {
            println!(
                "  {} no longer used by any definition: {}",
                style("note:").dim(),
                unused.join(", ")
            );
        }
    }
    Ok(())
}

pub async fn apply_task<S: DagStore>(
    state: &AppState<S>,
    file: &Path,
    name: Option<String>,
    namespace: &str,
    json: bool,
) -> Result<()> {
    let mut spec: TaskSpec = load_file(file)?;
    let name = resource_name(file, name)?;
    if spec.name.is_empty() {
        spec.name = name.clone();
    }
    let task_id = state.engine.add_reusable_task(&name, namespace, &spec).await?;

    if json {
        println!(
            "{}",
            serde_json::json!({ "applied": true, "name": name, "namespace": namespace, "taskId": task_id })
        );
    } else {
        println!("  {} Task '{}' applied (id {})", style("✓").green().bold(), style(&name).bold(), task_id);
    }
    Ok(())
}

pub async fn delete_task<S: DagStore>(state: &AppState<S>, name: &str, namespace: &str, json: bool) -> Result<()> {
    state.engine.delete_reusable_task(name, namespace).await?;

    if json {
        println!("{}", serde_json::json!({ "deleted": true, "name": name }));
    } else {
        println!("  {} Task '{}' deleted", style("✓").green().bold(), style(name).bold());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_toml_definition() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nightly.toml");
        std::fs::write(
            &path,
            r#"
schedule = "0 2 * * *"

[[tasks]]
name = "extract"
image = "alpine"
command = ["sh", "-c", "echo extract"]

[[tasks]]
name = "load"
image = "alpine"
command = ["true"]
runAfter = ["extract"]
"#,
        )
        .unwrap();

        let spec: DagSpec = load_file(&path).unwrap();
        assert_eq!(spec.tasks.len(), 2);
        assert_eq!(spec.tasks[1].run_after, vec!["extract"]);
        assert_eq!(resource_name(&path, None).unwrap(), "nightly");
        assert_eq!(resource_name(&path, Some("x".into())).unwrap(), "x");
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dag.yaml");
        std::fs::write(&path, "tasks: []").unwrap();
        assert!(load_file::<DagSpec>(&path).is_err());
    }
}
