//! Static validation of workflow specifications.
//!
//! `validate_dag` runs a fixed sequence of checks and returns the first
//! failure. It never touches storage: parameters of referenced reusable tasks
//! are supplied by the caller as a lookup table.

use std::collections::{BTreeMap, HashMap, HashSet};

use dagrun_types::dag::{DagSpec, TaskRef, TaskSpec};
use dagrun_types::error::ValidationError;
use petgraph::algo::connected_components;
use petgraph::graph::UnGraph;
use serde::Serialize;

/// Declared parameter names of reusable tasks, keyed by reference.
pub type TaskRefParameters = HashMap<TaskRef, Vec<String>>;

/// Validate a definition. Checks run in order; the first failure wins.
pub fn validate_dag(spec: &DagSpec, task_refs: &TaskRefParameters) -> Result<(), ValidationError> {
    check_task_fields(spec)?;
    check_parameter_declarations(spec)?;
    check_parameter_references(spec, task_refs)?;
    check_no_cycles(spec)?;
    check_run_after_exists(spec)?;
    check_connected(spec)?;
    check_starting_task(spec)?;
    Ok(())
}

/// Validate a standalone reusable task.
pub fn validate_task(task: &TaskSpec) -> Result<(), ValidationError> {
    if task.name.is_empty() {
        return Err(ValidationError::EmptyTaskName);
    }
    check_task_body(task)
}

// ---------------------------------------------------------------------------
// Checks
// ---------------------------------------------------------------------------

fn check_task_body(task: &TaskSpec) -> Result<(), ValidationError> {
    if task.image.is_empty() {
        return Err(ValidationError::MissingImage(task.name.clone()));
    }
    if task.script.is_empty() && task.command.is_empty() {
        return Err(ValidationError::MissingCommand(task.name.clone()));
    }
    Ok(())
}

fn check_task_fields(spec: &DagSpec) -> Result<(), ValidationError> {
    let mut names = HashSet::new();

    for task in &spec.tasks {
        if task.name.is_empty() {
            return Err(ValidationError::EmptyTaskName);
        }

        // Referenced tasks take their body from the stored reusable task.
        if !task.is_reference() {
            check_task_body(task)?;
        }

        if !names.insert(task.name.as_str()) {
            return Err(ValidationError::DuplicateTask(task.name.clone()));
        }
    }

    Ok(())
}

fn check_parameter_declarations(spec: &DagSpec) -> Result<(), ValidationError> {
    for param in &spec.parameters {
        if param.name.is_empty() {
            return Err(ValidationError::EmptyParameterName);
        }

        let has_default = !param.default_value.is_empty();
        let has_secret = !param.default_from_secret.is_empty();

        if has_default && has_secret {
            return Err(ValidationError::ParameterHasBothSources(param.name.clone()));
        }
        if !has_default && !has_secret {
            return Err(ValidationError::ParameterHasNoSource(param.name.clone()));
        }
    }
    Ok(())
}

fn check_parameter_references(
    spec: &DagSpec,
    task_refs: &TaskRefParameters,
) -> Result<(), ValidationError> {
    let declared: HashSet<&str> = spec.parameters.iter().map(|p| p.name.as_str()).collect();

    for task in &spec.tasks {
        let referenced: &[String] = match &task.task_ref {
            Some(r) => task_refs.get(r).map(Vec::as_slice).ok_or_else(|| {
                ValidationError::UnknownTaskRef {
                    task: task.name.clone(),
                    reference: format!("{}@{}", r.name, r.version),
                }
            })?,
            None => &task.parameters,
        };

        if let Some(missing) = referenced.iter().find(|p| !declared.contains(p.as_str())) {
            return Err(ValidationError::UnknownParameter {
                task: task.name.clone(),
                parameter: missing.clone(),
            });
        }
    }
    Ok(())
}

/// Depth-first search over runs-after edges with explicit visited and
/// in-progress marker sets. Reaching a node that is still in progress closes
/// a cycle.
fn check_no_cycles(spec: &DagSpec) -> Result<(), ValidationError> {
    let deps: HashMap<&str, &[String]> = spec
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), t.run_after.as_slice()))
        .collect();

    let mut visited: HashSet<&str> = HashSet::new();
    let mut in_progress: HashSet<&str> = HashSet::new();

    for task in &spec.tasks {
        let root = task.name.as_str();
        if !visited.insert(root) {
            continue;
        }
        in_progress.insert(root);

        // (node, index of the next dependency to explore)
        let mut stack: Vec<(&str, usize)> = vec![(root, 0)];

        while let Some(&(node, next)) = stack.last() {
            let children = deps.get(node).copied().unwrap_or_default();
            match children.get(next) {
                Some(child) => {
                    if let Some(top) = stack.last_mut() {
                        top.1 += 1;
                    }
                    let child = child.as_str();
                    if in_progress.contains(child) {
                        return Err(ValidationError::CycleDetected(child.to_string()));
                    }
                    if visited.insert(child) {
                        in_progress.insert(child);
                        stack.push((child, 0));
                    }
                }
                None => {
                    in_progress.remove(node);
                    stack.pop();
                }
            }
        }
    }

    Ok(())
}

fn check_run_after_exists(spec: &DagSpec) -> Result<(), ValidationError> {
    let names: HashSet<&str> = spec.tasks.iter().map(|t| t.name.as_str()).collect();
    for task in &spec.tasks {
        for dep in &task.run_after {
            if !names.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    task: task.name.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

fn check_connected(spec: &DagSpec) -> Result<(), ValidationError> {
    let mut graph = UnGraph::<&str, ()>::new_undirected();
    let index: HashMap<&str, _> = spec
        .tasks
        .iter()
        .map(|t| (t.name.as_str(), graph.add_node(t.name.as_str())))
        .collect();

    for task in &spec.tasks {
        let to = index[task.name.as_str()];
        for dep in &task.run_after {
            if let Some(&from) = index.get(dep.as_str()) {
                graph.add_edge(from, to, ());
            }
        }
    }

    if connected_components(&graph) > 1 {
        return Err(ValidationError::Disconnected);
    }
    Ok(())
}

fn check_starting_task(spec: &DagSpec) -> Result<(), ValidationError> {
    if spec.tasks.iter().any(|t| t.run_after.is_empty()) {
        Ok(())
    } else {
        Err(ValidationError::NoStartingTask)
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Shape of a definition, reported by `dagrun validate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GraphSummary {
    pub task_count: usize,
    pub task_names: Vec<String>,
    pub root_tasks: Vec<String>,
    pub leaf_tasks: Vec<String>,
    pub dependencies: BTreeMap<String, Vec<String>>,
    pub has_schedule: bool,
    pub schedule: String,
}

pub fn summarize(spec: &DagSpec) -> GraphSummary {
    let upstream: HashSet<&str> = spec
        .tasks
        .iter()
        .flat_map(|t| t.run_after.iter().map(String::as_str))
        .collect();

    GraphSummary {
        task_count: spec.tasks.len(),
        task_names: spec.tasks.iter().map(|t| t.name.clone()).collect(),
        root_tasks: spec
            .tasks
            .iter()
            .filter(|t| t.run_after.is_empty())
            .map(|t| t.name.clone())
            .collect(),
        leaf_tasks: spec
            .tasks
            .iter()
            .filter(|t| !upstream.contains(t.name.as_str()))
            .map(|t| t.name.clone())
            .collect(),
        dependencies: spec
            .tasks
            .iter()
            .filter(|t| !t.run_after.is_empty())
            .map(|t| (t.name.clone(), t.run_after.clone()))
            .collect(),
        has_schedule: spec.has_schedule(),
        schedule: spec.schedule.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dagrun_types::dag::DagParameterSpec;

    fn task(name: &str, run_after: &[&str]) -> TaskSpec {
        TaskSpec {
            name: name.to_string(),
            image: "alpine".to_string(),
            command: vec!["echo".to_string(), name.to_string()],
            run_after: run_after.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn dag(tasks: Vec<TaskSpec>) -> DagSpec {
        DagSpec {
            tasks,
            ..Default::default()
        }
    }

    fn validate(spec: &DagSpec) -> Result<(), ValidationError> {
        validate_dag(spec, &TaskRefParameters::new())
    }

    #[test]
    fn test_valid_diamond() {
        let spec = dag(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &["a"]),
            task("d", &["b", "c"]),
        ]);
        assert!(validate(&spec).is_ok());
    }

    #[test]
    fn test_duplicate_task_names() {
        let spec = dag(vec![task("a", &[]), task("a", &[])]);
        assert_eq!(
            validate(&spec).unwrap_err(),
            ValidationError::DuplicateTask("a".into())
        );
    }

    #[test]
    fn test_missing_image() {
        let mut t = task("a", &[]);
        t.image.clear();
        assert_eq!(
            validate(&dag(vec![t])).unwrap_err(),
            ValidationError::MissingImage("a".into())
        );
    }

    #[test]
    fn test_missing_script_and_command() {
        let mut t = task("a", &[]);
        t.command.clear();
        assert_eq!(
            validate(&dag(vec![t])).unwrap_err(),
            ValidationError::MissingCommand("a".into())
        );
    }

    #[test]
    fn test_missing_image_is_reported_before_missing_command() {
        let mut t = task("a", &[]);
        t.image.clear();
        t.command.clear();
        assert_eq!(
            validate(&dag(vec![t.clone()])).unwrap_err(),
            ValidationError::MissingImage("a".into())
        );
        assert_eq!(
            validate_task(&t).unwrap_err(),
            ValidationError::MissingImage("a".into())
        );
    }

    #[test]
    fn test_script_without_command_is_valid() {
        let mut t = task("a", &[]);
        t.command.clear();
        t.script = "echo hi".into();
        assert!(validate(&dag(vec![t])).is_ok());
    }

    #[test]
    fn test_empty_task_name() {
        let spec = dag(vec![task("", &[])]);
        assert_eq!(validate(&spec).unwrap_err(), ValidationError::EmptyTaskName);
    }

    #[test]
    fn test_self_reference_is_cycle() {
        let spec = dag(vec![task("a", &[]), task("b", &["a", "b"])]);
        assert_eq!(
            validate(&spec).unwrap_err(),
            ValidationError::CycleDetected("b".into())
        );
    }

    #[test]
    fn test_longer_cycle() {
        let spec = dag(vec![
            task("root", &[]),
            task("a", &["root", "c"]),
            task("b", &["a"]),
            task("c", &["b"]),
        ]);
        assert!(matches!(
            validate(&spec).unwrap_err(),
            ValidationError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_cycle_is_reported_before_unknown_dependency() {
        let spec = dag(vec![task("a", &["b", "ghost"]), task("b", &["a"])]);
        assert!(matches!(
            validate(&spec).unwrap_err(),
            ValidationError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_unknown_dependency() {
        let spec = dag(vec![task("a", &[]), task("b", &["ghost"])]);
        assert_eq!(
            validate(&spec).unwrap_err(),
            ValidationError::UnknownDependency {
                task: "b".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn test_disconnected() {
        let spec = dag(vec![
            task("a", &[]),
            task("b", &["a"]),
            task("c", &[]),
            task("d", &["c"]),
        ]);
        assert_eq!(validate(&spec).unwrap_err(), ValidationError::Disconnected);
    }

    #[test]
    fn test_no_starting_task() {
        let spec = dag(vec![]);
        assert_eq!(validate(&spec).unwrap_err(), ValidationError::NoStartingTask);
    }

    #[test]
    fn test_parameter_with_both_sources() {
        let mut spec = dag(vec![task("a", &[])]);
        spec.parameters.push(DagParameterSpec {
            name: "p".into(),
            default_value: "1".into(),
            default_from_secret: "s".into(),
        });
        assert_eq!(
            validate(&spec).unwrap_err(),
            ValidationError::ParameterHasBothSources("p".into())
        );
    }

    #[test]
    fn test_parameter_with_neither_source() {
        let mut spec = dag(vec![task("a", &[])]);
        spec.parameters.push(DagParameterSpec {
            name: "p".into(),
            ..Default::default()
        });
        assert_eq!(
            validate(&spec).unwrap_err(),
            ValidationError::ParameterHasNoSource("p".into())
        );
    }

    #[test]
    fn test_undeclared_task_parameter() {
        let mut t = task("a", &[]);
        t.parameters = vec!["missing".into()];
        assert_eq!(
            validate(&dag(vec![t])).unwrap_err(),
            ValidationError::UnknownParameter {
                task: "a".into(),
                parameter: "missing".into()
            }
        );
    }

    #[test]
    fn test_task_ref_parameters_resolved_from_lookup() {
        let reference = TaskRef {
            name: "shared".into(),
            version: 2,
        };
        let spec = DagSpec {
            tasks: vec![TaskSpec {
                name: "uses-shared".into(),
                task_ref: Some(reference.clone()),
                ..Default::default()
            }],
            parameters: vec![DagParameterSpec {
                name: "token".into(),
                default_from_secret: "api-token".into(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut lookup = TaskRefParameters::new();
        assert!(matches!(
            validate_dag(&spec, &lookup).unwrap_err(),
            ValidationError::UnknownTaskRef { .. }
        ));

        lookup.insert(reference.clone(), vec!["token".into()]);
        assert!(validate_dag(&spec, &lookup).is_ok());

        lookup.insert(reference, vec!["token".into(), "region".into()]);
        assert!(matches!(
            validate_dag(&spec, &lookup).unwrap_err(),
            ValidationError::UnknownParameter { .. }
        ));
    }

    #[test]
    fn test_deep_chain_does_not_overflow() {
        let mut tasks = vec![task("t0", &[])];
        for i in 1..5_000 {
            let prev = format!("t{}", i - 1);
            tasks.push(task(&format!("t{i}"), &[prev.as_str()]));
        }
        assert!(validate(&dag(tasks)).is_ok());
    }

    #[test]
    fn test_validate_reusable_task() {
        assert!(validate_task(&task("x", &[])).is_ok());
        let mut bad = task("x", &[]);
        bad.image.clear();
        assert!(validate_task(&bad).is_err());
    }

    #[test]
    fn test_summary_roots_and_leaves() {
        let spec = dag(vec![task("a", &[]), task("b", &[]), task("c", &["a", "b"])]);
        let summary = summarize(&spec);
        assert_eq!(summary.task_count, 3);
        assert_eq!(summary.root_tasks, vec!["a", "b"]);
        assert_eq!(summary.leaf_tasks, vec!["c"]);
        assert_eq!(summary.dependencies["c"], vec!["a", "b"]);
        assert!(!summary.has_schedule);
    }
}
