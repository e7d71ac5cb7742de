//! Workflow Parser
//!
//! Handles loading and saving workflow definitions as YAML files.
//! Loaded specs are checked with the same graph rules the orchestrator
//! applies, so a bad file fails before anything is registered.

use std::fs;
use std::path::Path;

use log::{debug, info};

use super::model::{WorkflowDefinition, WorkflowSpec};
use super::validator::validate;
use crate::error::ParseError;

/// Parses and checks a workflow spec from YAML text.
pub fn parse_workflow_spec(yaml_content: &str) -> Result<WorkflowSpec, ParseError> {
    let spec: WorkflowSpec = serde_yaml::from_str(yaml_content)?;

    debug!("Parsed workflow '{}' with {} steps", spec.name, spec.steps.len());

    // Default ids are only assigned when the definition is built, so
    // check the graph on a throwaway definition.
    let preview = WorkflowDefinition::from_spec("preview", spec.clone());
    validate(&preview.steps)?;

    Ok(spec)
}

/// Loads a workflow spec from a YAML file.
///
/// # Arguments
///
/// * `path` - Path to the workflow YAML file
///
/// # Returns
///
/// * `Ok(WorkflowSpec)` - Successfully loaded and validated spec
/// * `Err` - Read, parse or validation error
///
/// # Example
///
/// ```rust,no_run
/// use flowdirector::workflow::load_workflow_spec;
///
/// fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let spec = load_workflow_spec("discovery.yaml")?;
///     println!("Loaded {} steps", spec.steps.len());
///     Ok(())
/// }
/// ```
pub fn load_workflow_spec(path: impl AsRef<Path>) -> Result<WorkflowSpec, ParseError> {
    let path = path.as_ref();
    info!("Loading workflow from: {}", path.display());

    let yaml_content = fs::read_to_string(path)?;
    debug!("YAML content loaded ({} bytes)", yaml_content.len());

    let spec = parse_workflow_spec(&yaml_content)?;
    info!("Workflow '{}' loaded: {} steps", spec.name, spec.steps.len());
    Ok(spec)
}

/// Saves a workflow spec to a YAML file.
pub fn save_workflow_spec(spec: &WorkflowSpec, path: impl AsRef<Path>) -> Result<(), ParseError> {
    let yaml_content = serde_yaml::to_string(spec)?;
    fs::write(path.as_ref(), yaml_content)?;
    info!("Workflow saved to: {}", path.as_ref().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::workflow::model::{FailureAction, Priority, StepSpec};
    use tempfile::tempdir;

    const DISCOVERY_YAML: &str = r#"
name: Keyword Discovery
description: Search two keyword groups
parallel_execution: true
max_concurrent_steps: 2
priority: high
session_requirements:
  session_type: job_discovery
  min_sessions: 2
steps:
  - id: setup
    action: create_session_pool
  - id: search_a
    action: search_jobs
    parameters:
      keywords: ["rust", "tokio"]
    dependencies: setup
  - id: search_b
    action: search_jobs
    dependencies: [setup]
    max_retries: 1
    on_failure: skip
  - action: merge_job_results
    dependencies: [search_a, search_b]
"#;

    #[test]
    fn test_parse_workflow_spec() {
        let spec = parse_workflow_spec(DISCOVERY_YAML).unwrap();
        assert_eq!(spec.name, "Keyword Discovery");
        assert!(spec.parallel_execution);
        assert_eq!(spec.priority, Priority::High);
        assert_eq!(spec.session_requirements.min_sessions, 2);
        assert_eq!(spec.steps.len(), 4);
        assert_eq!(spec.steps[1].dependencies, vec!["setup"]);
        assert_eq!(spec.steps[2].on_failure, FailureAction::Skip);
        assert_eq!(spec.steps[3].id, None);
    }

    #[test]
    fn test_parse_rejects_cycle() {
        let yaml = r#"
name: loop
steps:
  - id: a
    action: x
    dependencies: b
  - id: b
    action: x
    dependencies: a
"#;
        match parse_workflow_spec(yaml) {
            Err(ParseError::Validation(ValidationError::CyclicDependency(ids))) => {
                assert_eq!(ids, vec!["a", "b"]);
            }
            other => panic!("Expected cycle error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_dangling_dependency() {
        let yaml = "name: x\nsteps:\n  - id: a\n    action: x\n    dependencies: missing\n";
        assert!(matches!(
            parse_workflow_spec(yaml),
            Err(ParseError::Validation(ValidationError::UnknownDependency { .. }))
        ));
    }

    #[test]
    fn test_load_workflow_file_not_found() {
        let result = load_workflow_spec("/nonexistent/path/workflow.yaml");
        assert!(matches!(result, Err(ParseError::Io(_))));
    }

    #[test]
    fn test_load_workflow_invalid_yaml() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("bad.yaml");
        std::fs::write(&workflow_path, "this is not valid yaml: [[[").unwrap();

        let result = load_workflow_spec(&workflow_path);
        assert!(matches!(result, Err(ParseError::Yaml(_))));
    }

    #[test]
    fn test_save_and_load_workflow() {
        let temp_dir = tempdir().unwrap();
        let workflow_path = temp_dir.path().join("saved.yaml");

        let spec = WorkflowSpec::new("Saved")
            .with_step(StepSpec::new("open").with_id("open"))
            .with_step(StepSpec::new("read").with_id("read").depends_on("open"));

        save_workflow_spec(&spec, &workflow_path).unwrap();
        assert!(workflow_path.exists());

        let loaded = load_workflow_spec(&workflow_path).unwrap();
        assert_eq!(loaded, spec);
    }
}
