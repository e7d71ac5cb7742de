//! Workflow Validation and Dependency Resolution
//!
//! Provides the checks run before a definition is stored and the pure
//! readiness queries used by the scheduler:
//! - Step field validation
//! - Reference integrity checking
//! - Cycle detection and topological ordering (Kahn's algorithm)
//! - Ready-step and blocked-step resolution

use std::collections::{HashMap, HashSet, VecDeque};

use log::{debug, info};

use super::model::{check_payload, StepStatus, WorkflowDefinition, WorkflowStep};
use crate::error::ValidationError;

/// Validates a single step's fields.
fn validate_step(step: &WorkflowStep) -> Result<(), ValidationError> {
    if step.id.trim().is_empty() {
        return Err(ValidationError::EmptyStepId);
    }

    if step.action.trim().is_empty() {
        return Err(ValidationError::EmptyAction(step.id.clone()));
    }

    if step.dependencies.is_empty() {
        debug!("Step '{}' is a root step (no dependencies)", step.id);
    }

    Ok(())
}

/// Validates the step graph.
///
/// Fails if any step has an empty id or action, if ids repeat, if a
/// dependency names an unknown step, or if the graph contains a cycle.
pub fn validate(steps: &[WorkflowStep]) -> Result<(), ValidationError> {
    if steps.is_empty() {
        return Err(ValidationError::EmptyWorkflow);
    }

    let mut seen_ids: HashSet<&str> = HashSet::new();
    for step in steps {
        validate_step(step)?;
        if !seen_ids.insert(step.id.as_str()) {
            return Err(ValidationError::DuplicateStepId(step.id.clone()));
        }
    }

    for step in steps {
        for dep in &step.dependencies {
            if !seen_ids.contains(dep.as_str()) {
                return Err(ValidationError::UnknownDependency {
                    step: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    topological_order(steps)?;
    Ok(())
}

/// Validates a whole definition before it is stored.
///
/// Adds policy and payload checks on top of [`validate`].
pub fn validate_definition(
    definition: &WorkflowDefinition,
    max_payload_bytes: usize,
) -> Result<(), ValidationError> {
    info!(
        "Validating workflow '{}' with {} steps",
        definition.name,
        definition.steps.len()
    );

    validate(&definition.steps)?;

    if definition.parallel_execution && definition.max_concurrent_steps == 0 {
        return Err(ValidationError::InvalidSetting(
            "max_concurrent_steps must be at least 1".to_string(),
        ));
    }

    if definition.timeout_secs == 0 {
        return Err(ValidationError::InvalidSetting(
            "workflow timeout must be positive".to_string(),
        ));
    }

    for step in &definition.steps {
        check_payload(
            &format!("step '{}' parameters", step.id),
            &step.parameters,
            max_payload_bytes,
        )?;
    }
    check_payload("workflow metadata", &definition.metadata, max_payload_bytes)?;

    Ok(())
}

/// Returns step ids ordered so that dependencies come before dependents.
///
/// Ties keep definition order. Fails with the ids left on a cycle.
pub fn topological_order(steps: &[WorkflowStep]) -> Result<Vec<String>, ValidationError> {
    let mut in_degree: HashMap<&str, usize> = HashMap::new();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();

    for step in steps {
        in_degree.insert(step.id.as_str(), step.dependencies.len());
        for dep in &step.dependencies {
            successors.entry(dep.as_str()).or_default().push(step.id.as_str());
        }
    }

    // Start with root nodes (in-degree = 0)
    let mut queue: VecDeque<&str> = steps
        .iter()
        .filter(|s| s.dependencies.is_empty())
        .map(|s| s.id.as_str())
        .collect();

    let mut sorted_order: Vec<String> = Vec::with_capacity(steps.len());

    while let Some(current) = queue.pop_front() {
        sorted_order.push(current.to_string());

        for successor in successors.get(current).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(successor) {
                *degree = degree.saturating_sub(1);
                if *degree == 0 {
                    queue.push_back(*successor);
                }
            }
        }
    }

    if sorted_order.len() != steps.len() {
        let stuck: Vec<String> = steps
            .iter()
            .filter(|s| in_degree.get(s.id.as_str()).copied().unwrap_or(0) > 0)
            .map(|s| s.id.clone())
            .collect();
        return Err(ValidationError::CyclicDependency(stuck));
    }

    debug!("Topological order: {:?}", sorted_order);
    Ok(sorted_order)
}

/// Returns the PENDING steps whose dependencies are all in `completed_ids`.
///
/// `completed_ids` holds the ids of COMPLETED and SKIPPED steps. Results
/// keep definition order.
pub fn ready_steps<'a>(
    steps: &'a [WorkflowStep],
    completed_ids: &HashSet<String>,
) -> Vec<&'a WorkflowStep> {
    steps
        .iter()
        .filter(|step| step.status == StepStatus::Pending)
        .filter(|step| step.dependencies.iter().all(|dep| completed_ids.contains(dep)))
        .collect()
}

/// Returns the PENDING steps that can never run because an ancestor FAILED.
pub fn blocked_steps(steps: &[WorkflowStep]) -> Vec<String> {
    let failed: HashSet<&str> = steps
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .map(|s| s.id.as_str())
        .collect();
    let mut blocked: HashSet<&str> = HashSet::new();

    // Propagate until no new step becomes blocked
    loop {
        let mut changed = false;
        for step in steps.iter().filter(|s| s.status == StepStatus::Pending) {
            if blocked.contains(step.id.as_str()) {
                continue;
            }
            let has_failed_parent = step
                .dependencies
                .iter()
                .any(|dep| failed.contains(dep.as_str()) || blocked.contains(dep.as_str()));
            if has_failed_parent {
                blocked.insert(step.id.as_str());
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    steps
        .iter()
        .filter(|s| blocked.contains(s.id.as_str()))
        .map(|s| s.id.clone())
        .collect()
}
