//! Execution Planner
//!
//! Owns the step state of one execution:
//! - Dependency tracking
//! - Concurrency limits
//! - Retry bookkeeping and backoff deadlines
//! - Progress and status history

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::time::Instant;

use super::model::{FailureAction, Payload, StepStatus, WorkflowDefinition, WorkflowStep};
use super::validator::{blocked_steps, ready_steps};
use crate::error::TransitionError;
use crate::monitoring::ExecutionTimeline;

/// Exponential backoff between attempts of a failing step.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Multiplier applied for every further retry
    pub backoff: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, backoff: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            backoff,
            max_delay,
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 2.0, Duration::from_secs(300))
    }
}

/// What happened to a step after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// The step is RETRYING and may run again after `delay`
    Retry { retry: u32, delay: Duration },
    /// The step is FAILED and takes the execution down with it
    Failed,
    /// The step exhausted its retries but is marked skippable
    Skipped,
}

/// Manages step scheduling for a single execution.
///
/// The planner tracks:
/// - Which steps are satisfied (COMPLETED or SKIPPED)
/// - Which steps are currently running
/// - When RETRYING steps become dispatchable again
/// - Every status transition, in an [`ExecutionTimeline`]
#[derive(Debug, Clone)]
pub struct ExecutionPlanner {
    /// Execution-local copies of the definition's steps
    steps: Vec<WorkflowStep>,
    /// Steps that dependents may rely on
    satisfied: HashSet<String>,
    /// Steps with an attempt in flight
    running: HashSet<String>,
    /// Earliest dispatch time of RETRYING steps
    retry_at: HashMap<String, Instant>,
    /// Maximum steps in flight at once
    max_parallel: usize,
    retry_policy: RetryPolicy,
    timeline: ExecutionTimeline,
}

impl ExecutionPlanner {
    /// Creates a planner with fresh copies of the definition's steps.
    pub fn new(definition: &WorkflowDefinition, retry_policy: RetryPolicy) -> Self {
        let steps: Vec<WorkflowStep> = definition.steps.iter().map(WorkflowStep::reset).collect();
        let max_parallel = definition.effective_concurrency();

        debug!(
            "Creating planner for '{}': {} steps, {} max parallel",
            definition.name,
            steps.len(),
            max_parallel
        );

        Self {
            steps,
            satisfied: HashSet::new(),
            running: HashSet::new(),
            retry_at: HashMap::new(),
            max_parallel,
            retry_policy,
            timeline: ExecutionTimeline::new(),
        }
    }

    /// Returns the ids of steps to dispatch now, in definition order.
    ///
    /// A step is ready if it is PENDING with every dependency satisfied,
    /// or RETRYING with its backoff elapsed. The result never exceeds
    /// the free concurrency slots.
    pub fn get_ready_steps(&self, now: Instant) -> Vec<String> {
        let slots = self.max_parallel.saturating_sub(self.running.len());
        if slots == 0 {
            return Vec::new();
        }

        let pending_ready: HashSet<&str> = ready_steps(&self.steps, &self.satisfied)
            .into_iter()
            .map(|s| s.id.as_str())
            .collect();

        self.steps
            .iter()
            .filter(|step| {
                pending_ready.contains(step.id.as_str())
                    || (step.status == StepStatus::Retrying
                        && self.retry_at.get(&step.id).map_or(true, |at| *at <= now))
            })
            .take(slots)
            .map(|step| step.id.clone())
            .collect()
    }

    fn step_mut(&mut self, step_id: &str) -> Result<&mut WorkflowStep, TransitionError> {
        self.steps
            .iter_mut()
            .find(|s| s.id == step_id)
            .ok_or_else(|| TransitionError {
                entity: format!("step '{}'", step_id),
                from: "unknown".to_string(),
                to: "any".to_string(),
            })
    }

    fn transition(&mut self, step_id: &str, next: StepStatus) -> Result<(), TransitionError> {
        self.step_mut(step_id)?.transition(next)?;
        self.timeline.record(step_id, next);
        Ok(())
    }

    /// Marks a step as running and returns its 1-based attempt number.
    pub fn mark_step_running(&mut self, step_id: &str) -> Result<u32, TransitionError> {
        self.transition(step_id, StepStatus::Running)?;
        self.running.insert(step_id.to_string());
        self.retry_at.remove(step_id);

        let step = self.step_mut(step_id)?;
        Ok(step.retry_count + 1)
    }

    /// Records the session leased by a running step.
    pub fn bind_session(&mut self, step_id: &str, session_id: &str) {
        if let Some(step) = self.steps.iter_mut().find(|s| s.id == step_id) {
            if step.status == StepStatus::Running {
                step.session_id = Some(session_id.to_string());
            }
        }
    }

    /// Marks a step as completed with its result.
    pub fn mark_step_completed(&mut self, step_id: &str, result: Payload) -> Result<(), TransitionError> {
        self.transition(step_id, StepStatus::Completed)?;
        self.running.remove(step_id);
        self.satisfied.insert(step_id.to_string());

        let step = self.step_mut(step_id)?;
        step.result = Some(result);
        step.error_message = None;
        step.session_id = None;
        Ok(())
    }

    /// Applies the retry policy to a failed attempt.
    pub fn mark_step_failed(
        &mut self,
        step_id: &str,
        error: String,
        now: Instant,
    ) -> Result<FailureOutcome, TransitionError> {
        let (can_retry, on_failure) = {
            let step = self.step_mut(step_id)?;
            (step.can_retry(), step.on_failure)
        };

        let outcome = if can_retry {
            self.transition(step_id, StepStatus::Retrying)?;
            let retry = {
                let step = self.step_mut(step_id)?;
                step.retry_count += 1;
                step.retry_count
            };
            let delay = self.retry_policy.delay_for(retry);
            self.retry_at.insert(step_id.to_string(), now + delay);
            FailureOutcome::Retry { retry, delay }
        } else if on_failure == FailureAction::Skip {
            self.transition(step_id, StepStatus::Skipped)?;
            self.satisfied.insert(step_id.to_string());
            warn!("Step '{}' exhausted its retries and was skipped", step_id);
            FailureOutcome::Skipped
        } else {
            self.transition(step_id, StepStatus::Failed)?;
            FailureOutcome::Failed
        };

        self.running.remove(step_id);
        let step = self.step_mut(step_id)?;
        step.error_message = Some(error);
        step.session_id = None;
        Ok(outcome)
    }

    /// Fails every RUNNING or RETRYING step with `reason`.
    ///
    /// Returns the affected step ids.
    pub fn abort_in_flight(&mut self, reason: &str) -> Vec<String> {
        let ids: Vec<String> = self
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Running | StepStatus::Retrying))
            .map(|s| s.id.clone())
            .collect();

        for id in &ids {
            if self.transition(id, StepStatus::Failed).is_ok() {
                if let Ok(step) = self.step_mut(id) {
                    step.error_message = Some(reason.to_string());
                    step.session_id = None;
                }
            }
        }

        self.running.clear();
        self.retry_at.clear();
        ids
    }

    /// Skips every PENDING step that can no longer run.
    ///
    /// Steps behind a FAILED ancestor are skipped first, then the rest.
    pub fn skip_remaining(&mut self) -> Vec<String> {
        let blocked: HashSet<String> = blocked_steps(&self.steps).into_iter().collect();
        let pending: Vec<String> = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Pending)
            .map(|s| s.id.clone())
            .collect();

        for id in &pending {
            if self.transition(id, StepStatus::Skipped).is_ok() {
                self.satisfied.insert(id.clone());
                if let Ok(step) = self.step_mut(id) {
                    step.error_message = Some(if blocked.contains(id) {
                        "dependency failed".to_string()
                    } else {
                        "execution failed".to_string()
                    });
                }
            }
        }

        if !pending.is_empty() {
            info!("Skipped {} pending steps", pending.len());
        }
        pending
    }

    /// Earliest pending retry deadline, if any.
    pub fn next_retry_at(&self) -> Option<Instant> {
        self.retry_at.values().min().copied()
    }

    /// Number of steps with an attempt in flight.
    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Running steps still waiting to lease a session.
    pub fn unbound_steps(&self) -> impl Iterator<Item = &WorkflowStep> + '_ {
        self.steps
            .iter()
            .filter(|s| self.running.contains(&s.id) && s.session_id.is_none())
    }

    /// True when every step is COMPLETED or SKIPPED.
    pub fn is_finished(&self) -> bool {
        self.steps.iter().all(|s| s.status.satisfies_dependents())
    }

    /// First FAILED step, if any.
    pub fn failed_step(&self) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.status == StepStatus::Failed)
    }

    /// Returns the current progress as (satisfied, total).
    pub fn progress(&self) -> (usize, usize) {
        let done = self
            .steps
            .iter()
            .filter(|s| s.status.satisfies_dependents())
            .count();
        (done, self.steps.len())
    }

    /// Progress as a fraction in [0, 1].
    pub fn progress_fraction(&self) -> f64 {
        let (done, total) = self.progress();
        if total == 0 {
            return 1.0;
        }
        done as f64 / total as f64
    }

    /// Ids of COMPLETED steps, in definition order.
    pub fn completed_step_ids(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect()
    }

    /// Results of this step's completed dependencies, keyed by step id.
    pub fn dependency_results(&self, step_id: &str) -> Payload {
        let mut results = Payload::new();
        if let Some(step) = self.get_step(step_id) {
            for dep in &step.dependencies {
                if let Some(result) = self.get_step(dep).and_then(|d| d.result.clone()) {
                    results.insert(dep.clone(), Value::Object(result));
                }
            }
        }
        results
    }

    /// Results of every completed step, keyed by step id.
    pub fn results(&self) -> Payload {
        self.steps
            .iter()
            .filter_map(|s| s.result.clone().map(|r| (s.id.clone(), Value::Object(r))))
            .collect()
    }

    /// Gets a step by ID.
    pub fn get_step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn steps(&self) -> &[WorkflowStep] {
        &self.steps
    }

    pub fn timeline(&self) -> &ExecutionTimeline {
        &self.timeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::model::{StepSpec, WorkflowSpec};
    use serde_json::json;

    fn chain_definition() -> WorkflowDefinition {
        let spec = WorkflowSpec::new("chain")
            .with_step(StepSpec::new("open").with_id("step1"))
            .with_step(StepSpec::new("read").with_id("step2").depends_on("step1"))
            .with_step(StepSpec::new("save").with_id("step3").depends_on("step2"));
        WorkflowDefinition::from_spec("wf", spec)
    }

    fn parallel_definition(max: usize) -> WorkflowDefinition {
        let spec = WorkflowSpec::new("fan-out")
            .parallel(max)
            .with_step(StepSpec::new("a").with_id("a"))
            .with_step(StepSpec::new("b").with_id("b"))
            .with_step(StepSpec::new("c").with_id("c"));
        WorkflowDefinition::from_spec("wf", spec)
    }

    fn result(value: &str) -> Payload {
        let mut payload = Payload::new();
        payload.insert("value".into(), json!(value));
        payload
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
        assert_eq!(policy.delay_for(20), Duration::from_secs(300));
    }

    #[test]
    fn test_planner_creation() {
        let planner = ExecutionPlanner::new(&chain_definition(), RetryPolicy::default());
        assert_eq!(planner.progress(), (0, 3));
        assert_eq!(planner.running_count(), 0);
        assert!(!planner.is_finished());
    }

    #[test]
    fn test_planner_get_ready_steps() {
        let planner = ExecutionPlanner::new(&chain_definition(), RetryPolicy::default());
        assert_eq!(planner.get_ready_steps(Instant::now()), vec!["step1"]);
    }

    #[test]
    fn test_planner_sequential_limits_to_one() {
        let mut def = parallel_definition(3);
        def.parallel_execution = false;
        let planner = ExecutionPlanner::new(&def, RetryPolicy::default());
        assert_eq!(planner.get_ready_steps(Instant::now()), vec!["a"]);
    }

    #[test]
    fn test_planner_respects_max_parallel() {
        let mut planner = ExecutionPlanner::new(&parallel_definition(2), RetryPolicy::default());
        let now = Instant::now();
        assert_eq!(planner.get_ready_steps(now), vec!["a", "b"]);

        planner.mark_step_running("a").unwrap();
        assert_eq!(planner.get_ready_steps(now), vec!["b"]);

        planner.mark_step_running("b").unwrap();
        assert!(planner.get_ready_steps(now).is_empty());
    }

    #[test]
    fn test_planner_chain_progress() {
        let mut planner = ExecutionPlanner::new(&chain_definition(), RetryPolicy::default());

        for id in ["step1", "step2", "step3"] {
            assert_eq!(planner.get_ready_steps(Instant::now()), vec![id]);
            assert_eq!(planner.mark_step_running(id).unwrap(), 1);
            planner.mark_step_completed(id, result(id)).unwrap();
        }

        assert!(planner.is_finished());
        assert_eq!(planner.progress(), (3, 3));
        assert_eq!(planner.progress_fraction(), 1.0);
        assert_eq!(planner.results().len(), 3);
    }

    #[test]
    fn test_planner_dependency_results() {
        let mut planner = ExecutionPlanner::new(&chain_definition(), RetryPolicy::default());
        planner.mark_step_running("step1").unwrap();
        planner.mark_step_completed("step1", result("first")).unwrap();

        let deps = planner.dependency_results("step2");
        assert_eq!(deps["step1"], json!({"value": "first"}));
        assert!(planner.dependency_results("step1").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_planner_retry_then_fail() {
        let mut def = chain_definition();
        def.steps[0].max_retries = 2;
        let mut planner = ExecutionPlanner::new(&def, RetryPolicy::default());

        let now = Instant::now();
        assert_eq!(planner.mark_step_running("step1").unwrap(), 1);
        let outcome = planner.mark_step_failed("step1", "boom".into(), now).unwrap();
        assert_eq!(
            outcome,
            FailureOutcome::Retry {
                retry: 1,
                delay: Duration::from_secs(5)
            }
        );

        // Not dispatchable until the backoff elapses
        assert!(planner.get_ready_steps(now).is_empty());
        assert_eq!(planner.next_retry_at(), Some(now + Duration::from_secs(5)));
        let later = now + Duration::from_secs(5);
        assert_eq!(planner.get_ready_steps(later), vec!["step1"]);

        assert_eq!(planner.mark_step_running("step1").unwrap(), 2);
        planner.mark_step_failed("step1", "boom".into(), later).unwrap();
        assert_eq!(planner.mark_step_running("step1").unwrap(), 3);
        let outcome = planner.mark_step_failed("step1", "boom".into(), later).unwrap();
        assert_eq!(outcome, FailureOutcome::Failed);

        let step = planner.get_step("step1").unwrap();
        assert_eq!(step.retry_count, 2);
        assert_eq!(step.error_message.as_deref(), Some("boom"));
        assert_eq!(
            planner.timeline().history("step1"),
            vec![
                StepStatus::Pending,
                StepStatus::Running,
                StepStatus::Retrying,
                StepStatus::Running,
                StepStatus::Retrying,
                StepStatus::Running,
                StepStatus::Failed,
            ]
        );
    }

    #[test]
    fn test_planner_skippable_step_unblocks_dependents() {
        let mut def = chain_definition();
        def.steps[0].max_retries = 0;
        def.steps[0].on_failure = FailureAction::Skip;
        let mut planner = ExecutionPlanner::new(&def, RetryPolicy::default());

        planner.mark_step_running("step1").unwrap();
        let outcome = planner
            .mark_step_failed("step1", "nope".into(), Instant::now())
            .unwrap();
        assert_eq!(outcome, FailureOutcome::Skipped);
        assert_eq!(planner.get_ready_steps(Instant::now()), vec!["step2"]);
        assert_eq!(planner.progress(), (1, 3));
    }

    #[test]
    fn test_planner_skip_remaining_after_failure() {
        let mut def = parallel_definition(3);
        def.steps[2].dependencies = vec!["a".to_string()];
        def.steps[0].max_retries = 0;
        let mut planner = ExecutionPlanner::new(&def, RetryPolicy::default());

        planner.mark_step_running("a").unwrap();
        planner.mark_step_failed("a", "x".into(), Instant::now()).unwrap();

        let skipped = planner.skip_remaining();
        assert_eq!(skipped, vec!["b", "c"]);
        assert_eq!(
            planner.get_step("c").unwrap().error_message.as_deref(),
            Some("dependency failed")
        );
        assert_eq!(
            planner.get_step("b").unwrap().error_message.as_deref(),
            Some("execution failed")
        );
        assert!(planner.progress_fraction() < 1.0);
        assert!(planner.failed_step().is_some());
    }

    #[test]
    fn test_planner_unbound_steps() {
        let mut planner = ExecutionPlanner::new(&parallel_definition(3), RetryPolicy::default());
        planner.mark_step_running("a").unwrap();
        planner.mark_step_running("b").unwrap();
        planner.bind_session("a", "session-1");

        let unbound: Vec<&str> = planner.unbound_steps().map(|s| s.id.as_str()).collect();
        assert_eq!(unbound, vec!["b"]);

        planner.mark_step_completed("a", result("done")).unwrap();
        planner.bind_session("b", "session-1");
        assert_eq!(planner.unbound_steps().count(), 0);
    }

    #[test]
    fn test_planner_abort_in_flight() {
        let mut planner = ExecutionPlanner::new(&parallel_definition(3), RetryPolicy::default());
        planner.mark_step_running("a").unwrap();
        planner.mark_step_running("b").unwrap();
        planner.bind_session("a", "session-1");
        planner
            .mark_step_failed("b", "flaky".into(), Instant::now())
            .unwrap();

        let aborted = planner.abort_in_flight("cancelled");
        assert_eq!(aborted, vec!["a", "b"]);
        assert_eq!(planner.running_count(), 0);
        assert!(planner.next_retry_at().is_none());

        let a = planner.get_step("a").unwrap();
        assert_eq!(a.status, StepStatus::Failed);
        assert!(a.session_id.is_none());
        assert_eq!(planner.get_step("c").unwrap().status, StepStatus::Pending);
    }

    #[test]
    fn test_planner_rejects_double_dispatch() {
        let mut planner = ExecutionPlanner::new(&chain_definition(), RetryPolicy::default());
        planner.mark_step_running("step1").unwrap();
        assert!(planner.mark_step_running("step1").is_err());
        assert!(planner.mark_step_running("ghost").is_err());
    }
}
