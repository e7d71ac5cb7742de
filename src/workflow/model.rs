//! Workflow Data Model
//!
//! Core data structures describing workflow definitions and their steps.
//!
//! # Example YAML Format
//!
//! ```yaml
//! name: Parallel Job Discovery
//! description: Search several keyword groups at once
//! parallel_execution: true
//! max_concurrent_steps: 3
//! priority: high
//! session_requirements:
//!   session_type: job_discovery
//!   min_sessions: 3
//! steps:
//!   - id: setup_sessions
//!     action: create_session_pool
//!     parameters:
//!       pool_size: 3
//!
//!   - id: search_agentforce
//!     action: search_jobs
//!     parameters:
//!       keywords: ["Salesforce Agentforce"]
//!     dependencies: setup_sessions
//!     timeout_secs: 120
//!     max_retries: 2
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::{TransitionError, ValidationError};

/// Opaque key/value container handed through to the step executor.
pub type Payload = Map<String, Value>;

/// Default step timeout in seconds.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default number of retries after the first failed attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default whole-workflow timeout in seconds.
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 1800;

/// Default per-workflow step concurrency.
pub const DEFAULT_MAX_CONCURRENT_STEPS: usize = 3;

/// Session type used when neither the step nor the workflow names one.
pub const DEFAULT_SESSION_TYPE: &str = "general";

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_workflow_timeout() -> u64 {
    DEFAULT_WORKFLOW_TIMEOUT_SECS
}

fn default_max_concurrent_steps() -> usize {
    DEFAULT_MAX_CONCURRENT_STEPS
}

fn default_session_type() -> String {
    DEFAULT_SESSION_TYPE.to_string()
}

fn default_min_sessions() -> usize {
    1
}

/// Deserializes either a single string or array of strings into Vec<String>
fn single_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val = Value::deserialize(deserializer)?;
    match val {
        Value::Null => Ok(Vec::new()),
        Value::String(s) if s.trim().is_empty() => Ok(Vec::new()),
        Value::String(s) => Ok(vec![s]),
        Value::Array(arr) => arr
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(s),
                _ => Err(de::Error::custom("Expected string in array")),
            })
            .collect(),
        _ => Err(de::Error::custom("Expected string or array of strings")),
    }
}

/// Serialized size of a payload in bytes.
pub fn payload_size(payload: &Payload) -> usize {
    serde_json::to_vec(payload).map_or(0, |bytes| bytes.len())
}

/// Rejects a payload whose serialized form exceeds `limit` bytes.
pub fn check_payload(context: &str, payload: &Payload, limit: usize) -> Result<(), ValidationError> {
    let size = payload_size(payload);
    if size > limit {
        return Err(ValidationError::PayloadTooLarge {
            context: context.to_string(),
            size,
            limit,
        });
    }
    Ok(())
}

/// Dequeue ordering weight of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Priority {
    Low = 1,
    #[default]
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Priority {
    /// Numeric weight (LOW=1 .. CRITICAL=4).
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Low),
            2 => Some(Self::Normal),
            3 => Some(Self::High),
            4 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "critical" | "4" => Ok(Self::Critical),
            other => Err(format!("Unknown priority: {}", other)),
        }
    }
}

impl Serialize for Priority {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.value())
    }
}

impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_u64()
                .and_then(Priority::from_value)
                .ok_or_else(|| de::Error::custom(format!("priority out of range: {}", n))),
            Value::String(s) => s.parse().map_err(de::Error::custom),
            _ => Err(de::Error::custom("Expected priority name or number")),
        }
    }
}

/// Status of a workflow step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Waiting for dependencies or dispatch
    #[default]
    Pending,
    /// An attempt is in flight
    Running,
    /// Last attempt failed, waiting for the backoff to elapse
    Retrying,
    /// Finished successfully
    Completed,
    /// Exhausted its retries or was cancelled
    Failed,
    /// Will not run, or failed with `on_failure: skip`
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// True when dependents may treat this step as satisfied.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Skipped)
                | (Running, Completed)
                | (Running, Retrying)
                | (Running, Failed)
                | (Running, Skipped)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Retrying => "RETRYING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(label)
    }
}

/// What an exhausted step does to its execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailureAction {
    /// Fail the whole execution
    #[default]
    Fail,
    /// Mark the step SKIPPED and let dependents proceed
    Skip,
}

/// Sessions a workflow needs from the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequirements {
    /// Pool task type leased for steps that do not override it
    #[serde(default = "default_session_type")]
    pub session_type: String,

    /// Idle sessions warmed in the pool when an execution starts
    #[serde(default = "default_min_sessions")]
    pub min_sessions: usize,
}

impl Default for SessionRequirements {
    fn default() -> Self {
        Self {
            session_type: default_session_type(),
            min_sessions: default_min_sessions(),
        }
    }
}

impl SessionRequirements {
    pub fn new(session_type: impl Into<String>, min_sessions: usize) -> Self {
        Self {
            session_type: session_type.into(),
            min_sessions,
        }
    }
}

/// A single step of a workflow, with its runtime fields.
///
/// Definitions keep their steps in the initial state; each execution
/// works on its own copy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowStep {
    /// Unique identifier within the workflow
    pub id: String,

    /// Human readable label
    pub name: String,

    /// Capability the step executor should invoke
    pub action: String,

    #[serde(default)]
    pub parameters: Payload,

    /// IDs of steps that must complete before this one runs
    #[serde(default)]
    pub dependencies: Vec<String>,

    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default)]
    pub retry_count: u32,

    #[serde(default)]
    pub status: StepStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Payload>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Session leased by the in-flight attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Pool task type override for this step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,

    #[serde(default)]
    pub on_failure: FailureAction,
}

impl WorkflowStep {
    /// Creates a step in its initial state.
    ///
    /// # Example
    ///
    /// ```
    /// use flowdirector::workflow::WorkflowStep;
    ///
    /// let step = WorkflowStep::new("merge", "Merge Results", "merge_job_results")
    ///     .depends_on("search_a")
    ///     .depends_on("search_b")
    ///     .with_timeout(60);
    /// assert_eq!(step.max_retries, 3);
    /// ```
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into().trim().to_string(),
            name: name.into(),
            action: action.into().trim().to_string(),
            parameters: Payload::new(),
            dependencies: Vec::new(),
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            status: StepStatus::Pending,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            session_id: None,
            session_type: None,
            on_failure: FailureAction::Fail,
        }
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }

    /// Adds a dependency on another step.
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    pub fn with_on_failure(mut self, on_failure: FailureAction) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// True when another failed attempt would still be retried.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Moves the step to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: StepStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: format!("step '{}'", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == StepStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        self.status = next;
        Ok(())
    }

    /// Returns a copy with every runtime field back at its initial value.
    pub fn reset(&self) -> Self {
        Self {
            retry_count: 0,
            status: StepStatus::Pending,
            result: None,
            error_message: None,
            started_at: None,
            completed_at: None,
            session_id: None,
            ..self.clone()
        }
    }
}

/// Reusable template of steps and execution policy.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,

    /// Steps in definition order (scheduling tie-break)
    pub steps: Vec<WorkflowStep>,

    #[serde(default)]
    pub session_requirements: SessionRequirements,

    /// When false, steps run one at a time
    #[serde(default)]
    pub parallel_execution: bool,

    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    /// Whole-workflow timeout
    #[serde(default = "default_workflow_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub metadata: Payload,

    pub created_at: DateTime<Utc>,
}

impl WorkflowDefinition {
    /// Builds a definition from caller input, filling in default step ids and names.
    pub fn from_spec(id: impl Into<String>, spec: WorkflowSpec) -> Self {
        let steps = spec
            .steps
            .into_iter()
            .enumerate()
            .map(|(i, step)| step.into_step(i))
            .collect();

        Self {
            id: id.into(),
            name: spec.name,
            description: spec.description,
            steps,
            session_requirements: spec.session_requirements,
            parallel_execution: spec.parallel_execution,
            max_concurrent_steps: spec.max_concurrent_steps,
            timeout_secs: spec.timeout_secs,
            priority: spec.priority,
            metadata: spec.metadata,
            created_at: Utc::now(),
        }
    }

    /// Gets a step by ID.
    pub fn get_step(&self, id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    /// Number of steps that may be in flight at once for one execution.
    pub fn effective_concurrency(&self) -> usize {
        if self.parallel_execution {
            self.max_concurrent_steps.max(1)
        } else {
            1
        }
    }

    /// Pool task type a step leases sessions from.
    pub fn task_type_for<'a>(&'a self, step: &'a WorkflowStep) -> &'a str {
        step.session_type
            .as_deref()
            .unwrap_or(&self.session_requirements.session_type)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Returns the number of steps in the workflow.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if the workflow has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Caller input describing one step of a new workflow.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepSpec {
    /// Defaults to `step_{index}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Defaults to `Step {index + 1}`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    pub action: String,

    #[serde(default)]
    pub parameters: Payload,

    #[serde(deserialize_with = "single_or_vec", default)]
    pub dependencies: Vec<String>,

    #[serde(default = "default_step_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_type: Option<String>,

    #[serde(default)]
    pub on_failure: FailureAction,
}

impl StepSpec {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            id: None,
            name: None,
            action: action.into(),
            parameters: Payload::new(),
            dependencies: Vec::new(),
            timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            session_type: None,
            on_failure: FailureAction::Fail,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }

    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_session_type(mut self, session_type: impl Into<String>) -> Self {
        self.session_type = Some(session_type.into());
        self
    }

    pub fn with_on_failure(mut self, on_failure: FailureAction) -> Self {
        self.on_failure = on_failure;
        self
    }

    fn into_step(self, index: usize) -> WorkflowStep {
        let id = self.id.unwrap_or_else(|| format!("step_{}", index));
        let name = self.name.unwrap_or_else(|| format!("Step {}", index + 1));

        let mut step = WorkflowStep::new(id, name, self.action)
            .with_parameters(self.parameters)
            .with_timeout(self.timeout_secs)
            .with_max_retries(self.max_retries)
            .with_on_failure(self.on_failure);
        step.dependencies = self.dependencies;
        step.session_type = self.session_type;
        step
    }
}

/// Caller input for `create_workflow`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct WorkflowSpec {
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub steps: Vec<StepSpec>,

    #[serde(default)]
    pub session_requirements: SessionRequirements,

    #[serde(default)]
    pub parallel_execution: bool,

    #[serde(default = "default_max_concurrent_steps")]
    pub max_concurrent_steps: usize,

    #[serde(default = "default_workflow_timeout")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub priority: Priority,

    #[serde(default)]
    pub metadata: Payload,
}

impl WorkflowSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            session_requirements: SessionRequirements::default(),
            parallel_execution: false,
            max_concurrent_steps: DEFAULT_MAX_CONCURRENT_STEPS,
            timeout_secs: DEFAULT_WORKFLOW_TIMEOUT_SECS,
            priority: Priority::Normal,
            metadata: Payload::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    /// Enables parallel execution with the given step concurrency.
    pub fn parallel(mut self, max_concurrent_steps: usize) -> Self {
        self.parallel_execution = true;
        self.max_concurrent_steps = max_concurrent_steps;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_session_requirements(mut self, requirements: SessionRequirements) -> Self {
        self.session_requirements = requirements;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_step_defaults() {
        let step = WorkflowStep::new(" login ", "Login", "navigate");
        assert_eq!(step.id, "login");
        assert!(step.parameters.is_empty());
        assert!(step.dependencies.is_empty());
        assert_eq!(step.timeout_secs, 300);
        assert_eq!(step.max_retries, 3);
        assert_eq!(step.retry_count, 0);
        assert_eq!(step.status, StepStatus::Pending);
        assert_eq!(step.on_failure, FailureAction::Fail);
    }

    #[test]
    fn test_step_builder() {
        let step = WorkflowStep::new("search", "Search", "search_jobs")
            .with_parameter("keywords", json!(["rust"]))
            .depends_on("setup")
            .with_timeout(60)
            .with_max_retries(1)
            .with_session_type("job_discovery");

        assert_eq!(step.parameters["keywords"], json!(["rust"]));
        assert_eq!(step.dependencies, vec!["setup"]);
        assert_eq!(step.timeout(), Duration::from_secs(60));
        assert_eq!(step.session_type.as_deref(), Some("job_discovery"));
    }

    #[test]
    fn test_step_transitions_allowed() {
        let mut step = WorkflowStep::new("a", "A", "noop");
        step.transition(StepStatus::Running).unwrap();
        assert!(step.started_at.is_some());
        step.transition(StepStatus::Retrying).unwrap();
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Completed).unwrap();
        assert!(step.completed_at.is_some());
    }

    #[test]
    fn test_step_transition_rejected_from_terminal() {
        let mut step = WorkflowStep::new("a", "A", "noop");
        step.transition(StepStatus::Running).unwrap();
        step.transition(StepStatus::Completed).unwrap();

        let err = step.transition(StepStatus::Running).unwrap_err();
        assert_eq!(err.from, "COMPLETED");
        assert_eq!(err.to, "RUNNING");
        assert_eq!(step.status, StepStatus::Completed);
    }

    #[test]
    fn test_step_cannot_skip_running() {
        assert!(!StepStatus::Pending.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Retrying.can_transition_to(StepStatus::Completed));
        assert!(!StepStatus::Failed.can_transition_to(StepStatus::Pending));
    }

    #[test]
    fn test_step_reset() {
        let mut step = WorkflowStep::new("a", "A", "noop");
        step.transition(StepStatus::Running).unwrap();
        step.retry_count = 2;
        step.session_id = Some("s1".into());

        let fresh = step.reset();
        assert_eq!(fresh.status, StepStatus::Pending);
        assert_eq!(fresh.retry_count, 0);
        assert!(fresh.session_id.is_none());
        assert!(fresh.started_at.is_none());
        assert_eq!(fresh.id, "a");
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
        assert_eq!(Priority::Critical.value(), 4);
    }

    #[test]
    fn test_priority_serde() {
        assert_eq!(serde_json::to_string(&Priority::High).unwrap(), "3");
        let p: Priority = serde_json::from_str("4").unwrap();
        assert_eq!(p, Priority::Critical);
        let p: Priority = serde_json::from_str("\"low\"").unwrap();
        assert_eq!(p, Priority::Low);
        assert!(serde_json::from_str::<Priority>("9").is_err());
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("CRITICAL".parse::<Priority>(), Ok(Priority::Critical));
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_spec_default_ids_and_names() {
        let spec = WorkflowSpec::new("Demo")
            .with_step(StepSpec::new("open"))
            .with_step(StepSpec::new("read").with_id("read_page").depends_on("step_0"));

        let def = WorkflowDefinition::from_spec("wf-1", spec);
        assert_eq!(def.steps[0].id, "step_0");
        assert_eq!(def.steps[0].name, "Step 1");
        assert_eq!(def.steps[1].id, "read_page");
        assert_eq!(def.steps[1].name, "Step 2");
        assert_eq!(def.steps[1].dependencies, vec!["step_0"]);
    }

    #[test]
    fn test_definition_defaults() {
        let def = WorkflowDefinition::from_spec("wf", WorkflowSpec::new("Demo"));
        assert!(!def.parallel_execution);
        assert_eq!(def.max_concurrent_steps, 3);
        assert_eq!(def.timeout_secs, 1800);
        assert_eq!(def.priority, Priority::Normal);
        assert_eq!(def.session_requirements.session_type, "general");
        assert_eq!(def.effective_concurrency(), 1);
    }

    #[test]
    fn test_effective_concurrency_parallel() {
        let def = WorkflowDefinition::from_spec("wf", WorkflowSpec::new("Demo").parallel(4));
        assert_eq!(def.effective_concurrency(), 4);
    }

    #[test]
    fn test_task_type_for_step() {
        let spec = WorkflowSpec::new("Demo")
            .with_session_requirements(SessionRequirements::new("job_discovery", 2))
            .with_step(StepSpec::new("a"))
            .with_step(StepSpec::new("b").with_session_type("profile_management"));
        let def = WorkflowDefinition::from_spec("wf", spec);

        assert_eq!(def.task_type_for(&def.steps[0]), "job_discovery");
        assert_eq!(def.task_type_for(&def.steps[1]), "profile_management");
    }

    #[test]
    fn test_step_spec_single_dependency_yaml() {
        let yaml = "action: merge\ndependencies: search\n";
        let spec: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.dependencies, vec!["search"]);
        assert_eq!(spec.timeout_secs, 300);
        assert_eq!(spec.max_retries, 3);
    }

    #[test]
    fn test_on_failure_yaml() {
        let yaml = "action: notify\non_failure: skip\n";
        let spec: StepSpec = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(spec.on_failure, FailureAction::Skip);
    }

    #[test]
    fn test_check_payload_limit() {
        let mut payload = Payload::new();
        payload.insert("blob".into(), json!("x".repeat(100)));

        assert!(check_payload("parameters", &payload, 1024).is_ok());
        let err = check_payload("parameters", &payload, 10).unwrap_err();
        assert!(matches!(err, ValidationError::PayloadTooLarge { limit: 10, .. }));
    }

    #[test]
    fn test_payload_size_empty() {
        assert_eq!(payload_size(&Payload::new()), 2);
    }
}
