//! Workflow Definition Module
//!
//! Provides data structures and utilities for defining, parsing,
//! validating and tracking browser automation workflows.
//!
//! # Structure
//!
//! - [`model`]: Core data structures (WorkflowStep, WorkflowDefinition)
//! - [`parser`]: YAML parsing and loading
//! - [`validator`]: Validation rules and dependency resolution
//! - [`planner`]: Per-execution step scheduling and retries
//! - [`state`]: Execution records and checkpoints
//! - [`templates`]: Predefined workflows

pub mod model;
pub mod parser;
pub mod planner;
pub mod state;
pub mod templates;
pub mod validator;

pub use model::{
    FailureAction, Payload, Priority, SessionRequirements, StepSpec, StepStatus,
    WorkflowDefinition, WorkflowSpec, WorkflowStep,
};
pub use parser::{load_workflow_spec, parse_workflow_spec};
pub use planner::{ExecutionPlanner, FailureOutcome, RetryPolicy};
pub use state::{Checkpoint, CheckpointLog, ExecutionStatus, WorkflowExecution};
