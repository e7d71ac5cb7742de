//! Workflow Execution Module
//!
//! Provides the orchestrator that runs workflow executions: priority
//! admission, parallel step dispatch, retries, checkpoints and
//! cancellation.
//!
//! # Architecture
//!
//! - [`engine`]: The orchestrator handle and its coordinator task
//! - [`queue`]: Priority queue of pending executions
//! - [`step`]: One spawned task per step attempt
//! - [`executor`]: Boundary to the browser automation capability
//! - [`dry_run`]: Simulated provider and executor

pub mod dry_run;
pub mod engine;
pub mod executor;
pub mod queue;
pub(crate) mod step;

pub use dry_run::{DryRunExecutor, DryRunProvider};
pub use engine::Orchestrator;
pub use executor::{StepExecutor, StepRequest};
pub use queue::{ExecutionQueue, QueuedExecution};
