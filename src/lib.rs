//! FlowDirector - Workflow Orchestration for Browser Automation
//!
//! Runs multi-step browser automation workflows on a bounded pool of
//! remote browser sessions. Steps declare dependencies, run in parallel
//! when the workflow allows it, retry with exponential backoff and
//! leave a checkpoint after every terminal outcome.
//!
//! # Architecture
//!
//! The library is organized into these modules:
//!
//! - [`workflow`]: Definitions, parsing, validation and per-execution planning
//! - [`execution`]: The orchestrator, its priority queue and step tasks
//! - [`session`]: The session pool and the remote session provider boundary
//! - [`monitoring`]: Status reports, system metrics and step timelines
//! - [`config`]: YAML settings with environment overrides
//! - [`error`]: Error types shared across the crate
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use flowdirector::{DryRunExecutor, DryRunProvider, Orchestrator, SessionPool, Settings};
//! use flowdirector::load_workflow_spec;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = Settings::load("flowdirector.yaml")?;
//!     let pool = SessionPool::new(settings.pool, Arc::new(DryRunProvider::new()));
//!     pool.initialize().await?;
//!
//!     let orchestrator =
//!         Orchestrator::start(settings.orchestrator, pool, Arc::new(DryRunExecutor::new()));
//!     let workflow_id = orchestrator
//!         .create_workflow(load_workflow_spec("discovery.yaml")?)
//!         .await?;
//!     let execution_id = orchestrator.execute_workflow(&workflow_id).await?;
//!
//!     let report = orchestrator.wait_for_completion(&execution_id).await?;
//!     println!("{}: {}", report.workflow_name, report.status);
//!     orchestrator.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod execution;
pub mod monitoring;
pub mod session;
pub mod workflow;

// Re-export commonly used types
pub use config::Settings;
pub use error::{CapabilityError, OrchestratorError, PoolError};
pub use execution::{DryRunExecutor, DryRunProvider, Orchestrator, StepExecutor, StepRequest};
pub use monitoring::{ExecutionReport, SystemMetrics};
pub use session::{SessionPool, SessionProvider};
pub use workflow::{
    load_workflow_spec, ExecutionStatus, Priority, StepSpec, WorkflowDefinition, WorkflowSpec,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "FlowDirector";
