//! Monitoring Module
//!
//! Provides step timelines, status reports and orchestrator metrics.
//!
//! # Components
//!
//! - [`ExecutionTimeline`]: Step status transitions and Gantt charts
//! - [`ExecutionReport`]: Status of one execution
//! - [`SystemMetrics`]: Orchestrator-wide counters

pub mod metrics;
pub mod timeline;

pub use metrics::{ExecutionReport, ExecutionSnapshot, StepReport, SystemMetrics};
pub use timeline::{ExecutionTimeline, TimelineEvent};
