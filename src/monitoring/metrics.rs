//! Status Reports and System Metrics
//!
//! Read-only snapshots handed out by the orchestrator. Callers poll
//! these instead of receiving errors from failed executions.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::timeline::ExecutionTimeline;
use crate::session::PoolStats;
use crate::workflow::{
    ExecutionStatus, Priority, StepStatus, WorkflowExecution, WorkflowStep,
};

/// Status of one step inside an [`ExecutionReport`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepReport {
    pub id: String,
    pub name: String,
    pub action: String,
    pub status: StepStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub session_id: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&WorkflowStep> for StepReport {
    fn from(step: &WorkflowStep) -> Self {
        Self {
            id: step.id.clone(),
            name: step.name.clone(),
            action: step.action.clone(),
            status: step.status,
            retry_count: step.retry_count,
            max_retries: step.max_retries,
            session_id: step.session_id.clone(),
            error_message: step.error_message.clone(),
            started_at: step.started_at,
            completed_at: step.completed_at,
        }
    }
}

/// Answer to a workflow status query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionReport {
    pub id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub priority: Priority,
    pub progress: f64,
    pub current_step: Option<String>,
    pub error_log: Vec<String>,
    pub steps: Vec<StepReport>,
    pub checkpoints: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionReport {
    pub fn new(execution: &WorkflowExecution, workflow_name: &str, steps: &[WorkflowStep]) -> Self {
        Self {
            id: execution.id.clone(),
            workflow_id: execution.workflow_id.clone(),
            workflow_name: workflow_name.to_string(),
            status: execution.status,
            priority: execution.priority,
            progress: execution.progress,
            current_step: execution.current_step.clone(),
            error_log: execution.error_log.clone(),
            steps: steps.iter().map(StepReport::from).collect(),
            checkpoints: execution.checkpoints.len(),
            started_at: execution.started_at,
            completed_at: execution.completed_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Full record of one execution, checkpoints and step history included.
#[derive(Debug, Clone)]
pub struct ExecutionSnapshot {
    pub execution: WorkflowExecution,
    pub steps: Vec<WorkflowStep>,
    pub timeline: ExecutionTimeline,
}

/// Orchestrator-wide counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SystemMetrics {
    /// Executions not yet in a terminal state
    pub active_workflows: usize,
    pub running_workflows: usize,
    pub paused_workflows: usize,
    /// Executions waiting in the priority queue
    pub queued_workflows: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// completed / (completed + failed + cancelled)
    pub success_rate: f64,
    pub workflow_definitions: usize,
    pub is_running: bool,
    pub sessions: PoolStats,
    pub session_utilization: f64,
}

impl SystemMetrics {
    /// Tallies execution statuses into a metrics snapshot.
    pub fn collect<'a>(
        statuses: impl IntoIterator<Item = &'a ExecutionStatus>,
        queued_workflows: usize,
        workflow_definitions: usize,
        is_running: bool,
        sessions: PoolStats,
    ) -> Self {
        let mut metrics = Self {
            queued_workflows,
            workflow_definitions,
            is_running,
            session_utilization: sessions.utilization(),
            sessions,
            ..Default::default()
        };

        for status in statuses {
            match status {
                ExecutionStatus::Pending => {}
                ExecutionStatus::Running => metrics.running_workflows += 1,
                ExecutionStatus::Paused => metrics.paused_workflows += 1,
                ExecutionStatus::Completed => metrics.completed += 1,
                ExecutionStatus::Failed => metrics.failed += 1,
                ExecutionStatus::Cancelled => metrics.cancelled += 1,
            }
            if !status.is_terminal() {
                metrics.active_workflows += 1;
            }
        }

        let finished = metrics.completed + metrics.failed + metrics.cancelled;
        if finished > 0 {
            metrics.success_rate = metrics.completed as f64 / finished as f64;
        }
        metrics
    }
}
