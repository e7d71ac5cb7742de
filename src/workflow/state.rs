//! Workflow Execution State
//!
//! Runtime record of one execution plus its checkpoint log.
//!
//! Checkpoints are appended in memory as steps finish. When a checkpoint
//! directory is configured they are also appended, one JSON object per
//! line, to `{checkpoint_dir}/{execution_id}.jsonl` for external
//! inspection or replay.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::model::{Payload, Priority};
use crate::error::TransitionError;

/// Status of a workflow execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// Waiting in the priority queue
    #[default]
    Pending,
    Running,
    /// Admitted, but no new steps are dispatched
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(self, next: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(label)
    }
}

/// Immutable snapshot of execution progress.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Checkpoint {
    pub execution_id: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    pub progress: f64,
    pub status: ExecutionStatus,
    #[serde(default)]
    pub current_step: Option<String>,
    #[serde(default)]
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub session_assignments: BTreeMap<String, String>,
}

/// One run of a workflow definition.
///
/// Only the orchestrator mutates an execution; callers get clones.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    pub status: ExecutionStatus,
    pub priority: Priority,

    /// Step most recently dispatched
    pub current_step: Option<String>,

    /// Fraction of steps COMPLETED or SKIPPED
    pub progress: f64,

    /// Step id -> session id, for attempts currently holding a lease
    pub session_assignments: BTreeMap<String, String>,

    pub checkpoints: Vec<Checkpoint>,
    pub error_log: Vec<String>,

    /// Input handed to every step of this execution
    #[serde(default)]
    pub input: Payload,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<Payload>,
}

impl WorkflowExecution {
    /// Creates a new PENDING execution.
    pub fn new(
        id: impl Into<String>,
        workflow_id: impl Into<String>,
        priority: Priority,
        input: Payload,
    ) -> Self {
        Self {
            id: id.into(),
            workflow_id: workflow_id.into(),
            status: ExecutionStatus::Pending,
            priority,
            current_step: None,
            progress: 0.0,
            session_assignments: BTreeMap::new(),
            checkpoints: Vec::new(),
            error_log: Vec::new(),
            input,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
        }
    }

    /// Moves the execution to `next`, stamping start/finish times.
    pub fn transition(&mut self, next: ExecutionStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                entity: format!("execution {}", self.id),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        let now = Utc::now();
        if next == ExecutionStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            self.session_assignments.clear();
        }
        self.status = next;
        Ok(())
    }

    /// Updates progress; it never moves backwards.
    pub fn set_progress(&mut self, progress: f64) {
        let progress = progress.clamp(0.0, 1.0);
        if progress > self.progress {
            self.progress = progress;
        }
    }

    /// Appends an entry to the error log.
    pub fn log_error(&mut self, message: impl Into<String>) {
        self.error_log.push(message.into());
    }

    /// Appends a checkpoint for the current state and returns it.
    pub fn checkpoint(&mut self, completed_steps: Vec<String>) -> Checkpoint {
        let checkpoint = Checkpoint {
            execution_id: self.id.clone(),
            workflow_id: self.workflow_id.clone(),
            timestamp: Utc::now(),
            progress: self.progress,
            status: self.status,
            current_step: self.current_step.clone(),
            completed_steps,
            session_assignments: self.session_assignments.clone(),
        };
        self.checkpoints.push(checkpoint.clone());
        checkpoint
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Append-only JSON-lines checkpoint log on disk.
#[derive(Debug, Clone)]
pub struct CheckpointLog {
    dir: PathBuf,
}

impl CheckpointLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the log file path for an execution.
    pub fn path_for(&self, execution_id: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", execution_id))
    }

    /// Appends one checkpoint to its execution's log file.
    pub fn append(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&checkpoint.execution_id);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        let line = serde_json::to_string(checkpoint)?;
        writeln!(file, "{}", line)?;

        debug!("Appended checkpoint to {}", path.display());
        Ok(())
    }

    /// Replays every checkpoint recorded for an execution, in order.
    pub fn load(&self, execution_id: &str) -> std::io::Result<Vec<Checkpoint>> {
        Self::load_file(self.path_for(execution_id))
    }

    /// Replays a checkpoint log file.
    pub fn load_file(path: impl AsRef<Path>) -> std::io::Result<Vec<Checkpoint>> {
        let file = fs::File::open(path.as_ref())?;
        let mut checkpoints = Vec::new();

        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            checkpoints.push(serde_json::from_str(&line)?);
        }

        info!(
            "Loaded {} checkpoints from {}",
            checkpoints.len(),
            path.as_ref().display()
        );
        Ok(checkpoints)
    }
}
