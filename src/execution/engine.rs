//! Workflow Orchestrator
//!
//! The core engine that runs workflow executions, including:
//! - Priority admission of queued executions (priority, then FIFO)
//! - Parallel step dispatch with dependency resolution
//! - Retry with exponential backoff
//! - Checkpoints after every terminal step outcome
//! - Pause/resume, cancellation and whole-workflow timeouts
//!
//! A single coordinator task owns every definition, execution and
//! planner. [`Orchestrator`] handles send it commands over a channel;
//! step tasks report back over a second one.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use super::executor::{StepExecutor, StepRequest};
use super::queue::ExecutionQueue;
use super::step::{StepEvent, StepTask};
use crate::config::OrchestratorConfig;
use crate::error::{CapabilityError, OrchestratorError, TransitionError};
use crate::monitoring::{ExecutionReport, ExecutionSnapshot, SystemMetrics};
use crate::session::SessionPool;
use crate::workflow::model::check_payload;
use crate::workflow::templates;
use crate::workflow::validator::validate_definition;
use crate::workflow::{
    CheckpointLog, ExecutionPlanner, ExecutionStatus, FailureOutcome, Payload, Priority,
    RetryPolicy, SessionRequirements, WorkflowDefinition, WorkflowExecution, WorkflowSpec,
};

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

enum Command {
    CreateWorkflow {
        spec: WorkflowSpec,
        reply: Reply<String>,
    },
    RegisterWorkflow {
        definition: WorkflowDefinition,
        reply: Reply<String>,
    },
    GetWorkflow {
        workflow_id: String,
        reply: Reply<WorkflowDefinition>,
    },
    ListWorkflows {
        reply: Reply<Vec<WorkflowDefinition>>,
    },
    Execute {
        workflow_id: String,
        input: Payload,
        priority: Option<Priority>,
        reply: Reply<String>,
    },
    Status {
        execution_id: String,
        reply: Reply<ExecutionReport>,
    },
    Snapshot {
        execution_id: String,
        reply: Reply<ExecutionSnapshot>,
    },
    ListExecutions {
        reply: Reply<Vec<ExecutionReport>>,
    },
    WaitFor {
        execution_id: String,
        reply: Reply<ExecutionReport>,
    },
    Pause {
        execution_id: String,
        reply: Reply<()>,
    },
    Resume {
        execution_id: String,
        reply: Reply<()>,
    },
    Cancel {
        execution_id: String,
        reply: Reply<()>,
    },
    Purge {
        execution_id: String,
        reply: Reply<()>,
    },
    Metrics {
        reply: Reply<SystemMetrics>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Handle to a running orchestrator.
///
/// Cloning is cheap; every clone talks to the same coordinator.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use flowdirector::config::Settings;
/// use flowdirector::execution::{DryRunExecutor, DryRunProvider, Orchestrator};
/// use flowdirector::session::SessionPool;
/// use flowdirector::workflow::{StepSpec, WorkflowSpec};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let settings = Settings::default();
///     let pool = SessionPool::new(settings.pool, Arc::new(DryRunProvider::new()));
///     let orchestrator =
///         Orchestrator::start(settings.orchestrator, pool, Arc::new(DryRunExecutor::new()));
///
///     let spec = WorkflowSpec::new("Search")
///         .with_step(StepSpec::new("search_jobs").with_id("search"));
///     let workflow_id = orchestrator.create_workflow(spec).await?;
///     let execution_id = orchestrator.execute_workflow(&workflow_id).await?;
///
///     let report = orchestrator.wait_for_completion(&execution_id).await?;
///     println!("{} finished {}", report.id, report.status);
///     orchestrator.shutdown().await?;
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct Orchestrator {
    commands: mpsc::Sender<Command>,
    pool: SessionPool,
}

impl Orchestrator {
    /// Spawns the coordinator and the pool maintenance task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        config: OrchestratorConfig,
        pool: SessionPool,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (events, event_rx) = mpsc::unbounded_channel();

        let maintenance_token = CancellationToken::new();
        let maintenance = pool.spawn_maintenance(maintenance_token.clone());

        info!(
            "Starting orchestrator (max concurrent workflows: {})",
            config.max_concurrent_workflows
        );
        let coordinator = Coordinator::new(
            config.clone(),
            StepContext {
                pool: pool.clone(),
                executor,
                events,
                max_payload_bytes: config.max_payload_bytes,
            },
            maintenance_token,
            maintenance,
        );
        tokio::spawn(coordinator.run(command_rx, event_rx));

        Self { commands, pool }
    }

    /// The session pool this orchestrator leases from.
    pub fn pool(&self) -> &SessionPool {
        &self.pool
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| OrchestratorError::Unavailable)?;
        response.await.map_err(|_| OrchestratorError::Unavailable)?
    }

    /// Validates and stores a new workflow definition.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - Id of the stored definition
    /// * `Err(OrchestratorError::Validation)` - Malformed or cyclic steps
    pub async fn create_workflow(&self, spec: WorkflowSpec) -> Result<String, OrchestratorError> {
        self.request(|reply| Command::CreateWorkflow { spec, reply })
            .await
    }

    /// Stores a definition under its own id, replacing any previous one.
    pub async fn register_workflow(
        &self,
        definition: WorkflowDefinition,
    ) -> Result<String, OrchestratorError> {
        self.request(|reply| Command::RegisterWorkflow { definition, reply })
            .await
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<WorkflowDefinition, OrchestratorError> {
        let workflow_id = workflow_id.to_string();
        self.request(|reply| Command::GetWorkflow { workflow_id, reply })
            .await
    }

    /// Every stored definition, sorted by name.
    pub async fn list_workflows(&self) -> Result<Vec<WorkflowDefinition>, OrchestratorError> {
        self.request(|reply| Command::ListWorkflows { reply }).await
    }

    /// Queues a new execution of a stored workflow.
    pub async fn execute_workflow(&self, workflow_id: &str) -> Result<String, OrchestratorError> {
        self.execute_workflow_with(workflow_id, Payload::new(), None)
            .await
    }

    /// Queues an execution with an input payload and an optional
    /// priority override.
    pub async fn execute_workflow_with(
        &self,
        workflow_id: &str,
        input: Payload,
        priority: Option<Priority>,
    ) -> Result<String, OrchestratorError> {
        let workflow_id = workflow_id.to_string();
        self.request(|reply| Command::Execute {
            workflow_id,
            input,
            priority,
            reply,
        })
        .await
    }

    pub async fn get_workflow_status(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Status { execution_id, reply })
            .await
    }

    /// Full execution record, checkpoints and step timeline included.
    pub async fn get_execution(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionSnapshot, OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Snapshot { execution_id, reply })
            .await
    }

    /// Status of every retained execution, oldest first.
    pub async fn list_executions(&self) -> Result<Vec<ExecutionReport>, OrchestratorError> {
        self.request(|reply| Command::ListExecutions { reply }).await
    }

    /// Resolves once the execution reaches a terminal status.
    pub async fn wait_for_completion(
        &self,
        execution_id: &str,
    ) -> Result<ExecutionReport, OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::WaitFor { execution_id, reply })
            .await
    }

    /// Stops dispatching new steps. In-flight steps finish normally.
    pub async fn pause_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Pause { execution_id, reply })
            .await
    }

    /// Puts a paused execution back in the priority queue.
    pub async fn resume_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Resume { execution_id, reply })
            .await
    }

    /// Cancels an execution.
    ///
    /// Returns after every in-flight step of the execution has stopped
    /// and released its session.
    pub async fn cancel_workflow(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Cancel { execution_id, reply })
            .await
    }

    /// Forgets a terminal execution.
    pub async fn purge_execution(&self, execution_id: &str) -> Result<(), OrchestratorError> {
        let execution_id = execution_id.to_string();
        self.request(|reply| Command::Purge { execution_id, reply })
            .await
    }

    pub async fn get_system_metrics(&self) -> Result<SystemMetrics, OrchestratorError> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    /// Cancels every unfinished execution, waits for in-flight steps and
    /// closes the session pool.
    ///
    /// Status queries keep working afterwards. Calling it again is a no-op.
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        match self.request(|reply| Command::Shutdown { reply }).await {
            Err(OrchestratorError::Unavailable) => Ok(()),
            other => other,
        }
    }
}

/// What step tasks need from the coordinator.
struct StepContext {
    pool: SessionPool,
    executor: Arc<dyn StepExecutor>,
    events: mpsc::UnboundedSender<StepEvent>,
    max_payload_bytes: usize,
}

/// Runtime state of one execution.
struct ExecutionEntry {
    execution: WorkflowExecution,
    definition: Arc<WorkflowDefinition>,
    planner: ExecutionPlanner,
    /// Order of the latest admission; earlier admissions dispatch first
    admitted: u64,
    deadline: Option<Instant>,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ExecutionEntry {
    fn report(&self) -> ExecutionReport {
        ExecutionReport::new(&self.execution, &self.definition.name, self.planner.steps())
    }

    fn refresh_progress(&mut self) {
        self.execution.set_progress(self.planner.progress_fraction());
    }

    fn checkpoint(&mut self, log: Option<&CheckpointLog>) {
        let checkpoint = self.execution.checkpoint(self.planner.completed_step_ids());
        debug!(
            "Checkpoint {} for {} (progress {:.2})",
            self.execution.checkpoints.len(),
            self.execution.id,
            checkpoint.progress
        );
        if let Some(log) = log {
            if let Err(e) = log.append(&checkpoint) {
                warn!("Failed to persist checkpoint of {}: {}", self.execution.id, e);
            }
        }
    }

    /// Stops every in-flight attempt and fails their steps with `reason`.
    fn abort(&mut self, reason: &str) {
        self.cancel.cancel();
        self.tasks.close();
        let aborted = self.planner.abort_in_flight(reason);
        self.execution.session_assignments.clear();
        if !aborted.is_empty() {
            debug!(
                "Aborted {} in-flight steps of {}",
                aborted.len(),
                self.execution.id
            );
        }
    }

    fn fail(&mut self, reason: &str) {
        self.abort(reason);
        self.planner.skip_remaining();
        self.refresh_progress();
        match self.execution.transition(ExecutionStatus::Failed) {
            Ok(()) => error!("Execution {} failed: {}", self.execution.id, reason),
            Err(e) => warn!("{}", e),
        }
    }
}

/// Dispatches one step attempt of `entry`.
fn launch_step(entry: &mut ExecutionEntry, step_id: &str, ctx: &StepContext) {
    let attempt = match entry.planner.mark_step_running(step_id) {
        Ok(attempt) => attempt,
        Err(e) => {
            warn!("Cannot dispatch step: {}", e);
            return;
        }
    };
    let Some(step) = entry.planner.get_step(step_id) else {
        return;
    };

    let task_type = entry.definition.task_type_for(step).to_string();
    let request = StepRequest {
        execution_id: entry.execution.id.clone(),
        workflow_id: entry.definition.id.clone(),
        step_id: step.id.clone(),
        action: step.action.clone(),
        parameters: step.parameters.clone(),
        input: entry.execution.input.clone(),
        dependency_results: entry.planner.dependency_results(step_id),
        attempt,
        timeout: step.timeout(),
    };

    info!(
        "Dispatching step '{}' of {} (attempt {}/{}, session type '{}')",
        step_id,
        entry.execution.id,
        attempt,
        step.max_retries + 1,
        task_type
    );
    entry.execution.current_step = Some(step_id.to_string());

    let task = StepTask {
        pool: ctx.pool.clone(),
        executor: Arc::clone(&ctx.executor),
        request,
        task_type,
        max_payload_bytes: ctx.max_payload_bytes,
        cancel: entry.cancel.child_token(),
        events: ctx.events.clone(),
    };
    entry.tasks.spawn(task.run());
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Coordinator {
    config: OrchestratorConfig,
    retry_policy: RetryPolicy,
    ctx: StepContext,
    checkpoint_log: Option<CheckpointLog>,
    definitions: HashMap<String, Arc<WorkflowDefinition>>,
    executions: HashMap<String, ExecutionEntry>,
    queue: ExecutionQueue,
    next_admission: u64,
    waiters: HashMap<String, Vec<Reply<ExecutionReport>>>,
    maintenance_token: CancellationToken,
    maintenance: Option<JoinHandle<()>>,
    shutting_down: bool,
}

impl Coordinator {
    fn new(
        config: OrchestratorConfig,
        ctx: StepContext,
        maintenance_token: CancellationToken,
        maintenance: JoinHandle<()>,
    ) -> Self {
        let checkpoint_log = config.checkpoint_dir.clone().map(CheckpointLog::new);

        let mut coordinator = Self {
            retry_policy: config.retry_policy(),
            config,
            ctx,
            checkpoint_log,
            definitions: HashMap::new(),
            executions: HashMap::new(),
            queue: ExecutionQueue::new(),
            next_admission: 0,
            waiters: HashMap::new(),
            maintenance_token,
            maintenance: Some(maintenance),
            shutting_down: false,
        };

        if coordinator.config.preload_templates {
            for definition in templates::predefined() {
                if let Err(e) = coordinator.register(definition) {
                    warn!("Skipping predefined workflow: {}", e);
                }
            }
        }
        coordinator
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut events: mpsc::UnboundedReceiver<StepEvent>,
    ) {
        debug!("Coordinator started");
        let pool = self.ctx.pool.clone();
        loop {
            let wakeup = self.next_wakeup();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some(event) = events.recv() => self.handle_event(event),
                // Held steps may fit now
                _ = pool.released() => {}
                _ = sleep_until(wakeup) => {}
            }
            self.tick();
        }

        // Every handle is gone
        self.shutdown().await;
        debug!("Coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::CreateWorkflow { spec, reply } => {
                let definition = WorkflowDefinition::from_spec(Uuid::new_v4().to_string(), spec);
                let _ = reply.send(self.register(definition));
            }
            Command::RegisterWorkflow { definition, reply } => {
                let _ = reply.send(self.register(definition));
            }
            Command::GetWorkflow { workflow_id, reply } => {
                let result = self
                    .definitions
                    .get(&workflow_id)
                    .map(|d| d.as_ref().clone())
                    .ok_or(OrchestratorError::WorkflowNotFound(workflow_id));
                let _ = reply.send(result);
            }
            Command::ListWorkflows { reply } => {
                let mut definitions: Vec<WorkflowDefinition> =
                    self.definitions.values().map(|d| d.as_ref().clone()).collect();
                definitions.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
                let _ = reply.send(Ok(definitions));
            }
            Command::Execute {
                workflow_id,
                input,
                priority,
                reply,
            } => {
                let _ = reply.send(self.execute(workflow_id, input, priority));
            }
            Command::Status { execution_id, reply } => {
                let _ = reply.send(self.entry(&execution_id).map(ExecutionEntry::report));
            }
            Command::Snapshot { execution_id, reply } => {
                let result = self.entry(&execution_id).map(|entry| ExecutionSnapshot {
                    execution: entry.execution.clone(),
                    steps: entry.planner.steps().to_vec(),
                    timeline: entry.planner.timeline().clone(),
                });
                let _ = reply.send(result);
            }
            Command::ListExecutions { reply } => {
                let mut entries: Vec<&ExecutionEntry> = self.executions.values().collect();
                entries.sort_by_key(|e| e.execution.created_at);
                let _ = reply.send(Ok(entries.into_iter().map(ExecutionEntry::report).collect()));
            }
            Command::WaitFor { execution_id, reply } => {
                let finished = match self.entry(&execution_id) {
                    Ok(entry) if !entry.execution.is_terminal() => None,
                    other => Some(other.map(ExecutionEntry::report)),
                };
                match finished {
                    Some(result) => {
                        let _ = reply.send(result);
                    }
                    None => self.waiters.entry(execution_id).or_default().push(reply),
                }
            }
            Command::Pause { execution_id, reply } => {
                let _ = reply.send(self.pause(&execution_id));
            }
            Command::Resume { execution_id, reply } => {
                let _ = reply.send(self.resume(&execution_id));
            }
            Command::Cancel { execution_id, reply } => match self.cancel(&execution_id) {
                Ok(tasks) => {
                    // Answer once every attempt has dropped its lease
                    tokio::spawn(async move {
                        tasks.wait().await;
                        let _ = reply.send(Ok(()));
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Purge { execution_id, reply } => {
                let _ = reply.send(self.purge(&execution_id));
            }
            Command::Metrics { reply } => {
                let _ = reply.send(Ok(self.metrics()));
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn entry(&self, execution_id: &str) -> Result<&ExecutionEntry, OrchestratorError> {
        self.executions
            .get(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    fn entry_mut(&mut self, execution_id: &str) -> Result<&mut ExecutionEntry, OrchestratorError> {
        self.executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))
    }

    fn register(&mut self, definition: WorkflowDefinition) -> Result<String, OrchestratorError> {
        validate_definition(&definition, self.config.max_payload_bytes)?;

        let id = definition.id.clone();
        if self.definitions.contains_key(&id) {
            info!("Replacing workflow definition {}", id);
        }
        info!(
            "Registered workflow '{}' ({}) with {} steps",
            definition.name,
            id,
            definition.steps.len()
        );
        self.definitions.insert(id.clone(), Arc::new(definition));
        Ok(id)
    }

    fn execute(
        &mut self,
        workflow_id: String,
        input: Payload,
        priority: Option<Priority>,
    ) -> Result<String, OrchestratorError> {
        if self.shutting_down {
            return Err(OrchestratorError::ShuttingDown);
        }
        let definition = self
            .definitions
            .get(&workflow_id)
            .cloned()
            .ok_or(OrchestratorError::WorkflowNotFound(workflow_id))?;
        check_payload("execution input", &input, self.config.max_payload_bytes)?;

        let id = Uuid::new_v4().to_string();
        let priority = priority.unwrap_or(definition.priority);
        let entry = ExecutionEntry {
            execution: WorkflowExecution::new(&id, &definition.id, priority, input),
            planner: ExecutionPlanner::new(&definition, self.retry_policy.clone()),
            definition,
            admitted: 0,
            deadline: None,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
        };

        info!(
            "Queued execution {} of '{}' (priority {})",
            id, entry.definition.name, priority
        );
        self.executions.insert(id.clone(), entry);
        self.queue.push(id.clone(), priority);
        Ok(id)
    }

    fn pause(&mut self, execution_id: &str) -> Result<(), OrchestratorError> {
        let log = self.checkpoint_log.as_ref();
        let entry = self
            .executions
            .get_mut(execution_id)
            .ok_or_else(|| OrchestratorError::ExecutionNotFound(execution_id.to_string()))?;

        entry.execution.transition(ExecutionStatus::Paused)?;
        entry.checkpoint(log);
        info!(
            "Paused execution {} ({} steps still in flight)",
            execution_id,
            entry.planner.running_count()
        );
        Ok(())
    }

    fn resume(&mut self, execution_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(execution_id)?;
        if entry.execution.status != ExecutionStatus::Paused {
            return Err(TransitionError {
                entity: format!("execution {}", execution_id),
                from: entry.execution.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            }
            .into());
        }

        let priority = entry.execution.priority;
        if !self.queue.contains(execution_id) {
            self.queue.push(execution_id, priority);
            info!("Execution {} queued for resumption", execution_id);
        }
        Ok(())
    }

    /// Cancels an execution and returns the tracker of its step tasks.
    fn cancel(&mut self, execution_id: &str) -> Result<TaskTracker, OrchestratorError> {
        let entry = self.entry_mut(execution_id)?;
        entry.execution.transition(ExecutionStatus::Cancelled)?;
        entry.abort("cancelled");
        let tasks = entry.tasks.clone();

        self.queue.remove(execution_id);
        info!("Cancelled execution {}", execution_id);
        Ok(tasks)
    }

    fn purge(&mut self, execution_id: &str) -> Result<(), OrchestratorError> {
        let entry = self.entry(execution_id)?;
        if !entry.execution.is_terminal() {
            return Err(TransitionError {
                entity: format!("execution {}", execution_id),
                from: entry.execution.status.to_string(),
                to: "PURGED".to_string(),
            }
            .into());
        }
        self.executions.remove(execution_id);
        debug!("Purged execution {}", execution_id);
        Ok(())
    }

    fn metrics(&self) -> SystemMetrics {
        SystemMetrics::collect(
            self.executions.values().map(|e| &e.execution.status),
            self.queue.len(),
            self.definitions.len(),
            !self.shutting_down,
            self.ctx.pool.stats(),
        )
    }

    fn handle_event(&mut self, event: StepEvent) {
        match event {
            StepEvent::SessionBound {
                execution_id,
                step_id,
                session_id,
            } => {
                if let Some(entry) = self.executions.get_mut(&execution_id) {
                    if !entry.execution.is_terminal() {
                        debug!("Step '{}' leased session {}", step_id, session_id);
                        entry.planner.bind_session(&step_id, &session_id);
                        entry.execution.session_assignments.insert(step_id, session_id);
                    }
                }
            }
            StepEvent::Finished {
                execution_id,
                step_id,
                outcome,
            } => self.step_finished(&execution_id, &step_id, outcome),
        }
    }

    fn step_finished(
        &mut self,
        execution_id: &str,
        step_id: &str,
        outcome: Result<Payload, CapabilityError>,
    ) {
        let log = self.checkpoint_log.as_ref();
        let Some(entry) = self.executions.get_mut(execution_id) else {
            return;
        };
        entry.execution.session_assignments.remove(step_id);
        if entry.execution.is_terminal() {
            debug!("Ignoring late outcome of step '{}'", step_id);
            return;
        }

        match outcome {
            Ok(result) => match entry.planner.mark_step_completed(step_id, result) {
                Ok(()) => {
                    info!("Step '{}' of {} completed", step_id, execution_id);
                    entry.refresh_progress();
                    entry.checkpoint(log);
                }
                Err(e) => warn!("{}", e),
            },
            Err(failure) => {
                let (attempt, attempts) = entry
                    .planner
                    .get_step(step_id)
                    .map_or((1, 1), |s| (s.retry_count + 1, s.max_retries + 1));
                entry
                    .execution
                    .log_error(format!("{} attempt {}/{}: {}", step_id, attempt, attempts, failure));

                match entry
                    .planner
                    .mark_step_failed(step_id, failure.to_string(), Instant::now())
                {
                    Ok(FailureOutcome::Retry { retry, delay }) => warn!(
                        "Step '{}' failed ({}), retry {} in {:?}",
                        step_id, failure, retry, delay
                    ),
                    Ok(FailureOutcome::Skipped) => {
                        warn!("Step '{}' failed and was skipped: {}", step_id, failure);
                        entry.refresh_progress();
                        entry.checkpoint(log);
                    }
                    Ok(FailureOutcome::Failed) => {
                        error!(
                            "Step '{}' failed after {} attempts: {}",
                            step_id, attempts, failure
                        );
                        entry.checkpoint(log);
                    }
                    Err(e) => warn!("{}", e),
                }
            }
        }

        self.finalize(execution_id);
    }

    /// Completes or fails an execution whose steps allow it.
    fn finalize(&mut self, execution_id: &str) {
        let Some(entry) = self.executions.get_mut(execution_id) else {
            return;
        };
        if entry.execution.is_terminal() {
            return;
        }

        if let Some(step) = entry.planner.failed_step() {
            let reason = format!("step '{}' failed", step.id);
            entry.fail(&reason);
            self.queue.remove(execution_id);
            return;
        }

        if entry.execution.status == ExecutionStatus::Running && entry.planner.is_finished() {
            entry.execution.result = Some(entry.planner.results());
            entry.refresh_progress();
            match entry.execution.transition(ExecutionStatus::Completed) {
                Ok(()) => info!(
                    "Execution {} of '{}' completed",
                    execution_id, entry.definition.name
                ),
                Err(e) => warn!("{}", e),
            }
        }
    }

    fn tick(&mut self) {
        let now = Instant::now();
        self.enforce_deadlines(now);
        self.admit(now);
        self.dispatch(now);
        self.flush_waiters();
    }

    fn enforce_deadlines(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .executions
            .iter()
            .filter(|(_, e)| !e.execution.is_terminal() && e.deadline.map_or(false, |d| d <= now))
            .map(|(id, _)| id.clone())
            .collect();

        for id in expired {
            if let Some(entry) = self.executions.get_mut(&id) {
                let reason = format!("workflow timed out after {}s", entry.definition.timeout_secs);
                entry.execution.log_error(reason.clone());
                entry.fail(&reason);
            }
            self.queue.remove(&id);
        }
    }

    fn running_count(&self) -> usize {
        self.executions
            .values()
            .filter(|e| e.execution.status == ExecutionStatus::Running)
            .count()
    }

    fn admit(&mut self, now: Instant) {
        while self.running_count() < self.config.max_concurrent_workflows {
            let Some(next) = self.queue.pop() else {
                break;
            };
            let id = next.execution_id;
            let Some(entry) = self.executions.get_mut(&id) else {
                continue;
            };

            let mut warm = None;
            match entry.execution.status {
                ExecutionStatus::Pending => {
                    if let Err(e) = entry.execution.transition(ExecutionStatus::Running) {
                        warn!("{}", e);
                        continue;
                    }
                    entry.deadline = Some(now + entry.definition.timeout());
                    warm = Some(entry.definition.session_requirements.clone());
                    info!(
                        "Started execution {} of '{}'",
                        id, entry.definition.name
                    );
                }
                ExecutionStatus::Paused => {
                    if let Err(e) = entry.execution.transition(ExecutionStatus::Running) {
                        warn!("{}", e);
                        continue;
                    }
                    info!("Resumed execution {}", id);
                }
                _ => continue,
            }

            entry.admitted = self.next_admission;
            self.next_admission += 1;

            if let Some(requirements) = warm {
                self.warm_pool(requirements);
            }
            // A resumed execution may have nothing left to run
            self.finalize(&id);
        }
    }

    /// Pre-creates the sessions a workflow asks for.
    fn warm_pool(&self, requirements: SessionRequirements) {
        if requirements.min_sessions == 0 {
            return;
        }
        let pool = self.ctx.pool.clone();
        tokio::spawn(async move {
            match pool
                .ensure_minimum(&requirements.session_type, requirements.min_sessions)
                .await
            {
                Ok(created) if !created.is_empty() => debug!(
                    "Warmed {} '{}' sessions",
                    created.len(),
                    requirements.session_type
                ),
                Ok(_) => {}
                Err(e) => debug!("Could not warm '{}' sessions: {}", requirements.session_type, e),
            }
        });
    }

    fn dispatch(&mut self, now: Instant) {
        let mut order: Vec<(Priority, u64, String)> = self
            .executions
            .iter()
            .filter(|(_, e)| e.execution.status == ExecutionStatus::Running)
            .map(|(id, e)| (e.execution.priority, e.admitted, id.clone()))
            .collect();
        order.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        // Attempts still waiting on a lease keep their claim
        let mut headroom = self.ctx.pool.headroom();
        for entry in self.executions.values().filter(|e| !e.execution.is_terminal()) {
            for step in entry.planner.unbound_steps() {
                headroom.take(entry.definition.task_type_for(step));
            }
        }

        let ctx = &self.ctx;
        for (_, _, id) in order {
            let Some(entry) = self.executions.get_mut(&id) else {
                continue;
            };
            for step_id in entry.planner.get_ready_steps(now) {
                let Some(step) = entry.planner.get_step(&step_id) else {
                    continue;
                };
                // A type the pool can never serve is dispatched to fail fast
                let task_type = entry.definition.task_type_for(step);
                if !headroom.take(task_type) && ctx.pool.serves(task_type) {
                    debug!(
                        "Holding step '{}' of {} until a '{}' session frees up",
                        step_id, id, task_type
                    );
                    continue;
                }
                launch_step(entry, &step_id, ctx);
            }
        }
    }

    /// Earliest deadline or future retry time that needs a tick.
    fn next_wakeup(&self) -> Option<Instant> {
        let now = Instant::now();
        self.executions
            .values()
            .filter(|e| !e.execution.is_terminal())
            .flat_map(|e| {
                // Due retries blocked on a full slot wait for a step to finish
                let retry = (e.execution.status == ExecutionStatus::Running)
                    .then(|| e.planner.next_retry_at())
                    .flatten()
                    .filter(|at| *at > now);
                [e.deadline, retry]
            })
            .flatten()
            .min()
    }

    fn flush_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }
        let done: Vec<String> = self
            .waiters
            .keys()
            .filter(|id| {
                self.executions
                    .get(id.as_str())
                    .map_or(true, |e| e.execution.is_terminal())
            })
            .cloned()
            .collect();

        for id in done {
            for reply in self.waiters.remove(&id).unwrap_or_default() {
                let _ = reply.send(self.entry(&id).map(ExecutionEntry::report));
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        self.shutting_down = true;
        info!("Shutting down orchestrator");

        self.queue.drain();
        let mut trackers = Vec::new();
        for entry in self.executions.values_mut() {
            if !entry.execution.is_terminal()
                && entry.execution.transition(ExecutionStatus::Cancelled).is_ok()
            {
                entry.abort("orchestrator shut down");
                info!("Cancelled execution {} on shutdown", entry.execution.id);
            }
            entry.tasks.close();
            trackers.push(entry.tasks.clone());
        }

        for tracker in trackers {
            tracker.wait().await;
        }

        self.maintenance_token.cancel();
        if let Some(maintenance) = self.maintenance.take() {
            if let Err(e) = maintenance.await {
                warn!("Pool maintenance task ended abnormally: {}", e);
            }
        }
        self.ctx.pool.shutdown().await;
        self.flush_waiters();
        info!("Orchestrator shut down");
    }
}
