//! FlowDirector CLI Entry Point
//!
//! Runs one workflow end to end against the dry-run session backend.
//!
//! # Usage
//!
//! ```bash
//! # Execute a workflow file
//! flowdirector discovery.yaml
//!
//! # Run a predefined template
//! flowdirector --template job-discovery --keywords rust,tokio,async
//!
//! # Use a settings file and a higher priority
//! flowdirector discovery.yaml --config flowdirector.yaml --priority high
//!
//! # Make one step fail to watch retries and checkpoints
//! flowdirector discovery.yaml --fail search_jobs --verbose
//! ```

use std::env;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use log::{info, warn};
use serde_json::Value;

use flowdirector::monitoring::ExecutionReport;
use flowdirector::workflow::templates;
use flowdirector::workflow::validator::topological_order;
use flowdirector::workflow::{load_workflow_spec, Payload, StepStatus};
use flowdirector::{
    DryRunExecutor, DryRunProvider, ExecutionStatus, Orchestrator, Priority, SessionPool, Settings,
    WorkflowSpec, APP_NAME, VERSION,
};

/// Default keywords for the job discovery template.
const DEFAULT_KEYWORDS: &str = "rust,backend,automation";

/// Proposals per step of the submission template.
const DEFAULT_BATCH_SIZE: usize = 5;

/// Seconds between progress lines while waiting.
const PROGRESS_INTERVAL_SECS: u64 = 1;

/// Where the workflow comes from.
#[derive(Debug)]
enum Source {
    File(String),
    JobDiscovery,
    ProposalSubmission,
}

/// Command-line configuration parsed from arguments.
#[derive(Debug)]
struct Config {
    source: Option<Source>,
    keywords: Vec<String>,
    sequential: bool,
    proposals_path: Option<PathBuf>,
    settings_path: Option<PathBuf>,
    priority: Option<Priority>,
    input: Payload,
    fail: Vec<String>,
    latency: Duration,
    verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source: None,
            keywords: split_list(DEFAULT_KEYWORDS),
            sequential: false,
            proposals_path: None,
            settings_path: None,
            priority: None,
            input: Payload::new(),
            fail: Vec::new(),
            latency: Duration::ZERO,
            verbose: false,
        }
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Configures the logging system with appropriate formatting.
fn setup_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            use std::io::Write;

            match record.level() {
                log::Level::Warn | log::Level::Error => {
                    writeln!(buf, "[{}] {}", record.level(), record.args())
                }
                _ => writeln!(buf, "{}", record.args()),
            }
        })
        .init();
}

/// Prints the application banner with version information.
fn print_banner() {
    println!();
    println!("{} v{}", APP_NAME.bold(), VERSION);
    println!("Workflow Orchestration for Browser Automation");
    println!();
}

/// Prints usage information.
fn print_usage() {
    println!("Usage: flowdirector [OPTIONS] [WORKFLOW_FILE]");
    println!();
    println!("Arguments:");
    println!("  [WORKFLOW_FILE]       Path to workflow YAML file");
    println!();
    println!("Options:");
    println!("  --template NAME       Run a template: job-discovery | proposal-submission");
    println!("  --keywords LIST       Comma-separated keywords (default: {})", DEFAULT_KEYWORDS);
    println!("  --sequential          Run template steps one at a time");
    println!("  --proposals PATH      JSON array of proposals for proposal-submission");
    println!("  --config PATH         Settings YAML file");
    println!("  --priority LEVEL      low | normal | high | critical");
    println!("  --input JSON          Execution input object");
    println!("  --fail NAME           Make a step id or action fail (repeatable)");
    println!("  --latency-ms N        Simulated duration of each step");
    println!("  --verbose             Enable debug logging");
    println!("  --help                Show this help message");
    println!("  --version             Show version information");
    println!();
    println!("Examples:");
    println!("  flowdirector discovery.yaml");
    println!("  flowdirector --template job-discovery --keywords rust,tokio");
    println!("  flowdirector discovery.yaml --fail search_jobs --latency-ms 200");
}

/// Returns the value following an option.
fn option_value<'a>(args: &'a [String], i: &mut usize, name: &str) -> Result<&'a str, String> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| format!("{} requires an argument", name))
}

/// Parses command-line arguments into a Config struct.
fn parse_arguments(args: &[String]) -> Result<Config, String> {
    let mut config = Config::default();
    let mut i = 1; // Skip program name

    while i < args.len() {
        let arg = &args[i];

        match arg.as_str() {
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                println!("{} {}", APP_NAME, VERSION);
                std::process::exit(0);
            }
            "--verbose" | "-v" => {
                config.verbose = true;
            }
            "--sequential" => {
                config.sequential = true;
            }
            "--template" => {
                let source = match option_value(args, &mut i, "--template")? {
                    "job-discovery" => Source::JobDiscovery,
                    "proposal-submission" => Source::ProposalSubmission,
                    other => return Err(format!("Unknown template: {}", other)),
                };
                config.source = Some(source);
            }
            "--keywords" => {
                config.keywords = split_list(option_value(args, &mut i, "--keywords")?);
            }
            "--proposals" => {
                config.proposals_path = Some(PathBuf::from(option_value(args, &mut i, "--proposals")?));
            }
            "--config" => {
                config.settings_path = Some(PathBuf::from(option_value(args, &mut i, "--config")?));
            }
            "--priority" => {
                config.priority = Some(option_value(args, &mut i, "--priority")?.parse()?);
            }
            "--input" => {
                let raw = option_value(args, &mut i, "--input")?;
                config.input = serde_json::from_str(raw)
                    .map_err(|e| format!("Invalid --input object: {}", e))?;
            }
            "--fail" => {
                config.fail.push(option_value(args, &mut i, "--fail")?.to_string());
            }
            "--latency-ms" => {
                let raw = option_value(args, &mut i, "--latency-ms")?;
                let millis: u64 = raw
                    .parse()
                    .map_err(|_| format!("Invalid latency value: {}", raw))?;
                config.latency = Duration::from_millis(millis);
            }
            arg if arg.starts_with('-') => {
                return Err(format!("Unknown option: {}", arg));
            }
            _ => {
                if config.source.is_some() {
                    return Err(format!("Unexpected argument: {}", arg));
                }
                config.source = Some(Source::File(arg.clone()));
            }
        }
        i += 1;
    }

    Ok(config)
}

/// Loads settings from the file (if any), then applies environment overrides.
fn load_settings(path: Option<&PathBuf>) -> Result<Settings, Box<dyn std::error::Error>> {
    let mut settings = match path {
        Some(path) => {
            info!("Loading settings: {}", path.display());
            Settings::load(path)?
        }
        None => Settings::default(),
    };
    settings.apply_env_overrides()?;
    settings.validate()?;
    Ok(settings)
}

/// Builds the workflow spec the user asked for.
fn build_spec(config: &Config) -> Result<WorkflowSpec, Box<dyn std::error::Error>> {
    match &config.source {
        Some(Source::File(path)) => {
            info!("Loading workflow: {}", path);
            load_workflow_spec(path)
                .map_err(|e| format!("Could not load workflow from '{}': {}", path, e).into())
        }
        Some(Source::JobDiscovery) => {
            info!("Template: job discovery ({})", config.keywords.join(", "));
            Ok(templates::job_discovery_workflow(&config.keywords, !config.sequential))
        }
        Some(Source::ProposalSubmission) => {
            let path = config
                .proposals_path
                .as_ref()
                .ok_or("proposal-submission requires --proposals PATH")?;
            let proposals: Vec<Value> = serde_json::from_str(&fs::read_to_string(path)?)?;
            info!("Template: proposal submission ({} proposals)", proposals.len());
            Ok(templates::proposal_submission_workflow(&proposals, DEFAULT_BATCH_SIZE))
        }
        None => Err("No workflow given: pass a WORKFLOW_FILE or --template".into()),
    }
}

fn colored_status(status: ExecutionStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        ExecutionStatus::Completed => label.green().bold(),
        ExecutionStatus::Failed => label.red().bold(),
        ExecutionStatus::Cancelled | ExecutionStatus::Paused => label.yellow().bold(),
        ExecutionStatus::Pending | ExecutionStatus::Running => label.cyan(),
    }
}

fn colored_step(status: StepStatus) -> colored::ColoredString {
    let label = status.to_string();
    match status {
        StepStatus::Completed => label.green(),
        StepStatus::Failed => label.red(),
        StepStatus::Skipped => label.yellow(),
        _ => label.normal(),
    }
}

/// Prints the final report of an execution.
fn print_summary(report: &ExecutionReport, gantt: &str) {
    println!();
    println!("{}", "=".repeat(60));
    println!(
        "Workflow '{}' {} ({:.0}%)",
        report.workflow_name,
        colored_status(report.status),
        report.progress * 100.0
    );
    println!("{}", "=".repeat(60));

    for step in &report.steps {
        let retries = if step.retry_count > 0 {
            format!(" ({} retries)", step.retry_count)
        } else {
            String::new()
        };
        println!("  {:<28} {}{}", step.id, colored_step(step.status), retries);
    }

    if !report.error_log.is_empty() {
        println!();
        println!("Errors:");
        for entry in &report.error_log {
            println!("  {}", entry.red());
        }
    }

    println!();
    println!("Checkpoints: {}", report.checkpoints);
    println!();
    println!("{}", gantt);
}

/// Creates, runs and reports one workflow execution.
async fn orchestrate(config: Config, settings: Settings, spec: WorkflowSpec) -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let pool = SessionPool::new(settings.pool, Arc::new(DryRunProvider::new()));
    pool.initialize().await?;
    let stats = pool.stats();
    info!("Session pool ready: {} sessions", stats.total_sessions);

    let mut executor = DryRunExecutor::new().with_latency(config.latency);
    for name in &config.fail {
        warn!("Step '{}' will fail on every attempt", name);
        executor = executor.fail_always(name.clone());
    }

    let orchestrator = Orchestrator::start(settings.orchestrator, pool, Arc::new(executor));
    let workflow_id = orchestrator.create_workflow(spec).await?;
    let definition = orchestrator.get_workflow(&workflow_id).await?;

    println!("Execution plan for '{}':", definition.name);
    for (i, step_id) in topological_order(&definition.steps)?.iter().enumerate() {
        let deps = definition
            .get_step(step_id)
            .map(|s| s.dependencies.join(", "))
            .unwrap_or_default();
        if deps.is_empty() {
            println!("  {}. {}", i + 1, step_id);
        } else {
            println!("  {}. {} (after {})", i + 1, step_id, deps);
        }
    }
    println!();

    let execution_id = orchestrator
        .execute_workflow_with(&workflow_id, config.input, config.priority)
        .await?;
    info!("Execution {} started", execution_id);

    let waiting = orchestrator.wait_for_completion(&execution_id);
    tokio::pin!(waiting);
    let mut ticker = tokio::time::interval(Duration::from_secs(PROGRESS_INTERVAL_SECS));
    let mut last_progress = -1.0;

    let report = loop {
        tokio::select! {
            report = &mut waiting => break report?,
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling execution {}", execution_id);
                if let Err(e) = orchestrator.cancel_workflow(&execution_id).await {
                    warn!("Could not cancel: {}", e);
                }
            }
            _ = ticker.tick() => {
                let status = orchestrator.get_workflow_status(&execution_id).await?;
                if status.progress != last_progress {
                    last_progress = status.progress;
                    info!(
                        "Progress: {:.0}% (current step: {})",
                        status.progress * 100.0,
                        status.current_step.as_deref().unwrap_or("-")
                    );
                }
            }
        }
    };

    let snapshot = orchestrator.get_execution(&execution_id).await?;
    print_summary(&report, &snapshot.timeline.gantt_chart());

    let metrics = orchestrator.get_system_metrics().await?;
    info!(
        "Sessions: {} total, {} unhealthy, utilization {:.0}%",
        metrics.sessions.total_sessions,
        metrics.sessions.unhealthy,
        metrics.session_utilization * 100.0
    );

    orchestrator.shutdown().await?;
    Ok(report.status)
}

/// Main application entry point.
fn run() -> Result<ExecutionStatus, Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    // Parse arguments
    let config = parse_arguments(&args).map_err(|e| {
        eprintln!("Error: {}", e);
        eprintln!();
        print_usage();
        e
    })?;

    setup_logging(config.verbose);
    print_banner();

    let settings = load_settings(config.settings_path.as_ref())?;
    let spec = build_spec(&config)?;
    info!("Mode: DRY RUN (no remote browser sessions)");

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(orchestrate(config, settings, spec))
}

fn main() -> ExitCode {
    match run() {
        Ok(ExecutionStatus::Completed) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!();
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
