//! Predefined Workflows
//!
//! Ready-made definitions for the two recurring automation jobs, plus
//! builders that size them to the caller's keywords or proposals.

use serde_json::{json, Value};

use super::model::{
    SessionRequirements, StepSpec, WorkflowDefinition, WorkflowSpec, WorkflowStep,
};

/// Id of the predefined parallel job discovery workflow.
pub const JOB_DISCOVERY_ID: &str = "job_discovery_parallel";

/// Id of the predefined batch proposal submission workflow.
pub const PROPOSAL_SUBMISSION_ID: &str = "proposal_submission_batch";

/// Keywords searched together by one step of [`job_discovery_workflow`].
const KEYWORDS_PER_SEARCH: usize = 2;

fn with_steps(id: &str, spec: WorkflowSpec, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    let mut definition = WorkflowDefinition::from_spec(id, spec);
    definition.steps = steps;
    definition
}

/// Setup step, three parallel searches, then a merge.
pub fn job_discovery_parallel() -> WorkflowDefinition {
    let spec = WorkflowSpec::new("Parallel Job Discovery")
        .with_description("Discover jobs using multiple search strategies in parallel")
        .parallel(3)
        .with_session_requirements(SessionRequirements::new("job_discovery", 3));

    let steps = vec![
        WorkflowStep::new("setup_sessions", "Setup Browser Sessions", "create_session_pool")
            .with_parameter("pool_size", 3),
        WorkflowStep::new("search_agentforce", "Search Agentforce Jobs", "search_jobs")
            .with_parameter("keywords", json!(["Salesforce Agentforce"]))
            .with_parameter("sort", "newest")
            .depends_on("setup_sessions"),
        WorkflowStep::new("search_ai_einstein", "Search AI/Einstein Jobs", "search_jobs")
            .with_parameter("keywords", json!(["Salesforce AI", "Einstein"]))
            .with_parameter("sort", "best_match")
            .depends_on("setup_sessions"),
        WorkflowStep::new("search_developer", "Search Developer Jobs", "search_jobs")
            .with_parameter("keywords", json!(["Salesforce Developer"]))
            .with_parameter("filters", json!(["payment_verified", "high_rating"]))
            .depends_on("setup_sessions"),
        WorkflowStep::new("merge_results", "Merge and Deduplicate Results", "merge_job_results")
            .depends_on("search_agentforce")
            .depends_on("search_ai_einstein")
            .depends_on("search_developer"),
    ];

    with_steps(JOB_DISCOVERY_ID, spec, steps)
}

/// Validate, acquire sessions, two submission batches, then verify.
pub fn proposal_submission_batch() -> WorkflowDefinition {
    let spec = WorkflowSpec::new("Batch Proposal Submission")
        .with_description("Submit multiple proposals in parallel with error handling")
        .parallel(2)
        .with_session_requirements(SessionRequirements::new("proposal_submission", 2));

    let steps = vec![
        WorkflowStep::new("validate_proposals", "Validate Proposal Data", "validate_proposals"),
        WorkflowStep::new("acquire_sessions", "Acquire Submission Sessions", "acquire_sessions")
            .with_parameter("count", 2)
            .depends_on("validate_proposals"),
        WorkflowStep::new("submit_batch_1", "Submit First Batch", "submit_proposals")
            .with_parameter("batch_size", 5)
            .depends_on("acquire_sessions"),
        WorkflowStep::new("submit_batch_2", "Submit Second Batch", "submit_proposals")
            .with_parameter("batch_size", 5)
            .depends_on("acquire_sessions"),
        WorkflowStep::new("verify_submissions", "Verify All Submissions", "verify_submissions")
            .depends_on("submit_batch_1")
            .depends_on("submit_batch_2"),
    ];

    with_steps(PROPOSAL_SUBMISSION_ID, spec, steps)
}

/// All predefined definitions.
pub fn predefined() -> Vec<WorkflowDefinition> {
    vec![job_discovery_parallel(), proposal_submission_batch()]
}

/// Builds a discovery workflow with one search step per pair of keywords.
pub fn job_discovery_workflow(keywords: &[String], parallel: bool) -> WorkflowSpec {
    let mut spec = WorkflowSpec::new("Dynamic Job Discovery")
        .with_description(format!("Discover jobs for keywords: {}", keywords.join(", ")))
        .with_session_requirements(SessionRequirements::new("job_discovery", 3))
        .with_step(
            StepSpec::new("create_session_pool")
                .with_id("setup_sessions")
                .with_name("Setup Browser Sessions")
                .with_parameter("pool_size", 3),
        );
    spec.parallel_execution = parallel;

    let mut search_ids = Vec::new();
    for (i, group) in keywords.chunks(KEYWORDS_PER_SEARCH).enumerate() {
        let id = format!("search_keywords_{}", i);
        spec = spec.with_step(
            StepSpec::new("search_jobs")
                .with_id(id.clone())
                .with_name(format!("Search Keywords Group {}", i + 1))
                .with_parameter("keywords", json!(group))
                .depends_on("setup_sessions"),
        );
        search_ids.push(id);
    }

    let mut merge = StepSpec::new("merge_job_results")
        .with_id("merge_results")
        .with_name("Merge and Deduplicate Results");
    merge.dependencies = if search_ids.is_empty() {
        vec!["setup_sessions".to_string()]
    } else {
        search_ids
    };

    spec.with_step(merge)
}

/// Builds a submission workflow that splits `proposals` into batches.
pub fn proposal_submission_workflow(proposals: &[Value], batch_size: usize) -> WorkflowSpec {
    let batch_size = batch_size.max(1);
    let batches: Vec<&[Value]> = proposals.chunks(batch_size).collect();

    let mut spec = WorkflowSpec::new("Batch Proposal Submission")
        .with_description(format!(
            "Submit {} proposals in {} batches",
            proposals.len(),
            batches.len()
        ))
        .parallel(2)
        .with_session_requirements(SessionRequirements::new("proposal_submission", 2))
        .with_step(
            StepSpec::new("validate_proposals")
                .with_id("validate_proposals")
                .with_name("Validate Proposal Data")
                .with_parameter("proposals", json!(proposals)),
        )
        .with_step(
            StepSpec::new("acquire_sessions")
                .with_id("acquire_sessions")
                .with_name("Acquire Submission Sessions")
                .with_parameter("count", 2)
                .depends_on("validate_proposals"),
        );

    let mut batch_ids = Vec::new();
    for (i, batch) in batches.iter().enumerate() {
        let id = format!("submit_batch_{}", i);
        spec = spec.with_step(
            StepSpec::new("submit_proposals")
                .with_id(id.clone())
                .with_name(format!("Submit Batch {}", i + 1))
                .with_parameter("proposals", json!(batch))
                .with_parameter("batch_size", batch_size)
                .depends_on("acquire_sessions"),
        );
        batch_ids.push(id);
    }

    let mut verify = StepSpec::new("verify_submissions")
        .with_id("verify_submissions")
        .with_name("Verify All Submissions");
    verify.dependencies = if batch_ids.is_empty() {
        vec!["acquire_sessions".to_string()]
    } else {
        batch_ids
    };

    spec.with_step(verify)
}
