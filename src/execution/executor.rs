//! Step execution boundary.
//!
//! The browser automation behind each step action lives outside this
//! crate. The orchestrator reaches it only through [`StepExecutor`].

use std::time::Duration;

use async_trait::async_trait;

use crate::error::CapabilityError;
use crate::session::SessionHandle;
use crate::workflow::Payload;

/// Everything a capability gets to perform one step attempt.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub step_id: String,
    pub action: String,
    pub parameters: Payload,

    /// Input payload of the execution
    pub input: Payload,

    /// Results of completed dependencies, keyed by step id
    pub dependency_results: Payload,

    /// 1-based attempt number
    pub attempt: u32,

    /// Budget for this attempt; the orchestrator enforces it
    pub timeout: Duration,
}

/// Performs step actions inside a leased session.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Runs one attempt of a step.
    ///
    /// The future may be dropped at any suspension point when the
    /// execution is cancelled or the attempt times out.
    async fn execute(
        &self,
        session: &SessionHandle,
        request: &StepRequest,
    ) -> Result<Payload, CapabilityError>;
}
