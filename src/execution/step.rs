//! Individual Step Execution
//!
//! One spawned task per step attempt. The task:
//! - Leases a session of the step's task type
//! - Invokes the step executor under the step timeout
//! - Counts failures against the leased session
//! - Releases the lease, then reports the outcome to the coordinator
//!
//! Cancellation drops the in-flight attempt at its next suspension point;
//! the lease is released by its `Drop` before the outcome is sent.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::executor::{StepExecutor, StepRequest};
use crate::error::{CapabilityError, CapabilityErrorKind};
use crate::session::SessionPool;
use crate::workflow::model::check_payload;
use crate::workflow::Payload;

/// Messages from step tasks to the coordinator.
#[derive(Debug)]
pub(crate) enum StepEvent {
    /// A session was leased for the step's current attempt
    SessionBound {
        execution_id: String,
        step_id: String,
        session_id: String,
    },
    /// The attempt ended and its lease is already released
    Finished {
        execution_id: String,
        step_id: String,
        outcome: Result<Payload, CapabilityError>,
    },
}

/// One step attempt, ready to be spawned.
pub(crate) struct StepTask {
    pub pool: SessionPool,
    pub executor: Arc<dyn StepExecutor>,
    pub request: StepRequest,
    pub task_type: String,
    pub max_payload_bytes: usize,
    pub cancel: CancellationToken,
    pub events: UnboundedSender<StepEvent>,
}

impl StepTask {
    pub(crate) async fn run(self) {
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CapabilityError::cancelled()),
            outcome = self.attempt() => outcome,
        };

        if let Err(e) = &outcome {
            debug!(
                "Step '{}' attempt {} ended with {}",
                self.request.step_id, self.request.attempt, e
            );
        }

        let event = StepEvent::Finished {
            execution_id: self.request.execution_id.clone(),
            step_id: self.request.step_id.clone(),
            outcome,
        };
        if self.events.send(event).is_err() {
            warn!(
                "Coordinator gone before step '{}' reported",
                self.request.step_id
            );
        }
    }

    async fn attempt(&self) -> Result<Payload, CapabilityError> {
        let request = &self.request;
        let lease = self
            .pool
            .acquire(&self.task_type)
            .await
            .map_err(|e| CapabilityError::session_unavailable(e.to_string()))?;

        let _ = self.events.send(StepEvent::SessionBound {
            execution_id: request.execution_id.clone(),
            step_id: request.step_id.clone(),
            session_id: lease.session_id().to_string(),
        });

        let result = match time::timeout(
            request.timeout,
            self.executor.execute(lease.handle(), request),
        )
        .await
        {
            Ok(Ok(result)) => check_payload(
                &format!("step '{}' result", request.step_id),
                &result,
                self.max_payload_bytes,
            )
            .map(|()| result)
            .map_err(|e| CapabilityError::new(CapabilityErrorKind::InvalidResult, e.to_string())),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CapabilityError::timeout(request.timeout)),
        };

        if result.is_err() {
            lease.record_error();
        }
        lease.release();
        result
    }
}
