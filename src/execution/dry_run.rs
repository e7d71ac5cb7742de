//! Dry-Run Backend
//!
//! Simulated session provider and step executor. The CLI runs workflows
//! against them, and the tests script failures, hangs and gates with
//! them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::{json, Value};
use tokio::sync::Semaphore;

use super::executor::{StepExecutor, StepRequest};
use crate::error::{CapabilityError, ProviderError};
use crate::session::{SessionConfig, SessionHandle, SessionProvider};
use crate::workflow::Payload;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Provider that hands out fake remote sessions.
#[derive(Debug, Default)]
pub struct DryRunProvider {
    created: AtomicUsize,
    closed: AtomicUsize,
    fail_creates: AtomicBool,
    dead: AtomicBool,
    /// Milliseconds each `create_session` takes
    create_latency_ms: AtomicU64,
}

impl DryRunProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sessions created so far.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Sessions closed so far.
    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Makes every later `create_session` fail.
    pub fn set_fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Makes every later `create_session` take `latency`.
    pub fn set_create_latency(&self, latency: Duration) {
        let millis = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.create_latency_ms.store(millis, Ordering::SeqCst);
    }

    /// Makes liveness pings fail.
    pub fn set_alive(&self, alive: bool) {
        self.dead.store(!alive, Ordering::SeqCst);
    }
}

#[async_trait]
impl SessionProvider for DryRunProvider {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionHandle, ProviderError> {
        let latency = self.create_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(ProviderError("session quota exceeded".to_string()));
        }

        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "[DRY RUN] Created session {} (stealth: {}, proxy: {})",
            n, config.stealth, config.use_proxy
        );
        Ok(SessionHandle::new(format!("dry-run-{}", n))
            .with_connect_url(format!("wss://dry-run.invalid/sessions/{}", n)))
    }

    async fn close_session(&self, handle: &SessionHandle) -> Result<(), ProviderError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        debug!("[DRY RUN] Closed session {}", handle.remote_id);
        Ok(())
    }

    async fn is_alive(&self, _handle: &SessionHandle) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }
}

/// Scripted behaviour for a step id or action.
#[derive(Debug, Clone, PartialEq)]
enum Script {
    FailAlways,
    /// Fail this many more attempts, then succeed
    FailTimes(u32),
    /// Never return
    Hang,
    /// Succeed with a result padded to roughly this many bytes
    Oversized(usize),
}

/// Executor that pretends to run each step.
///
/// Scripts and gates are looked up by step id first, then by action.
#[derive(Debug, Default)]
pub struct DryRunExecutor {
    latency: Duration,
    scripts: Mutex<HashMap<String, Script>>,
    gates: HashMap<String, Semaphore>,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulated time spent on every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn fail_always(self, name: impl Into<String>) -> Self {
        self.script(name, Script::FailAlways)
    }

    /// Fails the first `times` attempts of `name`.
    pub fn fail_times(self, name: impl Into<String>, times: u32) -> Self {
        self.script(name, Script::FailTimes(times))
    }

    pub fn hang(self, name: impl Into<String>) -> Self {
        self.script(name, Script::Hang)
    }

    pub fn oversized_result(self, name: impl Into<String>, bytes: usize) -> Self {
        self.script(name, Script::Oversized(bytes))
    }

    fn script(self, name: impl Into<String>, script: Script) -> Self {
        lock(&self.scripts).insert(name.into(), script);
        self
    }

    /// Holds calls for `name` until [`open_gate`](Self::open_gate).
    pub fn with_gate(mut self, name: impl Into<String>) -> Self {
        self.gates.insert(name.into(), Semaphore::new(0));
        self
    }

    /// Lets every call held at the gate proceed, now and later.
    pub fn open_gate(&self, name: &str) {
        if let Some(gate) = self.gates.get(name) {
            // Each waiter takes the permit and hands it back on drop.
            gate.add_permits(1);
        }
    }

    /// Step ids in the order their attempts started.
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    /// Number of attempts made for a step.
    pub fn call_count(&self, step_id: &str) -> usize {
        lock(&self.calls).iter().filter(|id| *id == step_id).count()
    }

    /// Calls currently inside `execute`.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneous calls observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn next_script(&self, request: &StepRequest) -> Option<Script> {
        let mut scripts = lock(&self.scripts);
        let key = [&request.step_id, &request.action]
            .into_iter()
            .find(|key| scripts.contains_key(key.as_str()))?
            .clone();

        let script = scripts.get_mut(&key)?;
        match script {
            Script::FailTimes(0) => None,
            Script::FailTimes(remaining) => {
                *remaining -= 1;
                Some(Script::FailAlways)
            }
            other => Some(other.clone()),
        }
    }

    async fn run(&self, session: &SessionHandle, request: &StepRequest) -> Result<Payload, CapabilityError> {
        let gate = self
            .gates
            .get(&request.step_id)
            .or_else(|| self.gates.get(&request.action));
        if let Some(gate) = gate {
            debug!("[DRY RUN] Step '{}' waiting at gate", request.step_id);
            let _permit = gate
                .acquire()
                .await
                .map_err(|e| CapabilityError::failed(e.to_string()))?;
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut result = Payload::new();
        result.insert("step_id".into(), json!(request.step_id));
        result.insert("action".into(), json!(request.action));
        result.insert("attempt".into(), json!(request.attempt));
        result.insert("session".into(), json!(session.remote_id));
        result.insert("dry_run".into(), Value::Bool(true));

        match self.next_script(request) {
            None => Ok(result),
            Some(Script::FailAlways) | Some(Script::FailTimes(_)) => Err(CapabilityError::failed(
                format!("simulated failure of '{}'", request.action),
            )),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Oversized(bytes)) => {
                result.insert("padding".into(), json!("x".repeat(bytes)));
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl StepExecutor for DryRunExecutor {
    async fn execute(
        &self,
        session: &SessionHandle,
        request: &StepRequest,
    ) -> Result<Payload, CapabilityError> {
        lock(&self.calls).push(request.step_id.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        info!(
            "[DRY RUN] {} '{}' on {} (attempt {})",
            request.action, request.step_id, session.remote_id, request.attempt
        );

        let guard = InFlight(&self.in_flight);
        let outcome = self.run(session, request).await;
        drop(guard);
        outcome
    }
}

/// Decrements the in-flight counter even when the call is dropped.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
