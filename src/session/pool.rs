//! Session Pool
//!
//! Brokers exclusive, scoped access to a bounded set of remote browser
//! sessions partitioned by task type.
//!
//! - Idle ACTIVE sessions are reused before new ones are created
//! - Creation respects the per-type and global caps, counting creations
//!   still in flight
//! - Callers over capacity wait for a release until their budget runs out
//! - [`SessionLease`] hands the session back when dropped
//! - Provider creation runs detached, so an abandoned acquire keeps its
//!   slot accounted and its session pooled
//!
//! All membership changes happen under one mutex that is never held
//! across an `.await`; provider calls run outside it.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::model::{
    CleanupReport, PoolStats, SessionHandle, SessionInfo, SessionStatus, TypeStats,
};
use super::provider::SessionProvider;
use crate::config::{PoolConfig, TaskTypeLimits};
use crate::error::{PoolError, ProviderError};

struct PooledSession {
    info: SessionInfo,
    leased: bool,
    /// Insertion order, used to pick the oldest idle session
    seq: u64,
    created: Instant,
    last_used: Instant,
}

#[derive(Default)]
struct PoolState {
    sessions: HashMap<String, PooledSession>,
    /// Task type -> creations in flight
    pending: HashMap<String, usize>,
    next_seq: u64,
    initialized: bool,
    shut_down: bool,
}

impl PoolState {
    fn count_of(&self, task_type: &str) -> usize {
        let live = self
            .sessions
            .values()
            .filter(|s| s.info.task_type == task_type)
            .count();
        live + self.pending.get(task_type).copied().unwrap_or(0)
    }

    fn total(&self) -> usize {
        self.sessions.len() + self.pending.values().sum::<usize>()
    }

    fn begin_create(&mut self, task_type: &str) {
        *self.pending.entry(task_type.to_string()).or_insert(0) += 1;
    }

    fn end_create(&mut self, task_type: &str) {
        if let Some(count) = self.pending.get_mut(task_type) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(task_type);
            }
        }
    }
}

struct PoolInner {
    config: PoolConfig,
    provider: Arc<dyn SessionProvider>,
    state: Mutex<PoolState>,
    released: Notify,
}

/// A creation counted in `PoolState::pending`.
///
/// Dropping the slot before it is settled gives the capacity back and
/// wakes waiting acquirers.
struct CreateSlot {
    pool: SessionPool,
    task_type: String,
    settled: bool,
}

impl CreateSlot {
    /// Counts a creation of `task_type`. The caller holds the state lock.
    fn reserve(pool: &SessionPool, state: &mut PoolState, task_type: &str) -> Self {
        state.begin_create(task_type);
        Self {
            pool: pool.clone(),
            task_type: task_type.to_string(),
            settled: false,
        }
    }

    /// Ends the reservation under a lock the caller already holds.
    fn settle(mut self, state: &mut PoolState) {
        state.end_create(&self.task_type);
        self.settled = true;
    }
}

impl Drop for CreateSlot {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        self.pool.state().end_create(&self.task_type);
        self.pool.inner.released.notify_waiters();
    }
}

enum Reservation {
    Reused(String, SessionHandle),
    Create(CreateSlot),
    /// Create after closing an idle unhealthy session
    Replace(SessionInfo, CreateSlot),
    Full,
}

/// What the pool could hand out right now without anyone waiting.
///
/// A snapshot taken by [`SessionPool::headroom`]. Each [`Headroom::take`]
/// charges one lease against it, so a batch of decisions made from one
/// snapshot does not oversubscribe the pool.
#[derive(Debug, Clone)]
pub struct Headroom {
    /// Idle healthy sessions per task type
    idle: HashMap<String, usize>,
    /// Sessions counted against each type's cap, creations included
    counts: HashMap<String, usize>,
    limits: BTreeMap<String, TaskTypeLimits>,
    default_limits: TaskTypeLimits,
    /// Room left under the global cap
    free: usize,
}

impl Headroom {
    /// Charges one lease of `task_type`. Returns false when none is left.
    pub fn take(&mut self, task_type: &str) -> bool {
        if let Some(idle) = self.idle.get_mut(task_type) {
            if *idle > 0 {
                *idle -= 1;
                return true;
            }
        }

        let max = self
            .limits
            .get(task_type)
            .copied()
            .unwrap_or(self.default_limits)
            .max_sessions;
        let count = self.counts.entry(task_type.to_string()).or_insert(0);
        if *count < max && self.free > 0 {
            *count += 1;
            self.free -= 1;
            return true;
        }
        false
    }
}

/// Bounded pool of remote sessions. Cloning yields another handle to
/// the same pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SessionPool {
    pub fn new(config: PoolConfig, provider: Arc<dyn SessionProvider>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                provider,
                state: Mutex::new(PoolState::default()),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Local health rules; the provider ping is applied separately.
    fn locally_healthy(&self, session: &PooledSession, now: Instant) -> bool {
        let config = &self.inner.config;
        session.info.status == SessionStatus::Active
            && now.duration_since(session.created) <= config.max_session_age()
            && (session.leased || now.duration_since(session.last_used) <= config.max_idle())
            && session.info.error_count <= config.error_threshold
    }

    /// Creates `min_sessions` for every configured task type.
    ///
    /// Calling it again after a successful run does nothing.
    pub async fn initialize(&self) -> Result<(), PoolError> {
        if self.state().initialized {
            debug!("Session pool already initialized");
            return Ok(());
        }

        let mut created = 0;
        for (task_type, limits) in &self.inner.config.task_types {
            created += self.ensure_minimum(task_type, limits.min_sessions).await?.len();
        }

        self.state().initialized = true;
        info!("Session pool initialized with {} new sessions", created);
        Ok(())
    }

    /// Leases a session, waiting up to the configured acquire timeout.
    pub async fn acquire(&self, task_type: &str) -> Result<SessionLease, PoolError> {
        self.acquire_timeout(task_type, self.inner.config.acquire_timeout())
            .await
    }

    /// Leases a session without waiting for a release.
    pub async fn try_acquire(&self, task_type: &str) -> Result<SessionLease, PoolError> {
        self.acquire_timeout(task_type, Duration::ZERO).await
    }

    /// Leases a session of `task_type`, waiting at most `budget`.
    ///
    /// # Returns
    ///
    /// * `Ok(SessionLease)` - Exclusive access until the lease is dropped
    /// * `Err(PoolError::PoolExhausted)` - No session freed up in time
    /// * `Err(PoolError::Provider)` - A new session could not be created
    /// * `Err(PoolError::ShutDown)` - The pool was shut down
    pub async fn acquire_timeout(
        &self,
        task_type: &str,
        budget: Duration,
    ) -> Result<SessionLease, PoolError> {
        let deadline = Instant::now() + budget;

        loop {
            // Register interest before looking, so a release between the
            // check and the wait is not missed.
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.reserve(task_type)? {
                Reservation::Reused(id, handle) => {
                    debug!("Reusing session {} for '{}'", id, task_type);
                    return Ok(SessionLease::new(self.clone(), id, task_type, handle));
                }
                Reservation::Create(slot) => {
                    let info = self.create_reserved(slot, None, true, HashMap::new()).await?;
                    return Ok(SessionLease::new(self.clone(), info.id, task_type, info.handle));
                }
                Reservation::Replace(retired, slot) => {
                    let info = self
                        .create_reserved(slot, Some(retired), true, HashMap::new())
                        .await?;
                    return Ok(SessionLease::new(self.clone(), info.id, task_type, info.handle));
                }
                Reservation::Full => {}
            }

            if budget.is_zero() || Instant::now() >= deadline {
                break;
            }
            debug!("Pool full for '{}', waiting for a release", task_type);
            if time::timeout_at(deadline, notified).await.is_err() {
                break;
            }
        }

        warn!("No '{}' session available within {:?}", task_type, budget);
        Err(PoolError::PoolExhausted {
            task_type: task_type.to_string(),
            waited: budget,
        })
    }

    fn reserve(&self, task_type: &str) -> Result<Reservation, PoolError> {
        let now = Instant::now();
        let mut state = self.state();
        if state.shut_down {
            return Err(PoolError::ShutDown);
        }

        // Idle sessions that have aged out are flagged instead of reused
        let expired: Vec<String> = state
            .sessions
            .values()
            .filter(|s| {
                !s.leased
                    && s.info.status == SessionStatus::Active
                    && !self.locally_healthy(s, now)
            })
            .map(|s| s.info.id.clone())
            .collect();
        for id in expired {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.info.status = SessionStatus::Unhealthy;
                debug!("Session {} failed health rules and was flagged", id);
            }
        }

        let reusable = state
            .sessions
            .values()
            .filter(|s| {
                !s.leased && s.info.task_type == task_type && s.info.status == SessionStatus::Active
            })
            .min_by_key(|s| s.seq)
            .map(|s| s.info.id.clone());

        if let Some(id) = reusable {
            if let Some(session) = state.sessions.get_mut(&id) {
                session.leased = true;
                session.last_used = now;
                session.info.last_used = Utc::now();
                return Ok(Reservation::Reused(id, session.info.handle.clone()));
            }
        }

        let limits = self.inner.config.limits_for(task_type);
        let type_full = state.count_of(task_type) >= limits.max_sessions;
        let global_full = state.total() >= self.inner.config.max_total_sessions;

        if !type_full && !global_full {
            let slot = CreateSlot::reserve(self, &mut state, task_type);
            return Ok(Reservation::Create(slot));
        }

        // At a cap: an idle unhealthy session may make room. A per-type cap
        // can only be relieved by a session of the same type.
        let evictable = state
            .sessions
            .values()
            .filter(|s| !s.leased && s.info.status != SessionStatus::Active)
            .filter(|s| !type_full || s.info.task_type == task_type)
            .min_by_key(|s| (s.info.task_type != task_type, s.seq))
            .map(|s| s.info.id.clone());

        match evictable.and_then(|id| state.sessions.remove(&id)) {
            Some(retired) => {
                let slot = CreateSlot::reserve(self, &mut state, task_type);
                info!(
                    "Replacing unhealthy session {} to serve '{}'",
                    retired.info.id, task_type
                );
                Ok(Reservation::Replace(retired.info, slot))
            }
            None => Ok(Reservation::Full),
        }
    }

    /// Fills a reserved slot, first closing `retired` if given.
    ///
    /// The provider calls run on a detached task. A caller dropped midway
    /// leaves the slot to that task, and a leased session nobody is left
    /// to receive goes back to the idle set.
    async fn create_reserved(
        &self,
        slot: CreateSlot,
        retired: Option<SessionInfo>,
        leased: bool,
        context: HashMap<String, Value>,
    ) -> Result<SessionInfo, PoolError> {
        let (tx, rx) = oneshot::channel();
        let pool = self.clone();

        tokio::spawn(async move {
            if let Some(retired) = retired {
                pool.close_handle(&retired).await;
            }
            let created = pool
                .inner
                .provider
                .create_session(&pool.inner.config.session)
                .await;
            let result = pool.finish_create(slot, created, leased, context).await;

            if let Err(Ok(info)) = tx.send(result) {
                if leased {
                    debug!("Acquire abandoned, returning session {} to the pool", info.id);
                    if let Err(e) = pool.release(&info.id) {
                        debug!("Abandoned session {} not returned: {}", info.id, e);
                    }
                }
            }
        });

        rx.await.unwrap_or_else(|_| {
            Err(PoolError::Provider(ProviderError(
                "session creation task ended abnormally".to_string(),
            )))
        })
    }

    async fn finish_create(
        &self,
        slot: CreateSlot,
        created: Result<SessionHandle, ProviderError>,
        leased: bool,
        context: HashMap<String, Value>,
    ) -> Result<SessionInfo, PoolError> {
        let task_type = slot.task_type.clone();
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                drop(slot);
                warn!("Failed to create '{}' session: {}", task_type, e);
                return Err(e.into());
            }
        };

        let mut info = SessionInfo::new(Uuid::new_v4().to_string(), &task_type, handle);
        info.context = context;

        let rejected = {
            let mut state = self.state();
            slot.settle(&mut state);
            if state.shut_down {
                true
            } else {
                let now = Instant::now();
                let seq = state.next_seq;
                state.next_seq += 1;
                state.sessions.insert(
                    info.id.clone(),
                    PooledSession {
                        info: info.clone(),
                        leased,
                        seq,
                        created: now,
                        last_used: now,
                    },
                );
                false
            }
        };

        if rejected {
            self.close_handle(&info).await;
            return Err(PoolError::ShutDown);
        }

        info!(
            "Created session {} for '{}' (remote {})",
            info.id, task_type, info.handle.remote_id
        );
        if !leased {
            self.inner.released.notify_waiters();
        }
        Ok(info)
    }

    async fn close_handle(&self, info: &SessionInfo) {
        match self.inner.provider.close_session(&info.handle).await {
            Ok(()) => debug!("Closed session {}", info.id),
            Err(e) => warn!("Failed to close session {}: {}", info.id, e),
        }
    }

    /// Returns a leased session to the idle set.
    ///
    /// Releasing a session that is not leased is a no-op.
    pub fn release(&self, session_id: &str) -> Result<(), PoolError> {
        {
            let mut state = self.state();
            let session = state
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;

            if !session.leased {
                return Ok(());
            }
            session.leased = false;
            session.last_used = Instant::now();
            session.info.last_used = Utc::now();
        }

        debug!("Released session {}", session_id);
        self.inner.released.notify_waiters();
        Ok(())
    }

    /// Counts an error against a session; past the threshold it becomes
    /// UNHEALTHY.
    pub fn record_error(&self, session_id: &str) -> Result<u32, PoolError> {
        let mut state = self.state();
        let threshold = self.inner.config.error_threshold;
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;

        session.info.error_count += 1;
        if session.info.error_count > threshold && session.info.status == SessionStatus::Active {
            session.info.status = SessionStatus::Unhealthy;
            warn!(
                "Session {} marked unhealthy after {} errors",
                session_id, session.info.error_count
            );
        }
        Ok(session.info.error_count)
    }

    pub fn mark_unhealthy(&self, session_id: &str) -> Result<(), PoolError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;
        if session.info.status == SessionStatus::Active {
            session.info.status = SessionStatus::Unhealthy;
        }
        Ok(())
    }

    /// Checks one session against the health rules and pings it.
    ///
    /// An ACTIVE session that fails is marked UNHEALTHY.
    pub async fn health_check(&self, session_id: &str) -> Result<bool, PoolError> {
        let (locally_ok, handle) = {
            let state = self.state();
            let session = state
                .sessions
                .get(session_id)
                .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;
            (
                self.locally_healthy(session, Instant::now()),
                session.info.handle.clone(),
            )
        };

        let healthy = locally_ok && self.inner.provider.is_alive(&handle).await;

        if !healthy {
            let mut state = self.state();
            if let Some(session) = state.sessions.get_mut(session_id) {
                if session.info.status == SessionStatus::Active {
                    session.info.status = SessionStatus::Unhealthy;
                    debug!("Session {} failed health check", session_id);
                }
            }
        }
        Ok(healthy)
    }

    /// Health-checks every idle session and returns how many failed.
    pub async fn health_check_all(&self) -> usize {
        let idle: Vec<String> = {
            let state = self.state();
            state
                .sessions
                .values()
                .filter(|s| !s.leased)
                .map(|s| s.info.id.clone())
                .collect()
        };

        let mut unhealthy = 0;
        for id in idle {
            if let Ok(false) = self.health_check(&id).await {
                unhealthy += 1;
            }
        }
        if unhealthy > 0 {
            info!("Health check found {} unhealthy sessions", unhealthy);
        }
        unhealthy
    }

    /// Closes idle sessions that fail the health rules, then tops every
    /// task type back up to its minimum.
    pub async fn cleanup_unhealthy_sessions(&self) -> CleanupReport {
        let now = Instant::now();
        let retired: Vec<SessionInfo> = {
            let mut state = self.state();
            let ids: Vec<String> = state
                .sessions
                .values()
                .filter(|s| !s.leased && !self.locally_healthy(s, now))
                .map(|s| s.info.id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| state.sessions.remove(id))
                .map(|s| s.info)
                .collect()
        };

        let mut report = CleanupReport::default();
        let mut task_types: Vec<String> = self.inner.config.task_types.keys().cloned().collect();

        for info in retired {
            self.close_handle(&info).await;
            if !task_types.contains(&info.task_type) {
                task_types.push(info.task_type.clone());
            }
            report.closed.push(info.id);
        }
        if !report.closed.is_empty() {
            self.inner.released.notify_waiters();
        }

        for task_type in task_types {
            let min = self.inner.config.limits_for(&task_type).min_sessions;
            match self.ensure_minimum(&task_type, min).await {
                Ok(ids) => report.created.extend(ids),
                Err(e) => warn!("Could not restore '{}' sessions: {}", task_type, e),
            }
        }

        if !report.closed.is_empty() || !report.created.is_empty() {
            info!(
                "Cleanup closed {} sessions and created {}",
                report.closed.len(),
                report.created.len()
            );
        }
        report
    }

    /// Creates idle sessions until `task_type` has at least `min`, within
    /// the pool caps. Returns the new session ids.
    pub async fn ensure_minimum(&self, task_type: &str, min: usize) -> Result<Vec<String>, PoolError> {
        let mut created = Vec::new();

        loop {
            let slot = {
                let mut state = self.state();
                if state.shut_down {
                    return Err(PoolError::ShutDown);
                }
                let limits = self.inner.config.limits_for(task_type);
                let count = state.count_of(task_type);
                if count >= min
                    || count >= limits.max_sessions
                    || state.total() >= self.inner.config.max_total_sessions
                {
                    break;
                }
                CreateSlot::reserve(self, &mut state, task_type)
            };

            let info = self.create_reserved(slot, None, false, HashMap::new()).await?;
            created.push(info.id);
        }

        Ok(created)
    }

    /// Replaces an idle session with a fresh one carrying the same context.
    ///
    /// The replacement runs on a detached task, so dropping the returned
    /// future neither loses the old session nor its slot.
    ///
    /// # Returns
    ///
    /// * `Ok(String)` - Id of the replacement session
    /// * `Err(PoolError::SessionBusy)` - The session is leased
    pub async fn refresh(&self, session_id: &str) -> Result<String, PoolError> {
        let not_found = || PoolError::SessionNotFound(session_id.to_string());
        let (old, slot) = {
            let mut state = self.state();
            let leased = state.sessions.get(session_id).map(|s| s.leased).ok_or_else(not_found)?;
            if leased {
                return Err(PoolError::SessionBusy(session_id.to_string()));
            }
            // The replacement takes over the old session's slot
            let old = state.sessions.remove(session_id).ok_or_else(not_found)?;
            let slot = CreateSlot::reserve(self, &mut state, &old.info.task_type);
            (old, slot)
        };

        let pool = self.clone();
        let replaced = tokio::spawn(async move { pool.replace_idle(old, slot).await }).await;
        let info = replaced.unwrap_or_else(|e| {
            Err(PoolError::Provider(ProviderError(format!(
                "session refresh task ended abnormally: {}",
                e
            ))))
        })?;

        info!("Refreshed session {} -> {}", session_id, info.id);
        Ok(info.id)
    }

    async fn replace_idle(&self, old: PooledSession, slot: CreateSlot) -> Result<SessionInfo, PoolError> {
        let created = match self
            .inner
            .provider
            .create_session(&self.inner.config.session)
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                // Put the old session back before freeing the slot
                let orphan = {
                    let mut state = self.state();
                    slot.settle(&mut state);
                    if state.shut_down {
                        Some(old)
                    } else {
                        state.sessions.insert(old.info.id.clone(), old);
                        None
                    }
                };
                if let Some(orphan) = orphan {
                    self.close_handle(&orphan.info).await;
                }
                self.inner.released.notify_waiters();
                warn!("Failed to refresh session: {}", e);
                return Err(e.into());
            }
        };

        let replacement = self
            .finish_create(slot, Ok(created), false, old.info.context.clone())
            .await;
        self.close_handle(&old.info).await;
        replacement
    }

    /// Stores `data` under `namespace` in the session's context.
    pub fn store_context(&self, session_id: &str, namespace: &str, data: Value) -> Result<(), PoolError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;
        session.info.context.insert(namespace.to_string(), data);
        Ok(())
    }

    /// Reads one namespace, or every namespace as an object when
    /// `namespace` is `None`. A missing namespace reads as `Null`.
    pub fn get_context(&self, session_id: &str, namespace: Option<&str>) -> Result<Value, PoolError> {
        let state = self.state();
        let session = state
            .sessions
            .get(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;

        Ok(match namespace {
            Some(ns) => session.info.context.get(ns).cloned().unwrap_or(Value::Null),
            None => Value::Object(
                session
                    .info
                    .context
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<Map<String, Value>>(),
            ),
        })
    }

    /// Clears one namespace, or the whole context when `namespace` is `None`.
    pub fn clear_context(&self, session_id: &str, namespace: Option<&str>) -> Result<(), PoolError> {
        let mut state = self.state();
        let session = state
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| PoolError::SessionNotFound(session_id.to_string()))?;
        match namespace {
            Some(ns) => {
                session.info.context.remove(ns);
            }
            None => session.info.context.clear(),
        }
        Ok(())
    }

    /// Occupancy snapshot, including configured types with no sessions.
    pub fn stats(&self) -> PoolStats {
        let state = self.state();
        let mut stats = PoolStats::default();
        for task_type in self.inner.config.task_types.keys() {
            stats.by_type.insert(task_type.clone(), TypeStats::default());
        }

        for session in state.sessions.values() {
            let entry = stats.by_type.entry(session.info.task_type.clone()).or_default();
            entry.total += 1;
            stats.total_sessions += 1;

            if session.leased {
                entry.in_use += 1;
                stats.in_use += 1;
            } else if session.info.status == SessionStatus::Active {
                entry.available += 1;
                stats.available += 1;
            }
            if session.info.status == SessionStatus::Unhealthy {
                stats.unhealthy += 1;
            }
        }
        stats
    }

    /// Snapshot of the leases available without waiting.
    ///
    /// Idle sessions that fail the health rules count as room for a
    /// replacement, as `acquire` would evict them.
    pub fn headroom(&self) -> Headroom {
        let now = Instant::now();
        let config = &self.inner.config;
        let state = self.state();

        let mut idle: HashMap<String, usize> = HashMap::new();
        let mut counts: HashMap<String, usize> = HashMap::new();
        let mut stale = 0;
        for session in state.sessions.values() {
            if !session.leased && !self.locally_healthy(session, now) {
                stale += 1;
                continue;
            }
            let task_type = &session.info.task_type;
            *counts.entry(task_type.clone()).or_insert(0) += 1;
            if !session.leased {
                *idle.entry(task_type.clone()).or_insert(0) += 1;
            }
        }
        for (task_type, pending) in &state.pending {
            *counts.entry(task_type.clone()).or_insert(0) += pending;
        }

        Headroom {
            idle,
            counts,
            limits: config.task_types.clone(),
            default_limits: config.default_limits,
            free: config
                .max_total_sessions
                .saturating_sub(state.total().saturating_sub(stale)),
        }
    }

    /// Whether `task_type` can ever be served under the configured caps.
    pub fn serves(&self, task_type: &str) -> bool {
        !self.is_shut_down()
            && self.inner.config.max_total_sessions > 0
            && self.inner.config.limits_for(task_type).max_sessions > 0
    }

    /// Resolves at the next release, or when a new idle session appears.
    pub async fn released(&self) {
        self.inner.released.notified().await;
    }

    pub fn session(&self, session_id: &str) -> Option<SessionInfo> {
        self.state().sessions.get(session_id).map(|s| s.info.clone())
    }

    /// Every pooled session, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.state();
        let mut sessions: Vec<&PooledSession> = state.sessions.values().collect();
        sessions.sort_by_key(|s| s.seq);
        sessions.into_iter().map(|s| s.info.clone()).collect()
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    /// Closes every session and rejects later acquisitions.
    pub async fn shutdown(&self) {
        let sessions: Vec<PooledSession> = {
            let mut state = self.state();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.sessions.drain().map(|(_, s)| s).collect()
        };

        info!("Shutting down session pool ({} sessions)", sessions.len());
        for mut session in sessions {
            if session.leased {
                warn!("Closing session {} while still leased", session.info.id);
            }
            session.info.status = SessionStatus::Closed;
            session.info.context.clear();
            self.close_handle(&session.info).await;
        }
        self.inner.released.notify_waiters();
    }

    /// Spawns the periodic health check and cleanup task.
    pub fn spawn_maintenance(&self, token: CancellationToken) -> JoinHandle<()> {
        let pool = self.clone();
        let health_every = Duration::from_secs(self.inner.config.health_check_interval_secs.max(1));
        let cleanup_every = Duration::from_secs(self.inner.config.cleanup_interval_secs.max(1));

        tokio::spawn(async move {
            let mut health = time::interval_at(Instant::now() + health_every, health_every);
            let mut cleanup = time::interval_at(Instant::now() + cleanup_every, cleanup_every);
            health.set_missed_tick_behavior(MissedTickBehavior::Delay);
            cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

            debug!("Pool maintenance started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = health.tick() => {
                        pool.health_check_all().await;
                    }
                    _ = cleanup.tick() => {
                        pool.cleanup_unhealthy_sessions().await;
                    }
                }
            }
            debug!("Pool maintenance stopped");
        })
    }
}

/// Exclusive use of one pooled session.
///
/// The session goes back to the pool when the lease is released or
/// dropped, whichever comes first.
pub struct SessionLease {
    pool: SessionPool,
    session_id: String,
    task_type: String,
    handle: SessionHandle,
    released: bool,
}

impl SessionLease {
    fn new(pool: SessionPool, session_id: String, task_type: &str, handle: SessionHandle) -> Self {
        Self {
            pool,
            session_id,
            task_type: task_type.to_string(),
            handle,
            released: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Counts a failed attempt against the leased session.
    pub fn record_error(&self) {
        if let Err(e) = self.pool.record_error(&self.session_id) {
            debug!("Could not record error on {}: {}", self.session_id, e);
        }
    }

    /// Hands the session back now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.pool.release(&self.session_id) {
            debug!("Lease on {} ended without release: {}", self.session_id, e);
        }
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("session_id", &self.session_id)
            .field("task_type", &self.task_type)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::dry_run::DryRunProvider;
    use serde_json::json;

    fn pool_with(config: PoolConfig) -> (SessionPool, Arc<DryRunProvider>) {
        let provider = Arc::new(DryRunProvider::new());
        (SessionPool::new(config, provider.clone()), provider)
    }

    fn single_type(min: usize, max: usize) -> PoolConfig {
        let mut config = PoolConfig::default();
        config.task_types.clear();
        config.with_task_type("job_discovery", min, max)
    }

    #[tokio::test]
    async fn test_initialize_creates_minimums_once() {
        let (pool, provider) = pool_with(PoolConfig::default());
        pool.initialize().await.unwrap();
        pool.initialize().await.unwrap();

        // job_discovery and proposal_submission keep one each
        assert_eq!(provider.created(), 2);
        let stats = pool.stats();
        assert_eq!(stats.total_sessions, 2);
        assert_eq!(stats.available, 2);
        assert_eq!(stats.total_for("profile_management"), 0);
    }

    #[tokio::test]
    async fn test_acquire_prefers_reuse() {
        let (pool, provider) = pool_with(single_type(1, 2));
        pool.initialize().await.unwrap();
        let existing = pool.sessions()[0].id.clone();

        let lease = pool.try_acquire("job_discovery").await.unwrap();
        assert_eq!(lease.session_id(), existing);
        assert_eq!(provider.created(), 1);
        assert_eq!(pool.stats().in_use, 1);
    }

    #[tokio::test]
    async fn test_acquire_respects_type_cap() {
        let (pool, provider) = pool_with(single_type(0, 2));
        let first = pool.try_acquire("job_discovery").await.unwrap();
        let second = pool.try_acquire("job_discovery").await.unwrap();
        assert_ne!(first.session_id(), second.session_id());

        match pool.try_acquire("job_discovery").await {
            Err(PoolError::PoolExhausted { task_type, .. }) => assert_eq!(task_type, "job_discovery"),
            other => panic!("Expected PoolExhausted, got {:?}", other),
        }
        assert_eq!(provider.created(), 2);
    }

    #[tokio::test]
    async fn test_acquire_respects_global_cap() {
        let mut config = single_type(0, 2);
        config.max_total_sessions = 1;
        let (pool, _) = pool_with(config);

        let _held = pool.try_acquire("job_discovery").await.unwrap();
        assert!(matches!(
            pool.try_acquire("other").await,
            Err(PoolError::PoolExhausted { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_gets_released_session() {
        let (pool, _) = pool_with(single_type(0, 1));
        let lease = pool.try_acquire("job_discovery").await.unwrap();
        let id = lease.session_id().to_string();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.acquire_timeout("job_discovery", Duration::from_secs(10))
                    .await
                    .map(|lease| lease.session_id().to_string())
            })
        };

        time::sleep(Duration::from_secs(1)).await;
        drop(lease);

        assert_eq!(waiter.await.unwrap().unwrap(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_acquire_times_out() {
        let (pool, _) = pool_with(single_type(0, 1));
        let _held = pool.try_acquire("job_discovery").await.unwrap();

        let started = Instant::now();
        let result = pool.acquire_timeout("job_discovery", Duration::from_secs(3)).await;
        assert!(matches!(result, Err(PoolError::PoolExhausted { .. })));
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let (pool, _) = pool_with(single_type(0, 2));
        let lease = pool.try_acquire("job_discovery").await.unwrap();
        let id = lease.session_id().to_string();

        lease.release();
        pool.release(&id).unwrap();

        let stats = pool.stats();
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 1);
        assert_eq!(stats.total_sessions, 1);
        assert!(matches!(pool.release("ghost"), Err(PoolError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn test_error_threshold_marks_unhealthy() {
        let (pool, _) = pool_with(single_type(0, 2));
        let id = pool.try_acquire("job_discovery").await.unwrap().session_id().to_string();

        for _ in 0..3 {
            pool.record_error(&id).unwrap();
        }
        assert!(pool.health_check(&id).await.unwrap());
        assert_eq!(pool.session(&id).unwrap().status, SessionStatus::Active);

        assert_eq!(pool.record_error(&id).unwrap(), 4);
        assert_eq!(pool.session(&id).unwrap().status, SessionStatus::Unhealthy);
        assert!(!pool.health_check(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_check_uses_provider_ping() {
        let (pool, provider) = pool_with(single_type(1, 2));
        pool.initialize().await.unwrap();
        let id = pool.sessions()[0].id.clone();

        assert!(pool.health_check(&id).await.unwrap());
        provider.set_alive(false);
        assert!(!pool.health_check(&id).await.unwrap());
        assert_eq!(pool.stats().unhealthy, 1);
        assert!(matches!(
            pool.health_check("ghost").await,
            Err(PoolError::SessionNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_sessions_expire() {
        let (pool, _) = pool_with(single_type(1, 2));
        pool.initialize().await.unwrap();
        let id = pool.sessions()[0].id.clone();

        time::advance(pool.config().max_idle() + Duration::from_secs(1)).await;
        assert_eq!(pool.health_check_all().await, 1);
        assert_eq!(pool.session(&id).unwrap().status, SessionStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_cleanup_preserves_minimum() {
        let (pool, provider) = pool_with(single_type(3, 5));
        pool.initialize().await.unwrap();
        assert_eq!(pool.stats().total_for("job_discovery"), 3);

        let victim = pool.sessions()[1].id.clone();
        pool.mark_unhealthy(&victim).unwrap();

        let report = pool.cleanup_unhealthy_sessions().await;
        assert_eq!(report.closed, vec![victim.clone()]);
        assert_eq!(report.created.len(), 1);
        assert!(pool.session(&victim).is_none());
        assert!(pool.stats().total_for("job_discovery") >= 3);
        assert_eq!(provider.closed(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_skips_leased_sessions() {
        let (pool, _) = pool_with(single_type(0, 2));
        let lease = pool.try_acquire("job_discovery").await.unwrap();
        pool.mark_unhealthy(lease.session_id()).unwrap();

        let report = pool.cleanup_unhealthy_sessions().await;
        assert!(report.closed.is_empty());
        assert!(pool.session(lease.session_id()).is_some());
    }

    #[tokio::test]
    async fn test_unhealthy_idle_session_is_replaced_at_capacity() {
        let (pool, provider) = pool_with(single_type(0, 1));
        let id = pool.try_acquire("job_discovery").await.unwrap().session_id().to_string();
        pool.mark_unhealthy(&id).unwrap();

        let lease = pool.try_acquire("job_discovery").await.unwrap();
        assert_ne!(lease.session_id(), id);
        assert!(pool.session(&id).is_none());
        assert_eq!(provider.closed(), 1);
        assert_eq!(pool.stats().total_sessions, 1);
    }

    #[tokio::test]
    async fn test_headroom_counts_idle_and_creatable() {
        let mut config = single_type(1, 2);
        config.max_total_sessions = 3;
        let (pool, _) = pool_with(config);
        pool.initialize().await.unwrap();

        let mut headroom = pool.headroom();
        // One idle session and one more under the type cap
        assert!(headroom.take("job_discovery"));
        assert!(headroom.take("job_discovery"));
        assert!(!headroom.take("job_discovery"));
        // The global cap leaves room for one session of another type
        assert!(headroom.take("general"));
        assert!(!headroom.take("general"));

        let _a = pool.try_acquire("job_discovery").await.unwrap();
        let _b = pool.try_acquire("job_discovery").await.unwrap();
        assert!(!pool.headroom().take("job_discovery"));
    }

    #[tokio::test]
    async fn test_headroom_counts_unhealthy_idle_as_room() {
        let (pool, _) = pool_with(single_type(0, 1));
        let id = pool.try_acquire("job_discovery").await.unwrap().session_id().to_string();
        assert!(pool.headroom().take("job_discovery"));

        let held = pool.try_acquire("job_discovery").await.unwrap();
        assert!(!pool.headroom().take("job_discovery"));
        drop(held);

        pool.mark_unhealthy(&id).unwrap();
        assert!(pool.headroom().take("job_discovery"));
    }

    #[tokio::test]
    async fn test_serves() {
        let mut config = single_type(0, 1).with_task_type("disabled", 0, 0);
        config.max_total_sessions = 4;
        let (pool, _) = pool_with(config);

        assert!(pool.serves("job_discovery"));
        assert!(pool.serves("unlisted"));
        assert!(!pool.serves("disabled"));
        pool.shutdown().await;
        assert!(!pool.serves("job_discovery"));
    }

    #[tokio::test]
    async fn test_context_operations() {
        let (pool, _) = pool_with(single_type(1, 1));
        pool.initialize().await.unwrap();
        let id = pool.sessions()[0].id.clone();

        pool.store_context(&id, "auth", json!({"user": "alice"})).unwrap();
        pool.store_context(&id, "search", json!(["rust"])).unwrap();

        assert_eq!(pool.get_context(&id, Some("auth")).unwrap(), json!({"user": "alice"}));
        assert_eq!(pool.get_context(&id, Some("missing")).unwrap(), Value::Null);
        assert_eq!(
            pool.get_context(&id, None).unwrap(),
            json!({"auth": {"user": "alice"}, "search": ["rust"]})
        );

        pool.clear_context(&id, Some("auth")).unwrap();
        assert_eq!(pool.get_context(&id, None).unwrap(), json!({"search": ["rust"]}));
        pool.clear_context(&id, None).unwrap();
        assert_eq!(pool.get_context(&id, None).unwrap(), json!({}));

        assert!(matches!(
            pool.store_context("ghost", "x", json!(1)),
            Err(PoolError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_carries_context() {
        let (pool, provider) = pool_with(single_type(1, 1));
        pool.initialize().await.unwrap();
        let old = pool.sessions()[0].id.clone();
        pool.store_context(&old, "auth", json!("token")).unwrap();

        let new = pool.refresh(&old).await.unwrap();
        assert_ne!(new, old);
        assert!(pool.session(&old).is_none());
        assert_eq!(pool.get_context(&new, Some("auth")).unwrap(), json!("token"));
        assert_eq!(pool.stats().total_sessions, 1);
        assert_eq!(provider.closed(), 1);
    }

    #[tokio::test]
    async fn test_refresh_rejects_leased_session() {
        let (pool, _) = pool_with(single_type(0, 1));
        let lease = pool.try_acquire("job_discovery").await.unwrap();
        assert!(matches!(
            pool.refresh(lease.session_id()).await,
            Err(PoolError::SessionBusy(_))
        ));
    }

    #[tokio::test]
    async fn test_provider_failure_frees_reservation() {
        let (pool, provider) = pool_with(single_type(0, 1));
        provider.set_fail_creates(true);
        assert!(matches!(
            pool.try_acquire("job_discovery").await,
            Err(PoolError::Provider(_))
        ));

        provider.set_fail_creates(false);
        assert!(pool.try_acquire("job_discovery").await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_acquire_keeps_capacity() {
        let (pool, provider) = pool_with(single_type(0, 1));
        provider.set_create_latency(Duration::from_secs(10));

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.try_acquire("job_discovery").await.map(|_| ()) })
        };
        time::sleep(Duration::from_secs(1)).await;
        abandoned.abort();
        assert!(abandoned.await.unwrap_err().is_cancelled());

        time::sleep(Duration::from_secs(20)).await;
        let stats = pool.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.in_use, 0);

        // The session created for the abandoned caller is reused
        let lease = pool.try_acquire("job_discovery").await.unwrap();
        assert_eq!(provider.created(), 1);
        assert_eq!(pool.stats().in_use, 1);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_replacement_closes_retired_session() {
        let (pool, provider) = pool_with(single_type(0, 1));
        let retired = pool.try_acquire("job_discovery").await.unwrap().session_id().to_string();
        pool.mark_unhealthy(&retired).unwrap();
        provider.set_create_latency(Duration::from_secs(10));

        let abandoned = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.try_acquire("job_discovery").await.map(|_| ()) })
        };
        time::sleep(Duration::from_secs(1)).await;
        abandoned.abort();

        time::sleep(Duration::from_secs(20)).await;
        assert!(pool.session(&retired).is_none());
        assert_eq!(provider.closed(), 1);
        assert_eq!(pool.stats().total_sessions, 1);
        assert!(pool.try_acquire("job_discovery").await.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let (pool, provider) = pool_with(single_type(2, 2));
        pool.initialize().await.unwrap();

        pool.shutdown().await;
        pool.shutdown().await;

        assert_eq!(provider.closed(), 2);
        assert_eq!(pool.stats().total_sessions, 0);
        assert!(pool.is_shut_down());
        assert!(matches!(
            pool.try_acquire("job_discovery").await,
            Err(PoolError::ShutDown)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_replaces_expired_sessions() {
        let mut config = single_type(1, 2);
        config.health_check_interval_secs = 10;
        config.cleanup_interval_secs = 20;
        config.max_idle_secs = 15;
        let (pool, provider) = pool_with(config);
        pool.initialize().await.unwrap();
        let original = pool.sessions()[0].id.clone();

        let token = CancellationToken::new();
        let handle = pool.spawn_maintenance(token.clone());

        time::sleep(Duration::from_secs(21)).await;
        assert!(pool.session(&original).is_none());
        assert_eq!(pool.stats().total_for("job_discovery"), 1);
        assert_eq!(provider.created(), 2);

        token.cancel();
        handle.await.unwrap();
    }
}
