// Browsing session pool: fixed capacity, health state, cooldown and rotation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::source::traits::SessionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    InUse,
    Cooling,
    Expired,
}

/// How the owner of a lease judged the session when handing it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Clean,
    SuspectedDetection,
    Fatal,
}

struct Session {
    id: String,
    profile: String,
    state: SessionState,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_used: Instant,
    request_count: u32,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
}

impl Session {
    fn handle(&self) -> SessionHandle {
        SessionHandle {
            id: self.id.clone(),
            profile: self.profile.clone(),
            request_count: self.request_count,
        }
    }

    /// State as seen at `now`: a Cooling session whose deadline passed is Idle.
    fn effective_state(&self, now: Instant) -> SessionState {
        match (self.state, self.cooldown_until) {
            (SessionState::Cooling, Some(until)) if until <= now => SessionState::Idle,
            (state, _) => state,
        }
    }

    fn is_worn_out(&self, now: Instant, config: &PoolConfig) -> bool {
        now.duration_since(self.created_at) >= config.max_session_age()
            || self.request_count >= config.max_requests_per_session
            || (config.max_consecutive_failures > 0
                && self.consecutive_failures >= config.max_consecutive_failures)
    }
}

/// Point-in-time view of one session, for health reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub id: String,
    pub profile: String,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub request_count: u32,
    pub consecutive_failures: u32,
    pub cooldown_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolCounters {
    pub created: u64,
    pub retired: u64,
    pub cooled: u64,
    pub acquire_timeouts: u64,
    pub released: u64,
}

struct PoolState {
    sessions: Vec<Session>,
    retired: Vec<SessionHandle>,
    profile_cursor: usize,
}

pub struct SessionPool {
    config: PoolConfig,
    state: Mutex<PoolState>,
    /// One permit per session an owner may hold. Fair, so blocked callers are
    /// served in arrival order.
    permits: Arc<Semaphore>,
    /// Wakes permit holders that found only Cooling sessions.
    released: Notify,
    next_id: AtomicU64,
    created: AtomicU64,
    retired: AtomicU64,
    cooled: AtomicU64,
    timeouts: AtomicU64,
    releases: AtomicU64,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Result<Self> {
        if config.capacity == 0 {
            return Err(anyhow!("session pool capacity must be > 0"));
        }
        info!("session pool initialized with capacity {}", config.capacity);
        Ok(Self {
            permits: Arc::new(Semaphore::new(config.capacity)),
            config,
            state: Mutex::new(PoolState {
                sessions: Vec::new(),
                retired: Vec::new(),
                profile_cursor: 0,
            }),
            released: Notify::new(),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            retired: AtomicU64::new(0),
            cooled: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            releases: AtomicU64::new(0),
        })
    }

    /// Check out a session, waiting at most `timeout`.
    ///
    /// Reuses the least recently used Idle session, creates a new one while
    /// below capacity, or waits for a release / cooldown expiry.
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<SessionLease, PoolError> {
        let deadline = Instant::now() + timeout;

        let permit = match tokio::time::timeout_at(deadline, self.permits.clone().acquire_owned())
            .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) | Err(_) => return Err(self.timed_out(timeout)),
        };

        loop {
            let released = self.released.notified();
            let next_wake = {
                let mut state = self.state.lock();
                match self.checkout_locked(&mut state, Instant::now()) {
                    Ok(handle) => {
                        debug!("session {} checked out", handle.id);
                        return Ok(SessionLease {
                            pool: Arc::clone(self),
                            handle,
                            released: false,
                            _permit: permit,
                        });
                    }
                    Err(earliest_cooldown) => earliest_cooldown,
                }
            };

            if Instant::now() >= deadline {
                return Err(self.timed_out(timeout));
            }
            let wake_at = next_wake.map_or(deadline, |at| at.min(deadline));
            debug!("all free sessions cooling, waiting");
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = released => {}
            }
        }
    }

    fn timed_out(&self, timeout: Duration) -> PoolError {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        warn!("no session available within {:?}", timeout);
        PoolError::Timeout(timeout)
    }

    /// Pick or create a session. On failure returns the earliest cooldown deadline.
    fn checkout_locked(
        &self,
        state: &mut PoolState,
        now: Instant,
    ) -> std::result::Result<SessionHandle, Option<Instant>> {
        self.sweep_locked(state, now);

        if let Some(session) = state
            .sessions
            .iter_mut()
            .filter(|s| s.state == SessionState::Idle)
            .min_by_key(|s| s.last_used)
        {
            session.state = SessionState::InUse;
            return Ok(session.handle());
        }

        if state.sessions.len() < self.config.capacity {
            let profile = self.next_profile(state);
            let n = self.next_id.fetch_add(1, Ordering::Relaxed);
            let session = Session {
                id: format!("session_{}_{}", n, Utc::now().timestamp()),
                profile,
                state: SessionState::InUse,
                created_at: now,
                created_wall: Utc::now(),
                last_used: now,
                request_count: 0,
                consecutive_failures: 0,
                cooldown_until: None,
            };
            info!("created session {} (profile {})", session.id, session.profile);
            self.created.fetch_add(1, Ordering::Relaxed);
            let handle = session.handle();
            state.sessions.push(session);
            return Ok(handle);
        }

        Err(state
            .sessions
            .iter()
            .filter(|s| s.state == SessionState::Cooling)
            .filter_map(|s| s.cooldown_until)
            .min())
    }

    /// Promote finished cooldowns and retire worn-out sessions nobody holds.
    fn sweep_locked(&self, state: &mut PoolState, now: Instant) {
        for session in state.sessions.iter_mut() {
            if session.effective_state(now) != session.state {
                debug!("session {} cooldown finished", session.id);
                session.state = SessionState::Idle;
                session.cooldown_until = None;
            }
            if session.state != SessionState::InUse && session.is_worn_out(now, &self.config) {
                session.state = SessionState::Expired;
            }
        }
        self.remove_expired_locked(state);
    }

    fn remove_expired_locked(&self, state: &mut PoolState) {
        let mut kept = Vec::with_capacity(state.sessions.len());
        for session in state.sessions.drain(..) {
            if session.state == SessionState::Expired {
                info!(
                    "retiring session {} after {} requests",
                    session.id, session.request_count
                );
                self.retired.fetch_add(1, Ordering::Relaxed);
                state.retired.push(session.handle());
            } else {
                kept.push(session);
            }
        }
        state.sessions = kept;
    }

    fn next_profile(&self, state: &mut PoolState) -> String {
        if self.config.profiles.is_empty() {
            return "default".to_string();
        }
        let profiles = &self.config.profiles;
        let profile = profiles[state.profile_cursor % profiles.len()].clone();
        state.profile_cursor = state.profile_cursor.wrapping_add(1);
        profile
    }

    fn release_session(&self, id: &str, outcome: ReleaseOutcome) -> SessionState {
        self.releases.fetch_add(1, Ordering::Relaxed);
        let result = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let Some(session) = state.sessions.iter_mut().find(|s| s.id == id) else {
                warn!("attempted to release unknown session {}", id);
                return SessionState::Expired;
            };

            session.last_used = now;
            session.request_count = session.request_count.saturating_add(1);
            match outcome {
                ReleaseOutcome::Clean => {
                    session.consecutive_failures = 0;
                    session.state = SessionState::Idle;
                }
                ReleaseOutcome::SuspectedDetection => {
                    session.consecutive_failures += 1;
                    session.state = SessionState::Cooling;
                    session.cooldown_until = Some(now + self.config.cooldown());
                    self.cooled.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "session {} cooling for {:?} after suspected detection",
                        session.id,
                        self.config.cooldown()
                    );
                }
                ReleaseOutcome::Fatal => {
                    session.consecutive_failures += 1;
                    session.state = SessionState::Expired;
                }
            }
            if session.state != SessionState::Expired && session.is_worn_out(now, &self.config) {
                session.state = SessionState::Expired;
            }
            let result = session.state;
            if result == SessionState::Expired {
                self.remove_expired_locked(&mut state);
            }
            result
        };
        debug!("session {} released ({:?}) -> {:?}", id, outcome, result);
        self.released.notify_waiters();
        result
    }

    /// Retired sessions whose provider-side resources still need disposal.
    pub fn take_retired(&self) -> Vec<SessionHandle> {
        std::mem::take(&mut self.state.lock().retired)
    }

    /// Retire every session nobody holds (shutdown path).
    pub fn retire_idle(&self) -> Vec<SessionHandle> {
        let mut state = self.state.lock();
        for session in state.sessions.iter_mut() {
            if session.state != SessionState::InUse {
                session.state = SessionState::Expired;
            }
        }
        self.remove_expired_locked(&mut state);
        std::mem::take(&mut state.retired)
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    /// Live sessions, whatever their state.
    pub fn size(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Live sessions that are not cooling down.
    pub fn healthy(&self) -> usize {
        self.count_where(|s| matches!(s, SessionState::Idle | SessionState::InUse))
    }

    pub fn in_use(&self) -> usize {
        self.count_where(|s| s == SessionState::InUse)
    }

    pub fn cooling(&self) -> usize {
        self.count_where(|s| s == SessionState::Cooling)
    }

    /// Sessions that could be handed out right now (existing or creatable).
    pub fn available(&self) -> usize {
        self.capacity()
            .saturating_sub(self.count_where(|s| {
                matches!(s, SessionState::InUse | SessionState::Cooling)
            }))
    }

    fn count_where<F>(&self, pred: F) -> usize
    where
        F: Fn(SessionState) -> bool,
    {
        let now = Instant::now();
        self.state
            .lock()
            .sessions
            .iter()
            .filter(|s| pred(s.effective_state(now)))
            .count()
    }

    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        let now = Instant::now();
        self.state
            .lock()
            .sessions
            .iter()
            .map(|s| SessionSnapshot {
                id: s.id.clone(),
                profile: s.profile.clone(),
                state: s.effective_state(now),
                created_at: s.created_wall,
                age_secs: now.duration_since(s.created_at).as_secs(),
                idle_secs: now.duration_since(s.last_used).as_secs(),
                request_count: s.request_count,
                consecutive_failures: s.consecutive_failures,
                cooldown_remaining_ms: s
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| (until - now).as_millis() as u64),
            })
            .collect()
    }

    pub fn counters(&self) -> PoolCounters {
        PoolCounters {
            created: self.created.load(Ordering::Relaxed),
            retired: self.retired.load(Ordering::Relaxed),
            cooled: self.cooled.load(Ordering::Relaxed),
            acquire_timeouts: self.timeouts.load(Ordering::Relaxed),
            released: self.releases.load(Ordering::Relaxed),
        }
    }
}

/// Exclusive ownership of one session. Dropping a lease without calling
/// [`SessionLease::release`] retires the session as `Fatal`.
pub struct SessionLease {
    pool: Arc<SessionPool>,
    handle: SessionHandle,
    released: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionLease")
            .field("handle", &self.handle)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl SessionLease {
    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> &str {
        &self.handle.id
    }

    /// Hand the session back. Returns the state the pool moved it to.
    pub fn release(mut self, outcome: ReleaseOutcome) -> SessionState {
        self.released = true;
        self.pool.release_session(&self.handle.id, outcome)
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if !self.released {
            warn!("session {} dropped while in use, retiring it", self.handle.id);
            self.pool.release_session(&self.handle.id, ReleaseOutcome::Fatal);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn pool(capacity: usize) -> Arc<SessionPool> {
        Arc::new(
            SessionPool::new(PoolConfig {
                capacity,
                cooldown_secs: 300,
                ..PoolConfig::default()
            })
            .unwrap(),
        )
    }

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_zero_capacity_is_config_error() {
        assert!(SessionPool::new(PoolConfig {
            capacity: 0,
            ..PoolConfig::default()
        })
        .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_up_to_capacity_then_timeout() {
        let pool = pool(2);
        let a = pool.acquire(WAIT).await.unwrap();
        let b = pool.acquire(WAIT).await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.size(), 2);
        assert_eq!(pool.in_use(), 2);

        let err = pool.acquire(Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err, PoolError::Timeout(Duration::from_millis(200)));
        assert_eq!(pool.counters().acquire_timeouts, 1);
        assert_eq!(pool.size(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_release_reuses_session() {
        let pool = pool(2);
        let lease = pool.acquire(WAIT).await.unwrap();
        let id = lease.id().to_string();
        assert_eq!(lease.release(ReleaseOutcome::Clean), SessionState::Idle);

        let again = pool.acquire(WAIT).await.unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(again.handle().request_count, 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooling_session_not_acquirable_until_deadline() {
        let pool = pool(1);
        let lease = pool.acquire(WAIT).await.unwrap();
        let id = lease.id().to_string();
        assert_eq!(
            lease.release(ReleaseOutcome::SuspectedDetection),
            SessionState::Cooling
        );
        assert_eq!(pool.cooling(), 1);
        assert_eq!(pool.healthy(), 0);
        assert_eq!(pool.available(), 0);
        let snap = pool.snapshot();
        assert!(snap[0].cooldown_remaining_ms.unwrap() > 0);

        assert!(pool.acquire(Duration::from_secs(10)).await.is_err());

        tokio::time::advance(Duration::from_secs(300)).await;
        let lease = pool.acquire(WAIT).await.unwrap();
        assert_eq!(lease.id(), id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiter_sleeps_until_cooldown_ends() {
        let pool = pool(1);
        pool.acquire(WAIT)
            .await
            .unwrap()
            .release(ReleaseOutcome::SuspectedDetection);

        let started = Instant::now();
        let lease = pool.acquire(Duration::from_secs(600)).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(300));
        assert_eq!(lease.handle().request_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_release_destroys_and_replaces() {
        let pool = pool(1);
        let lease = pool.acquire(WAIT).await.unwrap();
        let id = lease.id().to_string();
        assert_eq!(lease.release(ReleaseOutcome::Fatal), SessionState::Expired);
        assert_eq!(pool.size(), 0);

        let retired = pool.take_retired();
        assert_eq!(retired.len(), 1);
        assert_eq!(retired[0].id, id);
        assert!(pool.take_retired().is_empty());

        let fresh = pool.acquire(WAIT).await.unwrap();
        assert_ne!(fresh.id(), id);
        assert_eq!(pool.counters().created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rotation_after_max_requests() {
        let pool = Arc::new(
            SessionPool::new(PoolConfig {
                capacity: 1,
                max_requests_per_session: 2,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let first = pool.acquire(WAIT).await.unwrap();
        let id = first.id().to_string();
        assert_eq!(first.release(ReleaseOutcome::Clean), SessionState::Idle);
        let second = pool.acquire(WAIT).await.unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(second.release(ReleaseOutcome::Clean), SessionState::Expired);
        assert_eq!(pool.counters().retired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_retired_after_max_age() {
        let pool = Arc::new(
            SessionPool::new(PoolConfig {
                capacity: 1,
                max_session_age_secs: 60,
                ..PoolConfig::default()
            })
            .unwrap(),
        );
        let lease = pool.acquire(WAIT).await.unwrap();
        let id = lease.id().to_string();
        lease.release(ReleaseOutcome::Clean);

        tokio::time::advance(Duration::from_secs(61)).await;
        let lease = pool.acquire(WAIT).await.unwrap();
        assert_ne!(lease.id(), id);
        assert_eq!(pool.take_retired().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_lease_frees_capacity() {
        let pool = pool(1);
        let lease = pool.acquire(WAIT).await.unwrap();
        drop(lease);
        assert_eq!(pool.size(), 0);
        assert!(pool.acquire(Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_wakes_waiter_stuck_on_cooling() {
        let pool = pool(2);
        let held = pool.acquire(WAIT).await.unwrap();
        let held_id = held.id().to_string();
        pool.acquire(WAIT)
            .await
            .unwrap()
            .release(ReleaseOutcome::SuspectedDetection);

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        held.release(ReleaseOutcome::Clean);

        let lease = waiter.await.unwrap().unwrap();
        assert_eq!(lease.id(), held_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_arrival_order() {
        let pool = pool(1);
        let held = pool.acquire(WAIT).await.unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for i in 0..3 {
            let pool = pool.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let lease = pool.acquire(Duration::from_secs(60)).await.unwrap();
                tx.send(i).unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                lease.release(ReleaseOutcome::Clean);
            }));
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        held.release(ReleaseOutcome::Clean);
        for h in handles {
            h.await.unwrap();
        }
        let order: Vec<i32> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_exceeds_capacity_under_churn() {
        let pool = pool(3);
        let holders = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..40u64 {
            let pool = pool.clone();
            let holders = holders.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let timeout = Duration::from_millis(50 + (i % 7) * 40);
                let Ok(lease) = pool.acquire(timeout).await else {
                    return;
                };
                let now = holders.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert!(pool.in_use() <= 3);
                tokio::time::sleep(Duration::from_millis(20 + (i % 5) * 10)).await;
                holders.fetch_sub(1, Ordering::SeqCst);
                let outcome = match i % 4 {
                    0 => ReleaseOutcome::Fatal,
                    _ => ReleaseOutcome::Clean,
                };
                lease.release(outcome);
            }));
        }
        // Cancel a few tasks mid-flight; their leases must come back.
        tokio::time::sleep(Duration::from_millis(30)).await;
        for h in handles.iter().step_by(9) {
            h.abort();
        }
        for h in handles {
            let _ = h.await;
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.size() <= 3);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.acquire(Duration::from_millis(10)).await.is_ok());
    }
}
