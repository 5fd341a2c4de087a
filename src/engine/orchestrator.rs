// Fetch orchestration: bounded parallel pipelines with retry, pacing and session hand-off.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cache::{CacheLookup, CacheStatus, ResponseCache};
use super::randomizer::Randomizer;
use super::session::{ReleaseOutcome, SessionLease, SessionPool};
use super::stats::{CycleSummary, StatsCollector};
use crate::config::FetchConfig;
use crate::error::{CaptureError, FetchError, PoolError};
use crate::source::traits::SessionProvider;
use crate::store::ResultSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Nothing was due.
    Empty,
    Completed,
    Partial,
    /// At least one entity was attempted and none succeeded.
    TotalFailure,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Empty => "empty",
            CycleStatus::Completed => "completed",
            CycleStatus::Partial => "partial",
            CycleStatus::TotalFailure => "total_failure",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub outcomes: BTreeMap<String, Result<CacheStatus, FetchError>>,
    pub succeeded: usize,
    pub failed: usize,
    pub cache_hits: usize,
    pub status: CycleStatus,
    pub elapsed: Duration,
}

impl CycleReport {
    fn new(outcomes: BTreeMap<String, Result<CacheStatus, FetchError>>, elapsed: Duration) -> Self {
        let succeeded = outcomes.values().filter(|r| r.is_ok()).count();
        let failed = outcomes.len() - succeeded;
        let cache_hits = outcomes
            .values()
            .filter(|r| matches!(r, Ok(CacheStatus::Hit)))
            .count();
        let status = if outcomes.is_empty() {
            CycleStatus::Empty
        } else if failed == 0 {
            CycleStatus::Completed
        } else if succeeded == 0 {
            CycleStatus::TotalFailure
        } else {
            CycleStatus::Partial
        };
        Self {
            outcomes,
            succeeded,
            failed,
            cache_hits,
            status,
            elapsed,
        }
    }
}

/// Decrements the active pipeline gauge however the pipeline ends.
struct PipelineGuard<'a>(&'a StatsCollector);

impl<'a> PipelineGuard<'a> {
    fn enter(stats: &'a StatsCollector) -> Self {
        stats.increment_pipelines();
        Self(stats)
    }
}

impl Drop for PipelineGuard<'_> {
    fn drop(&mut self) {
        self.0.decrement_pipelines();
    }
}

pub struct FetchOrchestrator {
    pool: Arc<SessionPool>,
    cache: Arc<ResponseCache>,
    provider: Arc<dyn SessionProvider>,
    randomizer: Arc<Randomizer>,
    stats: Arc<StatsCollector>,
    sink: Option<Arc<dyn ResultSink>>,
    limiter: Arc<Semaphore>,
    config: FetchConfig,
    acquire_timeout: Duration,
    shutdown_token: CancellationToken,
}

impl FetchOrchestrator {
    pub fn new(
        pool: Arc<SessionPool>,
        cache: Arc<ResponseCache>,
        provider: Arc<dyn SessionProvider>,
        randomizer: Arc<Randomizer>,
        config: FetchConfig,
        acquire_timeout: Duration,
    ) -> Result<Self> {
        if config.parallelism == 0 {
            return Err(anyhow!("fetch parallelism must be > 0"));
        }
        if config.max_attempts == 0 {
            return Err(anyhow!("fetch max_attempts must be > 0"));
        }
        info!(
            "fetch orchestrator: parallelism={} max_attempts={} delay={}..{}ms ({})",
            config.parallelism,
            config.max_attempts,
            config.delay_min_ms,
            config.delay_max_ms,
            config.delay_strategy
        );
        Ok(Self {
            pool,
            cache,
            provider,
            randomizer,
            stats: Arc::new(StatsCollector::new()),
            sink: None,
            limiter: Arc::new(Semaphore::new(config.parallelism)),
            config,
            acquire_timeout,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn ResultSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = stats;
        self
    }

    pub fn pool(&self) -> &Arc<SessionPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn stats(&self) -> &Arc<StatsCollector> {
        &self.stats
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Abort pending pipelines, refuse new ones and dispose of idle sessions.
    pub async fn shutdown(&self) {
        info!("fetch orchestrator shutting down");
        self.shutdown_token.cancel();
        self.limiter.close();
        for handle in self.pool.retire_idle() {
            self.provider.discard(&handle).await;
        }
    }

    /// Fetch one entity within the configured request deadline.
    pub async fn fetch_one(
        &self,
        entity: &str,
        force_refresh: bool,
    ) -> Result<CacheLookup, FetchError> {
        let deadline = Instant::now() + self.config.request_deadline();
        self.fetch_until(entity, force_refresh, deadline).await
    }

    /// Fetch a batch concurrently. Every entity gets an outcome; entities
    /// still pending at `deadline` fail with `DeadlineExceeded`.
    pub async fn fetch_many(
        self: &Arc<Self>,
        entities: Vec<String>,
        force_refresh: bool,
        deadline: Instant,
    ) -> CycleReport {
        let started = Instant::now();
        let mut unique: Vec<String> = Vec::with_capacity(entities.len());
        for entity in entities {
            if !unique.contains(&entity) {
                unique.push(entity);
            }
        }

        let mut outcomes = BTreeMap::new();
        if unique.is_empty() {
            debug!("fetch cycle: nothing to do");
            return CycleReport::new(outcomes, started.elapsed());
        }
        info!("fetch cycle started: {} entities", unique.len());

        let mut tasks = JoinSet::new();
        for entity in &unique {
            let this = Arc::clone(self);
            let entity = entity.clone();
            tasks.spawn(async move {
                let result = this.fetch_until(&entity, force_refresh, deadline).await;
                (entity, result.map(|lookup| lookup.status))
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((entity, result)) => {
                    outcomes.insert(entity, result);
                }
                Err(e) => error!("fetch task failed: {}", e),
            }
        }
        for entity in unique {
            outcomes
                .entry(entity)
                .or_insert_with(|| Err(FetchError::FatalSession("fetch task aborted".into())));
        }

        let report = CycleReport::new(outcomes, started.elapsed());
        match report.status {
            CycleStatus::TotalFailure => error!(
                "fetch cycle failed completely: {} entities, 0 succeeded ({:?})",
                report.failed, report.elapsed
            ),
            CycleStatus::Partial => warn!(
                "fetch cycle partial: {} succeeded, {} failed ({:?})",
                report.succeeded, report.failed, report.elapsed
            ),
            _ => info!(
                "fetch cycle completed: {} succeeded, {} from cache ({:?})",
                report.succeeded, report.cache_hits, report.elapsed
            ),
        }
        self.stats.record_cycle(CycleSummary {
            finished_at: Utc::now(),
            status: report.status.as_str().to_string(),
            entities: report.outcomes.len(),
            succeeded: report.succeeded,
            failed: report.failed,
            elapsed_ms: report.elapsed.as_millis() as u64,
        });
        report
    }

    async fn fetch_until(
        &self,
        entity: &str,
        force_refresh: bool,
        deadline: Instant,
    ) -> Result<CacheLookup, FetchError> {
        if self.is_shutting_down() {
            return Err(FetchError::ShuttingDown);
        }
        self.stats.record_request(entity);
        let started = Instant::now();

        // The pipeline parks its limiter permit here so pacing happens after
        // the result is published but before the slot is handed on.
        let permit_slot: Mutex<Option<OwnedSemaphorePermit>> = Mutex::new(None);
        let ttl = self.cache.default_ttl();
        let result = tokio::select! {
            biased;
            _ = self.shutdown_token.cancelled() => Err(FetchError::ShuttingDown),
            result = self.cache.get_or_fetch(entity, ttl, force_refresh, || {
                self.run_pipeline(entity, &permit_slot)
            }) => result,
            _ = tokio::time::sleep_until(deadline) => Err(FetchError::DeadlineExceeded),
        };

        match &result {
            Ok(lookup) if lookup.status == CacheStatus::Hit => self.stats.record_success(None),
            Ok(_) => self.stats.record_success(Some(started.elapsed())),
            Err(e) => {
                warn!("fetch {} failed [{}]: {}", entity, e.root().class(), e);
                self.stats.record_failure(e);
            }
        }

        // A published capture reaches storage whatever the deadline does next.
        if let (Ok(lookup), Some(sink)) = (&result, &self.sink) {
            if lookup.status == CacheStatus::Miss {
                if let Err(e) = sink.store(entity, &lookup.entry).await {
                    warn!("result sink failed for {}: {}", entity, e);
                }
            }
        }

        let permit = permit_slot.lock().take();
        if let Some(permit) = permit {
            self.pace(entity, deadline).await;
            drop(permit);
        }
        self.dispose_retired().await;
        result
    }

    /// Randomized gap before a pipeline slot is handed on. Cut short by the
    /// deadline or shutdown; the outcome is already settled by then.
    async fn pace(&self, entity: &str, deadline: Instant) {
        let delay = self.randomizer.next_delay(
            self.config.delay_min(),
            self.config.delay_max(),
            self.config.delay_strategy,
        );
        debug!("pacing {:?} after {}", delay, entity);
        let until = (Instant::now() + delay).min(deadline);
        tokio::select! {
            _ = self.shutdown_token.cancelled() => {}
            _ = tokio::time::sleep_until(until) => {}
        }
    }

    async fn run_pipeline(
        &self,
        entity: &str,
        permit_slot: &Mutex<Option<OwnedSemaphorePermit>>,
    ) -> Result<Bytes, FetchError> {
        let permit = Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| FetchError::ShuttingDown)?;
        let _pipeline = PipelineGuard::enter(&self.stats);
        let result = self.capture_with_retry(entity).await;
        *permit_slot.lock() = Some(permit);
        result
    }

    async fn capture_with_retry(&self, entity: &str) -> Result<Bytes, FetchError> {
        let mut attempts = 0u32;
        let mut detections = 0u32;
        let mut fatals = 0u32;
        let mut last_err: Option<FetchError> = None;
        let mut held: Option<SessionLease> = None;

        loop {
            let lease = match held.take() {
                Some(lease) => lease,
                None => match self.pool.acquire(self.acquire_timeout).await {
                    Ok(lease) => lease,
                    Err(PoolError::Timeout(waited)) => {
                        if let Some(prev) = &last_err {
                            warn!("no session to retry {} on after: {}", entity, prev);
                        }
                        return Err(FetchError::ResourceExhausted(waited));
                    }
                },
            };

            attempts += 1;
            if attempts > 1 {
                self.stats.record_retry();
            }
            self.stats.record_capture();
            debug!(
                "capture {} attempt {} on session {}",
                entity,
                attempts,
                lease.id()
            );
            let captured = match tokio::time::timeout(
                self.config.capture_timeout(),
                self.provider.capture(lease.handle(), entity),
            )
            .await
            {
                Ok(captured) => captured,
                Err(_) => Err(CaptureError::Transient(format!(
                    "capture timed out after {:?}",
                    self.config.capture_timeout()
                ))),
            };

            match captured {
                Ok(payload) => {
                    lease.release(ReleaseOutcome::Clean);
                    debug!("captured {} ({} bytes)", entity, payload.len());
                    return Ok(payload);
                }
                Err(CaptureError::Transient(message)) => {
                    let err = FetchError::TransientUpstream { attempts, message };
                    if attempts >= self.config.max_attempts {
                        lease.release(ReleaseOutcome::SuspectedDetection);
                        return Err(err);
                    }
                    let backoff = self.backoff(attempts);
                    warn!(
                        "transient failure for {} (attempt {}), retrying in {:?}: {}",
                        entity, attempts, backoff, err
                    );
                    tokio::time::sleep(backoff).await;
                    held = Some(lease);
                    last_err = Some(err);
                }
                Err(CaptureError::DetectionSuspected(message)) => {
                    let state = lease.release(ReleaseOutcome::SuspectedDetection);
                    warn!(
                        "detection suspected for {} (attempt {}), session now {:?}: {}",
                        entity, attempts, state, message
                    );
                    detections += 1;
                    let err = FetchError::DetectionSuspected(message);
                    if detections > self.config.detection_retries
                        || attempts >= self.config.max_attempts
                    {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
                Err(CaptureError::NotFound(message)) => {
                    // The session did its job; retrying cannot change the answer.
                    lease.release(ReleaseOutcome::Clean);
                    debug!("{} not found upstream: {}", entity, message);
                    return Err(FetchError::NotFound(message));
                }
                Err(CaptureError::Fatal(message)) => {
                    lease.release(ReleaseOutcome::Fatal);
                    warn!(
                        "fatal session error for {} (attempt {}): {}",
                        entity, attempts, message
                    );
                    fatals += 1;
                    let err = FetchError::FatalSession(message);
                    if fatals > self.config.fatal_retries || attempts >= self.config.max_attempts {
                        return Err(err);
                    }
                    last_err = Some(err);
                }
            }
        }
    }

    /// `base * multiplier^(attempt-1)`, capped, then jittered.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs =
            self.config.backoff_base().as_secs_f64() * self.config.backoff_multiplier.powi(exp);
        let capped = Duration::try_from_secs_f64(secs)
            .unwrap_or(self.config.backoff_max())
            .min(self.config.backoff_max());
        self.randomizer
            .jitter(capped, self.config.jitter_low, self.config.jitter_high)
    }

    async fn dispose_retired(&self) {
        for handle in self.pool.take_retired() {
            debug!("discarding retired session {}", handle.id);
            self.provider.discard(&handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CacheConfig, PoolConfig};

    struct Echo;

    #[async_trait::async_trait]
    impl SessionProvider for Echo {
        async fn capture(
            &self,
            _session: &crate::source::traits::SessionHandle,
            entity_key: &str,
        ) -> Result<Bytes, CaptureError> {
            Ok(Bytes::from(entity_key.to_string()))
        }
    }

    fn orchestrator(config: FetchConfig) -> FetchOrchestrator {
        let pool = Arc::new(SessionPool::new(PoolConfig::default()).unwrap());
        let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));
        FetchOrchestrator::new(
            pool,
            cache,
            Arc::new(Echo),
            Arc::new(Randomizer::seeded(1)),
            config,
            Duration::from_secs(1),
        )
        .unwrap()
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let o = orchestrator(FetchConfig {
            backoff_base_ms: 100,
            backoff_multiplier: 2.0,
            backoff_max_ms: 1000,
            jitter_low: 1.0,
            jitter_high: 1.0,
            ..FetchConfig::default()
        });
        assert_eq!(o.backoff(1), Duration::from_millis(100));
        assert_eq!(o.backoff(2), Duration::from_millis(200));
        assert_eq!(o.backoff(3), Duration::from_millis(400));
        assert_eq!(o.backoff(10), Duration::from_millis(1000));
        assert_eq!(o.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        let o = orchestrator(FetchConfig {
            backoff_base_ms: 1000,
            ..FetchConfig::default()
        });
        for _ in 0..200 {
            let d = o.backoff(1);
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let pool = Arc::new(SessionPool::new(PoolConfig::default()).unwrap());
        let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));
        let result = FetchOrchestrator::new(
            pool,
            cache,
            Arc::new(Echo),
            Arc::new(Randomizer::seeded(1)),
            FetchConfig {
                parallelism: 0,
                ..FetchConfig::default()
            },
            Duration::from_secs(1),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_cycle_status() {
        let empty = CycleReport::new(BTreeMap::new(), Duration::ZERO);
        assert_eq!(empty.status, CycleStatus::Empty);

        let mut outcomes = BTreeMap::new();
        outcomes.insert("a".to_string(), Err(FetchError::DeadlineExceeded));
        let total = CycleReport::new(outcomes.clone(), Duration::ZERO);
        assert_eq!(total.status, CycleStatus::TotalFailure);

        outcomes.insert("b".to_string(), Ok(CacheStatus::Hit));
        let partial = CycleReport::new(outcomes, Duration::ZERO);
        assert_eq!(partial.status, CycleStatus::Partial);
        assert_eq!(partial.cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_pacing() {
        let o = orchestrator(FetchConfig {
            delay_min_ms: 500,
            delay_max_ms: 500,
            ..FetchConfig::default()
        });
        let first = o.fetch_one("e1", false).await.unwrap();
        assert_eq!(first.status, CacheStatus::Miss);

        let started = Instant::now();
        let second = o.fetch_one("e1", false).await.unwrap();
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(o.stats().captures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_refuses_new_fetches() {
        let o = orchestrator(FetchConfig::default());
        o.shutdown().await;
        assert_eq!(o.fetch_one("e1", false).await.unwrap_err(), FetchError::ShuttingDown);
    }
}
