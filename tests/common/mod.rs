// Scripted session provider and builders shared by the integration tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use listing_fetch_engine::config::{CacheConfig, FetchConfig, PoolConfig};
use listing_fetch_engine::engine::cache::{CacheEntry, ResponseCache};
use listing_fetch_engine::engine::orchestrator::FetchOrchestrator;
use listing_fetch_engine::engine::randomizer::Randomizer;
use listing_fetch_engine::engine::session::SessionPool;
use listing_fetch_engine::error::CaptureError;
use listing_fetch_engine::source::traits::{SessionHandle, SessionProvider};
use listing_fetch_engine::store::ResultSink;

/// Replays queued outcomes per entity; succeeds with a small JSON payload
/// once an entity's queue is empty.
pub struct ScriptedProvider {
    latency: Duration,
    scripts: Mutex<HashMap<String, VecDeque<Result<Bytes, CaptureError>>>>,
    calls: Mutex<Vec<(String, String)>>,
    discarded: Mutex<Vec<String>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            latency,
            scripts: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            discarded: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    pub fn script(&self, entity: &str, outcomes: Vec<Result<Bytes, CaptureError>>) {
        self.scripts
            .lock()
            .entry(entity.to_string())
            .or_default()
            .extend(outcomes);
    }

    /// `(entity, session id)` per capture, in call order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, entity: &str) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter(|(e, _)| e == entity)
            .map(|(_, s)| s.clone())
            .collect()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded.lock().clone()
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

pub fn payload_for(entity: &str) -> Bytes {
    Bytes::from(format!(r#"{{"entity":"{}","listings":[{{"price":42}}]}}"#, entity))
}

#[async_trait]
impl SessionProvider for ScriptedProvider {
    async fn capture(
        &self,
        session: &SessionHandle,
        entity_key: &str,
    ) -> Result<Bytes, CaptureError> {
        self.calls
            .lock()
            .push((entity_key.to_string(), session.id.clone()));
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.latency).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .get_mut(entity_key)
            .and_then(|q| q.pop_front());
        scripted.unwrap_or_else(|| Ok(payload_for(entity_key)))
    }

    async fn discard(&self, session: &SessionHandle) {
        self.discarded.lock().push(session.id.clone());
    }
}

#[derive(Default)]
pub struct RecordingSink {
    stored: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn stored(&self) -> Vec<String> {
        self.stored.lock().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn store(&self, entity_id: &str, _entry: &CacheEntry) -> anyhow::Result<()> {
        self.stored.lock().push(entity_id.to_string());
        Ok(())
    }
}

/// Fast retry/pacing settings: fixed delay, no jitter.
pub fn fetch_config(parallelism: usize, delay: Duration) -> FetchConfig {
    let delay_ms = delay.as_millis() as u64;
    FetchConfig {
        parallelism,
        delay_min_ms: delay_ms,
        delay_max_ms: delay_ms,
        backoff_base_ms: 10,
        backoff_max_ms: 100,
        jitter_low: 1.0,
        jitter_high: 1.0,
        ..FetchConfig::default()
    }
}

pub fn pool_config(capacity: usize) -> PoolConfig {
    PoolConfig {
        capacity,
        acquire_timeout_ms: 5_000,
        ..PoolConfig::default()
    }
}

pub fn orchestrator(
    provider: Arc<ScriptedProvider>,
    pool: PoolConfig,
    fetch: FetchConfig,
) -> Arc<FetchOrchestrator> {
    let acquire_timeout = pool.acquire_timeout();
    let pool = Arc::new(SessionPool::new(pool).unwrap());
    let cache = Arc::new(ResponseCache::new(&CacheConfig::default()));
    Arc::new(
        FetchOrchestrator::new(
            pool,
            cache,
            provider,
            Arc::new(Randomizer::seeded(17)),
            fetch,
            acquire_timeout,
        )
        .unwrap(),
    )
}
